//! Node tree storage.
//!
//! Nodes are the routable entries of the application's navigation tree. Each
//! plugin owns the nodes its manifest declares. The `node_structure` table is a
//! denormalized view of the tree (who is a parent, at which depth tier) and is
//! always regenerated wholesale from `nodes`, never patched in place.

use crate::core::db::with_savepoint;
use crate::core::error::PluginctlError;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Deterministic 32-bit node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn to_db(self) -> i64 {
        i64::from(self.0)
    }

    fn from_db(idx: usize, value: i64) -> rusqlite::Result<Self> {
        u32::try_from(value)
            .map(NodeId)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = PluginctlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(NodeId)
            .map_err(|_| PluginctlError::ValidationError(format!("invalid node id: {s:?}")))
    }
}

/// What a node does when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    PluginScript,
    /// Shows another node; the target is stored in `extend`.
    LinkExisting,
    JumpToLink,
    ExternalFile,
    HttpUrl,
    Placeholder,
    /// Embedded frame; `height` applies.
    Iframe,
    CronJob,
    Widget,
    Lightbox,
    RawAjax,
}

impl NodeType {
    pub fn code(self) -> i64 {
        match self {
            NodeType::PluginScript => 1,
            NodeType::LinkExisting => 2,
            NodeType::JumpToLink => 3,
            NodeType::ExternalFile => 4,
            NodeType::HttpUrl => 5,
            NodeType::Placeholder => 6,
            NodeType::Iframe => 7,
            NodeType::CronJob => 8,
            NodeType::Widget => 9,
            NodeType::Lightbox => 10,
            NodeType::RawAjax => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => NodeType::PluginScript,
            2 => NodeType::LinkExisting,
            3 => NodeType::JumpToLink,
            4 => NodeType::ExternalFile,
            5 => NodeType::HttpUrl,
            6 => NodeType::Placeholder,
            7 => NodeType::Iframe,
            8 => NodeType::CronJob,
            9 => NodeType::Widget,
            10 => NodeType::Lightbox,
            11 => NodeType::RawAjax,
            _ => return None,
        })
    }
}

/// Requested position of a node among its peers.
///
/// `First` and `Last` are resolved against the node table when the node is
/// written, so installs that run later land after earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankSpec {
    Fixed(i64),
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub link: String,
    pub plugin: String,
    pub node_type: NodeType,
    pub extend: Option<NodeId>,
    pub new_window: bool,
    pub rank: i64,
    pub hide: bool,
    pub theme: Option<String>,
    pub alias: Option<String>,
    pub layout: Option<String>,
    pub params: Option<String>,
    pub height: Option<i64>,
}

impl Node {
    /// A plain plugin-script node with every optional attribute unset.
    pub fn new(node_id: NodeId, plugin: &str, link: &str, name: &str) -> Self {
        Self {
            node_id,
            parent_id: None,
            name: name.to_string(),
            link: link.to_string(),
            plugin: plugin.to_string(),
            node_type: NodeType::PluginScript,
            extend: None,
            new_window: false,
            rank: 0,
            hide: false,
            theme: None,
            alias: None,
            layout: None,
            params: None,
            height: None,
        }
    }
}

/// Depth tier recorded in the structure table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureTier {
    RootLeaf,
    RootParent,
    NestedParent,
    NestedLeaf,
}

impl StructureTier {
    pub fn code(self) -> i64 {
        match self {
            StructureTier::RootLeaf => 0,
            StructureTier::RootParent => 1,
            StructureTier::NestedParent => 3,
            StructureTier::NestedLeaf => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StructureTier::RootLeaf),
            1 => Some(StructureTier::RootParent),
            3 => Some(StructureTier::NestedParent),
            4 => Some(StructureTier::NestedLeaf),
            _ => None,
        }
    }

    fn classify(is_root: bool, is_parent: bool) -> Self {
        match (is_root, is_parent) {
            (true, true) => StructureTier::RootParent,
            (true, false) => StructureTier::RootLeaf,
            (false, true) => StructureTier::NestedParent,
            (false, false) => StructureTier::NestedLeaf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureEntry {
    pub position: i64,
    pub node_id: NodeId,
    pub is_parent: bool,
    pub tier: StructureTier,
}

/// Which nodes a delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    Id(NodeId),
    Plugin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fresh install: existing ids are left exactly as they are.
    Insert,
    /// Re-apply: existing ids keep their settings but get the manifest's link path.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    AlreadyExists,
    LinkRefreshed,
}

/// Rows touched by a node id rename, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenameSummary {
    pub nodes: usize,
    pub parent_pointers: usize,
    pub extend_pointers: usize,
    pub permissions: usize,
    pub filters: usize,
    pub cron: usize,
    pub settings: usize,
    pub tags: usize,
}

/// Normalize a `plugin/link` path so equivalent spellings hash the same.
pub fn normalize_node_path(plugin: &str, link: &str) -> String {
    let joined = format!("{}/{}", plugin.trim(), link.trim()).replace('\\', "/");
    joined
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Deterministic node id for a plugin's link path.
pub fn create_node_id(plugin: &str, link: &str) -> NodeId {
    let digest = Sha256::digest(normalize_node_path(plugin, link).as_bytes());
    NodeId(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// Derive the structure table from a node set.
///
/// Nodes are ordered by rank then id, roots are walked depth-first, and each
/// visited node gets the next position. Nodes whose parent does not exist (or
/// that sit on a parent cycle) are unreachable and left out.
pub fn compute_structure(nodes: &[Node]) -> Vec<StructureEntry> {
    let mut ordered: Vec<&Node> = nodes.iter().collect();
    ordered.sort_by_key(|n| (n.rank, n.node_id));

    let known: HashSet<NodeId> = ordered.iter().map(|n| n.node_id).collect();
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut roots = Vec::new();
    for node in &ordered {
        match node.parent_id {
            None => roots.push(node.node_id),
            Some(parent) if known.contains(&parent) => {
                children.entry(parent).or_default().push(node.node_id)
            }
            Some(parent) => {
                tracing::warn!(node = %node.node_id, parent = %parent, "parent missing; node left out of structure");
            }
        }
    }

    let mut entries = Vec::with_capacity(ordered.len());
    let mut visited = HashSet::new();
    for root in roots {
        walk_structure(root, true, &children, &mut visited, &mut entries);
    }
    entries
}

fn walk_structure(
    node_id: NodeId,
    is_root: bool,
    children: &HashMap<NodeId, Vec<NodeId>>,
    visited: &mut HashSet<NodeId>,
    entries: &mut Vec<StructureEntry>,
) {
    if !visited.insert(node_id) {
        return;
    }
    let kids = children.get(&node_id);
    let is_parent = kids.is_some_and(|k| !k.is_empty());
    entries.push(StructureEntry {
        position: entries.len() as i64 + 1,
        node_id,
        is_parent,
        tier: StructureTier::classify(is_root, is_parent),
    });
    if let Some(kids) = kids {
        for kid in kids {
            walk_structure(*kid, false, children, visited, entries);
        }
    }
}

const NODE_COLUMNS: &str = "node_id, parent_node_id, node_name, node_link, plugin, node_type, extend, new_window, node_rank, hide, theme, alias, layout, params, height";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let parent: Option<i64> = row.get(1)?;
    let extend: Option<i64> = row.get(6)?;
    let type_code: i64 = row.get(5)?;
    Ok(Node {
        node_id: NodeId::from_db(0, row.get(0)?)?,
        parent_id: parent.map(|p| NodeId::from_db(1, p)).transpose()?,
        name: row.get(2)?,
        link: row.get(3)?,
        plugin: row.get(4)?,
        node_type: NodeType::from_code(type_code).unwrap_or_default(),
        extend: extend.map(|e| NodeId::from_db(6, e)).transpose()?,
        new_window: row.get::<_, i64>(7)? != 0,
        rank: row.get(8)?,
        hide: row.get::<_, i64>(9)? != 0,
        theme: row.get(10)?,
        alias: row.get(11)?,
        layout: row.get(12)?,
        params: row.get(13)?,
        height: row.get(14)?,
    })
}

pub struct NodeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> NodeRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, node_id: NodeId) -> Result<Option<Node>, PluginctlError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![node_id.to_db()], node_from_row)
            .optional()?)
    }

    pub fn exists(&self, node_id: NodeId) -> Result<bool, PluginctlError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM nodes WHERE node_id = ?1",
                params![node_id.to_db()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Find a node by its link path, preferring one owned by `plugin`.
    pub fn find_by_link(&self, link: &str, plugin: Option<&str>) -> Result<Option<Node>, PluginctlError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE node_link = ?1
             ORDER BY CASE WHEN plugin = ?2 THEN 0 ELSE 1 END, node_id LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![link, plugin.unwrap_or("")], node_from_row)
            .optional()?)
    }

    pub fn list(&self) -> Result<Vec<Node>, PluginctlError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY node_rank ASC, node_id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_by_plugin(&self, plugin: &str) -> Result<Vec<Node>, PluginctlError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE plugin = ?1 ORDER BY node_rank ASC, node_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![plugin], node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn max_rank(&self) -> Result<Option<i64>, PluginctlError> {
        Ok(self
            .conn
            .query_row("SELECT MAX(node_rank) FROM nodes", [], |row| row.get(0))?)
    }

    pub fn min_rank(&self) -> Result<Option<i64>, PluginctlError> {
        Ok(self
            .conn
            .query_row("SELECT MIN(node_rank) FROM nodes", [], |row| row.get(0))?)
    }

    /// Resolve a rank request against the current table contents. Fails when
    /// the table already holds the extreme rank in the requested direction.
    pub fn resolve_rank(&self, spec: RankSpec) -> Result<i64, PluginctlError> {
        let resolved = match spec {
            RankSpec::Fixed(rank) => Some(rank),
            RankSpec::Last => match self.max_rank()? {
                Some(max) => max.checked_add(1),
                None => Some(1),
            },
            RankSpec::First => match self.min_rank()? {
                Some(min) => min.checked_sub(1),
                None => Some(1),
            },
        };
        resolved.ok_or_else(|| {
            let place = if spec == RankSpec::First { "before the first" } else { "after the last" };
            PluginctlError::ValidationError(format!("no rank is free {place} node"))
        })
    }

    /// True when making `parent` the parent of `node_id` would close a loop.
    pub fn would_cycle(&self, node_id: NodeId, parent: NodeId) -> Result<bool, PluginctlError> {
        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == node_id {
                return Ok(true);
            }
            if !seen.insert(current) {
                // Existing loop above us that does not include node_id.
                return Ok(false);
            }
            cursor = self.get(current)?.and_then(|n| n.parent_id);
        }
        Ok(false)
    }

    fn insert(&self, node: &Node) -> Result<(), PluginctlError> {
        if let Some(parent) = node.parent_id {
            if self.would_cycle(node.node_id, parent)? {
                return Err(PluginctlError::ValidationError(format!(
                    "node {} cannot have parent {}: parent chain would cycle",
                    node.node_id, parent
                )));
            }
        }
        let sql = format!(
            "INSERT INTO nodes({NODE_COLUMNS}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        self.conn.execute(
            &sql,
            params![
                node.node_id.to_db(),
                node.parent_id.map(NodeId::to_db),
                node.name,
                node.link,
                node.plugin,
                node.node_type.code(),
                node.extend.map(NodeId::to_db),
                node.new_window as i64,
                node.rank,
                node.hide as i64,
                node.theme,
                node.alias,
                node.layout,
                node.params,
                node.height,
            ],
        )?;
        Ok(())
    }

    /// Write a node. An id that is already present counts as "already exists";
    /// in update mode only its link path is refreshed.
    pub fn upsert(&self, node: &Node, mode: WriteMode) -> Result<UpsertOutcome, PluginctlError> {
        match self.get(node.node_id)? {
            None => {
                self.insert(node)?;
                Ok(UpsertOutcome::Created)
            }
            Some(existing) if mode == WriteMode::Update && existing.link != node.link => {
                self.conn.execute(
                    "UPDATE nodes SET node_link = ?1 WHERE node_id = ?2",
                    params![node.link, node.node_id.to_db()],
                )?;
                Ok(UpsertOutcome::LinkRefreshed)
            }
            Some(_) => Ok(UpsertOutcome::AlreadyExists),
        }
    }

    pub fn grant_permission(&self, role_id: i64, node_id: NodeId) -> Result<(), PluginctlError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO role_permissions(role_id, node_id) VALUES(?1, ?2)",
            params![role_id, node_id.to_db()],
        )?;
        Ok(())
    }

    pub fn structure(&self) -> Result<Vec<StructureEntry>, PluginctlError> {
        let mut stmt = self.conn.prepare(
            "SELECT position, node_id, is_parent, tier FROM node_structure ORDER BY position",
        )?;
        let rows = stmt.query_map([], |row| {
            let tier_code: i64 = row.get(3)?;
            Ok(StructureEntry {
                position: row.get(0)?,
                node_id: NodeId::from_db(1, row.get(1)?)?,
                is_parent: row.get::<_, i64>(2)? != 0,
                tier: StructureTier::from_code(tier_code)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, tier_code))?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Regenerate the structure table from the node table. Returns the number
    /// of entries written.
    pub fn rebuild_structure(&self) -> Result<usize, PluginctlError> {
        let nodes = self.list()?;
        let entries = compute_structure(&nodes);
        with_savepoint(self.conn, "rebuild_structure", |conn| {
            conn.execute("DELETE FROM node_structure", [])?;
            let mut stmt = conn.prepare(
                "INSERT INTO node_structure(position, node_id, is_parent, tier) VALUES(?1, ?2, ?3, ?4)",
            )?;
            for entry in &entries {
                stmt.execute(params![
                    entry.position,
                    entry.node_id.to_db(),
                    entry.is_parent as i64,
                    entry.tier.code(),
                ])?;
            }
            Ok(())
        })?;
        tracing::debug!(entries = entries.len(), "node structure rebuilt");
        Ok(entries.len())
    }

    /// Delete nodes by id or by owning plugin, then rebuild the structure.
    ///
    /// With `critical_only` the permission, filter and cron rows that point at
    /// the deleted nodes are left in place.
    pub fn delete_node(&self, target: &NodeTarget, critical_only: bool) -> Result<usize, PluginctlError> {
        with_savepoint(self.conn, "delete_node", |conn| {
            let ids: Vec<NodeId> = match target {
                NodeTarget::Id(id) => {
                    if self.exists(*id)? {
                        vec![*id]
                    } else {
                        Vec::new()
                    }
                }
                NodeTarget::Plugin(plugin) => self
                    .list_by_plugin(plugin)?
                    .into_iter()
                    .map(|n| n.node_id)
                    .collect(),
            };
            for id in &ids {
                let raw = id.to_db();
                conn.execute("DELETE FROM nodes WHERE node_id = ?1", params![raw])?;
                conn.execute("DELETE FROM node_structure WHERE node_id = ?1", params![raw])?;
                if !critical_only {
                    conn.execute("DELETE FROM role_permissions WHERE node_id = ?1", params![raw])?;
                    conn.execute("DELETE FROM search_filters WHERE node_id = ?1", params![raw])?;
                    conn.execute("DELETE FROM cron WHERE node_id = ?1", params![raw])?;
                }
            }
            self.rebuild_structure()?;
            Ok(ids.len())
        })
    }

    /// Rename a node id and rewrite every reference to it.
    pub fn update_node_id(&self, new_id: NodeId, old_id: NodeId) -> Result<RenameSummary, PluginctlError> {
        if new_id == old_id {
            return Ok(RenameSummary::default());
        }
        with_savepoint(self.conn, "update_node_id", |conn| {
            if !self.exists(old_id)? {
                return Err(PluginctlError::NotFound(format!("node {old_id}")));
            }
            if self.exists(new_id)? {
                return Err(PluginctlError::ValidationError(format!(
                    "node {new_id} already exists"
                )));
            }
            let (new_raw, old_raw) = (new_id.to_db(), old_id.to_db());
            let (new_text, old_text) = (new_id.to_string(), old_id.to_string());
            let summary = RenameSummary {
                nodes: conn.execute(
                    "UPDATE nodes SET node_id = ?1 WHERE node_id = ?2",
                    params![new_raw, old_raw],
                )?,
                parent_pointers: conn.execute(
                    "UPDATE nodes SET parent_node_id = ?1 WHERE parent_node_id = ?2",
                    params![new_raw, old_raw],
                )?,
                extend_pointers: conn.execute(
                    "UPDATE nodes SET extend = ?1 WHERE extend = ?2",
                    params![new_raw, old_raw],
                )?,
                permissions: conn.execute(
                    "UPDATE OR REPLACE role_permissions SET node_id = ?1 WHERE node_id = ?2",
                    params![new_raw, old_raw],
                )?,
                filters: conn.execute(
                    "UPDATE search_filters SET node_id = ?1 WHERE node_id = ?2",
                    params![new_raw, old_raw],
                )?,
                cron: conn.execute(
                    "UPDATE OR REPLACE cron SET node_id = ?1 WHERE node_id = ?2",
                    params![new_raw, old_raw],
                )?,
                settings: conn.execute(
                    "UPDATE settings SET setting_value = ?1 WHERE setting_value = ?2",
                    params![new_text, old_text],
                )?,
                tags: conn.execute(
                    "UPDATE tags SET tag_target = ?1 WHERE tag_target = ?2",
                    params![new_text, old_text],
                )?,
            };
            self.rebuild_structure()?;
            tracing::info!(old = %old_id, new = %new_id, "node id renamed");
            Ok(summary)
        })
    }
}
