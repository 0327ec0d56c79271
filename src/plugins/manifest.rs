//! Plugin manifest parsing.
//!
//! A manifest (`config/plugin.config.xml` inside a plugin folder) declares what
//! a plugin installs: nodes, settings, class registrations, SQL, dependencies,
//! and versioned upgrade blocks. Parsing turns the XML into an immutable
//! [`PluginManifest`] with every attribute fallback already decided, so the
//! install pipeline never looks at raw XML.

use crate::core::error::PluginctlError;
use crate::plugins::nodes::{NodeId, NodeType, RankSpec, create_node_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_RELATIVE_PATH: &str = "config/plugin.config.xml";

/// Location of the manifest inside a plugin folder.
pub fn manifest_path(plugin_dir: &Path) -> PathBuf {
    plugin_dir.join(MANIFEST_RELATIVE_PATH)
}

// ===== Raw XML shape =====

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    author: Option<String>,
    install: Option<RawInstall>,
    #[serde(default)]
    upgrade: Vec<RawUpgrade>,
    uninstall: Option<RawUninstall>,
}

#[derive(Debug, Deserialize)]
struct RawInstall {
    #[serde(rename = "@version")]
    version: Option<String>,
    dependencies: Option<RawDependencies>,
    queries: Option<RawQueries>,
    classes: Option<RawClasses>,
    settings: Option<RawSettings>,
    nodes: Option<RawNodes>,
}

#[derive(Debug, Deserialize)]
struct RawUpgrade {
    #[serde(rename = "@version")]
    version: String,
    queries: Option<RawQueries>,
    settings: Option<RawSettings>,
    nodes: Option<RawNodes>,
}

#[derive(Debug, Deserialize)]
struct RawUninstall {
    queries: Option<RawQueries>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDependencies {
    #[serde(default)]
    dependency: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    #[serde(rename = "@plugin")]
    plugin: String,
    #[serde(rename = "@class")]
    class: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawQueries {
    #[serde(default)]
    query: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClasses {
    #[serde(default)]
    class: Vec<RawClass>,
}

#[derive(Debug, Deserialize)]
struct RawClass {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@alias")]
    alias: Option<String>,
    #[serde(rename = "@plugin")]
    plugin: Option<String>,
    #[serde(rename = "@rank")]
    rank: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    setting: Vec<RawSetting>,
}

#[derive(Debug, Deserialize)]
struct RawSetting {
    #[serde(rename = "@write")]
    write: Option<String>,
    #[serde(rename = "@delete")]
    delete: Option<String>,
    #[serde(rename = "@note")]
    note: Option<String>,
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNodes {
    #[serde(default)]
    node: Vec<RawNode>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNode {
    #[serde(rename = "@nodeid")]
    nodeid: Option<String>,
    #[serde(rename = "@link")]
    link: Option<String>,
    #[serde(rename = "@parentlink")]
    parentlink: Option<String>,
    #[serde(rename = "@parentnodeid")]
    parentnodeid: Option<String>,
    #[serde(rename = "@alias")]
    alias: Option<String>,
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@plugin")]
    plugin: Option<String>,
    #[serde(rename = "@theme")]
    theme: Option<String>,
    #[serde(rename = "@layout")]
    layout: Option<String>,
    #[serde(rename = "@rank")]
    rank: Option<String>,
    #[serde(rename = "@type")]
    node_type: Option<String>,
    #[serde(rename = "@newwindow")]
    newwindow: Option<String>,
    #[serde(rename = "@hide")]
    hide: Option<String>,
    #[serde(rename = "@noautopermission")]
    noautopermission: Option<String>,
    #[serde(rename = "@symlink")]
    symlink: Option<String>,
    #[serde(rename = "@height")]
    height: Option<String>,
    #[serde(rename = "@params")]
    params: Option<String>,
    #[serde(rename = "@delete")]
    delete: Option<String>,
    #[serde(default)]
    node: Vec<RawNode>,
}

// ===== Normalized manifest =====

/// Where a node hangs in the tree, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParentRef {
    /// `parentnodeid` attribute.
    Explicit { node_id: NodeId },
    /// `parentlink` attribute; resolved against the node table at write time.
    Link { plugin: String, link: String },
    /// Nested inside another `<node>` of the same manifest.
    Inherited { node_id: NodeId },
    Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDirective {
    pub node_id: NodeId,
    pub link: String,
    pub name: String,
    pub plugin: String,
    pub parent: ParentRef,
    pub node_type: NodeType,
    pub rank: RankSpec,
    pub new_window: bool,
    pub hide: bool,
    pub auto_permission: bool,
    /// Link path of the node a `LinkExisting` node points at.
    pub symlink: Option<String>,
    pub theme: Option<String>,
    pub alias: Option<String>,
    pub layout: Option<String>,
    pub params: Option<String>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingEntry {
    pub name: String,
    pub value: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassEntry {
    pub name: String,
    pub alias: Option<String>,
    pub plugin: String,
    /// `None` means "after every existing registration of this class name".
    pub rank: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub class: String,
    pub plugin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeBlock {
    pub version: u32,
    pub queries: Vec<String>,
    pub setting_writes: Vec<SettingEntry>,
    pub setting_deletes: Vec<String>,
    pub node_removals: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginManifest {
    pub plugin_folder: String,
    pub name: String,
    /// Display version as written in `<version>`.
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    /// Schema version a fresh install reaches, and the target of upgrades.
    pub install_version: u32,
    pub nodes: Vec<NodeDirective>,
    pub settings: Vec<SettingEntry>,
    pub classes: Vec<ClassEntry>,
    pub install_queries: Vec<String>,
    pub uninstall_queries: Vec<String>,
    /// Sorted by ascending version.
    pub upgrades: Vec<UpgradeBlock>,
    pub dependencies: Vec<Dependency>,
}

impl PluginManifest {
    pub fn from_file(path: &Path, plugin_folder: &str) -> Result<Self, PluginctlError> {
        let xml = std::fs::read_to_string(path).map_err(|e| {
            PluginctlError::ManifestError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&xml, plugin_folder)
    }

    pub fn parse(xml: &str, plugin_folder: &str) -> Result<Self, PluginctlError> {
        let raw: RawManifest = quick_xml::de::from_str(xml)
            .map_err(|e| PluginctlError::ManifestError(format!("{plugin_folder}: {e}")))?;

        let name = non_empty(raw.name).ok_or_else(|| {
            PluginctlError::ManifestError(format!("{plugin_folder}: <name> is missing"))
        })?;
        let version = non_empty(raw.version).unwrap_or_default();

        let install = raw.install;
        let install_version = match install.as_ref().and_then(|i| non_empty(i.version.clone())) {
            Some(v) => parse_version(&v, plugin_folder)?,
            None => version.trim().parse::<u32>().unwrap_or(0),
        };

        let mut manifest = PluginManifest {
            plugin_folder: plugin_folder.to_string(),
            name,
            version,
            description: non_empty(raw.description),
            author: non_empty(raw.author),
            install_version,
            nodes: Vec::new(),
            settings: Vec::new(),
            classes: Vec::new(),
            install_queries: Vec::new(),
            uninstall_queries: clean_queries(raw.uninstall.and_then(|u| u.queries)),
            upgrades: Vec::new(),
            dependencies: Vec::new(),
        };

        if let Some(install) = install {
            for raw_node in install.nodes.unwrap_or_default().node {
                flatten_node(raw_node, None, plugin_folder, &mut manifest.nodes)?;
            }
            let (writes, _) = split_settings(install.settings, plugin_folder)?;
            manifest.settings = dedup_settings(writes);
            manifest.classes = install
                .classes
                .unwrap_or_default()
                .class
                .into_iter()
                .map(|c| to_class_entry(c, plugin_folder))
                .collect::<Result<_, _>>()?;
            manifest.install_queries = clean_queries(install.queries);
            manifest.dependencies = install
                .dependencies
                .unwrap_or_default()
                .dependency
                .into_iter()
                .map(|d| Dependency {
                    class: d.class.trim().to_string(),
                    plugin: d.plugin.trim().to_string(),
                })
                .collect();
        }

        for raw_upgrade in raw.upgrade {
            manifest
                .upgrades
                .push(to_upgrade_block(raw_upgrade, plugin_folder)?);
        }
        manifest.upgrades.sort_by_key(|u| u.version);

        Ok(manifest)
    }

    /// Schema version the manifest declares as current. The install section
    /// describes this version in full; upgrade blocks only carry older sites
    /// forward to it.
    pub fn latest_version(&self) -> u32 {
        self.install_version
    }

    /// Upgrade blocks to apply from `installed`, ascending. Blocks above the
    /// declared install version are not part of any reachable schema yet.
    pub fn pending_upgrades(&self, installed: u32) -> impl Iterator<Item = &UpgradeBlock> {
        let latest = self.latest_version();
        self.upgrades
            .iter()
            .filter(move |u| installed < u.version && u.version <= latest)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(value: &Option<String>) -> bool {
    matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

fn parse_version(value: &str, plugin_folder: &str) -> Result<u32, PluginctlError> {
    value.trim().parse::<u32>().map_err(|_| {
        PluginctlError::ManifestError(format!("{plugin_folder}: invalid version {value:?}"))
    })
}

fn parse_rank(value: Option<String>, plugin_folder: &str) -> Result<RankSpec, PluginctlError> {
    let Some(value) = non_empty(value) else {
        return Ok(RankSpec::Last);
    };
    match value.to_ascii_lowercase().as_str() {
        "last" => Ok(RankSpec::Last),
        "first" => Ok(RankSpec::First),
        other => other.parse::<i64>().map(RankSpec::Fixed).map_err(|_| {
            PluginctlError::ManifestError(format!("{plugin_folder}: invalid rank {value:?}"))
        }),
    }
}

fn parse_node_type(value: Option<String>, plugin_folder: &str) -> Result<NodeType, PluginctlError> {
    let Some(value) = non_empty(value) else {
        return Ok(NodeType::PluginScript);
    };
    value
        .parse::<i64>()
        .ok()
        .and_then(NodeType::from_code)
        .ok_or_else(|| {
            PluginctlError::ManifestError(format!("{plugin_folder}: invalid node type {value:?}"))
        })
}

fn clean_queries(queries: Option<RawQueries>) -> Vec<String> {
    queries
        .unwrap_or_default()
        .query
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

/// Node id for a directive: explicit `nodeid` wins over the (plugin, link) hash.
fn directive_id(
    nodeid: Option<String>,
    plugin: &str,
    link: Option<&str>,
    plugin_folder: &str,
) -> Result<NodeId, PluginctlError> {
    if let Some(explicit) = non_empty(nodeid) {
        return explicit.parse::<NodeId>().map_err(|_| {
            PluginctlError::ManifestError(format!("{plugin_folder}: invalid nodeid {explicit:?}"))
        });
    }
    match link {
        Some(link) => Ok(create_node_id(plugin, link)),
        None => Err(PluginctlError::ManifestError(format!(
            "{plugin_folder}: node needs a link or a nodeid"
        ))),
    }
}

fn flatten_node(
    raw: RawNode,
    enclosing: Option<NodeId>,
    plugin_folder: &str,
    out: &mut Vec<NodeDirective>,
) -> Result<(), PluginctlError> {
    let plugin = non_empty(raw.plugin).unwrap_or_else(|| plugin_folder.to_string());
    let link = non_empty(raw.link);
    let node_id = directive_id(raw.nodeid, &plugin, link.as_deref(), plugin_folder)?;

    let parent = if let Some(explicit) = non_empty(raw.parentnodeid) {
        ParentRef::Explicit {
            node_id: explicit.parse::<NodeId>().map_err(|_| {
                PluginctlError::ManifestError(format!(
                    "{plugin_folder}: invalid parentnodeid {explicit:?}"
                ))
            })?,
        }
    } else if let Some(parent_link) = non_empty(raw.parentlink) {
        ParentRef::Link {
            plugin: plugin.clone(),
            link: parent_link,
        }
    } else if let Some(node_id) = enclosing {
        ParentRef::Inherited { node_id }
    } else {
        ParentRef::Root
    };

    let height = match non_empty(raw.height) {
        Some(h) => Some(h.parse::<i64>().map_err(|_| {
            PluginctlError::ManifestError(format!("{plugin_folder}: invalid height {h:?}"))
        })?),
        None => None,
    };

    let name = non_empty(raw.name).unwrap_or_default();
    out.push(NodeDirective {
        node_id,
        link: link.unwrap_or_default(),
        name,
        plugin,
        parent,
        node_type: parse_node_type(raw.node_type, plugin_folder)?,
        rank: parse_rank(raw.rank, plugin_folder)?,
        new_window: parse_flag(&raw.newwindow),
        hide: parse_flag(&raw.hide),
        auto_permission: !parse_flag(&raw.noautopermission),
        symlink: non_empty(raw.symlink),
        theme: non_empty(raw.theme),
        alias: non_empty(raw.alias),
        layout: non_empty(raw.layout),
        params: non_empty(raw.params),
        height,
    });

    for child in raw.node {
        flatten_node(child, Some(node_id), plugin_folder, out)?;
    }
    Ok(())
}

/// Split `<setting>` elements into writes and delete keys.
fn split_settings(
    settings: Option<RawSettings>,
    plugin_folder: &str,
) -> Result<(Vec<SettingEntry>, Vec<String>), PluginctlError> {
    let mut writes = Vec::new();
    let mut deletes = Vec::new();
    for setting in settings.unwrap_or_default().setting {
        if let Some(name) = non_empty(setting.write) {
            writes.push(SettingEntry {
                name,
                value: setting.value.map(|v| v.trim().to_string()).unwrap_or_default(),
                note: non_empty(setting.note),
            });
        } else if let Some(name) = non_empty(setting.delete) {
            deletes.push(name);
        } else {
            return Err(PluginctlError::ManifestError(format!(
                "{plugin_folder}: <setting> needs a write or delete attribute"
            )));
        }
    }
    Ok((writes, deletes))
}

/// Later writes of the same name replace earlier ones, keeping first position.
fn dedup_settings(writes: Vec<SettingEntry>) -> Vec<SettingEntry> {
    let mut out: Vec<SettingEntry> = Vec::with_capacity(writes.len());
    for entry in writes {
        match out.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => out.push(entry),
        }
    }
    out
}

fn to_class_entry(raw: RawClass, plugin_folder: &str) -> Result<ClassEntry, PluginctlError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(PluginctlError::ManifestError(format!(
            "{plugin_folder}: <class> without a name"
        )));
    }
    let rank = match non_empty(raw.rank) {
        Some(r) => Some(r.parse::<i64>().map_err(|_| {
            PluginctlError::ManifestError(format!("{plugin_folder}: invalid class rank {r:?}"))
        })?),
        None => None,
    };
    Ok(ClassEntry {
        name,
        alias: non_empty(raw.alias),
        plugin: non_empty(raw.plugin).unwrap_or_else(|| plugin_folder.to_string()),
        rank,
    })
}

fn to_upgrade_block(raw: RawUpgrade, plugin_folder: &str) -> Result<UpgradeBlock, PluginctlError> {
    let version = parse_version(&raw.version, plugin_folder)?;
    let (setting_writes, setting_deletes) = split_settings(raw.settings, plugin_folder)?;
    let mut node_removals = Vec::new();
    for node in raw.nodes.unwrap_or_default().node {
        if !parse_flag(&node.delete) {
            tracing::warn!(plugin = plugin_folder, version, "upgrade <node> without delete=\"1\" ignored");
            continue;
        }
        let plugin = non_empty(node.plugin).unwrap_or_else(|| plugin_folder.to_string());
        let link = non_empty(node.link);
        node_removals.push(directive_id(node.nodeid, &plugin, link.as_deref(), plugin_folder)?);
    }
    Ok(UpgradeBlock {
        version,
        queries: clean_queries(raw.queries),
        setting_writes,
        setting_deletes,
        node_removals,
    })
}
