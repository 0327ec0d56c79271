//! Plugin install, upgrade, reinstall and uninstall.
//!
//! Every operation resolves the manifest first and fails fast before touching
//! the database. Database work then runs inside one savepoint, so a failing
//! step leaves nodes, settings, classes and the activation record exactly as
//! they were. Each operation ends by rebuilding the node structure and flushing
//! the derived-data cache.

use crate::core::cache::Cache;
use crate::core::config::{Config, SqlFailurePolicy};
use crate::core::db::with_savepoint;
use crate::core::error::PluginctlError;
use crate::core::output::compact_line;
use crate::plugins::activation::{ActivationStatus, ActivationStore};
use crate::plugins::dependencies::{collect_dependencies, plan_install_order};
use crate::plugins::lifecycle::{Action, Lifecycle, PluginState};
use crate::plugins::manifest::{ParentRef, PluginManifest};
use crate::plugins::nodes::{Node, NodeId, NodeRepository, NodeTarget, UpsertOutcome, WriteMode, create_node_id};
use crate::plugins::registry::{ClassRegistry, SettingsStore};
use crate::plugins::repository::{RepositoryClient, Transport};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
}

/// One line of an operation's structured log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub step: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Default)]
struct OperationLog {
    entries: Vec<LogEntry>,
}

impl OperationLog {
    fn info(&mut self, step: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(step, "{message}");
        self.entries.push(LogEntry {
            step: step.to_string(),
            level: LogLevel::Info,
            message,
        });
    }

    fn warn(&mut self, step: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(step, "{message}");
        self.entries.push(LogEntry {
            step: step.to_string(),
            level: LogLevel::Warn,
            message,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub plugin: String,
    pub action: Action,
    pub from: PluginState,
    pub to: PluginState,
    /// Activation version after the operation.
    pub version: Option<u32>,
    /// Lifecycle states visited, starting state included.
    pub states: Vec<PluginState>,
    pub log: Vec<LogEntry>,
}

impl OperationReport {
    fn new(plugin: &str, action: Action, lifecycle: &Lifecycle, version: Option<u32>, log: OperationLog) -> Self {
        let states = lifecycle.history().to_vec();
        Self {
            plugin: plugin.to_string(),
            action,
            from: states.first().copied().unwrap_or(lifecycle.state()),
            to: lifecycle.state(),
            version,
            states,
            log: log.entries,
        }
    }

    pub fn warnings(&self) -> usize {
        self.log.iter().filter(|e| e.level == LogLevel::Warn).count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Fetch the plugin folder from its repository when it is not present
    /// locally.
    pub download: bool,
}

/// Pipeline settings taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub admin_role_id: i64,
    pub sql_failure_policy: SqlFailurePolicy,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            admin_role_id: config.admin_role_id,
            sql_failure_policy: config.sql_failure_policy,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            admin_role_id: 1,
            sql_failure_policy: SqlFailurePolicy::Abort,
        }
    }
}

pub struct InstallPipeline<'a, T: Transport> {
    conn: &'a Connection,
    nodes: NodeRepository<'a>,
    client: &'a RepositoryClient<T>,
    options: PipelineOptions,
}

impl<'a, T: Transport> InstallPipeline<'a, T> {
    pub fn new(
        conn: &'a Connection,
        nodes: NodeRepository<'a>,
        client: &'a RepositoryClient<T>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            conn,
            nodes,
            client,
            options,
        }
    }

    fn lifecycle(&self, plugin: &str) -> Result<Lifecycle, PluginctlError> {
        let status = ActivationStore::new(self.conn).status(plugin)?;
        Ok(Lifecycle::new(plugin, PluginState::from_status(status)))
    }

    pub fn install(&self, plugin: &str, options: InstallOptions) -> Result<OperationReport, PluginctlError> {
        let mut lifecycle = self.lifecycle(plugin)?;
        lifecycle.begin(Action::Install)?;
        let mut log = OperationLog::default();

        if !self.client.has_local_manifest(plugin) {
            if !options.download {
                return Err(PluginctlError::ManifestError(format!(
                    "{plugin}: plugin folder is not present locally; download it first"
                )));
            }
            lifecycle.advance(PluginState::Downloading)?;
            let archive = self.client.download_archive(plugin)?;
            log.info("download", format!("downloaded {}", archive.path.display()));
            lifecycle.advance(PluginState::Extracting)?;
            let target = self.client.extract_archive(plugin, &archive)?;
            log.info("extract", format!("extracted into {}", target.display()));
        }

        let manifest = self.client.resolve_manifest(plugin)?;
        self.check_dependencies(&manifest)?;

        lifecycle.advance(PluginState::Installing)?;
        let version = manifest.latest_version();
        with_savepoint(self.conn, "plugin_install", |conn| {
            self.write_nodes(&manifest, WriteMode::Insert, &mut log)?;
            self.write_settings(&manifest, &mut log)?;
            self.write_classes(&manifest, &mut log)?;
            self.drop_previous(&manifest, &mut log)?;
            self.run_queries("install_sql", &manifest.install_queries, &mut log)?;
            ActivationStore::new(conn).write(plugin, ActivationStatus::Install, version)?;
            log.info("activation", format!("{plugin} installed at version {version}"));
            self.finish(&mut log)
        })?;
        lifecycle.advance(PluginState::Installed)?;

        Ok(OperationReport::new(plugin, Action::Install, &lifecycle, Some(version), log))
    }

    /// Install `plugin` after every plugin that provides a class it is missing.
    pub fn install_with_dependencies(
        &self,
        plugin: &str,
        options: InstallOptions,
    ) -> Result<Vec<OperationReport>, PluginctlError> {
        let registered = ClassRegistry::new(self.conn).registered_names()?;
        let order = plan_install_order(plugin, &registered, |name| self.client.resolve_manifest(name))?;
        tracing::info!(plugin, order = ?order, "install order planned");

        let activation = ActivationStore::new(self.conn);
        let mut reports = Vec::new();
        for name in &order {
            if name != plugin && activation.status(name)? == ActivationStatus::Install {
                tracing::info!(plugin = %name, "dependency already installed");
                continue;
            }
            reports.push(self.install(name, options)?);
        }
        Ok(reports)
    }

    pub fn upgrade(&self, plugin: &str) -> Result<OperationReport, PluginctlError> {
        let mut lifecycle = self.lifecycle(plugin)?;
        lifecycle.begin(Action::Upgrade)?;
        let mut log = OperationLog::default();

        let manifest = self.client.resolve_manifest(plugin)?;
        let activation = ActivationStore::new(self.conn);
        let installed = activation.get(plugin)?.map_or(0, |r| r.version);
        let latest = manifest.latest_version();
        if installed >= latest {
            log.info("upgrade", format!("{plugin} is already at version {installed}"));
            return Ok(OperationReport::new(plugin, Action::Upgrade, &lifecycle, Some(installed), log));
        }

        // Nodes an upgrade block removes stay removed even though the install
        // section may still list them.
        let removed: HashSet<NodeId> = manifest
            .pending_upgrades(installed)
            .flat_map(|block| block.node_removals.iter().copied())
            .collect();
        let mut current = manifest.clone();
        current.nodes.retain(|directive| !removed.contains(&directive.node_id));

        lifecycle.advance(PluginState::Upgrading)?;
        with_savepoint(self.conn, "plugin_upgrade", |conn| {
            let settings = SettingsStore::new(conn);
            for block in manifest.pending_upgrades(installed) {
                let step = format!("upgrade_{}", block.version);
                self.run_queries(&step, &block.queries, &mut log)?;
                for entry in &block.setting_writes {
                    settings.write(plugin, entry)?;
                }
                for name in &block.setting_deletes {
                    settings.delete(plugin, name)?;
                }
                for node_id in &block.node_removals {
                    self.nodes.delete_node(&NodeTarget::Id(*node_id), false)?;
                }
                log.info(
                    &step,
                    format!(
                        "applied upgrade {}: {} queries, {} settings written, {} settings removed, {} nodes removed",
                        block.version,
                        block.queries.len(),
                        block.setting_writes.len(),
                        block.setting_deletes.len(),
                        block.node_removals.len()
                    ),
                );
            }
            self.write_nodes(&current, WriteMode::Update, &mut log)?;
            self.write_classes(&current, &mut log)?;
            ActivationStore::new(conn).write(plugin, ActivationStatus::Install, latest)?;
            log.info("activation", format!("{plugin} upgraded from {installed} to {latest}"));
            self.finish(&mut log)
        })?;
        lifecycle.advance(PluginState::Installed)?;

        Ok(OperationReport::new(plugin, Action::Upgrade, &lifecycle, Some(latest), log))
    }

    /// Re-apply the manifest's nodes to an installed plugin.
    pub fn reinstall(&self, plugin: &str) -> Result<OperationReport, PluginctlError> {
        let mut lifecycle = self.lifecycle(plugin)?;
        lifecycle.begin(Action::Reinstall)?;
        let mut log = OperationLog::default();

        let manifest = self.client.resolve_manifest(plugin)?;
        lifecycle.advance(PluginState::Reinstalling)?;
        with_savepoint(self.conn, "plugin_reinstall", |_| {
            self.write_nodes(&manifest, WriteMode::Update, &mut log)?;
            self.finish(&mut log)
        })?;
        lifecycle.advance(PluginState::Installed)?;

        let version = ActivationStore::new(self.conn).get(plugin)?.map(|r| r.version);
        Ok(OperationReport::new(plugin, Action::Reinstall, &lifecycle, version, log))
    }

    pub fn uninstall(&self, plugin: &str) -> Result<OperationReport, PluginctlError> {
        let mut lifecycle = self.lifecycle(plugin)?;
        lifecycle.begin(Action::Uninstall)?;
        let activation = ActivationStore::new(self.conn);
        if activation.get(plugin)?.is_some_and(|r| r.persistent) {
            return Err(PluginctlError::ValidationError(format!(
                "{plugin} is persistent and cannot be uninstalled"
            )));
        }
        let mut log = OperationLog::default();

        let manifest = self.client.resolve_manifest(plugin)?;
        lifecycle.advance(PluginState::Uninstalling)?;
        with_savepoint(self.conn, "plugin_uninstall", |conn| {
            let removed = self.nodes.delete_node(&NodeTarget::Plugin(plugin.to_string()), false)?;
            log.info("nodes", format!("removed {removed} nodes"));
            let settings = SettingsStore::new(conn).delete_plugin(plugin)?;
            log.info("settings", format!("removed {settings} settings"));
            let classes = ClassRegistry::new(conn).delete_plugin(plugin)?;
            log.info("classes", format!("removed {classes} class registrations"));
            self.run_queries("uninstall_sql", &manifest.uninstall_queries, &mut log)?;
            ActivationStore::new(conn).delete(plugin)?;
            log.info("activation", format!("{plugin} uninstalled"));
            self.finish(&mut log)
        })?;
        lifecycle.advance(PluginState::Uninstalled)?;

        Ok(OperationReport::new(plugin, Action::Uninstall, &lifecycle, None, log))
    }

    pub fn set_persistent(&self, plugin: &str, persistent: bool) -> Result<(), PluginctlError> {
        ActivationStore::new(self.conn).set_persistent(plugin, persistent)?;
        tracing::info!(plugin, persistent, "persistent flag updated");
        Ok(())
    }

    fn check_dependencies(&self, manifest: &PluginManifest) -> Result<(), PluginctlError> {
        let registered = ClassRegistry::new(self.conn).registered_names()?;
        let missing: Vec<_> = collect_dependencies(manifest, &registered)
            .into_iter()
            .filter(|dep| dep.plugin != manifest.plugin_folder)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PluginctlError::DependencyError(missing))
        }
    }

    /// Write every node directive of `manifest`. Existing ids are kept, so
    /// running this twice never duplicates a node.
    pub fn apply_nodes(
        &self,
        manifest: &PluginManifest,
        mode: WriteMode,
    ) -> Result<Vec<(Node, UpsertOutcome)>, PluginctlError> {
        let mut written = Vec::with_capacity(manifest.nodes.len());
        for directive in &manifest.nodes {
            let parent_id = self.resolve_parent(&directive.parent)?;
            let extend = match &directive.symlink {
                Some(target) => Some(self.resolve_link(&directive.plugin, target)?),
                None => None,
            };
            let node = Node {
                node_id: directive.node_id,
                parent_id,
                name: directive.name.clone(),
                link: directive.link.clone(),
                plugin: directive.plugin.clone(),
                node_type: directive.node_type,
                extend,
                new_window: directive.new_window,
                rank: self.nodes.resolve_rank(directive.rank)?,
                hide: directive.hide,
                theme: directive.theme.clone(),
                alias: directive.alias.clone(),
                layout: directive.layout.clone(),
                params: directive.params.clone(),
                height: directive.height,
            };
            let outcome = self.nodes.upsert(&node, mode)?;
            if outcome == UpsertOutcome::Created && directive.auto_permission {
                self.nodes.grant_permission(self.options.admin_role_id, node.node_id)?;
            }
            written.push((node, outcome));
        }
        Ok(written)
    }

    fn write_nodes(&self, manifest: &PluginManifest, mode: WriteMode, log: &mut OperationLog) -> Result<(), PluginctlError> {
        for (node, outcome) in self.apply_nodes(manifest, mode)? {
            let message = match outcome {
                UpsertOutcome::Created => format!("created node {} ({})", node.node_id, node.link),
                UpsertOutcome::LinkRefreshed => format!("refreshed link of node {} to {}", node.node_id, node.link),
                UpsertOutcome::AlreadyExists => format!("node {} already exists", node.node_id),
            };
            log.info("nodes", message);
        }
        Ok(())
    }

    fn resolve_parent(&self, parent: &ParentRef) -> Result<Option<NodeId>, PluginctlError> {
        Ok(match parent {
            ParentRef::Root => None,
            ParentRef::Explicit { node_id } | ParentRef::Inherited { node_id } => Some(*node_id),
            ParentRef::Link { plugin, link } => Some(self.resolve_link(plugin, link)?),
        })
    }

    /// Id of the node at `link`: an existing node when one matches, otherwise
    /// the id that node will get once installed.
    fn resolve_link(&self, plugin: &str, link: &str) -> Result<NodeId, PluginctlError> {
        match self.nodes.find_by_link(link, Some(plugin))? {
            Some(node) => Ok(node.node_id),
            None => Ok(create_node_id(plugin, link)),
        }
    }

    fn write_settings(&self, manifest: &PluginManifest, log: &mut OperationLog) -> Result<(), PluginctlError> {
        let settings = SettingsStore::new(self.conn);
        for entry in &manifest.settings {
            settings.write(&manifest.plugin_folder, entry)?;
        }
        log.info("settings", format!("wrote {} settings", manifest.settings.len()));
        Ok(())
    }

    fn write_classes(&self, manifest: &PluginManifest, log: &mut OperationLog) -> Result<(), PluginctlError> {
        let registry = ClassRegistry::new(self.conn);
        registry.delete_plugin(&manifest.plugin_folder)?;
        for entry in &manifest.classes {
            let rank = registry.register(entry)?;
            log.info("classes", format!("registered class {} at rank {rank}", entry.name));
        }
        Ok(())
    }

    /// Run the uninstall queries ahead of a fresh install so leftovers of an
    /// earlier install are dropped. Failures here only warn.
    fn drop_previous(&self, manifest: &PluginManifest, log: &mut OperationLog) -> Result<(), PluginctlError> {
        for sql in &manifest.uninstall_queries {
            if let Err(e) = self.conn.execute_batch(sql) {
                log.warn("drop_sql", format!("{}: {e}", compact_line(sql, 80)));
            }
        }
        Ok(())
    }

    fn run_queries(&self, step: &str, queries: &[String], log: &mut OperationLog) -> Result<(), PluginctlError> {
        for sql in queries {
            match self.conn.execute_batch(sql) {
                Ok(()) => log.info(step, format!("executed {}", compact_line(sql, 80))),
                Err(e) => match self.options.sql_failure_policy {
                    SqlFailurePolicy::Abort => {
                        return Err(PluginctlError::DatabaseError {
                            statement: compact_line(sql, 200),
                            reason: e.to_string(),
                        });
                    }
                    SqlFailurePolicy::Continue => {
                        log.warn(step, format!("{} failed: {e}", compact_line(sql, 80)));
                    }
                },
            }
        }
        Ok(())
    }

    fn finish(&self, log: &mut OperationLog) -> Result<(), PluginctlError> {
        let entries = self.nodes.rebuild_structure()?;
        log.info("structure", format!("rebuilt {entries} structure entries"));
        let flushed = Cache::new(self.conn).flush()?;
        log.info("cache", format!("flushed {flushed} cache entries"));
        Ok(())
    }
}
