//! pluginctl: plugin lifecycle management for a node-based web application.
//!
//! A plugin is a folder under the plugins directory carrying a manifest at
//! `config/plugin.config.xml`. Installing it writes the menu nodes, settings,
//! class registrations and custom SQL the manifest declares; upgrading applies
//! the version blocks the installed copy has not seen yet; uninstalling takes
//! all of it back out.
//!
//! # Architecture
//!
//! ## Store
//!
//! Everything pluginctl owns lives under `<project>/.pluginctl/`:
//! `config.toml`, the SQLite database and broker audit log in `data/`, the
//! catalog cache in `cache/`, and download scratch space in `tmp/`.
//!
//! ## The Thin Waist
//!
//! All database access routes through `DbBroker` for:
//! - Serialization (in-process lock)
//! - Audit logging (`broker.events.jsonl`)
//!
//! Each lifecycle operation runs inside one savepoint; a failing step rolls
//! the whole operation back.
//!
//! # Examples
//!
//! ```bash
//! pluginctl init --catalog-url https://example.org/plugins.json
//! pluginctl repo refresh
//! pluginctl plugin install Blog --download
//! pluginctl plugin upgrade Blog
//! pluginctl node structure --format json
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store layout, config, logging, database broker, errors
//! - [`plugins`]: manifests, nodes, repository client, install pipeline

pub mod core;
mod cli;
pub mod plugins;

use crate::cli::{
    BrokerCommand, Cli, Command, NodeCommand, OutputFormat, PluginCommand, RepoCommand,
};
use crate::core::{
    broker::DbBroker,
    config::{Config, LoggingConfig},
    db,
    error::PluginctlError,
    logging, output,
    store::Store,
    time::command_envelope,
};
use crate::plugins::{
    activation::ActivationStore,
    dependencies::collect_dependencies,
    manifest::PluginManifest,
    nodes::{NodeId, NodeRepository, NodeTarget, create_node_id, normalize_node_path},
    pipeline::{InstallOptions, InstallPipeline, OperationReport, PipelineOptions},
    registry::ClassRegistry,
    repository::{HttpTransport, RefreshOutcome, RepositoryClient, RepositorySettings},
    status::list_plugins,
};

use clap::Parser;
use colored::Colorize;
use rusqlite::Connection;
use serde_json::json;
use std::fs;
use std::path::Path;

pub fn run() -> Result<(), PluginctlError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    match cli.command {
        Command::Init(init) => {
            logging::init(cli.verbose, &LoggingConfig::default());
            let root = init.dir.unwrap_or(current_dir);
            init_project(&root, init.catalog_url, cli.format)
        }
        Command::Plugin(plugin_cli) => {
            App::open(&current_dir, cli.format, cli.verbose)?.run_plugin(plugin_cli.command)
        }
        Command::Repo(repo_cli) => {
            App::open(&current_dir, cli.format, cli.verbose)?.run_repo(repo_cli.command)
        }
        Command::Node(node_cli) => {
            App::open(&current_dir, cli.format, cli.verbose)?.run_node(node_cli.command)
        }
        Command::Broker(broker_cli) => match broker_cli.command {
            BrokerCommand::Audit { limit } => {
                let app = App::open(&current_dir, cli.format, cli.verbose)?;
                let events = app.broker.audit_tail(limit)?;
                app.emit("broker.audit", json!({ "events": events }), || {
                    events
                        .iter()
                        .map(|e| {
                            let mut line = format!("{} {:<24} {:<8} {:>5}ms", e.ts, e.op, e.status, e.duration_ms);
                            if let Some(error) = &e.error {
                                line.push_str(&format!("  {error}"));
                            }
                            line
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
        },
    }
}

/// Create the store layout, a default config and the database.
fn init_project(
    root: &Path,
    catalog_url: Option<String>,
    format: OutputFormat,
) -> Result<(), PluginctlError> {
    let store = Store::new(root);
    for dir in [store.data_dir(), store.cache_dir(), store.tmp_dir()] {
        fs::create_dir_all(&dir).map_err(|e| PluginctlError::filesystem(&dir, e))?;
    }

    let config_path = store.config_path();
    let wrote_config = !config_path.exists();
    let config = if wrote_config {
        let config = Config {
            catalog_url,
            ..Config::default()
        };
        fs::write(&config_path, config.to_toml()?)
            .map_err(|e| PluginctlError::filesystem(&config_path, e))?;
        config
    } else {
        Config::load_file(&config_path)?
    };
    let plugins_dir = config.plugins_path(&store);
    fs::create_dir_all(&plugins_dir).map_err(|e| PluginctlError::filesystem(&plugins_dir, e))?;
    db::initialize_db(&store)?;
    tracing::info!(root = %root.display(), "store initialized");

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&command_envelope(
                "init",
                "ok",
                json!({
                    "root": root.display().to_string(),
                    "config_written": wrote_config,
                    "plugins_dir": plugins_dir.display().to_string(),
                }),
            ))?
        ),
        OutputFormat::Text => {
            println!(
                "{} initialized {}",
                "✓".bright_green(),
                store.state_dir().display()
            );
            if !wrote_config {
                println!("  kept existing {}", config_path.display());
            }
        }
    }
    Ok(())
}

struct App {
    store: Store,
    config: Config,
    broker: DbBroker,
    format: OutputFormat,
    verbose: bool,
}

impl App {
    fn open(current_dir: &Path, format: OutputFormat, verbose: bool) -> Result<Self, PluginctlError> {
        let store = Store::discover(current_dir)?;
        let config = Config::load(&store)?;
        logging::init(verbose, &config.logging);
        let data_dir = store.data_dir();
        fs::create_dir_all(&data_dir).map_err(|e| PluginctlError::filesystem(&data_dir, e))?;
        Ok(Self {
            broker: DbBroker::new(&data_dir),
            store,
            config,
            format,
            verbose,
        })
    }

    fn client(&self) -> Result<RepositoryClient<HttpTransport>, PluginctlError> {
        Ok(RepositoryClient::new(
            HttpTransport::new(self.config.http_timeout())?,
            RepositorySettings::from_config(&self.store, &self.config),
        ))
    }

    fn with_conn<F, R>(&self, op: &str, f: F) -> Result<R, PluginctlError>
    where
        F: FnOnce(&Connection) -> Result<R, PluginctlError>,
    {
        self.broker.with_conn(&self.store.db_path(), "pluginctl", op, f)
    }

    fn emit<F>(&self, cmd: &str, payload: serde_json::Value, text: F) -> Result<(), PluginctlError>
    where
        F: FnOnce() -> String,
    {
        match self.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&command_envelope(cmd, "ok", payload))?
            ),
            OutputFormat::Text => println!("{}", text()),
        }
        Ok(())
    }

    /// Run a pipeline operation inside the broker and print its reports.
    fn run_pipeline<F>(&self, op: &str, f: F) -> Result<(), PluginctlError>
    where
        F: FnOnce(&InstallPipeline<'_, HttpTransport>) -> Result<Vec<OperationReport>, PluginctlError>,
    {
        let client = self.client()?;
        let options = PipelineOptions::from_config(&self.config);
        let reports = self.with_conn(op, |conn| {
            let pipeline = InstallPipeline::new(conn, NodeRepository::new(conn), &client, options);
            f(&pipeline)
        })?;
        self.emit(op, json!({ "reports": reports }), || {
            reports
                .iter()
                .map(|r| output::render_report(r, self.verbose))
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn run_plugin(&self, command: PluginCommand) -> Result<(), PluginctlError> {
        match command {
            PluginCommand::List => {
                let client = self.client()?;
                let statuses = self.with_conn("plugin.list", |conn| list_plugins(conn, &client))?;
                self.emit("plugin.list", json!({ "plugins": statuses }), || {
                    output::render_status_table(&statuses)
                })
            }
            PluginCommand::Install {
                name,
                download,
                with_deps,
            } => {
                let options = InstallOptions { download };
                self.run_pipeline("plugin.install", |pipeline| {
                    if with_deps {
                        pipeline.install_with_dependencies(&name, options)
                    } else {
                        Ok(vec![pipeline.install(&name, options)?])
                    }
                })
            }
            PluginCommand::Upgrade { name } => {
                self.run_pipeline("plugin.upgrade", |pipeline| Ok(vec![pipeline.upgrade(&name)?]))
            }
            PluginCommand::Reinstall { name } => {
                self.run_pipeline("plugin.reinstall", |pipeline| Ok(vec![pipeline.reinstall(&name)?]))
            }
            PluginCommand::Uninstall { name } => {
                self.run_pipeline("plugin.uninstall", |pipeline| Ok(vec![pipeline.uninstall(&name)?]))
            }
            PluginCommand::Deps { name } => {
                let manifest: PluginManifest = self.client()?.resolve_manifest(&name)?;
                let missing = self.with_conn("plugin.deps", |conn| {
                    let registered = ClassRegistry::new(conn).registered_names()?;
                    Ok(collect_dependencies(&manifest, &registered))
                })?;
                self.emit(
                    "plugin.deps",
                    json!({ "plugin": name, "declared": manifest.dependencies.len(), "missing": missing }),
                    || {
                        if missing.is_empty() {
                            return format!("{} all dependencies of {name} are registered", "✓".bright_green());
                        }
                        let lines: Vec<String> = missing
                            .iter()
                            .map(|d| format!("class {} (provided by {})", d.class, d.plugin))
                            .collect();
                        format!(
                            "{} {name} is missing {}: {}",
                            "⚠".bright_yellow(),
                            missing.len(),
                            output::preview_messages(&lines, 5, 80)
                        )
                    },
                )
            }
            PluginCommand::Persist { name, off } => {
                let persistent = !off;
                self.with_conn("plugin.persist", |conn| {
                    ActivationStore::new(conn).set_persistent(&name, persistent)
                })?;
                self.emit(
                    "plugin.persist",
                    json!({ "plugin": name, "persistent": persistent }),
                    || format!("{name}: persistent = {persistent}"),
                )
            }
        }
    }

    fn run_repo(&self, command: RepoCommand) -> Result<(), PluginctlError> {
        let client = self.client()?;
        match command {
            RepoCommand::Refresh => {
                let outcome = client.refresh_catalog()?;
                self.emit("repo.refresh", json!({ "result": outcome }), || match &outcome {
                    RefreshOutcome::Updated { new_plugins, total } => {
                        let mut text = format!("{} catalog updated: {total} plugins", "✓".bright_green());
                        if !new_plugins.is_empty() {
                            text.push_str(&format!("\n  new: {}", new_plugins.join(", ")));
                        }
                        text
                    }
                    RefreshOutcome::NotUpdated { reason } => {
                        format!("{} catalog not updated: {reason}", "⚠".bright_yellow())
                    }
                })
            }
            RepoCommand::List => {
                let listings = client.listings()?;
                self.emit("repo.list", json!({ "plugins": listings }), || {
                    if listings.is_empty() {
                        return "No plugins in the catalog cache; run `pluginctl repo refresh`.".to_string();
                    }
                    listings
                        .iter()
                        .map(|l| {
                            let mark = if l.local { "*" } else { " " };
                            format!("{mark} {:<24} {}", l.name, output::compact_line(&l.description, 60))
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            RepoCommand::Fetch { name } => {
                let target = client.download_and_extract(&name)?;
                self.emit(
                    "repo.fetch",
                    json!({ "plugin": name, "path": target.display().to_string() }),
                    || format!("{} {name} extracted into {}", "✓".bright_green(), target.display()),
                )
            }
        }
    }

    fn run_node(&self, command: NodeCommand) -> Result<(), PluginctlError> {
        match command {
            NodeCommand::List { plugin } => {
                let nodes = self.with_conn("node.list", |conn| {
                    let repo = NodeRepository::new(conn);
                    match &plugin {
                        Some(plugin) => repo.list_by_plugin(plugin),
                        None => repo.list(),
                    }
                })?;
                self.emit("node.list", json!({ "nodes": nodes }), || {
                    nodes
                        .iter()
                        .map(|n| {
                            let parent = n.parent_id.map_or("-".to_string(), |p| p.to_string());
                            format!("{:>10}  {:>10}  {:<16} {}", n.node_id, parent, n.plugin, n.link)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            NodeCommand::Structure => {
                let entries = self.with_conn("node.structure", |conn| NodeRepository::new(conn).structure())?;
                self.emit("node.structure", json!({ "structure": entries }), || {
                    entries
                        .iter()
                        .map(|e| format!("{:>4}  {:>10}  {:?}", e.position, e.node_id, e.tier))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            NodeCommand::Rebuild => {
                let entries = self.with_conn("node.rebuild", |conn| {
                    NodeRepository::new(conn).rebuild_structure()
                })?;
                self.emit("node.rebuild", json!({ "entries": entries }), || {
                    format!("{} rebuilt {entries} structure entries", "✓".bright_green())
                })
            }
            NodeCommand::Delete {
                id,
                plugin,
                critical_only,
            } => {
                let target = match (id, plugin) {
                    (Some(id), _) => NodeTarget::Id(id.parse::<NodeId>()?),
                    (None, Some(plugin)) => NodeTarget::Plugin(plugin),
                    (None, None) => {
                        return Err(PluginctlError::ValidationError(
                            "pass --id or --plugin".into(),
                        ));
                    }
                };
                let deleted = self.with_conn("node.delete", |conn| {
                    NodeRepository::new(conn).delete_node(&target, critical_only)
                })?;
                self.emit("node.delete", json!({ "deleted": deleted }), || {
                    format!("deleted {deleted} nodes")
                })
            }
            NodeCommand::Rename { from, to } => {
                let (old_id, new_id) = (from.parse::<NodeId>()?, to.parse::<NodeId>()?);
                let summary = self.with_conn("node.rename", |conn| {
                    NodeRepository::new(conn).update_node_id(new_id, old_id)
                })?;
                self.emit("node.rename", json!({ "from": old_id, "to": new_id, "updated": summary }), || {
                    format!(
                        "{old_id} -> {new_id}: {} nodes, {} parent pointers, {} permissions",
                        summary.nodes, summary.parent_pointers, summary.permissions
                    )
                })
            }
            NodeCommand::Id { plugin, link } => {
                let id = create_node_id(&plugin, &link);
                let path = normalize_node_path(&plugin, &link);
                self.emit("node.id", json!({ "node_id": id, "path": path }), || {
                    format!("{id}  {path}")
                })
            }
        }
    }
}
