//! CLI struct definitions for the pluginctl command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "pluginctl",
    version = env!("CARGO_PKG_VERSION"),
    about = "Install, upgrade and remove plugins and the menu nodes they contribute."
)]
pub(crate) struct Cli {
    /// Output format: 'text' or 'json'.
    #[clap(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,
    /// Debug-level logging and per-step operation output.
    #[clap(short, long, global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create `.pluginctl/` with a default config and an empty database
    #[clap(name = "init")]
    Init(InitCli),

    /// Install, upgrade and remove plugins
    #[clap(name = "plugin", visible_alias = "p")]
    Plugin(PluginCli),

    /// Remote plugin catalog
    #[clap(name = "repo", visible_alias = "r")]
    Repo(RepoCli),

    /// Menu node maintenance
    #[clap(name = "node", visible_alias = "n")]
    Node(NodeCli),

    /// Audit log of brokered database operations
    #[clap(name = "broker")]
    Broker(BrokerCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct InitCli {
    /// Directory to initialize (defaults to current working directory).
    #[clap(short, long)]
    pub dir: Option<PathBuf>,
    /// Catalog URL written into the new config file.
    #[clap(long)]
    pub catalog_url: Option<String>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PluginCli {
    #[clap(subcommand)]
    pub command: PluginCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum PluginCommand {
    /// List known plugins with their status
    List,
    /// Install a plugin
    Install {
        name: String,
        /// Download the plugin folder from its repository when missing.
        #[clap(long)]
        download: bool,
        /// Install plugins that provide missing classes first.
        #[clap(long)]
        with_deps: bool,
    },
    /// Apply pending upgrade blocks
    Upgrade { name: String },
    /// Re-apply the manifest's nodes
    Reinstall { name: String },
    /// Remove a plugin's nodes, settings, classes and activation record
    Uninstall { name: String },
    /// Show dependencies whose classes are not registered
    Deps { name: String },
    /// Mark a plugin as persistent (cannot be uninstalled)
    Persist {
        name: String,
        /// Clear the flag instead of setting it.
        #[clap(long)]
        off: bool,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct RepoCli {
    #[clap(subcommand)]
    pub command: RepoCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum RepoCommand {
    /// Download the remote catalog into the local cache
    Refresh,
    /// List catalog entries and local-only plugins
    List,
    /// Download and extract a plugin folder without installing it
    Fetch { name: String },
}

#[derive(clap::Args, Debug)]
pub(crate) struct NodeCli {
    #[clap(subcommand)]
    pub command: NodeCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum NodeCommand {
    /// List nodes, optionally for one plugin
    List {
        #[clap(long)]
        plugin: Option<String>,
    },
    /// Show the flattened node structure
    Structure,
    /// Regenerate the node structure table
    Rebuild,
    /// Delete a node by id, or every node of a plugin
    Delete {
        #[clap(long, conflicts_with = "plugin", required_unless_present = "plugin")]
        id: Option<String>,
        #[clap(long)]
        plugin: Option<String>,
        /// Keep permission, filter and cron rows.
        #[clap(long)]
        critical_only: bool,
    },
    /// Change a node id and rewrite every reference to it
    Rename {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
    },
    /// Print the id a plugin/link pair hashes to
    Id {
        #[clap(long)]
        plugin: String,
        #[clap(long)]
        link: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct BrokerCli {
    #[clap(subcommand)]
    pub command: BrokerCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BrokerCommand {
    /// Show the audit log of brokered operations.
    Audit {
        /// Only show the most recent entries.
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
}
