//! Centralized database schema definitions.
//!
//! All pluginctl state lives in one SQLite database. Node rows are the hub:
//! permissions, search filters, cron bindings, tags and setting values all
//! reference node ids by value, which is why a node id rename has to touch
//! every one of these tables.

pub const PLUGINCTL_DB_NAME: &str = "pluginctl.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- Node tree ---
pub const SCHEMA_NODES: &str = "
    CREATE TABLE IF NOT EXISTS nodes (
        node_id INTEGER PRIMARY KEY,
        parent_node_id INTEGER,
        node_name TEXT NOT NULL DEFAULT '',
        node_link TEXT NOT NULL DEFAULT '',
        plugin TEXT NOT NULL,
        node_type INTEGER NOT NULL DEFAULT 1,
        extend INTEGER,
        new_window INTEGER NOT NULL DEFAULT 0,
        node_rank INTEGER NOT NULL DEFAULT 0,
        hide INTEGER NOT NULL DEFAULT 0,
        theme TEXT,
        alias TEXT,
        layout TEXT,
        params TEXT,
        height INTEGER
    )
";
pub const SCHEMA_NODES_INDEX_PLUGIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_plugin ON nodes(plugin)";
pub const SCHEMA_NODES_INDEX_LINK: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_link ON nodes(node_link)";

pub const SCHEMA_NODE_STRUCTURE: &str = "
    CREATE TABLE IF NOT EXISTS node_structure (
        position INTEGER PRIMARY KEY,
        node_id INTEGER NOT NULL,
        is_parent INTEGER NOT NULL,
        tier INTEGER NOT NULL
    )
";

// --- Tables referencing nodes ---
pub const SCHEMA_ROLE_PERMISSIONS: &str = "
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        PRIMARY KEY(role_id, node_id)
    )
";

pub const SCHEMA_SEARCH_FILTERS: &str = "
    CREATE TABLE IF NOT EXISTS search_filters (
        filter_id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id INTEGER NOT NULL,
        user_id INTEGER,
        filter_search TEXT,
        filter_order TEXT
    )
";

pub const SCHEMA_CRON: &str = "
    CREATE TABLE IF NOT EXISTS cron (
        node_id INTEGER PRIMARY KEY,
        cron_desc TEXT,
        cron_type INTEGER NOT NULL DEFAULT 0,
        last_execution INTEGER
    )
";

pub const SCHEMA_TAGS: &str = "
    CREATE TABLE IF NOT EXISTS tags (
        tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_object TEXT NOT NULL,
        tag_name TEXT NOT NULL,
        tag_target TEXT NOT NULL,
        tag_value TEXT
    )
";

// --- Plugin registries ---
pub const SCHEMA_SETTINGS: &str = "
    CREATE TABLE IF NOT EXISTS settings (
        setting_id TEXT PRIMARY KEY,
        plugin TEXT NOT NULL,
        name TEXT NOT NULL,
        setting_value TEXT NOT NULL DEFAULT '',
        note TEXT
    )
";
pub const SCHEMA_SETTINGS_INDEX_PLUGIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_settings_plugin ON settings(plugin)";

pub const SCHEMA_CLASSES: &str = "
    CREATE TABLE IF NOT EXISTS classes (
        class_id INTEGER PRIMARY KEY AUTOINCREMENT,
        class_name TEXT NOT NULL,
        alias TEXT,
        plugin_folder TEXT NOT NULL,
        enable INTEGER NOT NULL DEFAULT 1,
        class_rank INTEGER NOT NULL DEFAULT 1
    )
";
pub const SCHEMA_CLASSES_INDEX_NAME: &str =
    "CREATE INDEX IF NOT EXISTS idx_classes_name ON classes(class_name)";

pub const SCHEMA_PLUGIN_ACTIVATION: &str = "
    CREATE TABLE IF NOT EXISTS plugin_activation (
        plugin_folder TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        persistent INTEGER NOT NULL DEFAULT 0
    )
";

// --- Cache ---
pub const SCHEMA_CACHE: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        cache_key TEXT PRIMARY KEY,
        cache_value TEXT NOT NULL,
        stored_at TEXT NOT NULL
    )
";

/// Every schema statement, in creation order.
pub const ALL_SCHEMAS: &[&str] = &[
    SCHEMA_META,
    SCHEMA_NODES,
    SCHEMA_NODES_INDEX_PLUGIN,
    SCHEMA_NODES_INDEX_LINK,
    SCHEMA_NODE_STRUCTURE,
    SCHEMA_ROLE_PERMISSIONS,
    SCHEMA_SEARCH_FILTERS,
    SCHEMA_CRON,
    SCHEMA_TAGS,
    SCHEMA_SETTINGS,
    SCHEMA_SETTINGS_INDEX_PLUGIN,
    SCHEMA_CLASSES,
    SCHEMA_CLASSES_INDEX_NAME,
    SCHEMA_PLUGIN_ACTIVATION,
    SCHEMA_CACHE,
];
