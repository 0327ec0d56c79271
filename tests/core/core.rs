use pluginctl::core::broker::{BrokerEvent, DbBroker};
use pluginctl::core::cache::Cache;
use pluginctl::core::config::{Config, ENV_CATALOG_URL, ENV_PLUGINS_DIR, SqlFailurePolicy};
use pluginctl::core::db::{self, with_savepoint};
use pluginctl::core::error::PluginctlError;
use pluginctl::core::schemas;
use pluginctl::core::store::Store;
use rusqlite::params;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use tempfile::tempdir;

#[test]
fn store_discovery_walks_up_to_the_state_dir() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::create_dir_all(root.join(".pluginctl")).expect("state dir");
    let nested = root.join("site/public/admin");
    fs::create_dir_all(&nested).expect("nested dir");

    let store = Store::discover(&nested).expect("store found from nested dir");
    assert_eq!(store.root, root);
    assert_eq!(
        store.db_path(),
        root.join(".pluginctl/data").join(schemas::PLUGINCTL_DB_NAME)
    );
    assert_eq!(
        store.catalog_cache_path(),
        root.join(".pluginctl/cache/repository.json")
    );
}

#[test]
fn store_discovery_fails_without_state_dir() {
    let tmp = tempdir().expect("tempdir");
    let result = Store::discover(tmp.path());
    assert!(matches!(result, Err(PluginctlError::NotFound(_))));
}

#[test]
fn config_file_and_env_overrides() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    fs::create_dir_all(store.state_dir()).expect("state dir");

    // Missing file gives defaults.
    let defaults = Config::load_file(&store.config_path()).expect("defaults");
    assert_eq!(defaults.plugins_dir, PathBuf::from("plugins"));

    fs::write(
        store.config_path(),
        "catalog_url = \"https://example.org/plugins.json\"\n\
         sql_failure_policy = \"continue\"\n\
         admin_role_id = 7\n\
         [logging]\n\
         level = \"warn\"\n",
    )
    .expect("write config");
    let mut config = Config::load_file(&store.config_path()).expect("load config");
    assert_eq!(config.catalog_url.as_deref(), Some("https://example.org/plugins.json"));
    assert_eq!(config.sql_failure_policy, SqlFailurePolicy::Continue);
    assert_eq!(config.admin_role_id, 7);
    assert_eq!(config.logging.level, "warn");

    config.apply_env(|key| match key {
        k if k == ENV_CATALOG_URL => Some("https://mirror.example.org/plugins.json".to_string()),
        k if k == ENV_PLUGINS_DIR => Some("/srv/plugins".to_string()),
        _ => None,
    });
    assert_eq!(
        config.catalog_url.as_deref(),
        Some("https://mirror.example.org/plugins.json")
    );
    assert_eq!(config.plugins_path(&store), PathBuf::from("/srv/plugins"));
}

#[test]
fn invalid_config_is_a_config_error() {
    let result = Config::from_toml("http_timeout_secs = \"soon\"\n");
    assert!(matches!(result, Err(PluginctlError::ConfigError(_))));
}

#[test]
fn db_and_broker_round_trip_and_audit() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    db::initialize_db(&store).expect("db init");
    assert!(store.db_path().exists());

    let conn = db::db_connect(&store.db_path().to_string_lossy()).expect("db connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);
    let version: String = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .expect("schema version");
    assert_eq!(version, schemas::SCHEMA_VERSION.to_string());

    let broker = DbBroker::new(&store.data_dir());
    broker
        .with_conn(&store.db_path(), "tester", "settings.insert", |conn| {
            conn.execute(
                "INSERT INTO settings(setting_id, plugin, name, setting_value) VALUES(?1, ?2, ?3, ?4)",
                params!["Blog_per_page", "Blog", "per_page", "10"],
            )?;
            Ok(())
        })
        .expect("broker success path");

    let result: Result<(), PluginctlError> =
        broker.with_conn(&store.db_path(), "tester", "settings.fail", |_| {
            Err(PluginctlError::ValidationError("intentional".to_string()))
        });
    assert!(result.is_err());

    let audit_path = store.data_dir().join(schemas::BROKER_EVENTS_NAME);
    let events: Vec<BrokerEvent> = fs::read_to_string(&audit_path)
        .expect("read audit")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid broker event json"))
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].op, "settings.insert");
    assert_eq!(events[0].status, "success");
    assert_eq!(events[1].status, "error");
    assert!(events.iter().all(|ev| ev.actor == "tester" && ev.db_id == schemas::PLUGINCTL_DB_NAME));
    assert!(events[0].error.is_none());
    assert!(events[1].error.as_deref().is_some_and(|e| e.contains("intentional")));
    assert_eq!(broker.audit_events().expect("audit events").len(), 2);
    let tail = broker.audit_tail(1).expect("audit tail");
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].op, "settings.fail");
}

#[test]
fn broker_serializes_writers_on_one_database() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    db::initialize_db(&store).expect("db init");
    let broker = Arc::new(DbBroker::new(&store.data_dir()));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let broker = Arc::clone(&broker);
            let barrier = Arc::clone(&barrier);
            let db_path = store.db_path();
            std::thread::spawn(move || {
                barrier.wait();
                broker.with_conn(&db_path, "tester", "meta.insert", |conn| {
                    conn.execute(
                        "INSERT INTO meta(key, value) VALUES(?1, 'x')",
                        params![format!("writer-{i}")],
                    )?;
                    Ok(())
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread joined").expect("write ok");
    }

    let conn = db::db_connect(&store.db_path().to_string_lossy()).expect("db connect");
    let writers: i64 = conn
        .query_row("SELECT COUNT(*) FROM meta WHERE key LIKE 'writer-%'", [], |row| row.get(0))
        .expect("count");
    assert_eq!(writers, 4);
    assert_eq!(broker.audit_events().expect("audit").len(), 4);
}

#[test]
fn nested_savepoint_failure_keeps_outer_work() {
    let conn = db::open_in_memory().expect("db");
    with_savepoint(&conn, "outer", |conn| {
        conn.execute("INSERT INTO meta(key, value) VALUES('outer', '1')", [])?;
        let inner: Result<(), PluginctlError> = with_savepoint(conn, "inner", |conn| {
            conn.execute("INSERT INTO meta(key, value) VALUES('inner', '1')", [])?;
            Err(PluginctlError::ValidationError("inner fails".into()))
        });
        assert!(inner.is_err());
        Ok(())
    })
    .expect("outer commits");

    let keys: Vec<String> = conn
        .prepare("SELECT key FROM meta WHERE key IN ('outer', 'inner') ORDER BY key")
        .expect("prepare")
        .query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(keys, vec!["outer".to_string()]);
}

#[test]
fn cache_entries_survive_until_flush() {
    let conn = db::open_in_memory().expect("db");
    let cache = Cache::new(&conn);
    cache.put("classes", &vec!["mailer", "blogPosts"]).expect("put");
    let hit: Option<Vec<String>> = cache.get("classes").expect("get");
    assert_eq!(hit, Some(vec!["mailer".to_string(), "blogPosts".to_string()]));

    // A type mismatch reads as a miss rather than an error.
    let mismatch: Option<u64> = cache.get("classes").expect("get mismatch");
    assert!(mismatch.is_none());

    assert_eq!(cache.flush().expect("flush"), 1);
    let miss: Option<Vec<String>> = cache.get("classes").expect("get after flush");
    assert!(miss.is_none());
}
