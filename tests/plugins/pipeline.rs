use pluginctl::core::config::SqlFailurePolicy;
use pluginctl::core::db;
use pluginctl::core::error::PluginctlError;
use pluginctl::plugins::activation::{ActivationStatus, ActivationStore};
use pluginctl::plugins::lifecycle::PluginState;
use pluginctl::plugins::manifest::manifest_path;
use pluginctl::plugins::nodes::{NodeRepository, NodeTarget, create_node_id};
use pluginctl::plugins::pipeline::{InstallOptions, InstallPipeline, PipelineOptions};
use pluginctl::plugins::registry::{ClassRegistry, SettingsStore};
use pluginctl::plugins::repository::{
    HttpResponse, RepositoryClient, RepositorySettings, Transport,
};
use rusqlite::{Connection, params};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::{TempDir, tempdir};

const CATALOG_URL: &str = "https://plugins.example.org/catalog.json";

const MAILER_MANIFEST: &str = r#"<config>
  <name>Mailer</name>
  <install version="1">
    <classes><class name="mailer"/></classes>
    <nodes><node link="mailer/index.php" name="Mailer"/></nodes>
  </install>
</config>"#;

type Routes = Rc<RefCell<HashMap<String, Vec<u8>>>>;

struct FakeTransport {
    routes: Routes,
}

impl Transport for FakeTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, PluginctlError> {
        match self.routes.borrow().get(url) {
            Some(body) => Ok(HttpResponse {
                status: 200,
                content_length: Some(body.len() as u64),
                body: body.clone(),
            }),
            None => Ok(HttpResponse {
                status: 404,
                content_length: None,
                body: Vec::new(),
            }),
        }
    }
}

struct Site {
    tmp: TempDir,
    conn: Connection,
    client: RepositoryClient<FakeTransport>,
    routes: Routes,
}

impl Site {
    fn new() -> Self {
        let tmp = tempdir().expect("tempdir");
        let settings = RepositorySettings {
            catalog_url: Some(CATALOG_URL.into()),
            cache_path: tmp.path().join(".pluginctl/cache/repository.json"),
            plugins_dir: tmp.path().join("plugins"),
            tmp_dir: tmp.path().join(".pluginctl/tmp"),
            default_branch: "master".into(),
        };
        let routes = Routes::default();
        let transport = FakeTransport {
            routes: Rc::clone(&routes),
        };
        Self {
            conn: db::open_in_memory().expect("db"),
            client: RepositoryClient::new(transport, settings),
            routes,
            tmp,
        }
    }

    fn plugins_dir(&self) -> PathBuf {
        self.tmp.path().join("plugins")
    }

    fn add_plugin(&self, name: &str, manifest: &str) {
        let path = manifest_path(&self.plugins_dir().join(name));
        fs::create_dir_all(path.parent().expect("parent")).expect("plugin dir");
        fs::write(path, manifest).expect("write manifest");
    }

    fn add_blog(&self) {
        let fixture = manifest_path(
            &Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/plugins/Blog"),
        );
        self.add_plugin("Blog", &fs::read_to_string(fixture).expect("fixture"));
    }

    /// Blog as it shipped at schema version 1.
    fn add_blog_release_1(&self) {
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/releases/Blog-1.xml");
        self.add_plugin("Blog", &fs::read_to_string(fixture).expect("fixture"));
    }

    fn pipeline(&self) -> InstallPipeline<'_, FakeTransport> {
        self.pipeline_with(PipelineOptions::default())
    }

    fn pipeline_with(&self, options: PipelineOptions) -> InstallPipeline<'_, FakeTransport> {
        InstallPipeline::new(&self.conn, NodeRepository::new(&self.conn), &self.client, options)
    }

    fn count(&self, sql: &str, plugin: &str) -> i64 {
        self.conn
            .query_row(sql, params![plugin], |row| row.get(0))
            .expect("count query")
    }

    fn node_count(&self, plugin: &str) -> i64 {
        self.count("SELECT COUNT(*) FROM nodes WHERE plugin = ?1", plugin)
    }

    fn column_exists(&self, table: &str, column: &str) -> bool {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get::<_, i64>(0),
            )
            .expect("table info")
            == 1
    }

    fn table_exists(&self, table: &str) -> bool {
        self.count(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            table,
        ) == 1
    }

    fn has_permission(&self, role: i64, link: &str, plugin: &str) -> bool {
        let id = create_node_id(plugin, link).to_db();
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM role_permissions WHERE role_id = ?1 AND node_id = ?2",
                params![role, id],
                |row| row.get::<_, i64>(0),
            )
            .expect("permission query")
            == 1
    }
}

fn installed_site() -> Site {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.add_blog();
    {
        let pipeline = site.pipeline();
        pipeline.install("Mailer", InstallOptions::default()).expect("install Mailer");
        pipeline.install("Blog", InstallOptions::default()).expect("install Blog");
    }
    site
}

#[test]
fn install_writes_nodes_settings_classes_and_activation() {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.add_blog();
    let pipeline = site.pipeline();
    pipeline.install("Mailer", InstallOptions::default()).expect("install Mailer");
    let report = pipeline.install("Blog", InstallOptions::default()).expect("install Blog");

    assert_eq!(report.from, PluginState::Uninstalled);
    assert_eq!(report.to, PluginState::Installed);
    assert_eq!(
        report.states,
        vec![PluginState::Uninstalled, PluginState::Installing, PluginState::Installed]
    );
    assert_eq!(report.version, Some(3));
    assert_eq!(report.warnings(), 0);

    assert_eq!(site.node_count("Blog"), 3);
    let repo = NodeRepository::new(&site.conn);
    let shortcut = repo
        .get(create_node_id("Blog", "admin/shortcut.php"))
        .expect("get")
        .expect("shortcut stored");
    assert_eq!(shortcut.extend, Some(create_node_id("Blog", "admin/posts.php")));
    assert_eq!(shortcut.parent_id, Some(create_node_id("Blog", "admin/index.php")));
    assert_eq!(repo.structure().expect("structure").len(), 4);

    assert!(site.has_permission(1, "admin/index.php", "Blog"));
    assert!(site.has_permission(1, "admin/posts.php", "Blog"));
    assert!(!site.has_permission(1, "admin/shortcut.php", "Blog"));

    let settings = SettingsStore::new(&site.conn);
    assert_eq!(settings.get("Blog", "per_page").expect("get").as_deref(), Some("20"));
    assert_eq!(settings.get("Blog", "show_author").expect("get").as_deref(), Some("1"));

    let names = ClassRegistry::new(&site.conn).registered_names().expect("names");
    assert!(names.contains("blogPosts") && names.contains("posts") && names.contains("mailer"));

    let record = ActivationStore::new(&site.conn).get("Blog").expect("get").expect("record");
    assert_eq!(record.status, ActivationStatus::Install);
    assert_eq!(record.version, 3);
    assert!(!record.persistent);
    assert!(site.table_exists("blog_posts"));
    assert!(site.column_exists("blog_posts", "body"));
}

#[test]
fn fresh_install_is_already_at_the_latest_schema() {
    let site = installed_site();
    assert!(site.column_exists("blog_posts", "body"));
    assert_eq!(
        ActivationStore::new(&site.conn).get("Blog").expect("get").map(|r| r.version),
        Some(3)
    );

    let report = site.pipeline().upgrade("Blog").expect("upgrade");
    assert_eq!(report.states, vec![PluginState::Installed]);
    assert_eq!(report.version, Some(3));
    assert!(!report.log.iter().any(|e| e.step.starts_with("upgrade_")));
}

#[test]
fn installing_twice_is_an_invalid_transition() {
    let site = installed_site();
    let err = site
        .pipeline()
        .install("Blog", InstallOptions::default())
        .expect_err("second install refused");
    assert!(matches!(err, PluginctlError::InvalidTransition { .. }));
    assert_eq!(site.node_count("Blog"), 3);
}

#[test]
fn missing_dependency_fails_before_any_write() {
    let site = Site::new();
    site.add_blog();
    let err = site
        .pipeline()
        .install("Blog", InstallOptions::default())
        .expect_err("dependency missing");
    match err {
        PluginctlError::DependencyError(missing) => {
            assert_eq!(missing.len(), 1);
            assert_eq!(missing[0].class, "mailer");
            assert_eq!(missing[0].plugin, "Mailer");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(site.node_count("Blog"), 0);
    assert!(ActivationStore::new(&site.conn).get("Blog").expect("get").is_none());
    assert!(!site.table_exists("blog_posts"));
}

#[test]
fn self_provided_dependencies_are_satisfied() {
    let site = Site::new();
    site.add_plugin(
        "Forms",
        r#"<config><name>Forms</name><install version="1">
             <dependencies><dependency plugin="Forms" class="formBuilder"/></dependencies>
             <classes><class name="formBuilder"/></classes>
           </install></config>"#,
    );
    let report = site
        .pipeline()
        .install("Forms", InstallOptions::default())
        .expect("install");
    assert_eq!(report.to, PluginState::Installed);
}

#[test]
fn upgrade_applies_pending_blocks_once() {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.add_blog_release_1();
    let pipeline = site.pipeline();
    pipeline.install("Mailer", InstallOptions::default()).expect("install Mailer");
    let installed = pipeline.install("Blog", InstallOptions::default()).expect("install Blog 1");
    assert_eq!(installed.version, Some(1));
    assert!(!site.column_exists("blog_posts", "body"));
    assert_eq!(site.node_count("Blog"), 4);

    site.add_blog();
    let report = pipeline.upgrade("Blog").expect("upgrade");
    assert_eq!(
        report.states,
        vec![PluginState::Installed, PluginState::Upgrading, PluginState::Installed]
    );
    assert_eq!(report.version, Some(3));
    assert!(report.log.iter().any(|e| e.step == "upgrade_2"));
    assert!(report.log.iter().any(|e| e.step == "upgrade_3"));

    let settings = SettingsStore::new(&site.conn);
    assert_eq!(settings.get("Blog", "per_page").expect("get").as_deref(), Some("20"));
    assert_eq!(settings.get("Blog", "allow_comments").expect("get"), None);
    let repo = NodeRepository::new(&site.conn);
    assert!(!repo.exists(create_node_id("Blog", "admin/drafts.php")).expect("exists"));
    assert!(repo.exists(create_node_id("Blog", "admin/shortcut.php")).expect("exists"));
    assert_eq!(site.node_count("Blog"), 3);
    assert!(site.column_exists("blog_posts", "body"));
    assert_eq!(
        ActivationStore::new(&site.conn).get("Blog").expect("get").map(|r| r.version),
        Some(3)
    );

    let again = pipeline.upgrade("Blog").expect("second upgrade");
    assert_eq!(again.states, vec![PluginState::Installed]);
    assert_eq!(again.version, Some(3));
    assert_eq!(again.log.len(), 1);
}

#[test]
fn upgrade_skips_blocks_above_the_declared_version() {
    let site = Site::new();
    site.add_plugin(
        "Notes",
        r#"<config><name>Notes</name><install version="1">
             <queries><query>CREATE TABLE notes (id INTEGER PRIMARY KEY)</query></queries>
           </install></config>"#,
    );
    let pipeline = site.pipeline();
    pipeline.install("Notes", InstallOptions::default()).expect("install");

    site.add_plugin(
        "Notes",
        r#"<config><name>Notes</name><install version="2">
             <queries><query>CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT)</query></queries>
           </install>
           <upgrade version="2"><queries><query>ALTER TABLE notes ADD COLUMN title TEXT</query></queries></upgrade>
           <upgrade version="5"><queries><query>ALTER TABLE notes ADD COLUMN archived INTEGER</query></queries></upgrade>
         </config>"#,
    );
    let report = pipeline.upgrade("Notes").expect("upgrade");
    assert_eq!(report.version, Some(2));
    assert!(report.log.iter().any(|e| e.step == "upgrade_2"));
    assert!(!report.log.iter().any(|e| e.step == "upgrade_5"));
    assert!(site.column_exists("notes", "title"));
    assert!(!site.column_exists("notes", "archived"));
    assert_eq!(
        ActivationStore::new(&site.conn).get("Notes").expect("get").map(|r| r.version),
        Some(2)
    );
}

#[test]
fn upgrade_requires_an_installed_plugin() {
    let site = Site::new();
    site.add_blog();
    assert!(matches!(
        site.pipeline().upgrade("Blog"),
        Err(PluginctlError::InvalidTransition { .. })
    ));
}

#[test]
fn reinstall_restores_missing_nodes_without_duplicates() {
    let site = installed_site();
    let repo = NodeRepository::new(&site.conn);
    let posts = create_node_id("Blog", "admin/posts.php");
    repo.delete_node(&NodeTarget::Id(posts), false).expect("delete posts");
    assert_eq!(site.node_count("Blog"), 2);

    let pipeline = site.pipeline();
    let report = pipeline.reinstall("Blog").expect("reinstall");
    assert_eq!(report.to, PluginState::Installed);
    assert_eq!(report.version, Some(3));
    assert_eq!(site.node_count("Blog"), 3);
    assert!(repo.exists(posts).expect("exists"));

    pipeline.reinstall("Blog").expect("second reinstall");
    assert_eq!(site.node_count("Blog"), 3);
    assert_eq!(repo.structure().expect("structure").len(), 4);
}

#[test]
fn uninstall_removes_everything_the_plugin_owns() {
    let site = installed_site();
    let report = site.pipeline().uninstall("Blog").expect("uninstall");
    assert_eq!(
        report.states,
        vec![PluginState::Installed, PluginState::Uninstalling, PluginState::Uninstalled]
    );
    assert_eq!(report.version, None);

    assert_eq!(site.node_count("Blog"), 0);
    assert_eq!(site.node_count("Mailer"), 1);
    assert!(!site.has_permission(1, "admin/index.php", "Blog"));
    assert!(site.has_permission(1, "mailer/index.php", "Mailer"));
    assert!(SettingsStore::new(&site.conn).list("Blog").expect("list").is_empty());
    let names = ClassRegistry::new(&site.conn).registered_names().expect("names");
    assert!(!names.contains("blogPosts"));
    assert!(names.contains("mailer"));
    assert!(ActivationStore::new(&site.conn).get("Blog").expect("get").is_none());
    assert!(!site.table_exists("blog_posts"));
    assert_eq!(NodeRepository::new(&site.conn).structure().expect("structure").len(), 1);

    // The plugin can be installed again afterwards.
    site.pipeline()
        .install("Blog", InstallOptions::default())
        .expect("reinstall after uninstall");
}

#[test]
fn persistent_plugins_cannot_be_uninstalled() {
    let site = installed_site();
    let pipeline = site.pipeline();
    pipeline.set_persistent("Mailer", true).expect("persist");
    assert!(matches!(
        pipeline.uninstall("Mailer"),
        Err(PluginctlError::ValidationError(_))
    ));
    assert_eq!(site.node_count("Mailer"), 1);

    pipeline.set_persistent("Mailer", false).expect("unpersist");
    pipeline.uninstall("Mailer").expect("uninstall after clearing flag");
    assert!(matches!(
        pipeline.set_persistent("Ghost", true),
        Err(PluginctlError::NotFound(_))
    ));
}

#[test]
fn exhausted_rank_fails_the_install_cleanly() {
    let site = Site::new();
    site.add_plugin(
        "Edge",
        r#"<config><name>Edge</name><install version="1"><nodes>
             <node link="edge/top.php" rank="9223372036854775807"/>
             <node link="edge/next.php"/>
           </nodes></install></config>"#,
    );
    let err = site
        .pipeline()
        .install("Edge", InstallOptions::default())
        .expect_err("no rank after i64::MAX");
    assert!(matches!(err, PluginctlError::ValidationError(_)));
    assert_eq!(site.node_count("Edge"), 0);
    assert!(ActivationStore::new(&site.conn).get("Edge").expect("get").is_none());
}

const BROKEN_MANIFEST: &str = r#"<config>
  <name>Broken</name>
  <install version="2">
    <queries>
      <query>CREATE TABLE broken_items (id INTEGER PRIMARY KEY)</query>
      <query>INSERT INTO no_such_table VALUES (1)</query>
    </queries>
    <settings><setting write="mode">strict</setting></settings>
    <nodes><node link="broken/index.php"/></nodes>
  </install>
</config>"#;

#[test]
fn failing_install_query_rolls_back_under_abort() {
    let site = Site::new();
    site.add_plugin("Broken", BROKEN_MANIFEST);
    let err = site
        .pipeline()
        .install("Broken", InstallOptions::default())
        .expect_err("query fails");
    match err {
        PluginctlError::DatabaseError { statement, .. } => {
            assert!(statement.contains("no_such_table"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(site.node_count("Broken"), 0);
    assert!(SettingsStore::new(&site.conn).list("Broken").expect("list").is_empty());
    assert!(ActivationStore::new(&site.conn).get("Broken").expect("get").is_none());
    assert!(!site.table_exists("broken_items"));
    assert!(NodeRepository::new(&site.conn).structure().expect("structure").is_empty());
}

#[test]
fn failing_install_query_only_warns_under_continue() {
    let site = Site::new();
    site.add_plugin("Broken", BROKEN_MANIFEST);
    let pipeline = site.pipeline_with(PipelineOptions {
        admin_role_id: 1,
        sql_failure_policy: SqlFailurePolicy::Continue,
    });
    let report = pipeline
        .install("Broken", InstallOptions::default())
        .expect("install continues");
    assert_eq!(report.warnings(), 1);
    assert_eq!(report.version, Some(2));
    assert!(site.table_exists("broken_items"));
    assert_eq!(site.node_count("Broken"), 1);
}

#[test]
fn admin_role_comes_from_options() {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.pipeline_with(PipelineOptions {
        admin_role_id: 9,
        sql_failure_policy: SqlFailurePolicy::Abort,
    })
    .install("Mailer", InstallOptions::default())
    .expect("install");
    assert!(site.has_permission(9, "mailer/index.php", "Mailer"));
    assert!(!site.has_permission(1, "mailer/index.php", "Mailer"));
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(body.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }
    cursor.into_inner()
}

#[test]
fn install_downloads_missing_plugin_folders_on_request() {
    let site = Site::new();
    {
        let mut routes = site.routes.borrow_mut();
        routes.insert(
            CATALOG_URL.into(),
            br#"{"plugins": {"Mailer": {"desc": "Mail", "repo": "https://github.com/acme/mailer"}}}"#
                .to_vec(),
        );
        routes.insert(
            "https://github.com/acme/mailer/archive/master.zip".into(),
            zip_bytes(&[("mailer-master/config/plugin.config.xml", MAILER_MANIFEST)]),
        );
    }
    site.client.refresh_catalog().expect("refresh");

    let pipeline = site.pipeline();
    assert!(matches!(
        pipeline.install("Mailer", InstallOptions::default()),
        Err(PluginctlError::ManifestError(_))
    ));

    let report = pipeline
        .install("Mailer", InstallOptions { download: true })
        .expect("install with download");
    assert_eq!(
        report.states,
        vec![
            PluginState::Uninstalled,
            PluginState::Downloading,
            PluginState::Extracting,
            PluginState::Installing,
            PluginState::Installed,
        ]
    );
    assert!(site.client.has_local_manifest("Mailer"));
    assert_eq!(site.node_count("Mailer"), 1);
}


#[test]
fn install_with_dependencies_installs_providers_first() {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.add_blog();
    let reports = site
        .pipeline()
        .install_with_dependencies("Blog", InstallOptions::default())
        .expect("install chain");
    let order: Vec<&str> = reports.iter().map(|r| r.plugin.as_str()).collect();
    assert_eq!(order, vec!["Mailer", "Blog"]);
    assert!(reports.iter().all(|r| r.to == PluginState::Installed));
    assert_eq!(site.node_count("Mailer"), 1);
    assert_eq!(site.node_count("Blog"), 3);
}

#[test]
fn install_with_dependencies_skips_installed_providers() {
    let site = Site::new();
    site.add_plugin("Mailer", MAILER_MANIFEST);
    site.add_blog();
    let pipeline = site.pipeline();
    pipeline.install("Mailer", InstallOptions::default()).expect("install Mailer");
    let reports = pipeline
        .install_with_dependencies("Blog", InstallOptions::default())
        .expect("install chain");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].plugin, "Blog");
}

#[test]
fn install_with_dependencies_reports_cycles() {
    let site = Site::new();
    site.add_plugin(
        "Alpha",
        r#"<config><name>Alpha</name><install version="1">
             <dependencies><dependency plugin="Beta" class="beta"/></dependencies>
             <classes><class name="alpha"/></classes>
           </install></config>"#,
    );
    site.add_plugin(
        "Beta",
        r#"<config><name>Beta</name><install version="1">
             <dependencies><dependency plugin="Alpha" class="alpha"/></dependencies>
             <classes><class name="beta"/></classes>
           </install></config>"#,
    );
    match site
        .pipeline()
        .install_with_dependencies("Alpha", InstallOptions::default())
    {
        Err(PluginctlError::DependencyCycle(cycle)) => {
            assert_eq!(cycle, vec!["Alpha".to_string(), "Beta".to_string(), "Alpha".to_string()]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(site.node_count("Alpha") + site.node_count("Beta"), 0);
    assert!(ActivationStore::new(&site.conn).list().expect("list").is_empty());
}
