use pluginctl::core::error::PluginctlError;
use pluginctl::plugins::manifest::{ParentRef, PluginManifest, manifest_path};
use pluginctl::plugins::nodes::{NodeId, NodeType, RankSpec, create_node_id};
use std::path::PathBuf;

fn fixture_dir(plugin: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/plugins")
        .join(plugin)
}

fn blog() -> PluginManifest {
    PluginManifest::from_file(&manifest_path(&fixture_dir("Blog")), "Blog").expect("fixture parses")
}

#[test]
fn fixture_manifest_is_normalized() {
    let manifest = blog();
    assert_eq!(manifest.name, "Blog");
    assert_eq!(manifest.version, "1.3");
    assert_eq!(manifest.description.as_deref(), Some("Simple blog with posts and tags"));
    assert_eq!(manifest.install_version, 3);
    assert_eq!(manifest.latest_version(), 3);

    assert_eq!(manifest.install_queries.len(), 1);
    assert!(manifest.install_queries[0].starts_with("CREATE TABLE blog_posts"));
    assert_eq!(manifest.uninstall_queries, vec!["DROP TABLE IF EXISTS blog_posts".to_string()]);

    assert_eq!(manifest.settings.len(), 2);
    assert_eq!(manifest.settings[0].name, "per_page");
    assert_eq!(manifest.settings[0].value, "20");
    assert_eq!(manifest.settings[0].note.as_deref(), Some("Posts per page"));

    assert_eq!(manifest.classes.len(), 1);
    assert_eq!(manifest.classes[0].alias.as_deref(), Some("posts"));
    assert_eq!(manifest.classes[0].plugin, "Blog");
    assert_eq!(manifest.classes[0].rank, None);

    assert_eq!(manifest.dependencies.len(), 1);
    assert_eq!(manifest.dependencies[0].class, "mailer");
    assert_eq!(manifest.dependencies[0].plugin, "Mailer");
}

#[test]
fn nested_nodes_flatten_in_document_order() {
    let manifest = blog();
    let root = create_node_id("Blog", "admin/index.php");
    let links: Vec<&str> = manifest.nodes.iter().map(|n| n.link.as_str()).collect();
    assert_eq!(links, vec!["admin/index.php", "admin/posts.php", "admin/shortcut.php"]);

    assert_eq!(manifest.nodes[0].node_id, root);
    assert_eq!(manifest.nodes[0].parent, ParentRef::Root);
    assert_eq!(manifest.nodes[0].rank, RankSpec::Last);
    assert_eq!(manifest.nodes[1].parent, ParentRef::Inherited { node_id: root });
    assert!(manifest.nodes[1].auto_permission);

    let shortcut = &manifest.nodes[2];
    assert_eq!(shortcut.node_type, NodeType::LinkExisting);
    assert_eq!(shortcut.symlink.as_deref(), Some("admin/posts.php"));
    assert!(!shortcut.auto_permission);
}

#[test]
fn upgrade_blocks_are_sorted_and_filtered() {
    let manifest = blog();
    let versions: Vec<u32> = manifest.upgrades.iter().map(|u| u.version).collect();
    assert_eq!(versions, vec![2, 3]);

    let from_one: Vec<u32> = manifest.pending_upgrades(1).map(|u| u.version).collect();
    assert_eq!(from_one, vec![2, 3]);
    let from_two: Vec<u32> = manifest.pending_upgrades(2).map(|u| u.version).collect();
    assert_eq!(from_two, vec![3]);
    assert_eq!(manifest.pending_upgrades(3).count(), 0);

    let v2 = &manifest.upgrades[0];
    assert_eq!(v2.setting_writes.len(), 1);
    assert_eq!(v2.setting_writes[0].value, "20");
    assert_eq!(v2.setting_deletes, vec!["allow_comments".to_string()]);
    let v3 = &manifest.upgrades[1];
    assert_eq!(v3.node_removals, vec![create_node_id("Blog", "admin/drafts.php")]);
}

#[test]
fn upgrade_blocks_above_the_install_version_are_not_pending() {
    let xml = r#"<config><name>X</name><install version="2"/>
      <upgrade version="2"><queries><query>ALTER TABLE x ADD COLUMN a TEXT</query></queries></upgrade>
      <upgrade version="5"><queries><query>ALTER TABLE x ADD COLUMN z TEXT</query></queries></upgrade>
    </config>"#;
    let manifest = PluginManifest::parse(xml, "X").expect("parse");
    assert_eq!(manifest.latest_version(), 2);
    let pending: Vec<u32> = manifest.pending_upgrades(1).map(|u| u.version).collect();
    assert_eq!(pending, vec![2]);
    assert_eq!(manifest.pending_upgrades(2).count(), 0);
}

#[test]
fn explicit_ids_and_foreign_plugins() {
    let xml = r#"<config>
      <name>Shop</name>
      <install version="2">
        <nodes>
          <node nodeid="4242" link="admin/index.php" name="Shop"/>
          <node link="reports.php" plugin="Reports" parentnodeid="4242"/>
          <node link="cart.php" parentlink="admin/index.php" rank="First" height="400" type="7"/>
        </nodes>
      </install>
    </config>"#;
    let manifest = PluginManifest::parse(xml, "Shop").expect("parses");
    assert_eq!(manifest.nodes[0].node_id, NodeId(4242));
    assert_eq!(manifest.nodes[1].node_id, create_node_id("Reports", "reports.php"));
    assert_eq!(manifest.nodes[1].plugin, "Reports");
    assert_eq!(manifest.nodes[1].parent, ParentRef::Explicit { node_id: NodeId(4242) });

    let cart = &manifest.nodes[2];
    assert_eq!(
        cart.parent,
        ParentRef::Link {
            plugin: "Shop".into(),
            link: "admin/index.php".into()
        }
    );
    assert_eq!(cart.rank, RankSpec::First);
    assert_eq!(cart.height, Some(400));
    assert_eq!(cart.node_type, NodeType::Iframe);
}

#[test]
fn repeated_settings_keep_the_last_value() {
    let xml = r#"<config><name>X</name><install version="1"><settings>
        <setting write="theme">light</setting>
        <setting write="size">10</setting>
        <setting write="theme">dark</setting>
    </settings></install></config>"#;
    let manifest = PluginManifest::parse(xml, "X").expect("parses");
    let pairs: Vec<(&str, &str)> = manifest
        .settings
        .iter()
        .map(|s| (s.name.as_str(), s.value.as_str()))
        .collect();
    assert_eq!(pairs, vec![("theme", "dark"), ("size", "10")]);
}

#[test]
fn upgrade_nodes_without_delete_are_ignored() {
    let xml = r#"<config><name>X</name><install version="1"/>
      <upgrade version="2"><nodes>
        <node link="keep.php"/>
        <node link="drop.php" delete="1"/>
      </nodes></upgrade></config>"#;
    let manifest = PluginManifest::parse(xml, "X").expect("parses");
    assert_eq!(
        manifest.upgrades[0].node_removals,
        vec![create_node_id("X", "drop.php")]
    );
}

#[test]
fn malformed_manifests_are_rejected() {
    let cases = [
        "<config><name>X</name>",
        r#"<config><name>X</name><install version="one"/></config>"#,
        r#"<config><name>X</name><install version="1"><settings><setting>1</setting></settings></install></config>"#,
        r#"<config><name>X</name><install version="1"><nodes><node link="a" type="99"/></nodes></install></config>"#,
    ];
    for xml in cases {
        assert!(
            matches!(PluginManifest::parse(xml, "X"), Err(PluginctlError::ManifestError(_))),
            "expected manifest error for {xml}"
        );
    }
}

#[test]
fn missing_file_is_a_manifest_error() {
    let result = PluginManifest::from_file(&manifest_path(&fixture_dir("Nope")), "Nope");
    assert!(matches!(result, Err(PluginctlError::ManifestError(_))));
}
