#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use tenant_clients::mock::{MockCatalog, MockDeployments};
use tenant_clients::RegistryClient;
use tenant_core::mem::MemProject;
use tenant_core::{Event, EventKind, Plugin, PluginData};
use tenant_manifest::{LocalPuller, ManifestSource};
use tenant_plugins::ExtensionsPlugin;

const MANIFEST: &str = r#"
metadata:
  schemaVersion: "0.1"
  release: "1.3.5"
lpke:
  deploymentPackages:
    - dpkg: edge-orch/en/files/base-extensions
      version: 1.3.5
  deploymentList:
    - dpName: base-extensions
      displayName: base-extensions-baseline
      dpVersion: 1.3.5
      dpProfileName: baseline
      allAppTargetClusters:
        - key: default-extension
          val: baseline
      desiredState: present
    - dpName: observability
      dpVersion: 0.9.0
      dpProfileName: default
      desiredState: absent
"#;

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

fn artifact_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "edge-orch/en/files/manifest/v1.3.5/manifest.yaml", MANIFEST);
    write(dir.path(), "edge-orch/en/files/base-extensions/1.3.5/b-app.yaml", "kind: application\n");
    write(dir.path(), "edge-orch/en/files/base-extensions/1.3.5/a-dp.yaml", "kind: deployment-package\n");
    write(dir.path(), "edge-orch/en/files/base-extensions/1.3.5/README.md", "not uploaded\n");
    dir
}

struct Fixture {
    _dir: tempfile::TempDir,
    catalog: MockCatalog,
    deployments: MockDeployments,
    plugin: ExtensionsPlugin,
    project: MemProject,
}

async fn fixture() -> Fixture {
    let dir = artifact_tree();
    let catalog = MockCatalog::new();
    catalog.initialize_client_secret().await.unwrap();
    let deployments = MockDeployments::new();
    let source = ManifestSource::Remote { path: "edge-orch/en/files/manifest".into(), tag: "v1.3.5".into() };
    let plugin = ExtensionsPlugin::new(
        source,
        Arc::new(LocalPuller::new(dir.path())),
        Arc::new(catalog.clone()),
        Arc::new(deployments.clone()),
    );
    plugin.initialize().await.unwrap();
    Fixture { _dir: dir, catalog, deployments, plugin, project: MemProject::new("acme", "p1", "uuid-1") }
}

fn event(f: &Fixture, kind: EventKind) -> Event {
    Event::new(kind, "acme", "p1", "uuid-1", f.project.handle())
}

fn deployed_keys(d: &MockDeployments) -> Vec<(String, String, String)> {
    let mut v: Vec<_> = d.deployed("uuid-1").into_iter().map(|a| (a.app_name, a.version, a.profile_name)).collect();
    v.sort();
    v
}

#[tokio::test]
async fn uploads_package_files_with_last_flag() {
    let f = fixture().await;
    f.plugin.create_event(&event(&f, EventKind::Create), &mut PluginData::new()).await.unwrap();

    let uploads = f.catalog.uploads();
    let names: Vec<_> = uploads.iter().map(|(_, u)| u.file_name.as_str()).collect();
    assert_eq!(names, vec!["a-dp.yaml", "b-app.yaml"]);
    assert_eq!(uploads.iter().map(|(_, u)| u.last).collect::<Vec<_>>(), vec![false, true]);
    assert_eq!(uploads[1].1.session_id.as_deref(), Some("session-1"));
    assert_eq!(f.catalog.committed("uuid-1"), vec!["a-dp.yaml", "b-app.yaml"]);
}

#[tokio::test]
async fn running_twice_converges_to_the_same_deployments() {
    let f = fixture().await;
    let ev = event(&f, EventKind::Create);
    f.plugin.create_event(&ev, &mut PluginData::new()).await.unwrap();
    let first = deployed_keys(&f.deployments);
    f.plugin.create_event(&ev, &mut PluginData::new()).await.unwrap();

    assert_eq!(first, vec![("base-extensions".to_string(), "1.3.5".to_string(), "baseline".to_string())]);
    assert_eq!(deployed_keys(&f.deployments), first);
    let creates = f.deployments.calls().iter().filter(|c| *c == "create_deployment").count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn absent_entry_removes_only_the_matching_deployment() {
    let f = fixture().await;
    f.deployments.seed("uuid-1", "observability", "0.9.0", "default");
    f.deployments.seed("uuid-1", "observability", "0.9.1", "default");
    f.deployments.seed("uuid-1", "other-app", "1.0.0", "default");

    f.plugin.create_event(&event(&f, EventKind::Create), &mut PluginData::new()).await.unwrap();

    let keys = deployed_keys(&f.deployments);
    assert!(!keys.contains(&("observability".into(), "0.9.0".into(), "default".into())));
    assert!(keys.contains(&("observability".into(), "0.9.1".into(), "default".into())));
    assert!(keys.contains(&("other-app".into(), "1.0.0".into(), "default".into())));
    assert_eq!(keys.len(), 3); // two untouched plus the created base-extensions
}

#[tokio::test]
async fn absent_entry_without_match_is_a_noop() {
    let f = fixture().await;
    f.deployments.seed("uuid-1", "base-extensions", "1.3.5", "baseline");
    let before = deployed_keys(&f.deployments);

    f.plugin.create_event(&event(&f, EventKind::Create), &mut PluginData::new()).await.unwrap();

    assert_eq!(deployed_keys(&f.deployments), before);
    assert!(!f.deployments.calls().iter().any(|c| c == "delete_deployment"));
}

#[tokio::test]
async fn delete_removes_present_extensions() {
    let f = fixture().await;
    f.plugin.create_event(&event(&f, EventKind::Create), &mut PluginData::new()).await.unwrap();
    f.deployments.seed("uuid-1", "unrelated", "1.0.0", "default");

    f.plugin.delete_event(&event(&f, EventKind::Delete), &mut PluginData::new()).await.unwrap();
    assert_eq!(deployed_keys(&f.deployments), vec![("unrelated".to_string(), "1.0.0".to_string(), "default".to_string())]);
    // a second delete finds nothing left to remove
    f.plugin.delete_event(&event(&f, EventKind::Delete), &mut PluginData::new()).await.unwrap();
}

#[tokio::test]
async fn override_manifest_skips_the_puller() {
    let catalog = MockCatalog::new();
    catalog.initialize_client_secret().await.unwrap();
    let deployments = MockDeployments::new();
    let doc = "lpke:\n  deploymentList:\n    - {dpName: solo, dpVersion: '1.0', dpProfileName: default}\n";
    let plugin = ExtensionsPlugin::new(
        ManifestSource::Override(doc.to_string()),
        Arc::new(LocalPuller::new("/nonexistent")),
        Arc::new(catalog.clone()),
        Arc::new(deployments.clone()),
    );
    plugin.initialize().await.unwrap();
    let project = MemProject::new("acme", "p1", "uuid-1");
    let ev = Event::new(EventKind::Create, "acme", "p1", "uuid-1", project.handle());
    plugin.create_event(&ev, &mut PluginData::new()).await.unwrap();
    assert_eq!(deployments.deployed("uuid-1").len(), 1);
    assert!(catalog.uploads().is_empty());
}
