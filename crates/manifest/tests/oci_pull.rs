#![forbid(unsafe_code)]

use tenant_manifest::{resolve, ArtifactPuller, ManifestSource, OciPuller};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST_DOC: &str = "metadata:\n  release: '1.3.5'\nlpke:\n  deploymentList:\n    - {dpName: base-extensions, dpVersion: '1.3.5', dpProfileName: baseline}\n";

async fn registry_with_manifest(server: &MockServer, protected: bool) {
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": "sha256:aaa",
                "size": MANIFEST_DOC.len(),
                "annotations": { "org.opencontainers.image.title": "manifest.yaml" }
            },
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": "sha256:bbb",
                "size": 3,
                "annotations": { "org.opencontainers.image.title": "../escape.yaml" }
            }
        ]
    });
    if protected {
        let challenge = format!(
            "Bearer realm=\"{}/service/token\",service=\"registry\",scope=\"repository:edge-orch/manifest:pull\"",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/v2/edge-orch/manifest/manifests/v1.3.5"))
            .and(header("authorization", "Bearer anon-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
            .with_priority(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/edge-orch/manifest/manifests/v1.3.5"))
            .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()))
            .with_priority(2)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/service/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "anon-token" })))
            .mount(server)
            .await;
    } else {
        Mock::given(method("GET"))
            .and(path("/v2/edge-orch/manifest/manifests/v1.3.5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/v2/edge-orch/manifest/blobs/sha256:aaa"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST_DOC))
        .mount(server)
        .await;
}

#[tokio::test]
async fn pulls_titled_layers_into_a_directory() {
    let server = MockServer::start().await;
    registry_with_manifest(&server, false).await;
    let work = tempfile::tempdir().unwrap();
    let puller = OciPuller::new(server.uri()).with_work_dir(work.path());

    let artifact = puller.load("edge-orch/manifest", "v1.3.5").await.unwrap();
    let dir = artifact.path().to_path_buf();
    let got = std::fs::read_to_string(dir.join("manifest.yaml")).unwrap();
    assert_eq!(got, MANIFEST_DOC);
    // the traversal-named layer is skipped, never fetched
    assert!(!work.path().join("escape.yaml").exists());
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

    drop(artifact);
    assert!(!dir.exists());
}

#[tokio::test]
async fn repeated_resolves_leave_no_scratch_dirs() {
    let server = MockServer::start().await;
    registry_with_manifest(&server, false).await;
    let work = tempfile::tempdir().unwrap();
    let puller = OciPuller::new(server.uri()).with_work_dir(work.path());
    let source = ManifestSource::Remote { path: "edge-orch/manifest".into(), tag: "v1.3.5".into() };

    for _ in 0..3 {
        resolve(&source, &puller).await.unwrap();
    }
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn answers_anonymous_bearer_challenge() {
    let server = MockServer::start().await;
    registry_with_manifest(&server, true).await;
    let work = tempfile::tempdir().unwrap();
    let puller = OciPuller::new(server.uri()).with_work_dir(work.path());

    let source = ManifestSource::Remote { path: "edge-orch/manifest".into(), tag: "v1.3.5".into() };
    let m = resolve(&source, &puller).await.unwrap();
    assert_eq!(m.metadata.release, "1.3.5");
    assert_eq!(m.deployments.len(), 1);
    assert_eq!(m.deployments[0].app_name, "base-extensions");
}

#[tokio::test]
async fn missing_tag_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/edge-orch/manifest/manifests/v0.0.0"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let puller = OciPuller::new(server.uri());
    let e = puller.load("edge-orch/manifest", "v0.0.0").await.unwrap_err().to_string();
    assert!(e.contains("manifest fetch failed"), "e={}", e);
}
