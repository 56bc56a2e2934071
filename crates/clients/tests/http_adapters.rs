#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use tenant_clients::{
    AdmHttpClient, CatalogHttpClient, ClientError, DeploymentClient, FileUpload, HarborClient, HarborHttpClient, Registry,
    RegistryClient, RegistryKind, TokenSource,
};
use tenant_manifest::{DeploymentDescriptor, DesiredState};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry(name: &str) -> Registry {
    Registry {
        name: name.into(),
        display_name: name.into(),
        description: "project registry".into(),
        kind: RegistryKind::Helm,
        root_url: "oci://harbor.example/acme-p1".into(),
        username: Some("robot$acme-p1+catalog-apps-read-write".into()),
        auth_token: Some("s3cr3t".into()),
        inventory_url: None,
    }
}

// ---- harbor ----

#[tokio::test]
async fn harbor_maps_conflict_and_sends_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2.0/projects"))
        .and(header("authorization", "Basic YWRtaW46cHc="))
        .and(body_partial_json(serde_json::json!({ "project_name": "acme-p1" })))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "errors": [{ "code": "CONFLICT", "message": "The project named acme-p1 already exists" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HarborHttpClient::from_credential(server.uri(), "admin:pw").unwrap();
    let err = client.create_project("acme-p1").await.unwrap_err();
    assert!(err.is_conflict(), "err={}", err);
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn harbor_finds_robot_by_project_scoped_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2.0/robots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "id": 7, "name": "robot$acme-p10+catalog-apps-read-write" },
            { "id": 9, "name": "robot$acme-p1+catalog-apps-read-write" }
        ])))
        .mount(&server)
        .await;

    let client = HarborHttpClient::new(server.uri(), "admin", "pw");
    let robot = client.get_robot("acme-p1", "catalog-apps-read-write").await.unwrap().unwrap();
    assert_eq!(robot.id, 9);
    assert!(client.get_robot("acme-p2", "catalog-apps-read-write").await.unwrap().is_none());
}

#[test]
fn harbor_credential_needs_separator() {
    assert!(matches!(HarborHttpClient::from_credential("http://h", "nocolon"), Err(ClientError::Unauthorized(_))));
}

// ---- catalog ----

#[tokio::test]
async fn catalog_updates_registry_on_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/catalog.orchestrator.apis/v3/registries"))
        .and(header("authorization", "Bearer tok"))
        .and(header("activeprojectid", "uuid-1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({ "message": "registry exists" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/catalog.orchestrator.apis/v3/registries/harbor-helm-oci"))
        .and(body_partial_json(serde_json::json!({ "registry": { "name": "harbor-helm-oci", "type": "HELM" } })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = CatalogHttpClient::new(server.uri(), Arc::new(TokenSource::fixed("tok")));
    client.create_or_update_registry("uuid-1", &registry("harbor-helm-oci")).await.unwrap();
}

#[tokio::test]
async fn catalog_upload_encodes_artifact_and_returns_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/catalog.orchestrator.apis/v3/upload"))
        .and(body_partial_json(serde_json::json!({
            "lastUpload": true,
            "uploadNumber": 1,
            "sessionId": "s-1",
            "upload": { "fileName": "app.yaml", "artifact": "a2luZDogYXBw" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "sessionId": "s-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = CatalogHttpClient::new(server.uri(), Arc::new(TokenSource::fixed("tok")));
    let upload = FileUpload {
        session_id: Some("s-1".into()),
        upload_number: 1,
        file_name: "app.yaml".into(),
        artifact: b"kind: app".to_vec(),
        last: true,
    };
    assert_eq!(client.upload_file("uuid-1", &upload).await.unwrap().session_id, "s-1");
}

#[tokio::test]
async fn catalog_upload_reports_existing_entities_as_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/catalog.orchestrator.apis/v3/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionId": "s-2",
            "errorMessages": ["application base-extensions:1.3.5 already exists"]
        })))
        .mount(&server)
        .await;

    let client = CatalogHttpClient::new(server.uri(), Arc::new(TokenSource::fixed("tok")));
    let upload = FileUpload { session_id: None, upload_number: 0, file_name: "a.yaml".into(), artifact: vec![], last: true };
    assert!(client.upload_file("uuid-1", &upload).await.unwrap_err().is_conflict());
}

// ---- deployment manager ----

#[tokio::test]
async fn deployments_list_and_create() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/deployment.orchestrator.apis/v1/deployments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "deployments": [{ "deployId": "d-1", "appName": "base-extensions", "appVersion": "1.2.0", "profileName": "baseline" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/deployment.orchestrator.apis/v1/deployments"))
        .and(body_partial_json(serde_json::json!({
            "appName": "base-extensions",
            "appVersion": "1.3.5",
            "deploymentType": "auto-scaling",
            "allAppTargetClusters": { "labels": { "default-extension": "baseline" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "deploymentId": "d-2" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = AdmHttpClient::new(server.uri(), Arc::new(TokenSource::fixed("tok")));
    let listed = client.list_deployments("uuid-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "d-1");
    assert_eq!(listed[0].version, "1.2.0");

    let d = DeploymentDescriptor {
        app_name: "base-extensions".into(),
        display_name: "base-extensions-baseline".into(),
        version: "1.3.5".into(),
        profile_name: "baseline".into(),
        target_cluster_labels: BTreeMap::from([("default-extension".to_string(), "baseline".to_string())]),
        desired_state: DesiredState::Present,
    };
    client.create_deployment("uuid-1", &d).await.unwrap();
}

#[tokio::test]
async fn deployments_delete_tolerates_missing_when_asked() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/deployment.orchestrator.apis/v1/deployments/d-9"))
        .and(query_param("deleteType", "PARENT_ONLY"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({ "message": "not found" })))
        .mount(&server)
        .await;

    let client = AdmHttpClient::new(server.uri(), Arc::new(TokenSource::fixed("tok")));
    client.delete_deployment("uuid-1", "d-9", true).await.unwrap();
    assert!(client.delete_deployment("uuid-1", "d-9", false).await.unwrap_err().is_not_found());
}
