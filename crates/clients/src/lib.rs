//! Backend clients the provisioning plugins talk to.
//!
//! Each backend is a trait so plugins can run against the HTTP adapters in
//! production and against the in-memory mocks in tests.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use tenant_manifest::{DeployedApp, DeploymentDescriptor};

pub mod auth;
pub mod catalog;
pub mod deployments;
pub mod error;
pub mod harbor;
pub mod mock;

pub use auth::TokenSource;
pub use catalog::CatalogHttpClient;
pub use deployments::AdmHttpClient;
pub use error::{ClientError, ClientResult};
pub use harbor::HarborHttpClient;

// ----------------- Harbor -----------------

/// Robot account as listed by Harbor (no secret).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Robot {
    pub id: i64,
    pub name: String,
}

/// Robot account as returned on creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RobotCredential {
    pub id: i64,
    pub name: String,
    pub secret: String,
}

/// Harbor role ids.
pub mod roles {
    pub const PROJECT_ADMIN: i64 = 1;
    pub const MAINTAINER: i64 = 4;
}

#[async_trait::async_trait]
pub trait HarborClient: Send + Sync {
    async fn ping(&self) -> ClientResult<()>;
    async fn apply_configuration(&self, config: &serde_json::Value) -> ClientResult<()>;
    async fn create_project(&self, name: &str) -> ClientResult<()>;
    async fn get_project_id(&self, name: &str) -> ClientResult<i64>;
    async fn delete_project(&self, name: &str) -> ClientResult<()>;
    async fn set_member_permissions(&self, project: &str, group: &str, role_id: i64) -> ClientResult<()>;
    async fn get_robot(&self, project: &str, robot: &str) -> ClientResult<Option<Robot>>;
    async fn create_robot(&self, project: &str, robot: &str) -> ClientResult<RobotCredential>;
    async fn delete_robot(&self, id: i64) -> ClientResult<()>;
}

// ----------------- Catalog -----------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegistryKind {
    #[serde(rename = "HELM")]
    Helm,
    #[serde(rename = "IMAGE")]
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: RegistryKind,
    pub root_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_url: Option<String>,
}

/// One file of a catalog upload batch; `last` asks the catalog to validate the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub session_id: Option<String>,
    pub upload_number: u32,
    pub file_name: String,
    pub artifact: Vec<u8>,
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadReceipt {
    pub session_id: String,
}

#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch client credentials and an access token; required before any other call.
    async fn initialize_client_secret(&self) -> ClientResult<()>;
    async fn create_or_update_registry(&self, project_uuid: &str, registry: &Registry) -> ClientResult<()>;
    async fn list_registries(&self, project_uuid: &str) -> ClientResult<Vec<Registry>>;
    async fn upload_file(&self, project_uuid: &str, upload: &FileUpload) -> ClientResult<UploadReceipt>;
    async fn wipe_project(&self, project_uuid: &str) -> ClientResult<()>;
}

// ----------------- Deployment manager -----------------

#[async_trait::async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn list_deployments(&self, project_uuid: &str) -> ClientResult<Vec<DeployedApp>>;
    async fn create_deployment(&self, project_uuid: &str, deployment: &DeploymentDescriptor) -> ClientResult<()>;
    /// With `missing_ok`, deleting an unknown deployment succeeds.
    async fn delete_deployment(&self, project_uuid: &str, deployment_id: &str, missing_ok: bool) -> ClientResult<()>;
}
