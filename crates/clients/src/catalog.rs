//! Application catalog REST adapter (registries, uploads, project wipe).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{check, ClientError, ClientResult};
use crate::{FileUpload, Registry, RegistryClient, TokenSource, UploadReceipt};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API: &str = "/catalog.orchestrator.apis/v3";

#[derive(Clone)]
pub struct CatalogHttpClient {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<TokenSource>,
}

#[derive(Deserialize)]
struct RegistryList {
    #[serde(default)]
    registries: Vec<Registry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody<'a> {
    session_id: &'a str,
    upload_number: u32,
    last_upload: bool,
    upload: UploadFile<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadFile<'a> {
    file_name: &'a str,
    artifact: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    error_messages: Vec<String>,
}

impl CatalogHttpClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenSource>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url: base_url.into(), client, tokens }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base_url.trim_end_matches('/'), API, suffix)
    }

    async fn req(&self, method: reqwest::Method, suffix: &str, project_uuid: &str) -> ClientResult<reqwest::RequestBuilder> {
        let token = self.tokens.bearer().await?;
        Ok(self.client.request(method, self.url(suffix)).bearer_auth(token).header("ActiveProjectID", project_uuid))
    }

    /// Run `check`, dropping the cached token on 401/403 so the next attempt re-authenticates.
    async fn checked(&self, what: &str, resp: reqwest::Response) -> ClientResult<reqwest::Response> {
        let res = check(what, resp).await;
        if let Err(ClientError::Unauthorized(_)) = &res {
            self.tokens.invalidate().await;
        }
        res
    }
}

#[async_trait::async_trait]
impl RegistryClient for CatalogHttpClient {
    async fn initialize_client_secret(&self) -> ClientResult<()> {
        self.tokens.refresh().await
    }

    async fn create_or_update_registry(&self, project_uuid: &str, registry: &Registry) -> ClientResult<()> {
        let body = json!({ "registry": registry });
        let resp = self.req(reqwest::Method::POST, "/registries", project_uuid).await?.json(&body).send().await?;
        match self.checked("catalog create registry", resp).await {
            Ok(_) => {
                debug!(project = %project_uuid, registry = %registry.name, "registry created");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                let suffix = format!("/registries/{}", registry.name);
                let resp = self.req(reqwest::Method::PUT, &suffix, project_uuid).await?.json(&body).send().await?;
                self.checked("catalog update registry", resp).await?;
                debug!(project = %project_uuid, registry = %registry.name, "registry updated");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_registries(&self, project_uuid: &str) -> ClientResult<Vec<Registry>> {
        let resp = self.req(reqwest::Method::GET, "/registries", project_uuid).await?.send().await?;
        let resp = self.checked("catalog list registries", resp).await?;
        let list: RegistryList = resp.json().await?;
        Ok(list.registries)
    }

    async fn upload_file(&self, project_uuid: &str, upload: &FileUpload) -> ClientResult<UploadReceipt> {
        let body = UploadBody {
            session_id: upload.session_id.as_deref().unwrap_or(""),
            upload_number: upload.upload_number,
            last_upload: upload.last,
            upload: UploadFile {
                file_name: &upload.file_name,
                artifact: base64::engine::general_purpose::STANDARD.encode(&upload.artifact),
            },
        };
        let resp = self.req(reqwest::Method::POST, "/upload", project_uuid).await?.json(&body).send().await?;
        let resp = self.checked("catalog upload", resp).await?;
        let out: UploadResponse = resp.json().await?;
        if !out.error_messages.is_empty() {
            let message = out.error_messages.join("; ");
            // the catalog reports re-uploads of existing entities this way
            if message.contains("already exists") {
                return Err(ClientError::Conflict(message));
            }
            return Err(ClientError::Status { status: 400, message });
        }
        Ok(UploadReceipt { session_id: out.session_id })
    }

    async fn wipe_project(&self, project_uuid: &str) -> ClientResult<()> {
        let suffix = format!("/projects/{}", project_uuid);
        let resp = self.req(reqwest::Method::DELETE, &suffix, project_uuid).await?.send().await?;
        self.checked("catalog wipe project", resp).await?;
        Ok(())
    }
}
