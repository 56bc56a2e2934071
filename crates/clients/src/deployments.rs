//! App deployment manager REST adapter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenant_manifest::{DeployedApp, DeploymentDescriptor};
use tracing::debug;

use crate::error::{check, ClientError, ClientResult};
use crate::{DeploymentClient, TokenSource};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API: &str = "/deployment.orchestrator.apis/v1";

#[derive(Clone)]
pub struct AdmHttpClient {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<TokenSource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentList {
    #[serde(default)]
    deployments: Vec<DeploymentItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentItem {
    deploy_id: String,
    app_name: String,
    app_version: String,
    #[serde(default)]
    profile_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetClusters<'a> {
    app_name: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    app_name: &'a str,
    app_version: &'a str,
    profile_name: &'a str,
    display_name: &'a str,
    deployment_type: &'a str,
    all_app_target_clusters: TargetClusters<'a>,
}

impl AdmHttpClient {
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

    async fn checked(&self, what: &str, resp: reqwest::Response) -> ClientResult<reqwest::Response> {
        let res = check(what, resp).await;
        if let Err(ClientError::Unauthorized(_)) = &res {
            self.tokens.invalidate().await;
        }
        res
    }
}

#[async_trait::async_trait]
impl DeploymentClient for AdmHttpClient {
    async fn list_deployments(&self, project_uuid: &str) -> ClientResult<Vec<DeployedApp>> {
        let resp = self.req(reqwest::Method::GET, "/deployments", project_uuid).await?.send().await?;
        let resp = self.checked("adm list deployments", resp).await?;
        let list: DeploymentList = resp.json().await?;
        Ok(list
            .deployments
            .into_iter()
            .map(|d| DeployedApp { id: d.deploy_id, app_name: d.app_name, version: d.app_version, profile_name: d.profile_name })
            .collect())
    }

    async fn create_deployment(&self, project_uuid: &str, deployment: &DeploymentDescriptor) -> ClientResult<()> {
        let body = CreateBody {
            app_name: &deployment.app_name,
            app_version: &deployment.version,
            profile_name: &deployment.profile_name,
            display_name: &deployment.display_name,
            deployment_type: "auto-scaling",
            all_app_target_clusters: TargetClusters { app_name: "", labels: &deployment.target_cluster_labels },
        };
        let resp = self.req(reqwest::Method::POST, "/deployments", project_uuid).await?.json(&body).send().await?;
        self.checked("adm create deployment", resp).await?;
        debug!(project = %project_uuid, app = %deployment.app_name, version = %deployment.version, "deployment created");
        Ok(())
    }

    async fn delete_deployment(&self, project_uuid: &str, deployment_id: &str, missing_ok: bool) -> ClientResult<()> {
        let suffix = format!("/deployments/{}", deployment_id);
        let resp = self
            .req(reqwest::Method::DELETE, &suffix, project_uuid)
            .await?
            .query(&[("deleteType", "PARENT_ONLY")])
            .send()
            .await?;
        match self.checked("adm delete deployment", resp).await {
            Ok(_) => Ok(()),
            Err(e) if missing_ok && e.is_not_found() => {
                debug!(project = %project_uuid, id = %deployment_id, "deployment already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
