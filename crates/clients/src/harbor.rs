//! Harbor REST (v2.0 API) adapter.

use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{check, ClientError, ClientResult};
use crate::{HarborClient, Robot, RobotCredential};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OIDC group member type in Harbor.
const GROUP_TYPE_OIDC: i64 = 3;

#[derive(Clone)]
pub struct HarborHttpClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ProjectBody {
    project_id: i64,
}

impl HarborHttpClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url: base_url.into(), username: username.into(), password: password.into(), client }
    }

    /// Build from a `user:password` credential string as stored in the admin secret.
    pub fn from_credential(base_url: impl Into<String>, credential: &str) -> ClientResult<Self> {
        let (user, pass) = credential
            .trim()
            .split_once(':')
            .ok_or_else(|| ClientError::Unauthorized("harbor credential must be user:password".into()))?;
        Ok(Self::new(base_url, user, pass))
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/api/v2.0{}", self.base_url.trim_end_matches('/'), suffix)
    }

    fn req(&self, method: reqwest::Method, suffix: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(suffix))
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Is-Resource-Name", "true")
    }

    /// Robot names as Harbor reports them: `robot$<project>+<name>`.
    fn robot_suffix(project: &str, robot: &str) -> String { format!("{}+{}", project, robot) }
}

#[async_trait::async_trait]
impl HarborClient for HarborHttpClient {
    async fn ping(&self) -> ClientResult<()> {
        let resp = self.client.get(self.url("/ping")).send().await?;
        check("harbor ping", resp).await?;
        Ok(())
    }

    async fn apply_configuration(&self, config: &serde_json::Value) -> ClientResult<()> {
        let resp = self.req(reqwest::Method::PUT, "/configurations").json(config).send().await?;
        check("harbor configuration", resp).await?;
        Ok(())
    }

    async fn create_project(&self, name: &str) -> ClientResult<()> {
        let t0 = Instant::now();
        let body = json!({ "project_name": name, "metadata": { "public": "false" } });
        let resp = self.req(reqwest::Method::POST, "/projects").json(&body).send().await?;
        check("harbor create project", resp).await?;
        histogram!("harbor_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(project = %name, "harbor project created");
        Ok(())
    }

    async fn get_project_id(&self, name: &str) -> ClientResult<i64> {
        let resp = self.req(reqwest::Method::GET, &format!("/projects/{}", name)).send().await?;
        let resp = check("harbor get project", resp).await?;
        let body: ProjectBody = resp.json().await?;
        Ok(body.project_id)
    }

    async fn delete_project(&self, name: &str) -> ClientResult<()> {
        let resp = self.req(reqwest::Method::DELETE, &format!("/projects/{}", name)).send().await?;
        check("harbor delete project", resp).await?;
        Ok(())
    }

    async fn set_member_permissions(&self, project: &str, group: &str, role_id: i64) -> ClientResult<()> {
        let body = json!({
            "role_id": role_id,
            "member_group": { "group_name": group, "group_type": GROUP_TYPE_OIDC },
        });
        let resp = self.req(reqwest::Method::POST, &format!("/projects/{}/members", project)).json(&body).send().await?;
        check("harbor project member", resp).await?;
        Ok(())
    }

    async fn get_robot(&self, project: &str, robot: &str) -> ClientResult<Option<Robot>> {
        let suffix = Self::robot_suffix(project, robot);
        let resp = self
            .req(reqwest::Method::GET, "/robots")
            .query(&[("q", format!("name=~{}", suffix)), ("page_size", "100".to_string())])
            .send()
            .await?;
        let resp = check("harbor list robots", resp).await?;
        let robots: Vec<Robot> = resp.json().await?;
        Ok(robots.into_iter().find(|r| r.name == suffix || r.name.ends_with(&format!("${}", suffix))))
    }

    async fn create_robot(&self, project: &str, robot: &str) -> ClientResult<RobotCredential> {
        let body = json!({
            "name": robot,
            "level": "project",
            "duration": -1,
            "disable": false,
            "permissions": [{
                "kind": "project",
                "namespace": project,
                "access": [
                    { "resource": "repository", "action": "pull" },
                    { "resource": "repository", "action": "push" },
                    { "resource": "artifact", "action": "read" },
                    { "resource": "artifact", "action": "list" },
                ],
            }],
        });
        let resp = self.req(reqwest::Method::POST, "/robots").json(&body).send().await?;
        let resp = check("harbor create robot", resp).await?;
        Ok(resp.json().await?)
    }

    async fn delete_robot(&self, id: i64) -> ClientResult<()> {
        let resp = self.req(reqwest::Method::DELETE, &format!("/robots/{}", id)).send().await?;
        check("harbor delete robot", resp).await?;
        Ok(())
    }
}
