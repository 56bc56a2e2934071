//! Harbor project, tenant group memberships and the catalog robot account.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tenant_clients::{roles, ClientResult, HarborClient};
use tenant_core::{Backoff, Event, Plugin, PluginData, HARBOR_TOKEN, HARBOR_USERNAME};
use tracing::{debug, info};

use crate::wait_until_ready;

/// Robot account the catalog uses to read and push project artifacts.
pub const CATALOG_ROBOT: &str = "catalog-apps-read-write";

/// Harbor project backing a tenant project.
pub fn harbor_project_name(organization: &str, project: &str) -> String {
    format!("{}-{}", organization, project).to_lowercase()
}

pub struct HarborPlugin {
    client: Arc<dyn HarborClient>,
    backoff: Backoff,
    configuration: Option<serde_json::Value>,
}

impl HarborPlugin {
    pub fn new(client: Arc<dyn HarborClient>) -> Self {
        Self { client, backoff: Backoff::default(), configuration: None }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// System configuration pushed to Harbor once it answers pings.
    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// OIDC login against the platform's Keycloak realm, groups taken from the `groups` claim.
    pub fn oidc_configuration(oidc_endpoint: &str, client_id: &str, client_secret: &str) -> serde_json::Value {
        json!({
            "auth_mode": "oidc_auth",
            "oidc_name": "keycloak",
            "oidc_endpoint": oidc_endpoint,
            "oidc_client_id": client_id,
            "oidc_client_secret": client_secret,
            "oidc_groups_claim": "groups",
            "oidc_scope": "openid,email,profile,groups",
            "oidc_user_claim": "preferred_username",
            "oidc_verify_cert": false,
            "oidc_auto_onboard": true,
        })
    }
}

fn conflict_ok(res: ClientResult<()>) -> ClientResult<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait::async_trait]
impl Plugin for HarborPlugin {
    fn name(&self) -> &str { "harbor" }

    async fn initialize(&self) -> Result<()> {
        wait_until_ready("harbor", self.backoff, || self.client.ping()).await?;
        if let Some(cfg) = &self.configuration {
            self.client.apply_configuration(cfg).await.context("harbor configuration")?;
            info!("harbor configuration applied");
        }
        Ok(())
    }

    async fn create_event(&self, event: &Event, data: &mut PluginData) -> Result<()> {
        let project = harbor_project_name(&event.organization, &event.project);
        let created = conflict_ok(self.client.create_project(&project).await).with_context(|| format!("creating harbor project {}", project))?;
        debug!(harbor_project = %project, created, "harbor project ensured");

        let groups = [
            (format!("{}_Edge-Manager-Group", event.project_uuid), roles::PROJECT_ADMIN),
            (format!("{}_Edge-Operator-Group", event.project_uuid), roles::MAINTAINER),
        ];
        for (group, role) in &groups {
            conflict_ok(self.client.set_member_permissions(&project, group, *role).await)
                .with_context(|| format!("granting {} on {}", group, project))?;
        }

        // the secret is only returned at creation, so an existing robot is replaced
        if let Some(existing) = self.client.get_robot(&project, CATALOG_ROBOT).await.context("looking up catalog robot")? {
            match self.client.delete_robot(existing.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context("deleting stale catalog robot"),
            }
        }
        let robot = self.client.create_robot(&project, CATALOG_ROBOT).await.context("creating catalog robot")?;
        data.insert(HARBOR_USERNAME.to_string(), robot.name.clone());
        data.insert(HARBOR_TOKEN.to_string(), robot.secret);
        info!(project = %event.project_uuid, harbor_project = %project, robot = %robot.name, "harbor provisioned");
        Ok(())
    }

    async fn delete_event(&self, event: &Event, _data: &mut PluginData) -> Result<()> {
        let project = harbor_project_name(&event.organization, &event.project);
        match self.client.delete_project(&project).await {
            Ok(()) => info!(project = %event.project_uuid, harbor_project = %project, "harbor project deleted"),
            Err(e) if e.is_not_found() => debug!(harbor_project = %project, "harbor project already gone"),
            Err(e) => return Err(e).with_context(|| format!("deleting harbor project {}", project)),
        }
        Ok(())
    }
}
