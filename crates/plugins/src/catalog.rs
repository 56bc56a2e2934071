//! Catalog registries for a tenant project: the project's own Harbor (helm
//! and image) plus the read-only release service.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tenant_clients::{Registry, RegistryClient, RegistryKind};
use tenant_core::{Backoff, Event, Plugin, PluginData, HARBOR_TOKEN, HARBOR_USERNAME};
use tracing::{debug, info};

use crate::{harbor_project_name, wait_until_ready};

/// Release service roots registered for every project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseService {
    pub helm_root: String,
    pub images_root: String,
}

impl ReleaseService {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self { helm_root: base.to_string(), images_root: base.to_string() }
    }
}

pub struct CatalogPlugin {
    client: Arc<dyn RegistryClient>,
    backoff: Backoff,
    /// OCI root of the Harbor the project registries point at, e.g. `oci://harbor.example`.
    harbor_oci: String,
    release: ReleaseService,
}

impl CatalogPlugin {
    pub fn new(client: Arc<dyn RegistryClient>, harbor_oci: impl Into<String>, release: ReleaseService) -> Self {
        Self { client, backoff: Backoff::default(), harbor_oci: harbor_oci.into(), release }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn registries(&self, event: &Event, data: &PluginData) -> Result<Vec<Registry>> {
        let username = data.get(HARBOR_USERNAME).ok_or_else(|| anyhow!("no harbor robot username published for {}", event.project))?;
        let token = data.get(HARBOR_TOKEN).ok_or_else(|| anyhow!("no harbor robot token published for {}", event.project))?;
        let root = format!("{}/{}", self.harbor_oci.trim_end_matches('/'), harbor_project_name(&event.organization, &event.project));
        let harbor = |name: &str, display: &str, kind| Registry {
            name: name.to_string(),
            display_name: display.to_string(),
            description: format!("Harbor OCI {} for project {}", display, event.project),
            kind,
            root_url: root.clone(),
            username: Some(username.clone()),
            auth_token: Some(token.clone()),
            inventory_url: None,
        };
        let release = |name: &str, display: &str, kind, root: &str| Registry {
            name: name.to_string(),
            display_name: display.to_string(),
            description: format!("Release service {}", display),
            kind,
            root_url: root.to_string(),
            username: None,
            auth_token: None,
            inventory_url: None,
        };
        Ok(vec![
            harbor("harbor-helm-oci", "harbor helm", RegistryKind::Helm),
            harbor("harbor-docker-oci", "harbor docker", RegistryKind::Image),
            release("intel-rs-helm", "release service helm", RegistryKind::Helm, &self.release.helm_root),
            release("intel-rs-images", "release service images", RegistryKind::Image, &self.release.images_root),
        ])
    }
}

#[async_trait::async_trait]
impl Plugin for CatalogPlugin {
    fn name(&self) -> &str { "catalog" }

    async fn initialize(&self) -> Result<()> {
        wait_until_ready("catalog client secret", self.backoff, || self.client.initialize_client_secret()).await
    }

    async fn create_event(&self, event: &Event, data: &mut PluginData) -> Result<()> {
        let registries = self.registries(event, data)?;
        for reg in &registries {
            self.client
                .create_or_update_registry(&event.project_uuid, reg)
                .await
                .with_context(|| format!("registry {}", reg.name))?;
            debug!(project = %event.project_uuid, registry = %reg.name, "registry ensured");
        }
        info!(project = %event.project_uuid, registries = registries.len(), "catalog registries provisioned");
        Ok(())
    }

    async fn delete_event(&self, event: &Event, _data: &mut PluginData) -> Result<()> {
        match self.client.wipe_project(&event.project_uuid).await {
            Ok(()) => info!(project = %event.project_uuid, "catalog project wiped"),
            Err(e) if e.is_not_found() => debug!(project = %event.project_uuid, "catalog project already empty"),
            Err(e) => return Err(e).context("wiping catalog project"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_clients::mock::MockCatalog;
    use tenant_core::mem::MemProject;
    use tenant_core::EventKind;

    fn event() -> Event {
        let p = MemProject::new("Acme", "Proj1", "uuid-1");
        Event::new(EventKind::Create, "Acme", "Proj1", "uuid-1", p.handle())
    }

    fn plugin(mock: &MockCatalog) -> CatalogPlugin {
        CatalogPlugin::new(Arc::new(mock.clone()), "oci://harbor.example/", ReleaseService::from_base("oci://rs.example"))
    }

    fn robot_data() -> PluginData {
        PluginData::from([
            (HARBOR_USERNAME.to_string(), "robot$acme-proj1+catalog-apps-read-write".to_string()),
            (HARBOR_TOKEN.to_string(), "s3cr3t".to_string()),
        ])
    }

    #[tokio::test]
    async fn creates_four_registries_with_robot_credentials() {
        let mock = MockCatalog::new();
        let p = plugin(&mock);
        p.initialize().await.unwrap();
        p.create_event(&event(), &mut robot_data()).await.unwrap();

        let helm = mock.registry("uuid-1", "harbor-helm-oci").unwrap();
        assert_eq!(helm.root_url, "oci://harbor.example/acme-proj1");
        assert_eq!(helm.auth_token.as_deref(), Some("s3cr3t"));
        assert_eq!(mock.registry("uuid-1", "harbor-docker-oci").unwrap().kind, RegistryKind::Image);
        let rs = mock.registry("uuid-1", "intel-rs-helm").unwrap();
        assert_eq!(rs.root_url, "oci://rs.example");
        assert!(rs.username.is_none());
        assert!(mock.registry("uuid-1", "intel-rs-images").is_some());
    }

    #[tokio::test]
    async fn missing_robot_credentials_fail_before_any_call() {
        let mock = MockCatalog::new();
        let p = plugin(&mock);
        p.initialize().await.unwrap();
        let err = p.create_event(&event(), &mut PluginData::new()).await.unwrap_err();
        assert!(err.to_string().contains("harbor robot"), "err={}", err);
        assert_eq!(mock.calls(), vec!["initialize_client_secret"]);
    }

    #[tokio::test]
    async fn rerun_updates_in_place() {
        let mock = MockCatalog::new();
        let p = plugin(&mock);
        p.initialize().await.unwrap();
        p.create_event(&event(), &mut robot_data()).await.unwrap();
        let mut rotated = robot_data();
        rotated.insert(HARBOR_TOKEN.to_string(), "rotated".to_string());
        p.create_event(&event(), &mut rotated).await.unwrap();
        assert_eq!(mock.registry("uuid-1", "harbor-helm-oci").unwrap().auth_token.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn delete_wipes_project() {
        let mock = MockCatalog::new();
        let p = plugin(&mock);
        p.initialize().await.unwrap();
        p.delete_event(&event(), &mut PluginData::new()).await.unwrap();
        assert_eq!(mock.wiped(), vec!["uuid-1"]);
    }
}
