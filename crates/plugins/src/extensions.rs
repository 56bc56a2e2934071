//! Extension reconciler: converges a project's extension deployments to the
//! manifest and uploads the manifest's deployment packages to the catalog.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use tenant_clients::{DeploymentClient, FileUpload, RegistryClient};
use tenant_core::{Backoff, Event, Plugin, PluginData};
use tenant_manifest::puller::yaml_files;
use tenant_manifest::{plan, resolve, ArtifactPuller, DesiredState, Manifest, ManifestSource};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::wait_until_ready;

pub struct ExtensionsPlugin {
    source: ManifestSource,
    puller: Arc<dyn ArtifactPuller>,
    catalog: Arc<dyn RegistryClient>,
    deployments: Arc<dyn DeploymentClient>,
    backoff: Backoff,
    manifest: RwLock<Option<Manifest>>,
}

impl ExtensionsPlugin {
    pub fn new(
        source: ManifestSource,
        puller: Arc<dyn ArtifactPuller>,
        catalog: Arc<dyn RegistryClient>,
        deployments: Arc<dyn DeploymentClient>,
    ) -> Self {
        Self { source, puller, catalog, deployments, backoff: Backoff::default(), manifest: RwLock::new(None) }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cached manifest, resolved on first use when `initialize` did not run or failed.
    async fn manifest(&self) -> Result<Manifest> {
        if let Some(m) = self.manifest.read().await.as_ref() {
            return Ok(m.clone());
        }
        let m = resolve(&self.source, self.puller.as_ref()).await?;
        *self.manifest.write().await = Some(m.clone());
        Ok(m)
    }

    /// Upload one package's YAML files as a single batch; the last file closes the batch.
    async fn upload_package(&self, project_uuid: &str, dir: &Path, package: &str) -> Result<usize> {
        let files = yaml_files(dir).await?;
        let mut session_id: Option<String> = None;
        for (i, file) in files.iter().enumerate() {
            let artifact = tokio::fs::read(file).await.with_context(|| format!("reading {}", file.display()))?;
            let file_name = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let upload = FileUpload {
                session_id: session_id.clone(),
                upload_number: i as u32,
                file_name,
                artifact,
                last: i + 1 == files.len(),
            };
            match self.catalog.upload_file(project_uuid, &upload).await {
                Ok(receipt) => session_id = Some(receipt.session_id),
                // already in the catalog from an earlier run
                Err(e) if e.is_conflict() => {
                    debug!(project = %project_uuid, package = %package, error = %e, "package already uploaded");
                    return Ok(0);
                }
                Err(e) => return Err(e).with_context(|| format!("uploading {} of {}", upload.file_name, package)),
            }
        }
        Ok(files.len())
    }
}

#[async_trait::async_trait]
impl Plugin for ExtensionsPlugin {
    fn name(&self) -> &str { "extensions" }

    async fn initialize(&self) -> Result<()> {
        let m = wait_until_ready("extension manifest", self.backoff, || resolve(&self.source, self.puller.as_ref())).await?;
        info!(release = %m.metadata.release, packages = m.packages.len(), deployments = m.deployments.len(), "extension manifest loaded");
        *self.manifest.write().await = Some(m);
        Ok(())
    }

    async fn create_event(&self, event: &Event, _data: &mut PluginData) -> Result<()> {
        let t0 = Instant::now();
        let manifest = self.manifest().await?;

        for pkg in &manifest.packages {
            let artifact = self.puller.load(&pkg.dpkg, &pkg.version).await.with_context(|| format!("pulling package {}:{}", pkg.dpkg, pkg.version))?;
            let uploaded = self.upload_package(&event.project_uuid, artifact.path(), &pkg.dpkg).await?;
            debug!(project = %event.project_uuid, package = %pkg.dpkg, files = uploaded, "package uploaded");
        }

        let deployed = self.deployments.list_deployments(&event.project_uuid).await.context("listing deployments")?;
        let p = plan(&manifest.deployments, &deployed);
        for d in &p.create {
            match self.deployments.create_deployment(&event.project_uuid, d).await {
                Ok(()) => {
                    counter!("extension_deployments_created_total", 1u64);
                }
                Err(e) if e.is_conflict() => debug!(project = %event.project_uuid, app = %d.app_name, "deployment already exists"),
                Err(e) => return Err(e).with_context(|| format!("creating deployment {} {}", d.app_name, d.version)),
            }
        }
        for del in &p.delete {
            self.deployments
                .delete_deployment(&event.project_uuid, &del.deployment_id, true)
                .await
                .with_context(|| format!("deleting deployment {} {}", del.descriptor.app_name, del.descriptor.version))?;
            counter!("extension_deployments_deleted_total", 1u64);
        }
        histogram!("extension_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            project = %event.project_uuid,
            created = p.create.len(),
            deleted = p.delete.len(),
            unchanged = p.unchanged,
            took_ms = %t0.elapsed().as_millis(),
            "extensions reconciled"
        );
        Ok(())
    }

    async fn delete_event(&self, event: &Event, _data: &mut PluginData) -> Result<()> {
        let manifest = self.manifest().await?;
        let deployed = self.deployments.list_deployments(&event.project_uuid).await.context("listing deployments")?;
        let mut removed = 0usize;
        for d in manifest.deployments.iter().filter(|d| d.desired_state == DesiredState::Present) {
            let key = d.key();
            for app in deployed.iter().filter(|a| a.key() == key) {
                self.deployments
                    .delete_deployment(&event.project_uuid, &app.id, true)
                    .await
                    .with_context(|| format!("deleting deployment {} {}", app.app_name, app.version))?;
                removed += 1;
            }
        }
        info!(project = %event.project_uuid, removed, "extension deployments removed");
        Ok(())
    }
}
