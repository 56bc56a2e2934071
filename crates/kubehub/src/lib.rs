//! Kubernetes side of the tenant controller: list+watch of `Project`
//! resources, watcher records stored as `ProjectActiveWatcher` resources and
//! secret reads.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use tenant_core::ProjectListener;
use tracing::{debug, info, warn};

pub mod project;
pub mod secrets;

pub use project::KubeProject;
pub use secrets::KubeSecretReader;

pub const DEFAULT_PROJECT_GVK: &str = "tenancy.edge-orchestrator.io/v1/Project";
pub const WATCHER_KIND: &str = "ProjectActiveWatcher";
pub const ORG_KIND: &str = "Org";
/// Label carrying the organization name when a project has no `Org` owner.
pub const ORG_LABEL: &str = "tenancy.edge-orchestrator.io/org";
/// Label on watcher records naming their project.
pub const PROJECT_LABEL: &str = "tenancy.edge-orchestrator.io/project";
pub const FINALIZER: &str = "tenant-controller.io/cleanup";
pub const FIELD_MANAGER: &str = "tenant-controller";

/// `TENANT_PROJECT_GVK` or the default Project GVK.
pub fn project_gvk_key() -> String {
    std::env::var("TENANT_PROJECT_GVK").ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| DEFAULT_PROJECT_GVK.to_string())
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

pub(crate) fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Drops `Applied` notifications that carry no spec change: metadata-only
/// writes (our own finalizer patches among them) leave `generation` alone.
#[derive(Default)]
pub(crate) struct GenerationFilter {
    seen: HashMap<String, (i64, bool)>,
}

impl GenerationFilter {
    fn key(obj: &DynamicObject) -> Option<(String, (i64, bool))> {
        let uid = obj.metadata.uid.clone()?;
        let generation = obj.metadata.generation?;
        Some((uid, (generation, obj.metadata.deletion_timestamp.is_some())))
    }

    /// True when `obj` should reach the listener. Objects without uid or generation always pass.
    pub(crate) fn admit(&mut self, obj: &DynamicObject) -> bool {
        let Some((uid, state)) = Self::key(obj) else { return true };
        self.seen.insert(uid, state) != Some(state)
    }

    /// A relist replaces everything known.
    pub(crate) fn reset<'a>(&mut self, objs: impl IntoIterator<Item = &'a DynamicObject>) {
        self.seen = objs.into_iter().filter_map(Self::key).collect();
    }

    pub(crate) fn forget(&mut self, obj: &DynamicObject) {
        if let Some(uid) = obj.metadata.uid.as_ref() {
            self.seen.remove(uid);
        }
    }
}

/// Resolved API resources shared by every [`KubeProject`].
pub(crate) struct HubContext {
    pub(crate) client: Client,
    pub(crate) project_ar: ApiResource,
    pub(crate) project_namespaced: bool,
    pub(crate) watcher_ar: ApiResource,
    pub(crate) org_ar: ApiResource,
}

/// Entry point: resolves the Project resource once and hands out project handles.
#[derive(Clone)]
pub struct KubeHub {
    ctx: Arc<HubContext>,
}

impl KubeHub {
    /// Discover the Project resource; the watcher and Org kinds live in the same group/version.
    pub async fn connect(client: Client, project_gvk: &str) -> Result<Self> {
        let gvk = parse_gvk_key(project_gvk)?;
        let (project_ar, project_namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let sibling = |kind: &str| ApiResource::from_gvk(&GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: kind.to_string() });
        let watcher_ar = sibling(WATCHER_KIND);
        let org_ar = sibling(ORG_KIND);
        info!(gvk = %project_gvk, namespaced = project_namespaced, "project resource resolved");
        Ok(Self { ctx: Arc::new(HubContext { client, project_ar, project_namespaced, watcher_ar, org_ar }) })
    }

    pub fn client(&self) -> Client { self.ctx.client.clone() }

    pub fn project(&self, obj: DynamicObject) -> KubeProject { KubeProject::new(obj, Arc::clone(&self.ctx)) }

    pub fn secrets(&self, namespace: &str) -> KubeSecretReader { KubeSecretReader::new(self.client(), namespace) }

    /// List+watch Projects and feed every object to `listener` until the stream ends.
    /// Deletions are finalizer-driven, so `Deleted` events are only logged.
    pub async fn watch_projects(&self, listener: Arc<dyn ProjectListener>) -> Result<()> {
        let api: Api<DynamicObject> = Api::all_with(self.ctx.client.clone(), &self.ctx.project_ar);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        let mut filter = GenerationFilter::default();
        info!(kind = %self.ctx.project_ar.kind, "project watch started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(watcher::Event::Applied(o)) => {
                    if !filter.admit(&o) {
                        counter!("project_notifications_total", 1u64, "kind" => "unchanged");
                        debug!(project = ?o.metadata.name, generation = ?o.metadata.generation, "metadata-only project update ignored");
                        continue;
                    }
                    counter!("project_notifications_total", 1u64, "kind" => "applied");
                    listener.on_update(Arc::new(self.project(o))).await;
                }
                Ok(watcher::Event::Deleted(o)) => {
                    counter!("project_notifications_total", 1u64, "kind" => "deleted");
                    filter.forget(&o);
                    debug!(project = ?o.metadata.name, "project object removed");
                }
                Ok(watcher::Event::Restarted(list)) => {
                    counter!("project_notifications_total", list.len() as u64, "kind" => "listed");
                    filter.reset(&list);
                    debug!(count = list.len(), "project watch (re)listed");
                    for o in list {
                        listener.on_add(Arc::new(self.project(o))).await;
                    }
                }
                Err(e) => warn!(error = %e, "project watch error; backing off"),
            }
        }
        warn!("project watch stream ended");
        Ok(())
    }
}
