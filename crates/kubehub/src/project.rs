//! [`ProjectHandle`] over a `Project` object. Watcher records are
//! `ProjectActiveWatcher` objects named `<project>-<app>`, owned by the
//! project so they go away with it.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::DynamicObject,
};
use serde_json::{json, Value};
use tenant_core::{ProjectHandle, WatcherRecord, WatcherStatus};
use tracing::debug;

use crate::{HubContext, FIELD_MANAGER, FINALIZER, ORG_KIND, ORG_LABEL, PROJECT_LABEL};

pub struct KubeProject {
    obj: DynamicObject,
    ctx: Arc<HubContext>,
}

// ---- object accessors (pure) ----

fn name_of(obj: &DynamicObject) -> String { obj.metadata.name.clone().unwrap_or_default() }

fn display_name_of(obj: &DynamicObject) -> String {
    obj.data
        .pointer("/spec/displayName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| name_of(obj))
}

fn is_deleted_of(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some() || obj.data.pointer("/spec/deleted").and_then(Value::as_bool).unwrap_or(false)
}

fn org_owner_of(obj: &DynamicObject) -> Option<String> {
    obj.metadata.owner_references.as_ref()?.iter().find(|o| o.kind == ORG_KIND).map(|o| o.name.clone())
}

fn org_label_of(obj: &DynamicObject) -> Option<String> {
    obj.metadata.labels.as_ref()?.get(ORG_LABEL).filter(|s| !s.is_empty()).cloned()
}

pub(crate) fn watcher_name(project: &str, app: &str) -> String { format!("{}-{}", project, app) }

/// Server-side apply body for a watcher record owned by `project`.
pub(crate) fn watcher_body(project: &DynamicObject, api_version: &str, app: &str, record: &WatcherRecord) -> Value {
    let project_name = name_of(project);
    let project_api_version = project.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_else(|| api_version.to_string());
    let project_kind = project.types.as_ref().map(|t| t.kind.clone()).unwrap_or_else(|| "Project".to_string());
    json!({
        "apiVersion": api_version,
        "kind": crate::WATCHER_KIND,
        "metadata": {
            "name": watcher_name(&project_name, app),
            "labels": { PROJECT_LABEL: project_name },
            "annotations": record.annotations,
            "ownerReferences": [{
                "apiVersion": project_api_version,
                "kind": project_kind,
                "name": project_name,
                "uid": project.metadata.uid.clone().unwrap_or_default(),
                "blockOwnerDeletion": true,
            }],
        },
        "spec": {
            "statusIndicator": record.status.as_str(),
            "message": record.message,
            "timeStamp": record.timestamp,
        },
    })
}

pub(crate) fn record_from(obj: &DynamicObject) -> Result<WatcherRecord> {
    let spec = obj.data.get("spec").ok_or_else(|| anyhow!("watcher {} has no spec", name_of(obj)))?;
    let raw_status = spec.get("statusIndicator").and_then(Value::as_str).unwrap_or_default();
    let status = WatcherStatus::parse(raw_status).ok_or_else(|| anyhow!("watcher {} has unknown status {:?}", name_of(obj), raw_status))?;
    Ok(WatcherRecord {
        status,
        message: spec.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
        timestamp: spec.get("timeStamp").and_then(Value::as_u64).unwrap_or(0),
        annotations: obj.metadata.annotations.clone().unwrap_or_default(),
    })
}

fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(r) if r.code == 404) }

impl KubeProject {
    pub(crate) fn new(obj: DynamicObject, ctx: Arc<HubContext>) -> Self { Self { obj, ctx } }

    fn projects(&self) -> Api<DynamicObject> {
        match (self.ctx.project_namespaced, self.obj.metadata.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.ctx.client.clone(), ns, &self.ctx.project_ar),
            _ => Api::all_with(self.ctx.client.clone(), &self.ctx.project_ar),
        }
    }

    fn watchers(&self) -> Api<DynamicObject> { Api::all_with(self.ctx.client.clone(), &self.ctx.watcher_ar) }

    /// Add or remove the cleanup finalizer on the live project.
    async fn set_finalizer(&self, present: bool) -> Result<()> {
        let api = self.projects();
        let name = name_of(&self.obj);
        let Some(live) = api.get_opt(&name).await? else { return Ok(()) };
        let mut finalizers = live.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) == present {
            return Ok(());
        }
        if present {
            // finalizers cannot be added once deletion started
            if live.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            finalizers.push(FINALIZER.to_string());
        } else {
            finalizers.retain(|f| f != FINALIZER);
        }
        let patch = json!({ "metadata": { "finalizers": finalizers, "resourceVersion": live.metadata.resource_version } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await.with_context(|| format!("updating finalizers on {}", name))?;
        debug!(project = %name, present, "cleanup finalizer updated");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectHandle for KubeProject {
    fn display_name(&self) -> String { display_name_of(&self.obj) }
    fn uid(&self) -> String { self.obj.metadata.uid.clone().unwrap_or_default() }
    fn is_deleted(&self) -> bool { is_deleted_of(&self.obj) }

    async fn organization(&self) -> Result<String> {
        if let Some(org) = org_owner_of(&self.obj) {
            let orgs: Api<DynamicObject> = Api::all_with(self.ctx.client.clone(), &self.ctx.org_ar);
            return match orgs.get_opt(&org).await.with_context(|| format!("reading org {}", org))? {
                Some(o) => Ok(display_name_of(&o)),
                None => Ok(org),
            };
        }
        org_label_of(&self.obj).ok_or_else(|| anyhow!("project {} has neither an {} owner nor an {} label", name_of(&self.obj), ORG_KIND, ORG_LABEL))
    }

    async fn get_active_watcher(&self, app: &str) -> Result<Option<WatcherRecord>> {
        let name = watcher_name(&name_of(&self.obj), app);
        match self.watchers().get_opt(&name).await.with_context(|| format!("reading watcher {}", name))? {
            Some(o) => Ok(Some(record_from(&o)?)),
            None => Ok(None),
        }
    }

    async fn put_active_watcher(&self, app: &str, record: &WatcherRecord) -> Result<()> {
        let name = watcher_name(&name_of(&self.obj), app);
        let body = watcher_body(&self.obj, &self.ctx.watcher_ar.api_version, app, record);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.watchers().patch(&name, &pp, &Patch::Apply(&body)).await.with_context(|| format!("applying watcher {}", name))?;
        self.set_finalizer(true).await
    }

    async fn delete_active_watcher(&self, app: &str) -> Result<()> {
        let name = watcher_name(&name_of(&self.obj), app);
        match self.watchers().delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!(watcher = %name, "watcher deleted"),
            Err(e) if is_not_found(&e) => debug!(watcher = %name, "watcher already gone"),
            Err(e) => return Err(e).with_context(|| format!("deleting watcher {}", name)),
        }
        self.set_finalizer(false).await
    }
}
