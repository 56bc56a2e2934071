//! Per-project watcher record state machine.
//!
//! ```text
//! Absent ──create──▶ InProgress ──▶ Idle | Error
//! Idle (other tag) / Error ──create──▶ InProgress
//! any ──delete done──▶ Absent
//! ```
//!
//! The record is the only memory across restarts. It also remembers the
//! organization name a project was provisioned under, so a delete addresses
//! the same backend resources even after the organization is gone. Reads and
//! writes are best-effort: a failed bookkeeping write is logged and the event
//! is still enqueued.

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use tenant_core::{ProjectHandle, ProjectListener, WatcherRecord, WatcherStatus, ORGANIZATION_ANNOTATION};
use tracing::{debug, info, warn};

use crate::{Config, EngineHandle};

/// What the guard did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Already provisioned at the current manifest tag, or deleted and never watched.
    Skip,
    /// First sight of the project.
    Create,
    /// Provisioned at another manifest tag; re-run to converge extensions.
    Upgrade,
    /// Previous attempt still in progress or failed.
    Retry,
    Delete,
}

pub struct WatcherGuard {
    engine: EngineHandle,
    app_name: String,
    manifest_tag: String,
}

impl WatcherGuard {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        Self { engine, app_name: config.app_name.clone(), manifest_tag: config.manifest_tag.clone() }
    }

    /// Decide on one notification and enqueue accordingly.
    pub async fn observe(&self, project: Arc<dyn ProjectHandle>) -> Result<Decision> {
        let name = project.display_name();
        let uid = project.uid();
        let record = match project.get_active_watcher(&self.app_name).await {
            Ok(r) => Some(r),
            Err(e) => {
                counter!("watcher_update_errors_total", 1u64);
                warn!(project = %name, uuid = %uid, error = %format!("{:#}", e), "failed to read watcher record");
                None
            }
        };

        if project.is_deleted() {
            // never watched: nothing was provisioned by us
            if matches!(record, Some(None)) {
                debug!(project = %name, uuid = %uid, "deleted project without watcher record");
                return Ok(Decision::Skip);
            }
            let provisioned_as = record.as_ref().and_then(|r| r.as_ref()).and_then(|r| r.organization().map(str::to_string));
            let org = match provisioned_as {
                Some(org) => org,
                None => project.organization().await.with_context(|| format!("organization of project {}", name))?,
            };
            self.update(&project, WatcherRecord::in_progress("Deleting"), &org).await;
            self.engine.delete_project(&org, &name, &uid, project.clone())?;
            info!(org = %org, project = %name, uuid = %uid, "project deletion enqueued");
            return Ok(Decision::Delete);
        }

        let (decision, update) = match record.flatten() {
            None => (Decision::Create, Some(WatcherRecord::in_progress("Creating"))),
            Some(r) => match r.status {
                WatcherStatus::Idle if r.manifest_tag().unwrap_or("") == self.manifest_tag => {
                    debug!(project = %name, uuid = %uid, tag = %self.manifest_tag, "already provisioned");
                    return Ok(Decision::Skip);
                }
                WatcherStatus::Idle => {
                    info!(project = %name, uuid = %uid, from = ?r.manifest_tag(), to = %self.manifest_tag, "manifest tag changed");
                    (Decision::Upgrade, Some(WatcherRecord::in_progress(format!("Upgrading to {}", self.manifest_tag))))
                }
                WatcherStatus::InProgress => (Decision::Retry, None),
                WatcherStatus::Error => (Decision::Retry, Some(WatcherRecord::in_progress("Retrying"))),
            },
        };
        let org = project.organization().await.with_context(|| format!("organization of project {}", name))?;
        if let Some(rec) = update {
            self.update(&project, rec, &org).await;
        }
        self.engine.create_project(&org, &name, &uid, project.clone())?;
        info!(org = %org, project = %name, uuid = %uid, decision = ?decision, "project creation enqueued");
        Ok(decision)
    }

    async fn update(&self, project: &Arc<dyn ProjectHandle>, record: WatcherRecord, organization: &str) {
        let record = record.with_annotation(ORGANIZATION_ANNOTATION, organization);
        if let Err(e) = project.put_active_watcher(&self.app_name, &record).await {
            counter!("watcher_update_errors_total", 1u64);
            warn!(uuid = %project.uid(), error = %format!("{:#}", e), "failed to update watcher record");
        }
    }

    async fn observe_logged(&self, project: Arc<dyn ProjectHandle>) {
        let uid = project.uid();
        if let Err(e) = self.observe(project).await {
            warn!(uuid = %uid, error = %format!("{:#}", e), "project notification dropped");
        }
    }
}

#[async_trait::async_trait]
impl ProjectListener for WatcherGuard {
    async fn on_add(&self, project: Arc<dyn ProjectHandle>) { self.observe_logged(project).await }
    async fn on_update(&self, project: Arc<dyn ProjectHandle>) { self.observe_logged(project).await }
}
