//! Tenant controller core types: events, watcher records and the contracts
//! shared by the engine, the plugins and the Kubernetes integration.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod mem;

pub use backoff::Backoff;

/// Annotation on the watcher record holding the manifest tag the project was last reconciled with.
pub const MANIFEST_TAG_ANNOTATION: &str = "tenant-controller.io/manifest-tag";
/// Annotation on the watcher record holding the organization name the project was provisioned under.
pub const ORGANIZATION_ANNOTATION: &str = "tenant-controller.io/organization";

/// PluginData key: robot account name published by the Harbor plugin.
pub const HARBOR_USERNAME: &str = "harborUsername";
/// PluginData key: robot account secret published by the Harbor plugin.
pub const HARBOR_TOKEN: &str = "harborToken";

/// Per-event scratch values handed from one plugin to the next.
pub type PluginData = HashMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One observed project lifecycle transition.
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub organization: String,
    pub project: String,
    pub project_uuid: String,
    /// Handle to the external project object (watcher record lives there).
    pub handle: Arc<dyn ProjectHandle>,
}

impl Event {
    pub fn new(kind: EventKind, organization: impl Into<String>, project: impl Into<String>, project_uuid: impl Into<String>, handle: Arc<dyn ProjectHandle>) -> Self {
        Self { kind, organization: organization.into(), project: project.into(), project_uuid: project_uuid.into(), handle }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("organization", &self.organization)
            .field("project", &self.project)
            .field("project_uuid", &self.project_uuid)
            .finish_non_exhaustive()
    }
}

// ---- watcher record ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatcherStatus {
    #[serde(rename = "STATUS_INDICATION_IN_PROGRESS")]
    InProgress,
    #[serde(rename = "STATUS_INDICATION_IDLE")]
    Idle,
    #[serde(rename = "STATUS_INDICATION_ERROR")]
    Error,
}

impl WatcherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherStatus::InProgress => "STATUS_INDICATION_IN_PROGRESS",
            WatcherStatus::Idle => "STATUS_INDICATION_IDLE",
            WatcherStatus::Error => "STATUS_INDICATION_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STATUS_INDICATION_IN_PROGRESS" => Some(WatcherStatus::InProgress),
            "STATUS_INDICATION_IDLE" => Some(WatcherStatus::Idle),
            "STATUS_INDICATION_ERROR" => Some(WatcherStatus::Error),
            _ => None,
        }
    }
}

/// Durable per-project status this application keeps on the external record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherRecord {
    #[serde(rename = "statusIndicator")]
    pub status: WatcherStatus,
    pub message: String,
    /// Seconds since epoch, never negative.
    #[serde(rename = "timeStamp")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl WatcherRecord {
    pub fn new(status: WatcherStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), timestamp: now_ts(), annotations: BTreeMap::new() }
    }

    pub fn in_progress(message: impl Into<String>) -> Self { Self::new(WatcherStatus::InProgress, message) }
    pub fn idle(message: impl Into<String>) -> Self { Self::new(WatcherStatus::Idle, message) }
    pub fn error(message: impl Into<String>) -> Self { Self::new(WatcherStatus::Error, message) }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn manifest_tag(&self) -> Option<&str> {
        self.annotations.get(MANIFEST_TAG_ANNOTATION).map(|s| s.as_str())
    }

    pub fn organization(&self) -> Option<&str> {
        self.annotations.get(ORGANIZATION_ANNOTATION).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}

/// Seconds since epoch, clamped to 0 when the clock reads before the epoch.
pub fn now_ts() -> u64 { clamp_ts(chrono::Utc::now().timestamp()) }

pub fn clamp_ts(secs: i64) -> u64 { u64::try_from(secs).unwrap_or(0) }

// ---- contracts ----

/// One backend-specific provisioning step in the dispatch chain.
///
/// Every method must be idempotent: the engine re-runs the whole chain after
/// any failure and never rolls back earlier plugins.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Startup hook; an error aborts process startup.
    async fn initialize(&self) -> Result<()>;

    async fn create_event(&self, event: &Event, data: &mut PluginData) -> Result<()>;

    async fn delete_event(&self, event: &Event, data: &mut PluginData) -> Result<()>;
}

/// Narrow view over the external project object delivered by the notification source.
#[async_trait::async_trait]
pub trait ProjectHandle: Send + Sync {
    fn display_name(&self) -> String;
    fn uid(&self) -> String;
    fn is_deleted(&self) -> bool;

    /// Parent lookup: display name of the owning organization.
    async fn organization(&self) -> Result<String>;

    async fn get_active_watcher(&self, app: &str) -> Result<Option<WatcherRecord>>;

    /// Create or replace the watcher record for `app`.
    async fn put_active_watcher(&self, app: &str, record: &WatcherRecord) -> Result<()>;

    /// Remove the watcher record for `app`; a missing record is not an error.
    async fn delete_active_watcher(&self, app: &str) -> Result<()>;
}

/// Callbacks registered with the project notification source.
#[async_trait::async_trait]
pub trait ProjectListener: Send + Sync {
    async fn on_add(&self, project: Arc<dyn ProjectHandle>);
    async fn on_update(&self, project: Arc<dyn ProjectHandle>);
}

/// Cluster secret store access.
#[async_trait::async_trait]
pub trait SecretReader: Send + Sync {
    async fn read_secret(&self, name: &str) -> Result<BTreeMap<String, Vec<u8>>>;
}

pub mod prelude {
    pub use super::{
        Event, EventKind, Plugin, PluginData, ProjectHandle, ProjectListener, SecretReader, WatcherRecord, WatcherStatus,
    };
}
