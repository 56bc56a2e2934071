//! In-memory doubles for the project handle and the secret store.
//! Each instance owns its state; nothing here is process-global.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::{ProjectHandle, SecretReader, WatcherRecord};

/// Watcher-record operation observed by [`MemProject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherOp {
    Get(String),
    Put(String, WatcherRecord),
    Delete(String),
}

#[derive(Default)]
struct MemState {
    organization: String,
    watchers: BTreeMap<String, WatcherRecord>,
    ops: Vec<WatcherOp>,
}

/// Project handle backed by a map; cheap to clone, clones share state.
#[derive(Clone)]
pub struct MemProject {
    name: String,
    uid: String,
    deleted: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    state: Arc<Mutex<MemState>>,
}

impl MemProject {
    pub fn new(organization: &str, name: &str, uid: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: uid.to_string(),
            deleted: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(MemState { organization: organization.to_string(), ..MemState::default() })),
        }
    }

    pub fn handle(&self) -> Arc<dyn ProjectHandle> { Arc::new(self.clone()) }

    pub fn mark_deleted(&self) { self.deleted.store(true, Ordering::SeqCst); }

    /// Change what `organization()` reports from now on, e.g. after an org rename or removal.
    pub fn set_organization(&self, organization: &str) { self.lock().organization = organization.to_string(); }

    /// Make every watcher write fail (put and delete).
    pub fn fail_watcher_writes(&self, on: bool) { self.fail_writes.store(on, Ordering::SeqCst); }

    /// Seed a record without logging an operation.
    pub fn seed_watcher(&self, app: &str, record: WatcherRecord) {
        self.lock().watchers.insert(app.to_string(), record);
    }

    pub fn watcher(&self, app: &str) -> Option<WatcherRecord> { self.lock().watchers.get(app).cloned() }

    pub fn ops(&self) -> Vec<WatcherOp> { self.lock().ops.clone() }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        // a poisoned lock only means a test thread panicked; keep the data
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl ProjectHandle for MemProject {
    fn display_name(&self) -> String { self.name.clone() }
    fn uid(&self) -> String { self.uid.clone() }
    fn is_deleted(&self) -> bool { self.deleted.load(Ordering::SeqCst) }

    async fn organization(&self) -> Result<String> { Ok(self.lock().organization.clone()) }

    async fn get_active_watcher(&self, app: &str) -> Result<Option<WatcherRecord>> {
        let mut st = self.lock();
        st.ops.push(WatcherOp::Get(app.to_string()));
        Ok(st.watchers.get(app).cloned())
    }

    async fn put_active_watcher(&self, app: &str, record: &WatcherRecord) -> Result<()> {
        let mut st = self.lock();
        st.ops.push(WatcherOp::Put(app.to_string(), record.clone()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("watcher store unavailable"));
        }
        st.watchers.insert(app.to_string(), record.clone());
        Ok(())
    }

    async fn delete_active_watcher(&self, app: &str) -> Result<()> {
        let mut st = self.lock();
        st.ops.push(WatcherOp::Delete(app.to_string()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("watcher store unavailable"));
        }
        st.watchers.remove(app);
        Ok(())
    }
}

/// Secret store backed by a map of secret name to key/value bytes.
#[derive(Default, Clone)]
pub struct MemSecrets {
    secrets: Arc<Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>>,
}

impl MemSecrets {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, name: &str, key: &str, value: &[u8]) {
        let mut map = self.secrets.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(name.to_string()).or_default().insert(key.to_string(), value.to_vec());
    }
}

#[async_trait::async_trait]
impl SecretReader for MemSecrets {
    async fn read_secret(&self, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let map = self.secrets.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).cloned().ok_or_else(|| anyhow!("secret {} not found", name))
    }
}
