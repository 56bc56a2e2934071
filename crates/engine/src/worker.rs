//! Event queue, worker pool and the bounded retry loop.

use std::sync::Arc;

use anyhow::anyhow;
use metrics::{counter, histogram};
use tenant_core::{Backoff, Event, EventKind, ProjectHandle, WatcherRecord, MANIFEST_TAG_ANNOTATION, ORGANIZATION_ANNOTATION};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{Config, EngineError, PluginRegistry};

/// Final result of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { attempts: u32 },
    /// Budget exhausted; `error` is the last attempt's error.
    Failed { attempts: u32, error: String },
}

/// Non-blocking producer side of the event queue.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    pub fn create_project(&self, organization: &str, project: &str, project_uuid: &str, handle: Arc<dyn ProjectHandle>) -> Result<(), EngineError> {
        self.enqueue(Event::new(EventKind::Create, organization, project, project_uuid, handle))
    }

    pub fn delete_project(&self, organization: &str, project: &str, project_uuid: &str, handle: Arc<dyn ProjectHandle>) -> Result<(), EngineError> {
        self.enqueue(Event::new(EventKind::Delete, organization, project, project_uuid, handle))
    }

    fn enqueue(&self, event: Event) -> Result<(), EngineError> {
        let kind = event.kind;
        let project = event.project_uuid.clone();
        self.tx.send(event).map_err(|_| EngineError::QueueClosed)?;
        counter!("events_enqueued_total", 1u64, "kind" => kind.as_str());
        debug!(kind = %kind, project = %project, "event enqueued");
        Ok(())
    }
}

pub struct Engine {
    config: Config,
    registry: Arc<PluginRegistry>,
    tx: mpsc::UnboundedSender<Event>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl Engine {
    /// Refuses an invalid [`Config`], so nothing is ever processed under one.
    pub fn new(config: Config, registry: PluginRegistry) -> Result<Self, EngineError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self { config, registry: Arc::new(registry), tx, rx: Arc::new(Mutex::new(rx)) })
    }

    pub fn config(&self) -> &Config { &self.config }

    /// Initialize every plugin; any failure must abort startup.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!(plugins = ?self.registry.names(), "initializing plugins");
        self.registry.initialize().await
    }

    pub fn handle(&self) -> EngineHandle { EngineHandle { tx: self.tx.clone() } }

    /// Spawn the worker pool. Workers exit once the engine and every handle are dropped.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|id| {
                let rx = Arc::clone(&self.rx);
                let registry = Arc::clone(&self.registry);
                let config = self.config.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "worker started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(event) = next else { break };
                        process(&registry, &config, event).await;
                    }
                    debug!(worker = id, "event queue closed; worker exiting");
                })
            })
            .collect()
    }

    /// Run one event to completion on the caller's task.
    pub async fn process(&self, event: Event) -> Outcome { process(&self.registry, &self.config, event).await }
}

async fn process(registry: &PluginRegistry, config: &Config, event: Event) -> Outcome {
    let started = Instant::now();
    let pause = Backoff::fixed(config.initial_sleep_interval);
    let mut attempt: u32 = 0;
    info!(kind = %event.kind, org = %event.organization, project = %event.project, uuid = %event.project_uuid, "processing event");
    loop {
        attempt += 1;
        counter!("event_attempts_total", 1u64, "kind" => event.kind.as_str());
        // an attempt never runs past the event's budget
        let limit = config.attempt_timeout.min(config.max_wait_time.saturating_sub(started.elapsed()));
        let res = match tokio::time::timeout(limit, registry.dispatch(&event)).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("attempt timed out after {}s", limit.as_secs_f64())),
        };
        let err = match res {
            Ok(()) => {
                finish_success(config, &event).await;
                counter!("events_succeeded_total", 1u64, "kind" => event.kind.as_str());
                histogram!("event_processing_ms", started.elapsed().as_secs_f64() * 1000.0);
                info!(kind = %event.kind, uuid = %event.project_uuid, attempts = attempt, took_ms = %started.elapsed().as_millis(), "event processed");
                return Outcome::Succeeded { attempts: attempt };
            }
            Err(e) => format!("{:#}", e),
        };
        let delay = pause.delay(attempt);
        if started.elapsed() + delay > config.max_wait_time {
            error!(kind = %event.kind, uuid = %event.project_uuid, attempts = attempt, error = %err, "giving up on event");
            put_watcher(config, &event, &WatcherRecord::error(err.clone())).await;
            counter!("events_failed_total", 1u64, "kind" => event.kind.as_str());
            histogram!("event_processing_ms", started.elapsed().as_secs_f64() * 1000.0);
            return Outcome::Failed { attempts: attempt, error: err };
        }
        warn!(kind = %event.kind, uuid = %event.project_uuid, attempt, retry_in_ms = %delay.as_millis(), error = %err, "event attempt failed");
        put_watcher(config, &event, &WatcherRecord::in_progress(err)).await;
        tokio::time::sleep(delay).await;
    }
}

async fn finish_success(config: &Config, event: &Event) {
    match event.kind {
        EventKind::Create => {
            let mut rec = WatcherRecord::idle("Created");
            if !config.manifest_tag.is_empty() {
                rec = rec.with_annotation(MANIFEST_TAG_ANNOTATION, config.manifest_tag.clone());
            }
            put_watcher(config, event, &rec).await;
        }
        EventKind::Delete => {
            if let Err(e) = event.handle.delete_active_watcher(&config.app_name).await {
                counter!("watcher_update_errors_total", 1u64);
                warn!(uuid = %event.project_uuid, error = %format!("{:#}", e), "failed to remove watcher record");
            }
        }
    }
}

/// Best-effort status update; failures are logged and never replace the event's own result.
/// Every write carries the event's organization so later deletes can find it.
async fn put_watcher(config: &Config, event: &Event, record: &WatcherRecord) {
    let record = record.clone().with_annotation(ORGANIZATION_ANNOTATION, event.organization.clone());
    if let Err(e) = event.handle.put_active_watcher(&config.app_name, &record).await {
        counter!("watcher_update_errors_total", 1u64);
        warn!(uuid = %event.project_uuid, status = %record.status.as_str(), error = %format!("{:#}", e), "failed to update watcher record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::{bail, Result};
    use tenant_core::mem::MemProject;
    use tenant_core::{Plugin, PluginData, WatcherStatus};

    /// Fails the first `failures` create attempts.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Plugin for Flaky {
        fn name(&self) -> &str { "flaky" }
        async fn initialize(&self) -> Result<()> { Ok(()) }
        async fn create_event(&self, _e: &Event, _d: &mut PluginData) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures { bail!("backend unavailable (attempt {})", n) }
            Ok(())
        }
        async fn delete_event(&self, _e: &Event, _d: &mut PluginData) -> Result<()> { Ok(()) }
    }

    fn config(sleep: u64, budget: u64) -> Config {
        Config {
            workers: 1,
            initial_sleep_interval: Duration::from_secs(sleep),
            max_wait_time: Duration::from_secs(budget),
            attempt_timeout: Duration::from_secs(30),
            manifest_tag: "v1.3.5".into(),
            app_name: "tenant-controller".into(),
        }
    }

    fn engine(cfg: Config, failures: u32) -> Engine {
        let mut r = PluginRegistry::new();
        r.register(Arc::new(Flaky { failures, calls: AtomicU32::new(0) }));
        Engine::new(cfg, r).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let err = Engine::new(config(10, 5), PluginRegistry::new()).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_marks_idle_with_tag() {
        let e = engine(config(1, 60), 2);
        let p = MemProject::new("acme", "p1", "uuid-1");
        let out = e.process(Event::new(EventKind::Create, "acme", "p1", "uuid-1", p.handle())).await;
        assert_eq!(out, Outcome::Succeeded { attempts: 3 });
        let rec = p.watcher("tenant-controller").unwrap();
        assert_eq!(rec.status, WatcherStatus::Idle);
        assert_eq!(rec.message, "Created");
        assert_eq!(rec.manifest_tag(), Some("v1.3.5"));
        assert_eq!(rec.organization(), Some("acme"));
        // one progress update per failed attempt, then the final one
        let puts = p.ops().iter().filter(|o| matches!(o, tenant_core::mem::WatcherOp::Put(..))).count();
        assert_eq!(puts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_update_carries_last_error() {
        let e = engine(config(1, 60), 1);
        let p = MemProject::new("acme", "p1", "uuid-1");
        e.process(Event::new(EventKind::Create, "acme", "p1", "uuid-1", p.handle())).await;
        let first_put = p.ops().into_iter().find_map(|o| match o {
            tenant_core::mem::WatcherOp::Put(_, rec) => Some(rec),
            _ => None,
        });
        let rec = first_put.unwrap();
        assert_eq!(rec.status, WatcherStatus::InProgress);
        assert!(rec.message.contains("backend unavailable (attempt 1)"), "msg={}", rec.message);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_write_failures_do_not_change_outcome() {
        let e = engine(config(1, 60), 1);
        let p = MemProject::new("acme", "p1", "uuid-1");
        p.fail_watcher_writes(true);
        let out = e.process(Event::new(EventKind::Create, "acme", "p1", "uuid-1", p.handle())).await;
        assert_eq!(out, Outcome::Succeeded { attempts: 2 });
    }

    struct Hang;

    #[async_trait::async_trait]
    impl Plugin for Hang {
        fn name(&self) -> &str { "hang" }
        async fn initialize(&self) -> Result<()> { Ok(()) }
        async fn create_event(&self, _e: &Event, _d: &mut PluginData) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn delete_event(&self, _e: &Event, _d: &mut PluginData) -> Result<()> { Ok(()) }
    }

    fn hanging_engine(cfg: Config) -> Engine {
        let mut r = PluginRegistry::new();
        r.register(Arc::new(Hang));
        Engine::new(cfg, r).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_is_cut_by_timeout() {
        let e = hanging_engine(Config { attempt_timeout: Duration::from_secs(2), ..config(1, 5) });
        let p = MemProject::new("acme", "p1", "uuid-1");
        let out = e.process(Event::new(EventKind::Create, "acme", "p1", "uuid-1", p.handle())).await;
        match out {
            Outcome::Failed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert!(error.contains("timed out"), "error={}", error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_stays_within_the_budget() {
        // attempt timeout far above the 5s budget
        let e = hanging_engine(config(1, 5));
        let p = MemProject::new("acme", "p1", "uuid-1");

        let t0 = Instant::now();
        let out = e.process(Event::new(EventKind::Create, "acme", "p1", "uuid-1", p.handle())).await;
        let took = t0.elapsed();

        // timer granularity may add a millisecond
        assert!(took < Duration::from_millis(5100), "took={:?}", took);
        assert!(matches!(out, Outcome::Failed { attempts: 1, ref error } if error.contains("timed out after 5s")), "out={:?}", out);
        assert_eq!(p.watcher("tenant-controller").unwrap().status, WatcherStatus::Error);
    }
}
