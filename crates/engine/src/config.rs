use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Worker pool and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub workers: usize,
    /// Fixed pause between failed attempts of one event.
    pub initial_sleep_interval: Duration,
    /// Wall-clock budget per event, measured from its first attempt.
    pub max_wait_time: Duration,
    /// Bound on a single dispatch attempt.
    pub attempt_timeout: Duration,
    /// Manifest tag stamped on the watcher record after a successful create.
    pub manifest_tag: String,
    /// Name of this application's watcher record on each project.
    pub app_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            initial_sleep_interval: Duration::from_secs(10),
            max_wait_time: Duration::from_secs(600),
            attempt_timeout: Duration::from_secs(120),
            manifest_tag: String::new(),
            app_name: "tenant-controller".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        for (name, d) in [
            ("initial_sleep_interval", self.initial_sleep_interval),
            ("max_wait_time", self.max_wait_time),
            ("attempt_timeout", self.attempt_timeout),
        ] {
            if d.is_zero() {
                return Err(EngineError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.initial_sleep_interval > self.max_wait_time {
            return Err(EngineError::Config(format!(
                "initial_sleep_interval ({}s) exceeds max_wait_time ({}s)",
                self.initial_sleep_interval.as_secs_f64(),
                self.max_wait_time.as_secs_f64()
            )));
        }
        if self.app_name.trim().is_empty() {
            return Err(EngineError::Config("app_name must not be empty".into()));
        }
        Ok(())
    }
}
