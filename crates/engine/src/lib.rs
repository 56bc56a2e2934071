//! Event reconciliation engine.
//!
//! Notifications reach a [`WatcherGuard`], which consults the project's
//! watcher record and decides whether to enqueue an event. A fixed pool of
//! workers drains the queue and runs each event through the
//! [`PluginRegistry`] under a wall-clock retry budget, reporting progress
//! and the final outcome back on the watcher record.

#![forbid(unsafe_code)]

pub mod config;
pub mod registry;
pub mod watcher;
pub mod worker;

pub use config::Config;
pub use registry::PluginRegistry;
pub use watcher::{Decision, WatcherGuard};
pub use worker::{Engine, EngineHandle, Outcome};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("event queue closed")]
    QueueClosed,
}
