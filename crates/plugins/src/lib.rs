//! Provisioning plugins, registered in this order by the binary:
//! [`HarborPlugin`] → [`CatalogPlugin`] → [`ExtensionsPlugin`].
//!
//! Every step is idempotent (create-or-update, conflict-is-success,
//! missing-on-delete-is-success): the engine re-runs the whole chain after
//! any failure and never rolls back.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::future::Future;

use anyhow::{bail, Result};
use tenant_core::Backoff;
use tracing::{info, warn};

pub mod catalog;
pub mod extensions;
pub mod harbor;

pub use catalog::{CatalogPlugin, ReleaseService};
pub use extensions::ExtensionsPlugin;
pub use harbor::{harbor_project_name, HarborPlugin};

/// Run `probe` until it succeeds, sleeping `backoff.delay(n)` after the n-th
/// failure. Gives up once `backoff.max_attempts` tries have failed.
pub async fn wait_until_ready<F, Fut, T, E>(what: &str, backoff: Backoff, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match probe().await {
            Ok(v) => {
                if attempt > 1 {
                    info!(dependency = %what, attempts = attempt, "dependency ready");
                }
                return Ok(v);
            }
            Err(e) => {
                if backoff.exhausted(attempt) {
                    bail!("{} not ready after {} attempts: {}", what, attempt, e);
                }
                let delay = backoff.delay(attempt);
                warn!(dependency = %what, attempt, delay_ms = %delay.as_millis(), error = %e, "dependency not ready; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
