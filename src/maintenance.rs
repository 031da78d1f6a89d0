//! Expired-record cleanup, meant to be driven by an external scheduler.

use std::time::Instant;
use tracing::{error, info};

use crate::backend::{Backend, BackendRegistry};
use crate::error::Result;

/// Removes expired records from `backend` and returns how many were removed.
///
/// Safe to run while decisions are in flight: a record removed just before a
/// fresh increment simply makes that increment start a new record.
pub fn purge_expired(backend: &dyn Backend) -> Result<u64> {
    let started = Instant::now();
    match backend.purge_expired() {
        Ok(removed) => {
            info!(
                backend = %backend.kind(),
                removed = removed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Purged expired rate limit records"
            );
            Ok(removed)
        }
        Err(err) => {
            error!(backend = %backend.kind(), error = %err, "Purge failed");
            Err(err)
        }
    }
}

/// Purges every registered backend, stopping at the first failure.
pub fn purge_all(registry: &BackendRegistry) -> Result<u64> {
    let mut total = 0;
    for name in registry.names() {
        total += purge_expired(registry.get(&name)?.as_ref())?;
    }
    Ok(total)
}
