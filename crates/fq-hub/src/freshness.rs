//! # Metadata Freshness
//!
//! `mark_dirty_and_wait` drops a table's cached schema and polls until
//! every leaf column reports a cardinality and an update time, or the
//! ceiling passes. Timing out is not an error: the caller proceeds with
//! whatever statistics exist.

use crate::cache::SchemaCache;
use crate::config::Settings;
use fq_store::Backend;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub table: String,
    pub converged: bool,
    pub waited_ms: u64,
    /// Columns still without statistics.
    pub pending: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn mark_dirty_and_wait(
    cache: &SchemaCache,
    backend: &dyn Backend,
    table: &str,
    settings: &Settings,
) -> FreshnessReport {
    let started = Instant::now();
    let report = |converged: bool, pending: Vec<String>, error: Option<String>| FreshnessReport {
        table: table.to_string(),
        converged,
        waited_ms: started.elapsed().as_millis() as u64,
        pending,
        error,
    };

    cache.invalidate(table).await;
    loop {
        let entry = match cache.resolve(backend, table).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Can not refresh {}: {}", table, e);
                return report(false, Vec::new(), Some(e.to_string()));
            }
        };
        let pending: Vec<String> = entry
            .columns
            .iter()
            .filter(|c| !c.relative && !c.is_fresh())
            .map(|c| c.name.clone())
            .collect();

        if pending.is_empty() {
            tracing::info!("Metadata of {} is fresh", table);
            return report(true, pending, None);
        }
        let elapsed = started.elapsed();
        if elapsed >= settings.freshness_timeout {
            tracing::warn!(
                "Gave up waiting for {} columns of {} after {:?}",
                pending.len(),
                table,
                elapsed
            );
            return report(false, pending, None);
        }

        tracing::info!(
            "wait for column (table={}, name={}) metadata to arrive",
            table,
            pending[0]
        );
        tokio::time::sleep(settings.poll_interval.min(settings.freshness_timeout - elapsed)).await;
        cache.invalidate(table).await;
    }
}
