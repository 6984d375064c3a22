use crate::db::PersistenceGateway;
use crate::metrics::{DB_FAILURES_TOTAL, PERSIST_LATENCY_SECONDS};
use crate::model::TelemetrySample;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Drains accepted samples into the persistence gateway, one call per
/// sample. Failures are logged and counted; they never reach the ingest
/// loop or the fan-out.
pub async fn run_persister(
    mut rx: mpsc::Receiver<TelemetrySample>,
    gateway: Arc<dyn PersistenceGateway>,
) {
    info!("Starting persistence worker");

    while let Some(sample) = rx.recv().await {
        let start = Instant::now();
        match gateway.upsert_device_and_sample(&sample).await {
            Ok(record) => {
                let elapsed = start.elapsed().as_secs_f64();
                PERSIST_LATENCY_SECONDS.observe(elapsed);
                debug!(
                    "Stored sample for {} ({}, last_seen {}) in {:.3}s",
                    record.id, record.status, record.last_seen, elapsed
                );
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!("Dropping sample for {}: {}", sample.device_id, e);
            }
        }
    }

    info!("Persistence channel closed, worker stopped");
}
