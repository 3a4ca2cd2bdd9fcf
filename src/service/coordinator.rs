//! Batch status coordinator.
//!
//! Invoked once per terminal scan transition, possibly concurrently from
//! many workers. Correctness comes from the data layer: the idempotency
//! guard on terminal batches, counters recomputed from a fresh snapshot of
//! the scan set, and a conditional terminal UPDATE in the batch store.

use sqlx::SqlitePool;

use crate::domain::models::{BatchStatus, BatchStatusResult, ScanStatus};
use crate::error::{AppError, Result};
use crate::repository::sqlite::{BatchRepository, ScanRepository};
use crate::service::aggregate::compute_aggregate;

pub struct BatchCoordinator {
    scan_db: ScanRepository,
    batch_db: BatchRepository,
}

impl BatchCoordinator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            scan_db: ScanRepository::new(pool.clone()),
            batch_db: BatchRepository::new(pool),
        }
    }

    /// Re-evaluate a batch after one of its scans reached a terminal state.
    ///
    /// Returns `None` when there is nothing to do: the scan is standalone,
    /// or the batch has already settled (redelivered or racing
    /// notifications). Otherwise returns the batch's updated state, with
    /// aggregate statistics on the settling call.
    pub async fn notify_scan_complete(
        &self,
        scan_id: &str,
        terminal_status: ScanStatus,
    ) -> Result<Option<BatchStatusResult>> {
        if scan_id.trim().is_empty() {
            return Err(AppError::invalid("scan id is required"));
        }
        if !terminal_status.is_terminal() {
            return Err(AppError::invalid(format!(
                "terminal status must be completed or failed, got {}",
                terminal_status
            )));
        }

        let scan = self
            .scan_db
            .find_by_id(scan_id)
            .await?
            .ok_or_else(|| AppError::ScanNotFound(scan_id.to_string()))?;

        let Some(batch_id) = scan.batch_id.as_deref() else {
            log::debug!("Scan {} is standalone, nothing to coordinate", scan_id);
            return Ok(None);
        };

        let batch = self.batch_db.find_by_id(batch_id).await?.ok_or_else(|| {
            // A scan pointing at a missing batch is a data-integrity bug.
            log::error!("Scan {} references missing batch {}", scan_id, batch_id);
            AppError::BatchNotFound(batch_id.to_string())
        })?;

        // Idempotency guard: notifications may race or be redelivered after
        // settlement. A terminal batch is never re-opened or re-mutated.
        if batch.status.is_terminal() {
            log::debug!(
                "Batch {} already {} - ignoring notification for scan {}",
                batch.id,
                batch.status,
                scan_id
            );
            return Ok(None);
        }

        // Fresh snapshot; stored counters are never trusted, so concurrent
        // settlements cannot compound drift.
        let scans = self.scan_db.find_by_batch(batch_id).await?;
        let completed_count = scans
            .iter()
            .filter(|s| s.status == ScanStatus::Completed)
            .count() as i64;
        let failed_count = scans
            .iter()
            .filter(|s| s.status == ScanStatus::Failed)
            .count() as i64;

        if completed_count + failed_count < batch.total_urls {
            self.batch_db
                .update_counts(batch_id, completed_count, failed_count)
                .await?;

            log::debug!(
                "Batch {} progress: {}/{} settled ({} failed)",
                batch.id,
                completed_count + failed_count,
                batch.total_urls,
                failed_count
            );
            return Ok(Some(BatchStatusResult {
                batch_id: batch.id,
                is_complete: false,
                status: BatchStatus::Running,
                completed_count,
                failed_count,
                aggregate: None,
            }));
        }

        // Settled. Any failure marks the whole batch failed; partial success
        // is not success.
        let final_status = if failed_count > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        let aggregate = compute_aggregate(&scans);

        let won = self
            .batch_db
            .finalize(
                batch_id,
                final_status,
                completed_count,
                failed_count,
                &aggregate,
            )
            .await?;
        if !won {
            // A concurrent notification settled the batch first. Both sides
            // computed identical values from the same terminal scan set.
            log::debug!("Batch {} was finalized by a concurrent writer", batch.id);
        }

        log::info!(
            "Batch {} settled as {} ({} completed, {} failed, {} issues)",
            batch.id,
            final_status,
            completed_count,
            failed_count,
            aggregate.total_issues
        );

        Ok(Some(BatchStatusResult {
            batch_id: batch.id,
            is_complete: true,
            status: final_status,
            completed_count,
            failed_count,
            aggregate: Some(aggregate),
        }))
    }
}
