//! Batch record store.
//!
//! The batch row carries the running counters and, once settled, the
//! aggregate statistics. The terminal write is conditional on the batch
//! still being in the running state, so an absorbing state is never
//! overwritten even if two workers race on settlement.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{map_batch_status, parse_datetime};
use crate::domain::models::{AggregateStats, Batch, BatchStatus};

#[derive(Clone)]
pub struct BatchRepository {
    pool: SqlitePool,
}

impl BatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a running batch with one pending scan per URL, in a single
    /// transaction. Returns the batch ID and the scan IDs in URL order.
    pub async fn create_with_scans(
        &self,
        root_url: &str,
        urls: &[String],
    ) -> Result<(String, Vec<String>)> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batches (id, root_url, status, total_urls, created_at) \
             VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(&batch_id)
        .bind(root_url)
        .bind(urls.len() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("Failed to create batch")?;

        let mut scan_ids = Vec::with_capacity(urls.len());
        for url in urls {
            let scan_id = uuid::Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO scans (id, batch_id, url, status, created_at) \
                 VALUES (?, ?, ?, 'pending', ?)",
            )
            .bind(&scan_id)
            .bind(&batch_id)
            .bind(url)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to create batch scan")?;
            scan_ids.push(scan_id);
        }

        tx.commit().await.context("Failed to commit batch")?;

        log::info!(
            "Created batch {} with {} scans for {}",
            batch_id,
            urls.len(),
            root_url
        );
        Ok((batch_id, scan_ids))
    }

    /// Get a batch by ID, or None if it does not exist.
    pub async fn find_by_id(&self, batch_id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query(
            "SELECT id, root_url, status, total_urls, completed_count, failed_count, \
                    total_issues, critical_count, serious_count, moderate_count, \
                    minor_count, passed_checks, urls_scanned, created_at, completed_at \
             FROM batches WHERE id = ?",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch batch")?;

        Ok(row.as_ref().map(row_to_batch))
    }

    /// Batches still in the running state (for the reconciliation sweep).
    pub async fn find_running(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query(
            "SELECT id, root_url, status, total_urls, completed_count, failed_count, \
                    total_issues, critical_count, serious_count, moderate_count, \
                    minor_count, passed_checks, urls_scanned, created_at, completed_at \
             FROM batches WHERE status = 'running' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch running batches")?;

        Ok(rows.iter().map(row_to_batch).collect())
    }

    /// Write freshly recomputed counters onto a still-running batch.
    /// Guarded on the running state like `finalize`, so a counts write that
    /// lost a race with cancellation cannot touch a terminal batch.
    pub async fn update_counts(
        &self,
        batch_id: &str,
        completed_count: i64,
        failed_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET completed_count = ?, failed_count = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(completed_count)
        .bind(failed_count)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .context("Failed to update batch counts")?;
        Ok(())
    }

    /// Terminal transition: status, counters, aggregate statistics and the
    /// completion timestamp written in one UPDATE, guarded on the batch
    /// still being running. Returns false if another writer got there first.
    pub async fn finalize(
        &self,
        batch_id: &str,
        status: BatchStatus,
        completed_count: i64,
        failed_count: i64,
        aggregate: &AggregateStats,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batches \
             SET status = ?, completed_count = ?, failed_count = ?, \
                 total_issues = ?, critical_count = ?, serious_count = ?, \
                 moderate_count = ?, minor_count = ?, passed_checks = ?, \
                 urls_scanned = ?, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(completed_count)
        .bind(failed_count)
        .bind(aggregate.total_issues)
        .bind(aggregate.critical_count)
        .bind(aggregate.serious_count)
        .bind(aggregate.moderate_count)
        .bind(aggregate.minor_count)
        .bind(aggregate.passed_checks)
        .bind(aggregate.urls_scanned)
        .bind(Utc::now().to_rfc3339())
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .context("Failed to finalize batch")?;

        let updated = result.rows_affected() > 0;
        if updated {
            log::info!("Batch {} finalized as {}", batch_id, status);
        }
        Ok(updated)
    }

    /// Mark a running batch cancelled. Absorbing once set.
    pub async fn cancel(&self, batch_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batches SET status = 'cancelled', completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel batch")?;

        let cancelled = result.rows_affected() > 0;
        if cancelled {
            log::info!("Batch {} cancelled", batch_id);
        }
        Ok(cancelled)
    }
}

// Helper to convert rows to domain types
fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> Batch {
    // urls_scanned doubles as the presence marker for the aggregate: it is
    // written on every terminal transition, including all-failed batches.
    let aggregate = row
        .get::<Option<i64>, _>("urls_scanned")
        .map(|urls_scanned| AggregateStats {
            total_issues: row.get::<Option<i64>, _>("total_issues").unwrap_or(0),
            critical_count: row.get::<Option<i64>, _>("critical_count").unwrap_or(0),
            serious_count: row.get::<Option<i64>, _>("serious_count").unwrap_or(0),
            moderate_count: row.get::<Option<i64>, _>("moderate_count").unwrap_or(0),
            minor_count: row.get::<Option<i64>, _>("minor_count").unwrap_or(0),
            passed_checks: row.get::<Option<i64>, _>("passed_checks").unwrap_or(0),
            urls_scanned,
        });

    Batch {
        id: row.get("id"),
        root_url: row.get("root_url"),
        status: map_batch_status(row.get::<&str, _>("status")),
        total_urls: row.get("total_urls"),
        completed_count: row.get("completed_count"),
        failed_count: row.get("failed_count"),
        aggregate,
        created_at: parse_datetime(row.get("created_at")),
        completed_at: row
            .get::<Option<&str>, _>("completed_at")
            .map(parse_datetime),
    }
}
