//! Scan record store.
//!
//! One row per page scan. Result columns are written together with the
//! terminal status so a completed row is never missing its stats.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{map_scan_status, parse_datetime};
use crate::domain::models::{Scan, ScanResultStats};

#[derive(Clone)]
pub struct ScanRepository {
    pool: SqlitePool,
}

impl ScanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new pending scan, optionally linked to a batch.
    /// Returns the scan ID (UUID string).
    pub async fn create(&self, url: &str, batch_id: Option<&str>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO scans (id, batch_id, url, status, created_at) \
             VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(batch_id)
        .bind(url)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to create scan")?;

        log::info!("Created scan {} for URL: {}", id, url);
        Ok(id)
    }

    /// Get a scan by ID, or None if it does not exist.
    pub async fn find_by_id(&self, scan_id: &str) -> Result<Option<Scan>> {
        let row = sqlx::query(
            "SELECT id, batch_id, url, status, total_issues, critical_count, \
                    serious_count, moderate_count, minor_count, passed_checks, \
                    error_message, created_at, completed_at \
             FROM scans WHERE id = ?",
        )
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch scan")?;

        Ok(row.as_ref().map(row_to_scan))
    }

    /// Snapshot of every scan belonging to a batch.
    pub async fn find_by_batch(&self, batch_id: &str) -> Result<Vec<Scan>> {
        let rows = sqlx::query(
            "SELECT id, batch_id, url, status, total_issues, critical_count, \
                    serious_count, moderate_count, minor_count, passed_checks, \
                    error_message, created_at, completed_at \
             FROM scans WHERE batch_id = ? ORDER BY created_at ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch scans for batch")?;

        Ok(rows.iter().map(row_to_scan).collect())
    }

    /// Pending scans in creation order (for the worker poll loop).
    pub async fn get_pending(&self) -> Result<Vec<Scan>> {
        let rows = sqlx::query(
            "SELECT id, batch_id, url, status, total_issues, critical_count, \
                    serious_count, moderate_count, minor_count, passed_checks, \
                    error_message, created_at, completed_at \
             FROM scans WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending scans")?;

        Ok(rows.iter().map(row_to_scan).collect())
    }

    /// Mark a scan as picked up by a worker.
    pub async fn mark_running(&self, scan_id: &str) -> Result<()> {
        sqlx::query("UPDATE scans SET status = 'running' WHERE id = ?")
            .bind(scan_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark scan running")?;
        Ok(())
    }

    /// Persist the scan result and mark the scan completed in one UPDATE.
    pub async fn complete_with_result(
        &self,
        scan_id: &str,
        stats: &ScanResultStats,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scans \
             SET status = 'completed', total_issues = ?, critical_count = ?, \
                 serious_count = ?, moderate_count = ?, minor_count = ?, \
                 passed_checks = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(stats.total_issues)
        .bind(stats.critical_count)
        .bind(stats.serious_count)
        .bind(stats.moderate_count)
        .bind(stats.minor_count)
        .bind(stats.passed_checks)
        .bind(Utc::now().to_rfc3339())
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .context("Failed to complete scan")?;

        log::info!(
            "Scan {} completed with {} issues",
            scan_id,
            stats.total_issues
        );
        Ok(())
    }

    /// Mark a scan failed with an error message.
    pub async fn mark_failed(&self, scan_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE scans \
             SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark scan failed")?;

        log::error!("Scan {} failed: {}", scan_id, error);
        Ok(())
    }
}

// Helper to convert rows to domain types
pub(super) fn row_to_scan(row: &sqlx::sqlite::SqliteRow) -> Scan {
    // All result columns are written together; total_issues doubles as the
    // presence marker.
    let result = row
        .get::<Option<i64>, _>("total_issues")
        .map(|total_issues| ScanResultStats {
            total_issues,
            critical_count: row.get::<Option<i64>, _>("critical_count").unwrap_or(0),
            serious_count: row.get::<Option<i64>, _>("serious_count").unwrap_or(0),
            moderate_count: row.get::<Option<i64>, _>("moderate_count").unwrap_or(0),
            minor_count: row.get::<Option<i64>, _>("minor_count").unwrap_or(0),
            passed_checks: row.get::<Option<i64>, _>("passed_checks").unwrap_or(0),
        });

    Scan {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        url: row.get("url"),
        status: map_scan_status(row.get::<&str, _>("status")),
        result,
        error_message: row.get("error_message"),
        created_at: parse_datetime(row.get("created_at")),
        completed_at: row
            .get::<Option<&str>, _>("completed_at")
            .map(parse_datetime),
    }
}
