//! Domain entities for batches and their member scans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ====== Enums ======

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    /// Completed and Failed are the scan's absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    /// Once a batch reaches Completed, Failed or Cancelled it never
    /// transitions again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ====== Entities ======

/// Per-page result produced by the scanning engine.
/// A result can be present and empty (zero issues, zero passed checks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResultStats {
    pub total_issues: i64,
    pub critical_count: i64,
    pub serious_count: i64,
    pub moderate_count: i64,
    pub minor_count: i64,
    pub passed_checks: i64,
}

/// One unit of work: scans exactly one URL.
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub id: String,
    /// None for standalone scans, which the coordinator ignores.
    pub batch_id: Option<String>,
    pub url: String,
    pub status: ScanStatus,
    /// Present iff the scan completed.
    pub result: Option<ScanResultStats>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A logical grouping of scans created from one discovery request.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub root_url: String,
    pub status: BatchStatus,
    /// Fixed at creation; never changes.
    pub total_urls: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    /// Populated only upon terminal transition.
    pub aggregate: Option<AggregateStats>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Summed issue/pass counts across the successfully completed scans of a
/// settled batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_issues: i64,
    pub critical_count: i64,
    pub serious_count: i64,
    pub moderate_count: i64,
    pub minor_count: i64,
    pub passed_checks: i64,
    /// Scans that contributed a result. Distinct from completed_count:
    /// a completed scan with an empty result still counts.
    pub urls_scanned: i64,
}

/// Outcome of a coordinator re-evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusResult {
    pub batch_id: String,
    pub is_complete: bool,
    pub status: BatchStatus,
    pub completed_count: i64,
    pub failed_count: i64,
    pub aggregate: Option<AggregateStats>,
}
