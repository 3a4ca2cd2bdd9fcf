use chrono::Utc;

use crate::domain::models::{BatchStatus, ScanStatus};

mod batch_repository;
mod scan_repository;

pub use batch_repository::BatchRepository;
pub use scan_repository::ScanRepository;

pub fn map_scan_status(s: &str) -> ScanStatus {
    match s {
        "pending" => ScanStatus::Pending,
        "running" => ScanStatus::Running,
        "completed" => ScanStatus::Completed,
        "failed" => ScanStatus::Failed,
        _ => ScanStatus::Pending,
    }
}

pub fn map_batch_status(s: &str) -> BatchStatus {
    match s {
        "running" => BatchStatus::Running,
        "completed" => BatchStatus::Completed,
        "failed" => BatchStatus::Failed,
        "cancelled" => BatchStatus::Cancelled,
        _ => BatchStatus::Running,
    }
}

pub(crate) fn parse_datetime(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
