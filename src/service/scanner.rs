//! Seam for the accessibility checking engine.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::models::ScanResultStats;

/// Runs the accessibility checks for a single URL and reports the issue
/// counts. The engine itself (browser automation, rule evaluation) lives
/// behind this trait.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, url: &str) -> Result<ScanResultStats>;
}
