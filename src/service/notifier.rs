//! Downstream notifications for settled batches.
//!
//! Delivery (email, webhooks) sits behind this trait. The worker spawns the
//! notification as its own task and swallows failures: a lost email must
//! never roll back a batch transition.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::models::BatchStatusResult;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn batch_settled(&self, result: BatchStatusResult) -> Result<()>;
}

/// Default notifier that only logs the settlement.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn batch_settled(&self, result: BatchStatusResult) -> Result<()> {
        log::info!(
            "Batch {} settled as {} ({}/{} scans completed)",
            result.batch_id,
            result.status,
            result.completed_count,
            result.completed_count + result.failed_count
        );
        Ok(())
    }
}
