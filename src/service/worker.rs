//! Scan worker - executes queued scans and drives batch settlement.
//!
//! The queue contract is at-least-once: a scan job gets a bounded number of
//! attempts with exponential backoff before it is marked failed. Coordinator
//! failures propagate out of `process_scan`; because the scan is already
//! terminal by then and the pending queue never re-delivers it, the poll
//! loop also sweeps running batches whose scans have all settled and
//! re-drives the coordinator for them, so a lost notification cannot leave
//! a batch stuck. Notifier failures are spawned away and swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::time::sleep;

use crate::domain::models::{BatchStatusResult, Scan, ScanResultStats, ScanStatus};
use crate::error::Result;
use crate::repository::sqlite::{BatchRepository, ScanRepository};
use crate::service::{BatchCoordinator, LogNotifier, Notifier, Scanner};

/// Retry budget for one scan job: 3 attempts, exponential backoff
/// starting at 1s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based attempt that just failed).
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct ScanWorker {
    scan_db: ScanRepository,
    batch_db: BatchRepository,
    coordinator: BatchCoordinator,
    scanner: Arc<dyn Scanner>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    cancel_map: Arc<DashMap<String, Arc<AtomicBool>>>,
}

impl ScanWorker {
    pub fn new(pool: SqlitePool, scanner: Arc<dyn Scanner>) -> Self {
        Self {
            scan_db: ScanRepository::new(pool.clone()),
            batch_db: BatchRepository::new(pool.clone()),
            coordinator: BatchCoordinator::new(pool),
            scanner,
            notifier: Arc::new(LogNotifier),
            retry: RetryPolicy::default(),
            cancel_map: Arc::new(DashMap::with_capacity(10)),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn cancel_flag(&self, batch_id: &str) -> Arc<AtomicBool> {
        self.cancel_map
            .entry(batch_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Cancel a batch: flag it for in-flight skips and mark the record
    /// cancelled. The coordinator treats cancelled as absorbing, so late
    /// scan notifications become no-ops.
    pub async fn cancel(&self, batch_id: &str) -> anyhow::Result<bool> {
        self.cancel_flag(batch_id).store(true, Ordering::Relaxed);
        self.batch_db.cancel(batch_id).await
    }

    fn is_cancelled(&self, batch_id: &str) -> bool {
        self.cancel_flag(batch_id).load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        log::info!("Starting scan worker");

        loop {
            match self.scan_db.get_pending().await {
                Ok(scans) => {
                    if scans.is_empty() {
                        if let Err(e) = self.reconcile_settled_batches().await {
                            log::error!("Batch reconciliation failed: {}", e);
                        }
                        sleep(Duration::from_secs(5)).await;
                        continue;
                    }

                    for scan in scans {
                        let scan_id = scan.id.clone();
                        if let Err(e) = self.process_scan(scan).await {
                            log::error!("Failed to process scan {}: {}", scan_id, e);
                        }
                    }

                    if let Err(e) = self.reconcile_settled_batches().await {
                        log::error!("Batch reconciliation failed: {}", e);
                    }
                }
                Err(e) => {
                    log::error!("Failed to fetch pending scans: {}", e);
                    sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    /// Sweep running batches whose scans have all settled and re-drive the
    /// coordinator for them. A scan leaves the pending queue when it turns
    /// terminal, so a coordinator notification lost to a transient store
    /// error would otherwise never be re-delivered and the batch would stay
    /// running forever. Returns the number of batches recovered.
    pub async fn reconcile_settled_batches(&self) -> anyhow::Result<usize> {
        let batches = self.batch_db.find_running().await?;
        let mut recovered = 0;

        for batch in batches {
            let scans = self.scan_db.find_by_batch(&batch.id).await?;
            let settled = scans.iter().filter(|s| s.status.is_terminal()).count() as i64;
            if scans.is_empty() || settled < batch.total_urls {
                continue;
            }

            // Any terminal member re-derives the full batch state.
            let scan = &scans[0];
            match self
                .coordinator
                .notify_scan_complete(&scan.id, scan.status)
                .await
            {
                Ok(Some(result)) if result.is_complete => {
                    log::warn!(
                        "Recovered batch {} after a lost settlement notification",
                        batch.id
                    );
                    recovered += 1;
                    self.spawn_notification(result);
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Reconciliation of batch {} failed: {}", batch.id, e);
                }
            }
        }

        Ok(recovered)
    }

    /// Execute one scan end to end: run the engine with retries, persist
    /// the terminal scan state, then notify the coordinator. Returns the
    /// batch state when the scan belonged to a batch.
    pub async fn process_scan(&self, scan: Scan) -> Result<Option<BatchStatusResult>> {
        if let Some(batch_id) = scan.batch_id.as_deref() {
            if self.is_cancelled(batch_id) {
                log::debug!(
                    "Skipping scan {} - batch {} was cancelled",
                    scan.id,
                    batch_id
                );
                return Ok(None);
            }
        }

        log::info!("Processing scan {} for URL: {}", scan.id, scan.url);
        self.scan_db.mark_running(&scan.id).await?;

        let terminal_status = match self.scan_with_retries(&scan.url).await {
            Ok(stats) => {
                self.scan_db.complete_with_result(&scan.id, &stats).await?;
                ScanStatus::Completed
            }
            Err(e) => {
                log::warn!("Scan {} exhausted its retries: {}", scan.id, e);
                self.scan_db.mark_failed(&scan.id, &e.to_string()).await?;
                ScanStatus::Failed
            }
        };

        // Coordinator errors propagate: a dropped status update would leave
        // the batch stuck, and the queue retry path is the recovery.
        let result = self
            .coordinator
            .notify_scan_complete(&scan.id, terminal_status)
            .await?;

        if let Some(batch_result) = &result {
            if batch_result.is_complete {
                self.spawn_notification(batch_result.clone());
            }
        }

        Ok(result)
    }

    async fn scan_with_retries(&self, url: &str) -> anyhow::Result<ScanResultStats> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.scanner.scan(url).await {
                Ok(stats) => return Ok(stats),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "Scan attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt,
                        self.retry.max_attempts,
                        url,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fire-and-forget settlement notification. Failures are logged and
    /// swallowed; they must never re-trigger or roll back the transition.
    fn spawn_notification(&self, result: BatchStatusResult) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let batch_id = result.batch_id.clone();
            if let Err(e) = notifier.batch_settled(result).await {
                log::warn!("Settlement notification for batch {} failed: {}", batch_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::domain::models::BatchStatus;
    use crate::test_utils::{fixtures, stubs};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_batch_runs_to_completion() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let notifier = Arc::new(stubs::RecordingNotifier::default());
        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::StubScanner::new(fixtures::stats(2, 1, 0, 1, 0, 5))),
        )
        .with_notifier(notifier.clone())
        .with_retry_policy(fast_retry());

        let (batch_id, _) = fixtures::batch_with_scans(&batch_repo, 2).await;

        for scan in scan_repo.get_pending().await.unwrap() {
            worker.process_scan(scan).await.unwrap();
        }

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.completed_count, 2);
        let aggregate = batch.aggregate.unwrap();
        assert_eq!(aggregate.total_issues, 4);
        assert_eq!(aggregate.passed_checks, 10);
        assert_eq!(aggregate.urls_scanned, 2);

        // Let the spawned notification task run.
        sleep(Duration::from_millis(50)).await;
        let settled = notifier.settled().await;
        assert_eq!(settled.len(), 1, "Exactly one settlement notification");
        assert_eq!(settled[0].batch_id, batch_id);
    }

    #[tokio::test]
    async fn test_failing_url_fails_batch() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let scanner = stubs::StubScanner::new(fixtures::stats(1, 0, 1, 0, 0, 3))
            .failing_on("https://site.test/page-1");
        // Default LogNotifier: settlement is only logged.
        let worker = ScanWorker::new(pool.clone(), Arc::new(scanner))
            .with_retry_policy(fast_retry());

        let (batch_id, _) = fixtures::batch_with_scans(&batch_repo, 2).await;

        for scan in scan_repo.get_pending().await.unwrap() {
            worker.process_scan(scan).await.unwrap();
        }

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.completed_count, 1);
        assert_eq!(batch.failed_count, 1);
        assert_eq!(batch.aggregate.unwrap().urls_scanned, 1);

        let scans = scan_repo.find_by_batch(&batch_id).await.unwrap();
        let failed = scans
            .iter()
            .find(|s| s.status == ScanStatus::Failed)
            .unwrap();
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn test_scanner_gets_full_retry_budget() {
        let pool = fixtures::setup_test_db().await;
        let scan_repo = ScanRepository::new(pool.clone());

        let attempts = Arc::new(AtomicU32::new(0));
        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::AlwaysFailingScanner::new(attempts.clone())),
        )
        .with_retry_policy(fast_retry());

        let scan_id = scan_repo
            .create("https://flaky.test", None)
            .await
            .unwrap();
        let scan = scan_repo.find_by_id(&scan_id).await.unwrap().unwrap();

        let result = worker.process_scan(scan).await.unwrap();
        assert!(result.is_none(), "Standalone scan yields no batch result");
        assert_eq!(attempts.load(Ordering::Relaxed), 3);

        let scan = scan_repo.find_by_id(&scan_id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_roll_back() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::StubScanner::new(fixtures::stats(0, 0, 0, 0, 0, 7))),
        )
        .with_notifier(Arc::new(stubs::FailingNotifier))
        .with_retry_policy(fast_retry());

        let (batch_id, _) = fixtures::batch_with_scans(&batch_repo, 1).await;
        for scan in scan_repo.get_pending().await.unwrap() {
            worker
                .process_scan(scan)
                .await
                .expect("Notifier failure must not surface");
        }

        sleep(Duration::from_millis(50)).await;

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(
            batch.status,
            BatchStatus::Completed,
            "Settlement sticks even when notification delivery fails"
        );
    }

    #[tokio::test]
    async fn test_cancelled_batch_scans_are_skipped() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::StubScanner::new(fixtures::stats(1, 1, 0, 0, 0, 2))),
        )
        .with_retry_policy(fast_retry());

        let (batch_id, _) = fixtures::batch_with_scans(&batch_repo, 2).await;
        assert!(worker.cancel(&batch_id).await.unwrap());

        for scan in scan_repo.get_pending().await.unwrap() {
            let result = worker.process_scan(scan).await.unwrap();
            assert!(result.is_none());
        }

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Cancelled);

        let scans = scan_repo.find_by_batch(&batch_id).await.unwrap();
        assert!(
            scans.iter().all(|s| s.status == ScanStatus::Pending),
            "Skipped scans are left untouched"
        );
    }

    #[tokio::test]
    async fn test_reconciliation_recovers_lost_settlement_notification() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let notifier = Arc::new(stubs::RecordingNotifier::default());
        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::StubScanner::new(fixtures::stats(2, 1, 0, 1, 0, 5))),
        )
        .with_notifier(notifier.clone())
        .with_retry_policy(fast_retry());

        let (batch_id, scan_ids) = fixtures::batch_with_scans(&batch_repo, 2).await;

        // Both scans turn terminal, but the coordinator never hears about
        // the second one (a transient store error ate the notification).
        scan_repo
            .complete_with_result(&scan_ids[0], &fixtures::stats(5, 1, 0, 0, 4, 8))
            .await
            .unwrap();
        scan_repo
            .complete_with_result(&scan_ids[1], &fixtures::stats(3, 0, 2, 1, 0, 6))
            .await
            .unwrap();

        // The pending queue no longer carries the scans, so nothing
        // re-delivers them on its own.
        assert!(scan_repo.get_pending().await.unwrap().is_empty());
        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert!(batch.completed_at.is_none());

        let recovered = worker.reconcile_settled_batches().await.unwrap();
        assert_eq!(recovered, 1, "Sweep should recover the stuck batch");

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.completed_count, 2);
        let aggregate = batch.aggregate.unwrap();
        assert_eq!(aggregate.total_issues, 8);
        assert_eq!(aggregate.urls_scanned, 2);

        sleep(Duration::from_millis(50)).await;
        let settled = notifier.settled().await;
        assert_eq!(settled.len(), 1, "Recovery still notifies downstream");
        assert_eq!(settled[0].batch_id, batch_id);

        // A second sweep finds nothing left to recover.
        assert_eq!(worker.reconcile_settled_batches().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconciliation_leaves_unsettled_batches_alone() {
        let pool = fixtures::setup_test_db().await;
        let batch_repo = BatchRepository::new(pool.clone());
        let scan_repo = ScanRepository::new(pool.clone());

        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(stubs::StubScanner::new(fixtures::stats(1, 0, 0, 1, 0, 2))),
        )
        .with_retry_policy(fast_retry());

        let (batch_id, scan_ids) = fixtures::batch_with_scans(&batch_repo, 2).await;
        scan_repo
            .complete_with_result(&scan_ids[0], &fixtures::stats(1, 0, 0, 1, 0, 2))
            .await
            .unwrap();

        assert_eq!(worker.reconcile_settled_batches().await.unwrap(), 0);

        let batch = batch_repo.find_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Running, "One scan is still in flight");
        assert!(batch.aggregate.is_none());
    }
}
