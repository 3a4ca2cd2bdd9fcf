//! Aggregate statistics over a batch's scan set.

use crate::domain::models::{AggregateStats, Scan, ScanStatus};

/// Sum issue and pass counts over the scans that completed with a result.
///
/// Failed scans and scans without a result contribute nothing and are not
/// counted in `urls_scanned`. A completed scan with a present-but-empty
/// result still counts toward `urls_scanned`. Order independent; an empty
/// input yields all zeros.
pub fn compute_aggregate(scans: &[Scan]) -> AggregateStats {
    let mut agg = AggregateStats::default();

    for scan in scans {
        if scan.status != ScanStatus::Completed {
            continue;
        }
        let Some(stats) = &scan.result else {
            continue;
        };

        agg.total_issues += stats.total_issues;
        agg.critical_count += stats.critical_count;
        agg.serious_count += stats.serious_count;
        agg.moderate_count += stats.moderate_count;
        agg.minor_count += stats.minor_count;
        agg.passed_checks += stats.passed_checks;
        agg.urls_scanned += 1;
    }

    agg
}
