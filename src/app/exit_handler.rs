//! Exit code logic for the mediarelay process.
//!
//! Single responsibility: map a batch report to the process exit outcome.

use mediarelay_core::{BatchReport, Outcome};

use crate::ProcessExit;

/// Determines the process exit outcome from a finished batch.
///
/// Skipped items count as neither success nor failure. Quota abort wins over
/// every other outcome.
pub(crate) fn determine_exit_outcome(report: &BatchReport) -> ProcessExit {
    if report.aborted_early {
        return ProcessExit::QuotaAborted;
    }
    let failed = report
        .results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
        .count();
    if failed == 0 {
        ProcessExit::Success
    } else if report.succeeded() > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
