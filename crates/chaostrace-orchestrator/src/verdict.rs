//! §4.8 step 3, "Finalize": maps a run's terminal status plus its
//! accumulated violation/block counters to a `Verdict`.
//!
//! Grounded on `original_source/chaostrace/control_plane/services/
//! orchestrator.py`'s `_finalize_run`.

use chaostrace_model::{RunStatus, Verdict};

/// Determine the verdict for a run given its terminal status, whether
/// any policy violation was recorded, and how many statements were
/// blocked.
///
/// | status     | violations | blocked | verdict    |
/// |------------|------------|---------|------------|
/// | COMPLETED  | none       | 0       | PASS       |
/// | COMPLETED  | none       | >0      | WARN       |
/// | COMPLETED  | some       | any     | FAIL       |
/// | FAILED     | any        | any     | FAIL       |
/// | TERMINATED | any        | any     | INCOMPLETE |
pub fn verdict_for(status: RunStatus, has_violations: bool, blocked: u64) -> Verdict {
    match status {
        RunStatus::Completed if has_violations => Verdict::Fail,
        RunStatus::Completed if blocked > 0 => Verdict::Warn,
        RunStatus::Completed => Verdict::Pass,
        RunStatus::Failed => Verdict::Fail,
        RunStatus::Terminated => Verdict::Incomplete,
        // Pending/Initializing/Running/Cleanup never reach finalize.
        _ => Verdict::Incomplete,
    }
}
