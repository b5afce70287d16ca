//! Backend queue control: clearing, interruption, targeted
//! cancellation.
//!
//! The backend's queue state is observable but not controllable beyond
//! these operations, so everything here is best-effort: a job may
//! complete between the cancellation decision and the interrupt
//! landing. Control operations get a bounded linear-backoff retry;
//! nothing else in the crate retries implicitly.

use std::future::Future;
use std::time::Duration;

use crate::api::{ApiError, ComfyApi, QueueSnapshot};

/// Default attempt budget for clear/interrupt operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Linear backoff step between attempts.
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Delay before retrying after the given (1-based) failed attempt.
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_STEP * attempt
}

/// Result of one queue control operation.
#[derive(Debug, Clone)]
pub struct OpReport {
    pub success: bool,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    pub message: String,
}

/// Outcome of a batch cancellation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Requested ids that were pending and successfully dequeued.
    pub removed: Vec<String>,
    /// Whether the running execution was interrupted.
    pub interrupted: bool,
    /// Requested ids present in neither pending nor running.
    pub not_found: Vec<String>,
}

/// How a cancellation request maps onto a queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelPlan {
    /// Requested ids sitting in the pending queue, in request order.
    pub pending_matches: Vec<String>,
    /// Whether any requested id is currently running. One interrupt
    /// suffices: the backend executes a single job at a time.
    pub interrupt_needed: bool,
    /// Requested ids in neither set.
    pub not_found: Vec<String>,
}

/// Partition a cancellation request against a queue snapshot.
///
/// Pure; the caller executes the plan. An id found in pending is never
/// `not_found`, even if its dequeue later fails.
pub fn plan_cancellation(snapshot: &QueueSnapshot, requested: &[String]) -> CancelPlan {
    let mut pending_matches = Vec::new();
    let mut not_found = Vec::new();
    let mut interrupt_needed = false;

    for id in requested {
        if snapshot.pending.contains(id) {
            pending_matches.push(id.clone());
        } else if snapshot.running.contains(id) {
            interrupt_needed = true;
        } else {
            not_found.push(id.clone());
        }
    }

    CancelPlan {
        pending_matches,
        interrupt_needed,
        not_found,
    }
}

/// Run a fallible operation with bounded linear-backoff retries.
async fn with_retries<F, Fut>(op_name: &str, max_retries: u32, op: F) -> OpReport
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), ApiError>>,
{
    let mut last_error = String::new();
    for attempt in 1..=max_retries.max(1) {
        match op().await {
            Ok(()) => {
                tracing::info!(op = op_name, attempt, "Queue operation succeeded");
                return OpReport {
                    success: true,
                    attempts: attempt,
                    message: format!("{op_name} succeeded"),
                };
            }
            Err(e) => {
                tracing::warn!(op = op_name, attempt, error = %e, "Queue operation failed");
                last_error = e.to_string();
            }
        }
        if attempt < max_retries {
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }
    OpReport {
        success: false,
        attempts: max_retries.max(1),
        message: format!("{op_name} failed after {} attempts: {last_error}", max_retries.max(1)),
    }
}

/// Cancels and clears backend queue state.
#[derive(Debug, Clone)]
pub struct QueueController {
    api: ComfyApi,
}

impl QueueController {
    pub fn new(api: ComfyApi) -> Self {
        Self { api }
    }

    /// Remove every pending job, with bounded retries.
    pub async fn clear_queue(&self, max_retries: u32) -> OpReport {
        with_retries("clear queue", max_retries, || self.api.clear_queue()).await
    }

    /// Interrupt the currently running execution, with bounded retries.
    pub async fn interrupt(&self, max_retries: u32) -> OpReport {
        with_retries("interrupt", max_retries, || self.api.interrupt()).await
    }

    /// Dequeue a single pending job. Single attempt; callers wanting
    /// retries use [`cancel_all`](Self::cancel_all) or re-invoke.
    pub async fn dequeue_one(&self, prompt_id: &str) -> OpReport {
        let id = prompt_id.to_string();
        match self.api.delete_from_queue(std::slice::from_ref(&id)).await {
            Ok(()) => OpReport {
                success: true,
                attempts: 1,
                message: format!("dequeued {prompt_id}"),
            },
            Err(e) => OpReport {
                success: false,
                attempts: 1,
                message: format!("dequeue of {prompt_id} failed: {e}"),
            },
        }
    }

    /// Cancel every requested job found in the backend queue.
    ///
    /// Fetches a queue snapshot, dequeues the pending matches
    /// individually, and issues at most one interrupt for the running
    /// matches. Racy by design: success is informational, not a
    /// guarantee that no artifact was produced.
    pub async fn cancel_all(&self, prompt_ids: &[String]) -> Result<CancelReport, ApiError> {
        if prompt_ids.is_empty() {
            return Ok(CancelReport::default());
        }

        let snapshot = self.api.queue_snapshot().await?;
        let plan = plan_cancellation(&snapshot, prompt_ids);

        let mut removed = Vec::new();
        for id in &plan.pending_matches {
            match self.api.delete_from_queue(std::slice::from_ref(id)).await {
                Ok(()) => {
                    tracing::info!(prompt_id = %id, "Dequeued pending job");
                    removed.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(prompt_id = %id, error = %e, "Failed to dequeue pending job");
                }
            }
        }

        let interrupted = if plan.interrupt_needed {
            self.interrupt(DEFAULT_MAX_RETRIES).await.success
        } else {
            false
        };

        tracing::info!(
            requested = prompt_ids.len(),
            removed = removed.len(),
            interrupted,
            not_found = plan.not_found.len(),
            "Cancellation batch processed",
        );

        Ok(CancelReport {
            removed,
            interrupted,
            not_found: plan.not_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(pending: &[&str], running: &[&str]) -> QueueSnapshot {
        QueueSnapshot {
            pending: pending.iter().map(|s| s.to_string()).collect(),
            running: running.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    // -- Backoff --

    #[test]
    fn retry_delay_is_linear() {
        assert_eq!(retry_delay(1), Duration::from_millis(500));
        assert_eq!(retry_delay(2), Duration::from_millis(1000));
        assert_eq!(retry_delay(3), Duration::from_millis(1500));
    }

    // -- Cancellation partition --

    #[test]
    fn partition_splits_pending_running_unknown() {
        let snap = snapshot(&["p1", "p2"], &["r1"]);
        let plan = plan_cancellation(&snap, &ids(&["p1", "r1", "x9"]));
        assert_eq!(plan.pending_matches, ids(&["p1"]));
        assert!(plan.interrupt_needed);
        assert_eq!(plan.not_found, ids(&["x9"]));
    }

    #[test]
    fn multiple_running_matches_need_only_one_interrupt() {
        let snap = snapshot(&[], &["r1", "r2"]);
        let plan = plan_cancellation(&snap, &ids(&["r1", "r2"]));
        assert!(plan.interrupt_needed);
        assert!(plan.pending_matches.is_empty());
        assert!(plan.not_found.is_empty());
    }

    #[test]
    fn partition_of_empty_request() {
        let plan = plan_cancellation(&snapshot(&["p1"], &[]), &[]);
        assert!(plan.pending_matches.is_empty());
        assert!(!plan.interrupt_needed);
        assert!(plan.not_found.is_empty());
    }

    #[test]
    fn all_unknown_ids_are_not_found() {
        let plan = plan_cancellation(&QueueSnapshot::default(), &ids(&["a", "b"]));
        assert_eq!(plan.not_found, ids(&["a", "b"]));
    }

    // -- Retry wrapper --

    #[tokio::test]
    async fn retries_stop_on_first_success() {
        let calls = AtomicU32::new(0);
        let report = with_retries("test op", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_and_report_last_error() {
        let report = with_retries("test op", 1, || async {
            Err(ApiError::Rejected {
                status: 500,
                message: "boom".to_string(),
            })
        })
        .await;
        assert!(!report.success);
        assert_eq!(report.attempts, 1);
        assert!(report.message.contains("boom"));
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let calls = AtomicU32::new(0);
        let report = with_retries("test op", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::Rejected {
                        status: 503,
                        message: "busy".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(report.success);
        assert_eq!(report.attempts, 2);
    }
}
