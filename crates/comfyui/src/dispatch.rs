//! Job submission and polling.
//!
//! [`JobDispatcher`] submits a concrete graph, then polls
//! `GET /history/{id}` at a fixed interval until the job produces a
//! selectable artifact, reports an error, or the per-job wall-clock
//! timeout expires. A timeout is a distinct outcome from a
//! backend-reported failure.
//!
//! Artifact selection is deterministic: video output always outranks
//! images; a configured save node id is exclusive; otherwise nodes
//! known to be save-class at submission time are preferred; the plain
//! first-candidate fallback is logged as an ambiguous selection and is
//! acceptable for diagnostics only.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use fabula_core::node_classes;

use crate::api::{ApiError, ComfyApi};
use crate::graph::NodeGraph;

/// Fixed delay between history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Wall-clock budget for generation jobs.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(7200);

/// Submits graphs and tracks their completion for one session.
///
/// The `client_id` (UUID v4) is the session correlation id: stable for
/// the dispatcher's lifetime and sent with every submission, distinct
/// from the backend-assigned job ids.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    api: ComfyApi,
    client_id: String,
}

/// Identifies one submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Backend-assigned job id.
    pub prompt_id: String,
    /// Dispatcher correlation id the job was submitted under.
    pub client_id: String,
}

/// Lifecycle state reported by [`JobDispatcher::check`] / `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No history record yet; the job is still waiting in the queue.
    Queued,
    /// Executing (or finished without a selectable artifact yet).
    Running,
    Completed,
    /// The backend reported an execution error.
    Failed,
    /// The polling budget ran out; the job may still finish later.
    TimedOut,
}

/// Result contract handed back to callers.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    /// Retrieval URL of the selected artifact, on completion.
    pub artifact_url: Option<String>,
    /// The raw per-node outputs map, for diagnostics.
    pub raw_outputs: Option<serde_json::Value>,
    pub message: String,
}

impl JobOutcome {
    /// Whether the job finished with an artifact.
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Whether polling should continue.
    fn is_pending(&self) -> bool {
        matches!(self.state, JobState::Queued | JobState::Running)
    }

    fn without_artifact(state: JobState, message: &str) -> Self {
        Self {
            state,
            artifact_url: None,
            raw_outputs: None,
            message: message.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact selection
// ---------------------------------------------------------------------------

/// Node ids eligible for artifact selection, captured at submission.
#[derive(Debug, Clone, Default)]
pub struct SelectionHints {
    /// Configured save node id; exclusive when set.
    pub save_node_id: Option<String>,
    /// Ids of save-class nodes in the submitted graph.
    pub save_class_nodes: BTreeSet<String>,
}

impl SelectionHints {
    /// Record the save-class node ids of a graph about to be
    /// submitted, plus an optional configured save node.
    pub fn from_graph(graph: &NodeGraph, save_node_id: Option<String>) -> Self {
        let save_class_nodes = graph
            .iter()
            .filter(|(_, node)| node_classes::is_save(&node.class_type))
            .map(|(id, _)| id.clone())
            .collect();
        Self {
            save_node_id,
            save_class_nodes,
        }
    }
}

/// How confident the selection is; fallback selections are surfaced in
/// telemetry so production flows can be audited for missing mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionConfidence {
    /// Matched the configured save node id.
    Configured,
    /// Matched a save-class node recorded at submission.
    SaveClass,
    /// First non-temp candidate in iteration order; diagnostics only.
    FirstCandidate,
}

/// The artifact chosen from a completed job's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedArtifact {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    pub file_type: String,
    pub is_video: bool,
    pub confidence: SelectionConfidence,
}

/// Select exactly one artifact from a non-empty outputs map.
///
/// Priority: any video list's first entry wins immediately; otherwise
/// image lists are scanned (node-id order), skipping temp files, with
/// a configured id exclusive, save-class nodes preferred, and the
/// first candidate as last resort. `None` means nothing selectable yet
/// -- the caller keeps polling.
pub fn select_artifact(
    outputs: &serde_json::Value,
    hints: &SelectionHints,
) -> Option<SelectedArtifact> {
    let outputs = outputs.as_object()?;

    // Video output outranks everything.
    for (node_id, node_output) in outputs {
        if let Some(entry) = node_output.get("gifs").and_then(|v| v.as_array()?.first()) {
            return artifact_from_entry(node_id, entry, true, hints.confidence_for(node_id));
        }
    }

    let mut first_candidate: Option<SelectedArtifact> = None;
    for (node_id, node_output) in outputs {
        let Some(entry) = node_output.get("images").and_then(|v| v.as_array()?.first()) else {
            continue;
        };
        let filename = entry.get("filename").and_then(|f| f.as_str()).unwrap_or("");
        if filename.to_lowercase().contains("temp") {
            tracing::debug!(node_id = %node_id, filename = %filename, "Skipping temp output");
            continue;
        }

        if let Some(want) = &hints.save_node_id {
            // Exclusive: only the configured node is acceptable.
            if node_id == want {
                return artifact_from_entry(node_id, entry, false, SelectionConfidence::Configured);
            }
            continue;
        }

        if hints.save_class_nodes.contains(node_id) {
            return artifact_from_entry(node_id, entry, false, SelectionConfidence::SaveClass);
        }

        if first_candidate.is_none() {
            first_candidate =
                artifact_from_entry(node_id, entry, false, SelectionConfidence::FirstCandidate);
        }
    }

    first_candidate
}

impl SelectionHints {
    fn confidence_for(&self, node_id: &str) -> SelectionConfidence {
        if self.save_node_id.as_deref() == Some(node_id) {
            SelectionConfidence::Configured
        } else if self.save_class_nodes.contains(node_id) {
            SelectionConfidence::SaveClass
        } else {
            SelectionConfidence::FirstCandidate
        }
    }
}

fn artifact_from_entry(
    node_id: &str,
    entry: &serde_json::Value,
    is_video: bool,
    confidence: SelectionConfidence,
) -> Option<SelectedArtifact> {
    Some(SelectedArtifact {
        node_id: node_id.to_string(),
        filename: entry.get("filename")?.as_str()?.to_string(),
        subfolder: entry
            .get("subfolder")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string(),
        file_type: entry
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("output")
            .to_string(),
        is_video,
        confidence,
    })
}

// ---------------------------------------------------------------------------
// Error-status extraction
// ---------------------------------------------------------------------------

/// Pull the first execution error message out of a history record, if
/// the backend flagged the job as failed.
///
/// `status.messages` rows are `[kind, data]` pairs; the
/// `execution_error` row carries an `exception_message`.
pub fn execution_error_message(record: &serde_json::Value) -> Option<String> {
    let status = record.get("status")?;
    if status.get("status_str").and_then(|s| s.as_str()) != Some("error") {
        return None;
    }
    let messages = status.get("messages").and_then(|m| m.as_array());
    if let Some(rows) = messages {
        for row in rows {
            let Some(pair) = row.as_array() else { continue };
            if pair.first().and_then(|k| k.as_str()) == Some("execution_error") {
                if let Some(msg) = pair
                    .get(1)
                    .and_then(|d| d.get("exception_message"))
                    .and_then(|m| m.as_str())
                {
                    return Some(msg.to_string());
                }
            }
        }
    }
    Some("unknown execution error".to_string())
}

// ---------------------------------------------------------------------------
// Record classification
// ---------------------------------------------------------------------------

/// How a history lookup classifies, before any URL composition.
#[derive(Debug)]
enum RecordClass {
    /// No record under the job id: still waiting in the queue.
    Queued,
    /// Record present, no selectable artifact and no error yet.
    Running,
    Completed {
        artifact: SelectedArtifact,
        outputs: serde_json::Value,
    },
    Failed {
        message: String,
        outputs: Option<serde_json::Value>,
    },
}

/// Classify one history lookup. Pure; `record` is the entry under the
/// job's id in the `GET /history/{id}` payload, absent while queued.
fn classify_record(record: Option<&serde_json::Value>, hints: &SelectionHints) -> RecordClass {
    let Some(record) = record else {
        return RecordClass::Queued;
    };

    if let Some(outputs) = record
        .get("outputs")
        .filter(|o| o.as_object().is_some_and(|m| !m.is_empty()))
    {
        if let Some(artifact) = select_artifact(outputs, hints) {
            return RecordClass::Completed {
                artifact,
                outputs: outputs.clone(),
            };
        }
    }

    if let Some(message) = execution_error_message(record) {
        return RecordClass::Failed {
            message,
            outputs: record.get("outputs").cloned(),
        };
    }

    RecordClass::Running
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

impl JobDispatcher {
    /// Create a dispatcher with a fresh session correlation id.
    pub fn new(api: ComfyApi) -> Self {
        Self {
            api,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The session correlation id sent with every submission.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Submit a concrete graph for execution.
    ///
    /// A backend rejection (non-200) is surfaced as
    /// [`ApiError::Rejected`] and never retried.
    pub async fn submit(&self, graph: &NodeGraph) -> Result<JobHandle, ApiError> {
        let response = self.api.submit(graph, &self.client_id).await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            client_id = %self.client_id,
            nodes = graph.len(),
            "Workflow submitted",
        );
        Ok(JobHandle {
            prompt_id: response.prompt_id,
            client_id: self.client_id.clone(),
        })
    }

    /// Fetch the job's history once and classify it. Safe to call
    /// concurrently from multiple tasks (idempotent read).
    pub async fn check(
        &self,
        handle: &JobHandle,
        hints: &SelectionHints,
    ) -> Result<JobOutcome, ApiError> {
        let history = self.api.history(&handle.prompt_id).await?;
        match classify_record(history.get(&handle.prompt_id), hints) {
            RecordClass::Queued => {
                Ok(JobOutcome::without_artifact(JobState::Queued, "waiting in queue"))
            }
            RecordClass::Running => {
                Ok(JobOutcome::without_artifact(JobState::Running, "executing"))
            }
            RecordClass::Completed { artifact, outputs } => {
                if artifact.confidence == SelectionConfidence::FirstCandidate {
                    tracing::warn!(
                        prompt_id = %handle.prompt_id,
                        node_id = %artifact.node_id,
                        "Ambiguous artifact selection (no save node configured)",
                    );
                } else {
                    tracing::info!(
                        prompt_id = %handle.prompt_id,
                        node_id = %artifact.node_id,
                        confidence = ?artifact.confidence,
                        video = artifact.is_video,
                        "Artifact selected",
                    );
                }
                let url =
                    self.api
                        .view_url(&artifact.filename, &artifact.subfolder, &artifact.file_type);
                Ok(JobOutcome {
                    state: JobState::Completed,
                    artifact_url: Some(url),
                    raw_outputs: Some(outputs),
                    message: "generation complete".to_string(),
                })
            }
            RecordClass::Failed { message, outputs } => {
                tracing::error!(prompt_id = %handle.prompt_id, error = %message, "Job failed");
                Ok(JobOutcome {
                    state: JobState::Failed,
                    artifact_url: None,
                    raw_outputs: outputs,
                    message,
                })
            }
        }
    }

    /// Poll until completion, failure, or timeout, sleeping a fixed
    /// interval between ticks.
    ///
    /// Transport errors on a tick are logged and retried on the next
    /// tick; only the wall clock bounds the wait. The returned
    /// [`JobState::TimedOut`] is distinct from a backend-reported
    /// failure.
    pub async fn poll(
        &self,
        handle: &JobHandle,
        hints: &SelectionHints,
        timeout: Duration,
        interval: Duration,
    ) -> JobOutcome {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed > timeout {
                let message = format!(
                    "job timed out after {}s (limit {}s)",
                    elapsed.as_secs(),
                    timeout.as_secs()
                );
                tracing::warn!(prompt_id = %handle.prompt_id, "{message}");
                return JobOutcome::without_artifact(JobState::TimedOut, &message);
            }

            match self.check(handle, hints).await {
                Ok(outcome) if !outcome.is_pending() => return outcome,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        prompt_id = %handle.prompt_id,
                        error = %e,
                        "Poll tick failed; retrying",
                    );
                }
            }

            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn hints_with(save_node_id: Option<&str>, save_class: &[&str]) -> SelectionHints {
        SelectionHints {
            save_node_id: save_node_id.map(str::to_string),
            save_class_nodes: save_class.iter().map(|s| s.to_string()).collect(),
        }
    }

    // -- Artifact selection --

    #[test]
    fn video_outranks_image() {
        let outputs = json!({
            "9": {"images": [{"filename": "shot.png", "type": "output"}]},
            "12": {"gifs": [{"filename": "shot.mp4", "subfolder": "", "type": "output"}]},
        });
        let artifact = select_artifact(&outputs, &SelectionHints::default()).unwrap();
        assert!(artifact.is_video);
        assert_eq!(artifact.node_id, "12");
        assert_eq!(artifact.filename, "shot.mp4");
    }

    #[test]
    fn configured_node_beats_iteration_order() {
        let outputs = json!({
            "5": {"images": [{"filename": "preview.png", "type": "output"}]},
            "9": {"images": [{"filename": "final.png", "subfolder": "story_1", "type": "output"}]},
        });
        let artifact = select_artifact(&outputs, &hints_with(Some("9"), &[])).unwrap();
        assert_eq!(artifact.node_id, "9");
        assert_eq!(artifact.filename, "final.png");
        assert_eq!(artifact.confidence, SelectionConfidence::Configured);
    }

    #[test]
    fn configured_node_is_exclusive() {
        let outputs = json!({
            "5": {"images": [{"filename": "other.png", "type": "output"}]},
        });
        assert!(select_artifact(&outputs, &hints_with(Some("9"), &[])).is_none());
    }

    #[test]
    fn save_class_node_preferred_over_first_candidate() {
        let outputs = json!({
            "3": {"images": [{"filename": "intermediate.png", "type": "output"}]},
            "7": {"images": [{"filename": "saved.png", "type": "output"}]},
        });
        let artifact = select_artifact(&outputs, &hints_with(None, &["7"])).unwrap();
        assert_eq!(artifact.node_id, "7");
        assert_eq!(artifact.confidence, SelectionConfidence::SaveClass);
    }

    #[test]
    fn fallback_takes_first_non_temp_candidate() {
        let outputs = json!({
            "2": {"images": [{"filename": "ComfyUI_temp_001.png", "type": "temp"}]},
            "4": {"images": [{"filename": "real.png", "type": "output"}]},
        });
        let artifact = select_artifact(&outputs, &SelectionHints::default()).unwrap();
        assert_eq!(artifact.node_id, "4");
        assert_eq!(artifact.confidence, SelectionConfidence::FirstCandidate);
    }

    #[test]
    fn all_temp_outputs_select_nothing() {
        let outputs = json!({
            "2": {"images": [{"filename": "temp_a.png"}]},
        });
        assert!(select_artifact(&outputs, &SelectionHints::default()).is_none());
    }

    #[test]
    fn non_image_outputs_select_nothing() {
        let outputs = json!({"6": {"text": ["caption"]}});
        assert!(select_artifact(&outputs, &SelectionHints::default()).is_none());
    }

    #[test]
    fn hints_recorded_from_graph() {
        let mut graph = NodeGraph::new();
        graph.insert("9".into(), crate::graph::Node::new("SaveImage"));
        graph.insert("12".into(), crate::graph::Node::new("VHS_VideoCombine"));
        graph.insert("5".into(), crate::graph::Node::new("KSampler"));
        let hints = SelectionHints::from_graph(&graph, Some("9".into()));
        assert_eq!(hints.save_node_id.as_deref(), Some("9"));
        assert!(hints.save_class_nodes.contains("12"));
        assert!(!hints.save_class_nodes.contains("5"));
    }

    // -- Error-status extraction --

    #[test]
    fn error_status_extracts_exception_message() {
        let record = json!({
            "status": {
                "status_str": "error",
                "messages": [
                    ["execution_start", {"prompt_id": "abc"}],
                    ["execution_error", {"exception_message": "CUDA out of memory"}]
                ]
            }
        });
        assert_eq!(
            execution_error_message(&record).as_deref(),
            Some("CUDA out of memory")
        );
    }

    #[test]
    fn error_status_without_detail_is_still_an_error() {
        let record = json!({"status": {"status_str": "error"}});
        assert_eq!(
            execution_error_message(&record).as_deref(),
            Some("unknown execution error")
        );
    }

    #[test]
    fn success_status_is_not_an_error() {
        let record = json!({"status": {"status_str": "success", "messages": []}});
        assert!(execution_error_message(&record).is_none());
        assert!(execution_error_message(&json!({})).is_none());
    }

    // -- Record classification --

    #[test]
    fn missing_record_classifies_as_queued() {
        assert_matches!(
            classify_record(None, &SelectionHints::default()),
            RecordClass::Queued
        );
    }

    #[test]
    fn record_without_outputs_or_error_is_running() {
        let record = json!({"status": {"status_str": "success"}, "outputs": {}});
        assert_matches!(
            classify_record(Some(&record), &SelectionHints::default()),
            RecordClass::Running
        );
    }

    #[test]
    fn record_with_artifact_classifies_as_completed() {
        let record = json!({
            "outputs": {"9": {"images": [{"filename": "done.png", "type": "output"}]}}
        });
        let class = classify_record(Some(&record), &hints_with(None, &["9"]));
        assert_matches!(
            class,
            RecordClass::Completed { artifact, .. } if artifact.filename == "done.png"
        );
    }

    #[test]
    fn record_with_error_status_classifies_as_failed() {
        let record = json!({
            "status": {
                "status_str": "error",
                "messages": [["execution_error", {"exception_message": "node missing"}]]
            }
        });
        let class = classify_record(Some(&record), &SelectionHints::default());
        assert_matches!(class, RecordClass::Failed { message, .. } if message == "node missing");
    }

    // -- Polling --

    #[tokio::test]
    async fn poll_reports_timeout_distinct_from_failure() {
        // Unreachable backend: every tick errors, so only the wall
        // clock can end the loop.
        let dispatcher = JobDispatcher::new(ComfyApi::new("http://127.0.0.1:1"));
        let handle = JobHandle {
            prompt_id: "p".to_string(),
            client_id: dispatcher.client_id().to_string(),
        };
        let outcome = dispatcher
            .poll(
                &handle,
                &SelectionHints::default(),
                Duration::from_millis(100),
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(outcome.state, JobState::TimedOut);
        assert_ne!(outcome.state, JobState::Failed);
        assert!(outcome.message.contains("timed out"));
        assert!(outcome.message.contains("limit"));
        assert!(outcome.artifact_url.is_none());
        assert!(!outcome.succeeded());
    }

    // -- Dispatcher identity --

    #[test]
    fn dispatcher_correlation_id_is_stable() {
        let dispatcher = JobDispatcher::new(ComfyApi::new("http://localhost:8188"));
        let id = dispatcher.client_id().to_string();
        assert_eq!(dispatcher.client_id(), id);
        assert!(!id.is_empty());
    }
}
