//! High-level render flows.
//!
//! [`RenderService`] ties the template engine, dispatcher, and queue
//! controller together into the per-asset generation flows the rest of
//! the application calls: character portraits, scene stills, shot
//! images and videos, and frame-to-frame transition videos. Every flow
//! folds its failures into a [`RenderResult`] instead of returning an
//! error: rendering is a best-effort pipeline stage and the caller
//! decides whether a miss is fatal.

use std::path::Path;
use std::time::Duration;

use rand::Rng;

use crate::api::ComfyApi;
use crate::convert;
use crate::dispatch::{
    JobDispatcher, SelectionHints, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use crate::graph::NodeGraph;
use crate::queue::{CancelReport, OpReport, QueueController, DEFAULT_MAX_RETRIES};
use crate::template::{self, InstantiationReport, JobParameters, NodeMapping};

/// Terminal result of one render flow.
///
/// `success` implies `artifact_url` and `prompt_id` are set. The
/// submitted graph is included whenever submission was attempted, so
/// failed jobs can be replayed or inspected.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub success: bool,
    pub artifact_url: Option<String>,
    pub message: String,
    /// The concrete graph sent to the backend, if submission was
    /// reached.
    pub submitted_graph: Option<NodeGraph>,
    /// Backend job id, once assigned.
    pub prompt_id: Option<String>,
    /// What templating changed, for flows that parameterize a
    /// template. A zero `prompt_injections` count means the template
    /// may lack a prompt slot; callers should treat that as a defect.
    /// Unset for flows that bypass full templating (built-in portrait
    /// graph, transition videos).
    pub instantiation: Option<InstantiationReport>,
}

impl RenderResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            artifact_url: None,
            message: message.into(),
            submitted_graph: None,
            prompt_id: None,
            instantiation: None,
        }
    }
}

/// Orchestrates the render flows against one backend instance.
#[derive(Debug, Clone)]
pub struct RenderService {
    api: ComfyApi,
    dispatcher: JobDispatcher,
    queue: QueueController,
    job_timeout: Duration,
    poll_interval: Duration,
}

impl RenderService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_api(ComfyApi::new(base_url))
    }

    pub fn with_api(api: ComfyApi) -> Self {
        Self {
            dispatcher: JobDispatcher::new(api.clone()),
            queue: QueueController::new(api.clone()),
            api,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the per-job wall-clock budget.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Override the history polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn api(&self) -> &ComfyApi {
        &self.api
    }

    // -----------------------------------------------------------------
    // Image flows
    // -----------------------------------------------------------------

    /// Generate a character portrait.
    ///
    /// With a template, the graph is parsed (UI exports converted) and
    /// parameterized; without one, a built-in portrait workflow is
    /// assembled directly from the parameters and needs no further
    /// templating.
    pub async fn generate_character_image(
        &self,
        template_json: Option<&str>,
        params: JobParameters,
        mapping: &NodeMapping,
    ) -> RenderResult {
        let mut graph = match template_json {
            Some(raw) => match convert::graph_from_json(raw) {
                Ok(graph) => graph,
                Err(e) => return RenderResult::failure(format!("invalid workflow template: {e}")),
            },
            None => {
                tracing::info!("No template configured; using built-in portrait workflow");
                let graph = template::default_portrait_graph(&params);
                return self
                    .submit_and_poll(graph, mapping.save_image_node_id.clone(), None)
                    .await;
            }
        };

        let report = template::instantiate(&mut graph, &params, mapping);
        self.submit_and_poll(graph, mapping.save_image_node_id.clone(), Some(report))
            .await
    }

    /// Generate a scene still. Same pipeline as character portraits;
    /// the parameters carry the scene's prompt, naming, and aspect.
    pub async fn generate_scene_image(
        &self,
        template_json: Option<&str>,
        params: JobParameters,
        mapping: &NodeMapping,
    ) -> RenderResult {
        tracing::info!(
            scene = params.entity_name.as_deref().unwrap_or("unnamed"),
            "Generating scene image",
        );
        self.generate_character_image(template_json, params, mapping)
            .await
    }

    /// Generate a shot image, compositing uploaded character and scene
    /// references into the template's load nodes.
    ///
    /// References are uploaded in character-then-scene order, matching
    /// the mapping's reference node order.
    pub async fn generate_shot_image(
        &self,
        template_json: &str,
        mut params: JobParameters,
        mapping: &NodeMapping,
        character_reference: Option<&Path>,
        scene_reference: Option<&Path>,
    ) -> RenderResult {
        let mut graph = match convert::graph_from_json(template_json) {
            Ok(graph) => graph,
            Err(e) => return RenderResult::failure(format!("invalid workflow template: {e}")),
        };

        for path in [character_reference, scene_reference].into_iter().flatten() {
            match self.upload_reference(path).await {
                Ok(name) => params.reference_images.push(name),
                Err(message) => return RenderResult::failure(message),
            }
        }

        let report = template::instantiate(&mut graph, &params, mapping);
        self.submit_and_poll(graph, mapping.save_image_node_id.clone(), Some(report))
            .await
    }

    // -----------------------------------------------------------------
    // Video flows
    // -----------------------------------------------------------------

    /// Generate a shot video from an optional still reference.
    ///
    /// The artifact is selected against the video save node; the
    /// parameters' `frame_count` and the aspect's longest-side bound
    /// are written to the mapped nodes.
    pub async fn generate_shot_video(
        &self,
        template_json: &str,
        mut params: JobParameters,
        mapping: &NodeMapping,
        reference: Option<&Path>,
    ) -> RenderResult {
        let mut graph = match convert::graph_from_json(template_json) {
            Ok(graph) => graph,
            Err(e) => return RenderResult::failure(format!("invalid workflow template: {e}")),
        };

        if let Some(path) = reference {
            match self.upload_reference(path).await {
                Ok(name) => params.reference_images.push(name),
                Err(message) => return RenderResult::failure(message),
            }
        }

        let report = template::instantiate(&mut graph, &params, mapping);
        self.submit_and_poll(graph, mapping.video_save_node_id.clone(), Some(report))
            .await
    }

    /// Generate a transition video interpolating between two frames.
    ///
    /// No prompt or style is involved: only the two uploaded frames,
    /// the frame count, and a seed are written into the template. The
    /// mapping's reference node ids name the first- and last-frame
    /// load nodes in that order.
    pub async fn generate_transition_video(
        &self,
        template_json: &str,
        mut params: JobParameters,
        mapping: &NodeMapping,
        first_frame: &Path,
        last_frame: &Path,
    ) -> RenderResult {
        let mut graph = match convert::graph_from_json(template_json) {
            Ok(graph) => graph,
            Err(e) => return RenderResult::failure(format!("invalid workflow template: {e}")),
        };

        for path in [first_frame, last_frame] {
            match self.upload_reference(path).await {
                Ok(name) => params.reference_images.push(name),
                Err(message) => return RenderResult::failure(message),
            }
        }

        template::apply_video_params(&mut graph, &params, mapping);
        let seed = params
            .seed
            .unwrap_or_else(|| rand::rng().random_range(1..(1u64 << 32)));
        template::assign_seed(&mut graph, seed);
        template::wire_reference_images(&mut graph, &params.reference_images, mapping);

        self.submit_and_poll(graph, mapping.video_save_node_id.clone(), None)
            .await
    }

    // -----------------------------------------------------------------
    // Queue control
    // -----------------------------------------------------------------

    /// Whether the backend answers its health probe.
    pub async fn check_health(&self) -> bool {
        self.api.check_health().await
    }

    /// Remove every pending job from the backend queue.
    pub async fn clear_queue(&self) -> OpReport {
        self.queue.clear_queue(DEFAULT_MAX_RETRIES).await
    }

    /// Interrupt whatever is currently executing.
    pub async fn interrupt(&self) -> OpReport {
        self.queue.interrupt(DEFAULT_MAX_RETRIES).await
    }

    /// Cancel a batch of jobs by id.
    pub async fn cancel_jobs(&self, prompt_ids: &[String]) -> Result<CancelReport, crate::api::ApiError> {
        self.queue.cancel_all(prompt_ids).await
    }

    /// Cancel one job: try to dequeue it, and fall back to an
    /// interrupt in case it already started executing.
    pub async fn cancel_job(&self, prompt_id: &str) -> OpReport {
        let dequeued = self.queue.dequeue_one(prompt_id).await;
        if dequeued.success {
            return dequeued;
        }
        tracing::info!(prompt_id = %prompt_id, "Dequeue missed; interrupting execution");
        self.queue.interrupt(DEFAULT_MAX_RETRIES).await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn upload_reference(&self, path: &Path) -> Result<String, String> {
        match self.api.upload_image(path).await {
            Ok(response) => Ok(response.name),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Reference upload failed");
                Err(format!("reference upload failed for {}: {e}", path.display()))
            }
        }
    }

    async fn submit_and_poll(
        &self,
        graph: NodeGraph,
        save_node_id: Option<String>,
        instantiation: Option<InstantiationReport>,
    ) -> RenderResult {
        let hints = SelectionHints::from_graph(&graph, save_node_id);
        let handle = match self.dispatcher.submit(&graph).await {
            Ok(handle) => handle,
            Err(e) => {
                return RenderResult {
                    success: false,
                    artifact_url: None,
                    message: format!("submission failed: {e}"),
                    submitted_graph: Some(graph),
                    prompt_id: None,
                    instantiation,
                }
            }
        };

        let outcome = self
            .dispatcher
            .poll(&handle, &hints, self.job_timeout, self.poll_interval)
            .await;

        RenderResult {
            success: outcome.succeeded(),
            artifact_url: outcome.artifact_url,
            message: outcome.message,
            submitted_graph: Some(graph),
            prompt_id: Some(handle.prompt_id),
            instantiation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- Template parsing --

    #[test]
    fn api_format_template_parses_directly() {
        let raw = json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 7}}
        })
        .to_string();
        let graph = convert::graph_from_json(&raw).unwrap();
        assert_eq!(graph["3"].class_type, "KSampler");
    }

    #[test]
    fn ui_format_template_is_converted() {
        let raw = json!({
            "nodes": [
                {"id": 5, "type": "SaveImage", "inputs": [], "widgets_values": []}
            ],
            "links": []
        })
        .to_string();
        let graph = convert::graph_from_json(&raw).unwrap();
        assert_eq!(graph["5"].class_type, "SaveImage");
    }

    #[test]
    fn malformed_template_is_an_error() {
        assert!(convert::graph_from_json("not json").is_err());
    }

    // -- Result contract --

    #[test]
    fn failure_result_carries_no_artifact() {
        let result = RenderResult::failure("invalid workflow template: oops");
        assert!(!result.success);
        assert!(result.artifact_url.is_none());
        assert!(result.prompt_id.is_none());
        assert!(result.instantiation.is_none());
        assert!(result.message.contains("oops"));
    }

    #[tokio::test]
    async fn instantiation_report_survives_submission_failure() {
        // Unreachable backend: submission fails, but the templating
        // report must still reach the caller so defective templates
        // (zero injections) stay detectable.
        let service = RenderService::new("http://127.0.0.1:1");
        let template_json =
            serde_json::to_string(&template::default_portrait_graph(&JobParameters::default()))
                .unwrap();
        let params = JobParameters {
            prompt_text: "a lighthouse keeper".to_string(),
            seed: Some(5),
            ..Default::default()
        };
        let result = service
            .generate_character_image(Some(&template_json), params, &NodeMapping::default())
            .await;
        assert!(!result.success);
        assert!(result.message.contains("submission failed"));
        let report = result.instantiation.expect("templated flow reports instantiation");
        assert_eq!(report.seed, 5);
        assert_eq!(report.prompt_injections, 1);
        assert!(result.submitted_graph.is_some());
    }

    #[tokio::test]
    async fn service_builders_apply_overrides() {
        let service = RenderService::new("http://localhost:8188")
            .with_job_timeout(Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(100));
        assert_eq!(service.job_timeout, Duration::from_secs(60));
        assert_eq!(service.poll_interval, Duration::from_millis(100));
        assert_eq!(service.api().base_url(), "http://localhost:8188");
    }
}
