//! Graph template parameterization.
//!
//! A workflow template is a reusable API-format graph with
//! placeholders; [`instantiate`] turns it into a concrete, submittable
//! graph for one job. Rules run in a fixed order so later rules never
//! undo earlier ones: style substitution, canvas dimensions, prompt
//! injection, seed assignment, save-path prefix, reference-image
//! wiring.
//!
//! Prompt injection is heuristic but tiered: an explicit node mapping
//! always wins, then sentinel placeholders, then empty/stub text, then
//! the first unprotected text-encode node. A template where no tier
//! matches is left untouched and reported with a zero injection count
//! — callers decide whether that is a defect.

use fabula_core::{aspect, naming, node_classes};
use rand::Rng;

use crate::graph::{node_ids_by_class, Node, NodeGraph};

/// Style applied when the caller does not specify one.
pub const DEFAULT_STYLE: &str = "anime style, high quality, detailed";

/// Per-job parameters injected into a workflow template.
#[derive(Debug, Clone)]
pub struct JobParameters {
    /// Generated prompt text for the positive conditioning node.
    pub prompt_text: String,
    /// Aspect-ratio token, e.g. `"16:9"`. Unknown tokens fall back to
    /// portrait dimensions.
    pub aspect_ratio: String,
    /// Sampler seed; drawn uniformly from `[1, 2^32)` when `None`.
    pub seed: Option<u64>,
    /// Replacement for the `##STYLE##` placeholder.
    pub style: String,
    /// Server-side filenames of already-uploaded reference images, in
    /// wiring order (e.g. character reference before scene reference).
    pub reference_images: Vec<String>,
    /// Total frame count for video workflows.
    pub frame_count: Option<u64>,
    /// Novel the artifact belongs to; part of the save prefix.
    pub novel_id: Option<String>,
    /// Character/scene name; sanitized into the save prefix.
    pub entity_name: Option<String>,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            prompt_text: String::new(),
            aspect_ratio: "9:16".to_string(),
            seed: None,
            style: DEFAULT_STYLE.to_string(),
            reference_images: Vec::new(),
            frame_count: None,
            novel_id: None,
            entity_name: None,
        }
    }
}

/// Which node ids in a template play which semantic role.
///
/// All fields optional; absent roles fall back to class-based
/// heuristics. Stored alongside the template by the (external)
/// workflow registry.
#[derive(Debug, Clone, Default)]
pub struct NodeMapping {
    pub prompt_node_id: Option<String>,
    pub save_image_node_id: Option<String>,
    pub width_node_id: Option<String>,
    pub height_node_id: Option<String>,
    /// Explicit load-node targets per reference image index.
    pub reference_image_node_ids: Vec<String>,
    pub frame_count_node_id: Option<String>,
    pub max_side_node_id: Option<String>,
    pub video_save_node_id: Option<String>,
}

/// What [`instantiate`] actually changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantiationReport {
    /// Number of nodes that received prompt text. Zero means no
    /// injection tier matched — the template may be defective.
    pub prompt_injections: usize,
    /// Seed written to the sampler nodes (caller-supplied or drawn).
    pub seed: u64,
    /// Number of reference images actually wired to load nodes.
    pub references_wired: usize,
}

/// Parameterize a template graph in place.
///
/// Mutates `graph` through every templating rule in order and reports
/// what changed. Pure except for seed randomness when
/// [`JobParameters::seed`] is unset.
pub fn instantiate(
    graph: &mut NodeGraph,
    params: &JobParameters,
    mapping: &NodeMapping,
) -> InstantiationReport {
    replace_style_placeholder(graph, &params.style);
    apply_dimensions(graph, &params.aspect_ratio, mapping);
    apply_video_params(graph, params, mapping);

    let prompt_injections = inject_prompt(graph, &params.prompt_text, mapping);
    if prompt_injections == 0 {
        tracing::warn!("Prompt injection modified no nodes; template may lack a prompt slot");
    }

    let seed = params
        .seed
        .unwrap_or_else(|| rand::rng().random_range(1..(1u64 << 32)));
    assign_seed(graph, seed);

    apply_save_prefix(graph, params, mapping);
    let references_wired = wire_reference_images(graph, &params.reference_images, mapping);

    InstantiationReport {
        prompt_injections,
        seed,
        references_wired,
    }
}

// ---------------------------------------------------------------------------
// Rule 1: style substitution
// ---------------------------------------------------------------------------

/// Replace every `##STYLE##` occurrence in every string input. All
/// surrounding text is preserved verbatim.
pub fn replace_style_placeholder(graph: &mut NodeGraph, style: &str) {
    for (node_id, node) in graph.iter_mut() {
        let targets: Vec<(String, String)> = node
            .inputs
            .iter()
            .filter_map(|(name, _)| {
                node.input_str(name)
                    .filter(|s| s.contains(node_classes::STYLE_PLACEHOLDER))
                    .map(|s| (name.clone(), s.replace(node_classes::STYLE_PLACEHOLDER, style)))
            })
            .collect();
        for (name, rewritten) in targets {
            tracing::debug!(node_id = %node_id, input = %name, "Substituted style placeholder");
            node.set_input(&name, rewritten);
        }
    }
}

// ---------------------------------------------------------------------------
// Rule 2: canvas dimensions (+ video sizing knobs)
// ---------------------------------------------------------------------------

/// Write resolved width/height into the template.
///
/// An explicitly mapped node takes precedence for its dimension and
/// receives the resolution as its `value` input. Each dimension falls
/// back to class matching independently, so a mapping that names only
/// one of the two still gets the other applied.
pub fn apply_dimensions(graph: &mut NodeGraph, aspect_ratio: &str, mapping: &NodeMapping) {
    let (width, height) = aspect::dimensions(aspect_ratio);

    let width_mapped = write_mapped_value(graph, &mapping.width_node_id, width);
    let height_mapped = write_mapped_value(graph, &mapping.height_node_id, height);

    for node in graph.values_mut() {
        if node_classes::takes_dimensions(&node.class_type) {
            if !width_mapped && node.has_input("width") {
                node.set_input("width", width);
            }
            if !height_mapped && node.has_input("height") {
                node.set_input("height", height);
            }
        }
    }
}

/// Write `value` on a mapped node if the mapping names one that exists.
fn write_mapped_value(graph: &mut NodeGraph, node_id: &Option<String>, value: u32) -> bool {
    match node_id.as_ref().and_then(|id| graph.get_mut(id)) {
        Some(node) => {
            node.set_input("value", value);
            true
        }
        None => false,
    }
}

/// Video-only knobs: longest-side bound and total frame count, both
/// written as `value` inputs of explicitly mapped nodes.
///
/// Public because the transition-video flow sets these without running
/// the full prompt-injection pipeline.
pub fn apply_video_params(graph: &mut NodeGraph, params: &JobParameters, mapping: &NodeMapping) {
    if let Some(node) = mapping
        .max_side_node_id
        .as_ref()
        .and_then(|id| graph.get_mut(id))
    {
        node.set_input("value", aspect::max_side(&params.aspect_ratio));
    }
    if let Some(frames) = params.frame_count {
        if let Some(node) = mapping
            .frame_count_node_id
            .as_ref()
            .and_then(|id| graph.get_mut(id))
        {
            node.set_input("value", frames);
        }
    }
}

// ---------------------------------------------------------------------------
// Rule 3: prompt injection
// ---------------------------------------------------------------------------

/// Inject prompt text, trying each tier over all nodes; the first
/// success stops injection. Returns the number of modified nodes
/// (0 or 1).
pub fn inject_prompt(graph: &mut NodeGraph, prompt: &str, mapping: &NodeMapping) -> usize {
    // Tier a: explicitly mapped node, overwritten unconditionally.
    if let Some(id) = &mapping.prompt_node_id {
        if let Some(node) = graph.get_mut(id) {
            set_prompt_input(node, prompt);
            tracing::debug!(node_id = %id, "Prompt set on mapped node");
            return 1;
        }
    }

    // Tier b: sentinel placeholder in the current text.
    for (id, node) in graph.iter_mut() {
        if node
            .text()
            .is_some_and(|t| t.contains(node_classes::PROMPT_SENTINEL))
        {
            node.set_text(prompt);
            tracing::debug!(node_id = %id, "Prompt replaced sentinel placeholder");
            return 1;
        }
    }

    // Tier c: empty or stub text.
    for (id, node) in graph.iter_mut() {
        if node
            .text()
            .is_some_and(|t| t.is_empty() || t == node_classes::PROMPT_STUB)
        {
            node.set_text(prompt);
            tracing::debug!(node_id = %id, "Prompt filled empty/stub text");
            return 1;
        }
    }

    // Tier d: first unprotected text-encode node, only when no node
    // was explicitly mapped.
    if mapping.prompt_node_id.is_none() {
        for id in node_ids_by_class(graph, node_classes::TEXT_ENCODE_TYPE) {
            let Some(node) = graph.get_mut(&id) else { continue };
            if node
                .text()
                .is_some_and(node_classes::is_protected_prompt)
            {
                continue;
            }
            node.set_text(prompt);
            tracing::debug!(node_id = %id, "Prompt set on first unprotected text-encode node");
            return 1;
        }
    }

    0
}

/// Write prompt text into whichever input the node's class exposes
/// (`text` for encode nodes, `prompt` for prompt-text helpers).
fn set_prompt_input(node: &mut Node, prompt: &str) {
    if node.class_type == node_classes::TEXT_ENCODE_TYPE || node.has_input("text") {
        node.set_text(prompt);
    } else if node.has_input("prompt") {
        node.set_input("prompt", prompt);
    } else {
        node.set_text(prompt);
    }
}

// ---------------------------------------------------------------------------
// Rule 4: seed assignment
// ---------------------------------------------------------------------------

/// Write the seed into every sampler/noise-class node, covering both
/// the `seed` and `noise_seed` spellings where the node declares them.
pub fn assign_seed(graph: &mut NodeGraph, seed: u64) {
    for node in graph.values_mut() {
        if node_classes::is_sampler(&node.class_type) {
            if node.has_input("seed") {
                node.set_input("seed", seed);
            }
            if node.has_input("noise_seed") {
                node.set_input("noise_seed", seed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rule 5: save-path prefix
// ---------------------------------------------------------------------------

/// Set `filename_prefix` on the save node(s). A configured save node
/// id restricts the write to that node; otherwise every save-class
/// node gets the prefix.
fn apply_save_prefix(graph: &mut NodeGraph, params: &JobParameters, mapping: &NodeMapping) {
    let (Some(novel_id), Some(entity_name)) = (&params.novel_id, &params.entity_name) else {
        return;
    };
    let prefix = naming::save_prefix(novel_id, entity_name);
    tracing::debug!(prefix = %prefix, "Applying save prefix");

    let configured = mapping
        .save_image_node_id
        .as_ref()
        .or(mapping.video_save_node_id.as_ref());

    for (id, node) in graph.iter_mut() {
        if !node_classes::is_save(&node.class_type) {
            continue;
        }
        if configured.is_none_or(|want| want == id) {
            node.set_input("filename_prefix", prefix.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Rule 6: reference-image wiring
// ---------------------------------------------------------------------------

/// Assign uploaded reference filenames to image-load nodes.
///
/// The Nth filename goes to the Nth explicitly mapped node id when
/// given, else to the Nth `LoadImage` node in declaration order.
/// Returns how many references were actually wired.
pub fn wire_reference_images(
    graph: &mut NodeGraph,
    filenames: &[String],
    mapping: &NodeMapping,
) -> usize {
    if filenames.is_empty() {
        return 0;
    }
    let load_ids = node_ids_by_class(graph, node_classes::IMAGE_LOAD_TYPE);
    let mut wired = 0;

    for (index, filename) in filenames.iter().enumerate() {
        let target = mapping
            .reference_image_node_ids
            .get(index)
            .filter(|id| graph.contains_key(*id))
            .cloned()
            .or_else(|| load_ids.get(index).cloned());

        match target.and_then(|id| graph.get_mut(&id).map(|n| (id, n))) {
            Some((id, node)) => {
                node.set_input("image", filename.clone());
                tracing::debug!(node_id = %id, filename = %filename, "Wired reference image");
                wired += 1;
            }
            None => {
                tracing::warn!(index, filename = %filename, "No load node for reference image");
            }
        }
    }
    wired
}

// ---------------------------------------------------------------------------
// Built-in portrait template
// ---------------------------------------------------------------------------

/// Built-in Flux text-to-image graph used when a caller supplies no
/// workflow template (character/scene portraits only).
pub fn default_portrait_graph(params: &JobParameters) -> NodeGraph {
    let (width, height) = aspect::dimensions(&params.aspect_ratio);
    let seed = params
        .seed
        .unwrap_or_else(|| rand::rng().random_range(1..(1u64 << 32)));
    let prefix = match (&params.novel_id, &params.entity_name) {
        (Some(novel_id), Some(name)) => naming::save_prefix(novel_id, name),
        _ => "character_".to_string(),
    };

    let mut graph = NodeGraph::new();
    graph.insert(
        "1".into(),
        Node::new("DualCLIPLoader")
            .with_input("clip_name1", "clip_l.safetensors")
            .with_input("clip_name2", "t5xxl_fp8_e4m3fn.safetensors")
            .with_input("type", "flux"),
    );
    graph.insert(
        "2".into(),
        Node::new("UNETLoader")
            .with_input("unet_name", "flux1-dev-fp8-e4m3fn.safetensors")
            .with_input("weight_dtype", "fp8_e4m3fn"),
    );
    graph.insert(
        "3".into(),
        Node::new("VAELoader").with_input("vae_name", "ae.safetensors"),
    );
    graph.insert(
        "4".into(),
        Node::new("EmptyFlux2LatentImage")
            .with_input("width", width)
            .with_input("height", height)
            .with_input("batch_size", 1),
    );
    graph.insert(
        "5".into(),
        Node::new("KSampler")
            .with_input("seed", seed)
            .with_input("steps", 20)
            .with_input("cfg", 1)
            .with_input("sampler_name", "euler")
            .with_input("scheduler", "simple")
            .with_input("denoise", 1)
            .with_link("model", "2", 0)
            .with_link("positive", "11", 0)
            .with_link("negative", "12", 0)
            .with_link("latent_image", "4", 0),
    );
    graph.insert(
        "6".into(),
        Node::new("VAEDecode")
            .with_link("samples", "5", 0)
            .with_link("vae", "3", 0),
    );
    graph.insert(
        "11".into(),
        Node::new("CLIPTextEncode")
            .with_input("text", params.prompt_text.clone())
            .with_link("clip", "1", 0),
    );
    graph.insert(
        "12".into(),
        Node::new("CLIPTextEncode")
            .with_input("text", "")
            .with_link("clip", "1", 0),
    );
    graph.insert(
        "13".into(),
        Node::new("SaveImage")
            .with_input("filename_prefix", prefix)
            .with_link("images", "6", 0),
    );
    graph
}
