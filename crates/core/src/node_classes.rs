//! Node-class dispatch tables for ComfyUI graph templating.
//!
//! ComfyUI dispatches on a node's `class_type` string. Rather than
//! scattering string comparisons through the templating code, every
//! behaviour is described here as a named table: which classes are
//! cosmetic, which take seeds, which consume canvas dimensions, and so
//! on. Each table can be unit-tested and extended without touching
//! control flow.

// ---------------------------------------------------------------------------
// Class sets
// ---------------------------------------------------------------------------

/// Editor-only node types with no execution semantics. Filtered out
/// during UI→API conversion and never parameterized.
pub const UI_ONLY_TYPES: &[&str] = &["Note", "Reroute", "PrimitiveNode", "Comment", "Group"];

/// Sampler/noise classes that accept a `seed` (and sometimes
/// `noise_seed`) input.
pub const SAMPLER_TYPES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "SamplerCustom",
    "SamplerCustomAdvanced",
    "RandomNoise",
    "PainterSamplerLTXV",
];

/// Classes that consume canvas dimensions via `width`/`height` inputs:
/// latent-image sizing nodes plus scheduler nodes.
pub const DIMENSION_TYPES: &[&str] = &[
    "EmptySD3LatentImage",
    "EmptyFlux2LatentImage",
    "EmptyLatentImage",
    "Flux2Scheduler",
];

/// Text-encoding class targeted by the prompt-injection fallback tier.
pub const TEXT_ENCODE_TYPE: &str = "CLIPTextEncode";

/// Class that loads an uploaded image by filename.
pub const IMAGE_LOAD_TYPE: &str = "LoadImage";

/// Classes whose execution produces a retrievable artifact.
pub const SAVE_TYPES: &[&str] = &["SaveImage", "VHS_VideoCombine"];

// ---------------------------------------------------------------------------
// Widget layouts (UI→API conversion)
// ---------------------------------------------------------------------------

/// Positional widget layouts: class type → ordered input names for the
/// node's inline `widgets_values`. Only classes listed here get their
/// widget values carried into the API graph; everything else keeps
/// link inputs only.
pub const WIDGET_LAYOUTS: &[(&str, &[&str])] = &[
    ("CheckpointLoaderSimple", &["ckpt_name"]),
    ("VAELoader", &["vae_name"]),
    ("LoadImage", &["image"]),
    ("CLIPTextEncode", &["text"]),
];

/// Look up the positional widget layout for a node class.
pub fn widget_layout(class_type: &str) -> Option<&'static [&'static str]> {
    WIDGET_LAYOUTS
        .iter()
        .find(|(ty, _)| *ty == class_type)
        .map(|(_, names)| *names)
}

// ---------------------------------------------------------------------------
// Prompt-injection rule data
// ---------------------------------------------------------------------------

/// Placeholder substring replaced by the generated prompt text.
pub const PROMPT_SENTINEL: &str = "{CHARACTER_PROMPT}";

/// Stub text authors leave in templates; treated the same as empty.
pub const PROMPT_STUB: &str = "prompt here";

/// Placeholder token rewritten with the caller's style string.
pub const STYLE_PLACEHOLDER: &str = "##STYLE##";

/// Text-encode nodes whose current text contains one of these
/// (case-insensitive) are negative prompts and must not be overwritten.
pub const NEGATIVE_PROMPT_KEYWORDS: &[&str] = &["negative", "bad", "worst"];

/// Text-encode nodes carrying reference-pose directives (character
/// turnaround sheets) are likewise off-limits to the fallback tier.
pub const REFERENCE_POSE_KEYWORDS: &[&str] = &["三视图", "正面"];

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Check whether a node class is editor-only (no execution semantics).
pub fn is_ui_only(class_type: &str) -> bool {
    UI_ONLY_TYPES.contains(&class_type)
}

/// Check whether a node class accepts seed inputs.
pub fn is_sampler(class_type: &str) -> bool {
    SAMPLER_TYPES.contains(&class_type)
}

/// Check whether a node class consumes canvas dimensions.
pub fn takes_dimensions(class_type: &str) -> bool {
    DIMENSION_TYPES.contains(&class_type)
}

/// Check whether a node class produces a retrievable artifact.
pub fn is_save(class_type: &str) -> bool {
    SAVE_TYPES.contains(&class_type)
}

/// Check whether prompt text is protected from fallback injection
/// (negative prompt or reference-pose directive).
pub fn is_protected_prompt(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if NEGATIVE_PROMPT_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return true;
    }
    REFERENCE_POSE_KEYWORDS.iter().any(|kw| text.contains(kw))
}
