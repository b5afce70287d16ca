//! Aspect-ratio resolution for canvas sizing.
//!
//! ComfyUI latent nodes want concrete pixel dimensions; callers speak
//! in aspect-ratio tokens (`"16:9"`, `"9:16"`, ...). All dimensions
//! are multiples of 64 as required by the diffusion backends.

/// Aspect-ratio token → (width, height) in pixels.
pub const ASPECT_RATIOS: &[(&str, (u32, u32))] = &[
    ("16:9", (1088, 704)),
    ("9:16", (1088, 1920)),
    ("4:3", (1088, 832)),
    ("3:4", (832, 1088)),
    ("1:1", (1088, 1088)),
    ("21:9", (1088, 480)),
    ("2.35:1", (1088, 480)),
];

/// Dimensions used when the token is not recognised (portrait 9:16).
pub const FALLBACK_DIMENSIONS: (u32, u32) = (1088, 1920);

/// Resolve an aspect-ratio token to pixel dimensions.
///
/// Unknown tokens fall back to [`FALLBACK_DIMENSIONS`] rather than
/// erroring — an unrecognised ratio should never abort a job.
pub fn dimensions(aspect_ratio: &str) -> (u32, u32) {
    ASPECT_RATIOS
        .iter()
        .find(|(token, _)| *token == aspect_ratio)
        .map(|(_, dims)| *dims)
        .unwrap_or(FALLBACK_DIMENSIONS)
}

/// Longest-side bound for video generation at a given aspect ratio.
///
/// Video workflows scale the reference frame to a maximum side length
/// instead of taking explicit width/height.
pub fn max_side(aspect_ratio: &str) -> u32 {
    match aspect_ratio {
        "16:9" | "21:9" | "2.35:1" => 1280,
        "1:1" => 1024,
        _ => 960,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ratio_resolves() {
        assert_eq!(dimensions("16:9"), (1088, 704));
        assert_eq!(dimensions("3:4"), (832, 1088));
    }

    #[test]
    fn cinemascope_matches_ultrawide() {
        assert_eq!(dimensions("2.35:1"), dimensions("21:9"));
    }

    #[test]
    fn unknown_ratio_falls_back_to_portrait() {
        assert_eq!(dimensions("5:7"), (1088, 1920));
        assert_eq!(dimensions(""), FALLBACK_DIMENSIONS);
    }

    #[test]
    fn all_dimensions_are_multiples_of_64() {
        for (token, (w, h)) in ASPECT_RATIOS {
            assert_eq!(w % 64, 0, "{token} width");
            assert_eq!(h % 64, 0, "{token} height");
        }
    }

    #[test]
    fn max_side_per_ratio() {
        assert_eq!(max_side("16:9"), 1280);
        assert_eq!(max_side("2.35:1"), 1280);
        assert_eq!(max_side("1:1"), 1024);
        assert_eq!(max_side("9:16"), 960);
        assert_eq!(max_side("5:7"), 960);
    }
}
