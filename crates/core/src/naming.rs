//! Save-path naming rules for generated artifacts.
//!
//! Character and scene names come from user-authored novels and may
//! contain anything (CJK text, slashes, wildcards). They are reduced
//! to a filesystem-safe slug before being handed to the backend as a
//! `filename_prefix`.

use std::sync::LazyLock;

use regex::Regex;

/// Slug used when sanitization leaves nothing behind.
pub const DEFAULT_SLUG: &str = "character";

// `\w` is Unicode-aware: CJK characters survive, punctuation does not.
static STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Sanitize a free-text name into a save-path slug.
///
/// Strips everything outside word characters / whitespace / hyphens,
/// trims the edges, and collapses internal whitespace runs to a single
/// underscore. An empty result becomes [`DEFAULT_SLUG`] so the backend
/// never receives a bare prefix.
pub fn sanitize_slug(name: &str) -> String {
    let stripped = STRIP_RE.replace_all(name, "");
    let trimmed = stripped.trim();
    let slug = WHITESPACE_RE.replace_all(trimmed, "_");
    if slug.is_empty() {
        DEFAULT_SLUG.to_string()
    } else {
        slug.into_owned()
    }
}

/// Compose the artifact save prefix for one novel entity.
///
/// Convention: `story_{novel_id}/{slug}` — one directory per novel,
/// one file family per character/scene.
pub fn save_prefix(novel_id: &str, entity_name: &str) -> String {
    format!("story_{novel_id}/{}", sanitize_slug(entity_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_passes_through() {
        assert_eq!(sanitize_slug("Dragon"), "Dragon");
    }

    #[test]
    fn spaces_become_single_underscores() {
        assert_eq!(sanitize_slug("Elder  Mage   Lin"), "Elder_Mage_Lin");
    }

    #[test]
    fn punctuation_is_stripped_cjk_survives() {
        let slug = sanitize_slug("三视图/Dragon*?");
        assert_eq!(slug, "三视图Dragon");
        for forbidden in ['/', '*', '?'] {
            assert!(!slug.contains(forbidden));
        }
    }

    #[test]
    fn edges_are_trimmed() {
        assert_eq!(sanitize_slug("  Hero  "), "Hero");
        assert!(!sanitize_slug("  a b  ").starts_with('_'));
    }

    #[test]
    fn empty_input_gets_default() {
        assert_eq!(sanitize_slug(""), DEFAULT_SLUG);
        assert_eq!(sanitize_slug("***"), DEFAULT_SLUG);
        assert_eq!(sanitize_slug("   "), DEFAULT_SLUG);
    }

    #[test]
    fn save_prefix_composition() {
        assert_eq!(save_prefix("42", "Elder Mage"), "story_42/Elder_Mage");
    }
}
