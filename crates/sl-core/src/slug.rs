//! Slug rules for workflow and step identifiers
//!
//! A slug is `[A-Za-z_][A-Za-z0-9_]{0,127}`. The word `run` is reserved for
//! the run-input namespace and rejected everywhere a slug is accepted.

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum slug length, including the leading character.
pub const MAX_SLUG_LEN: usize = 128;

/// Reserved identifiers that can never name a workflow or step.
pub const RESERVED: &[&str] = &["run"];

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid pattern"))
}

/// Check whether `candidate` is a well-formed, non-reserved slug.
pub fn is_valid_slug(candidate: &str) -> bool {
    slug_pattern().is_match(candidate) && !RESERVED.contains(&candidate)
}

/// Validate a slug, naming the offending field in the error.
pub fn validate_slug(candidate: &str, field: &str) -> Result<()> {
    if RESERVED.contains(&candidate) {
        return Err(Error::Validation {
            message: format!("'{candidate}' is a reserved word"),
            field: Some(field.to_string()),
        });
    }
    if !slug_pattern().is_match(candidate) {
        return Err(Error::Validation {
            message: format!(
                "'{candidate}' is not a valid slug (expected [A-Za-z_][A-Za-z0-9_]{{0,127}})"
            ),
            field: Some(field.to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_slugs() {
        for slug in ["fetch", "process_items", "_private", "Step9", "a"] {
            assert!(is_valid_slug(slug), "{slug} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_slugs() {
        for slug in ["", "9lives", "has-dash", "has space", "ünicode"] {
            assert!(!is_valid_slug(slug), "{slug} should be invalid");
        }
    }

    #[test]
    fn rejects_overlong_slug() {
        let at_limit = "a".repeat(MAX_SLUG_LEN);
        let over_limit = "a".repeat(MAX_SLUG_LEN + 1);
        assert!(is_valid_slug(&at_limit));
        assert!(!is_valid_slug(&over_limit));
    }

    #[test]
    fn rejects_reserved_word() {
        assert!(!is_valid_slug("run"));
        // Only the exact word is reserved.
        assert!(is_valid_slug("run_report"));
    }

    #[test]
    fn error_names_the_field() {
        let err = validate_slug("run", "workflow_slug").unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("workflow_slug"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
