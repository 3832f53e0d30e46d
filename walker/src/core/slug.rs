//! Slug validation for issue identifiers.

use anyhow::{Result, anyhow};

/// Validate that a slug is safe for use as an issue directory name.
///
/// Slugs must match `^[a-z0-9][a-z0-9-]*$` and are unique across both the
/// open and closed partitions of a walk.
pub fn validate_slug(slug: &str) -> Result<()> {
    let mut chars = slug.chars();
    let first = chars
        .next()
        .ok_or_else(|| anyhow!("slug must not be empty"))?;
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(anyhow!(
            "slug must start with [a-z0-9] (got '{slug}')"
        ));
    }
    if chars.any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')) {
        return Err(anyhow!("slug must be [a-z0-9-] only (got '{slug}')"));
    }
    Ok(())
}

/// Derive the issue type from an explicit value, the title prefix, or the slug prefix.
///
/// The type is free-form, not an enum: `"fix: flaky test"` yields `fix`,
/// slug `probe-cache-miss` yields `probe`.
pub fn derive_kind(explicit: Option<&str>, title: &str, slug: &str) -> String {
    if let Some(kind) = explicit {
        let kind = kind.trim();
        if !kind.is_empty() {
            return kind.to_string();
        }
    }
    if let Some((prefix, _)) = title.split_once(':') {
        let prefix = prefix.trim();
        if !prefix.is_empty() && !prefix.contains(' ') {
            return prefix.to_lowercase();
        }
    }
    match slug.split_once('-') {
        Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
        _ => slug.to_string(),
    }
}
