//! Shared dashboard addressing.
//!
//! Shared dashboards live at `prefix.folder.segments.slug`. The slug is the
//! lowercased, dash-separated name (at most 40 characters) followed by a
//! random 6-character suffix.

use crate::error::{SyncError, SyncResult};
use livedash_core::validate_kv_key;

/// Maximum length of the name-derived part of a slug.
pub const MAX_SLUG_BASE_LEN: usize = 40;

const SUFFIX_LEN: usize = 6;
const FALLBACK_BASE: &str = "dashboard";

/// Name-derived slug base: lowercase ASCII alphanumerics joined by `-`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_SLUG_BASE_LEN));
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if out.len() >= MAX_SLUG_BASE_LEN {
            break;
        }
    }
    out.truncate(MAX_SLUG_BASE_LEN);
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        FALLBACK_BASE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Slug with a fresh random suffix.
pub fn generate_slug(name: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SUFFIX_LEN)
        .collect();
    format!("{}-{suffix}", slugify(name))
}

/// Normalize a user-entered folder path (`/` or `.` separated) into
/// dot-delimited segments. Empty input means the root folder.
pub fn normalize_folder(folder: &str) -> SyncResult<String> {
    let segments: Vec<String> = folder
        .split(|c: char| c == '.' || c == '/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let seg = slugify(s);
            if seg == FALLBACK_BASE && !s.eq_ignore_ascii_case(FALLBACK_BASE) {
                Err(SyncError::InvalidKey(format!("invalid folder segment '{s}'")))
            } else {
                Ok(seg)
            }
        })
        .collect::<SyncResult<_>>()?;
    Ok(segments.join("."))
}

/// Full key for a shared dashboard.
pub fn shared_key(prefix: &str, folder: &str, slug: &str) -> SyncResult<String> {
    let folder = normalize_folder(folder)?;
    let key = [prefix, folder.as_str(), slug]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(".");
    validate_kv_key(&key)?;
    Ok(key)
}

/// Split a shared key into `(folder, slug)` relative to `prefix`.
///
/// Returns `None` for keys outside the prefix.
pub fn split_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('.')?
    };
    if rest.is_empty() {
        return None;
    }
    Some(match rest.rfind('.') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => ("", rest),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Ops Overview"), "ops-overview");
        assert_eq!(slugify("  Plant #3 -- Power!  "), "plant-3-power");
        assert_eq!(slugify("???"), "dashboard");
        let long = "a".repeat(100);
        assert_eq!(slugify(&long).len(), MAX_SLUG_BASE_LEN);
    }

    #[test]
    fn test_generate_slug_has_random_suffix() {
        let a = generate_slug("Ops");
        let b = generate_slug("Ops");
        assert!(a.starts_with("ops-"));
        assert_eq!(a.len(), "ops-".len() + 6);
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_key_and_split() {
        let key = shared_key("dash", "Team A/Ops", "overview-abc123").unwrap();
        assert_eq!(key, "dash.team-a.ops.overview-abc123");
        assert_eq!(split_key("dash", &key), Some(("team-a.ops", "overview-abc123")));

        let root = shared_key("dash", "", "x-000000").unwrap();
        assert_eq!(root, "dash.x-000000");
        assert_eq!(split_key("dash", &root), Some(("", "x-000000")));
        assert_eq!(split_key("dash", "other.x"), None);
    }

    #[test]
    fn test_invalid_folder_rejected() {
        assert!(matches!(
            normalize_folder("ok/%%%"),
            Err(SyncError::InvalidKey(_))
        ));
    }
}
