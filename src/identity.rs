//! Identity normalization.
//!
//! Turns handles, profile URLs and display names into comparable tokens so the
//! same creator can be matched across platforms:
//!
//! ```
//! use creatorlink::identity::{normalize, to_handle};
//!
//! assert_eq!(normalize("https://instagram.com/@Jane.Doe/"), "jane.doe");
//! assert_eq!(to_handle("https://instagram.com/@Jane.Doe/"), "@jane.doe");
//! ```
//!
//! Normalization never fails: anything unusable collapses to an empty string.

use std::collections::BTreeSet;

/// Hosts whose profile URLs carry the handle as the last path segment.
const PLATFORM_HOSTS: &[&str] = &[
    "instagram.com",
    "tiktok.com",
    "youtube.com",
    "twitter.com",
    "x.com",
    "facebook.com",
    "threads.net",
    "linkedin.com",
];

/// Canonicalize a handle, profile URL or display name.
///
/// Rules, applied in order:
/// - trim and lower-case
/// - drop a `scheme://` prefix and any `?query` / `#fragment` suffix
/// - drop trailing slashes
/// - for known platform hosts, keep only the final path segment
/// - drop a single leading `@`
/// - drop every character outside `[a-z0-9._-]`
pub fn normalize(token: &str) -> String {
    let mut value = token.trim().to_lowercase();

    if let Some(idx) = value.find("://") {
        value.replace_range(..idx + 3, "");
    }
    if let Some(idx) = value.find(|c: char| c == '?' || c == '#') {
        value.truncate(idx);
    }

    let trimmed = value.trim_end_matches('/');
    let reduced = match trimmed.split_once('/') {
        Some((host, path)) if is_platform_host(host) => {
            path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("")
        }
        _ => trimmed,
    };
    let reduced = reduced.strip_prefix('@').unwrap_or(reduced);

    reduced
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(*c, '.' | '_' | '-'))
        .collect()
}

/// Same as [`normalize`], with `None` mapping to an empty string.
pub fn normalize_opt(token: Option<&str>) -> String {
    token.map(normalize).unwrap_or_default()
}

/// Normalized token with a single leading `@`, or empty when nothing is left.
pub fn to_handle(token: &str) -> String {
    let normalized = normalize(token);
    if normalized.is_empty() {
        String::new()
    } else {
        format!("@{}", normalized)
    }
}

/// Normalized token with all punctuation removed (`jane.doe` -> `janedoe`).
pub fn condense(token: &str) -> String {
    normalize(token)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Every comparable form of the given values.
///
/// Each value contributes its normalized token and its condensed form, so
/// `jane.doe`, `Jane_Doe` and `@janedoe` all share the variant `janedoe`.
pub fn variants<'a, I>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut out = BTreeSet::new();
    for value in values.into_iter().flatten() {
        let normalized = normalize(value);
        if normalized.is_empty() {
            continue;
        }
        let condensed: String = normalized
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if !condensed.is_empty() {
            out.insert(condensed);
        }
        out.insert(normalized);
    }
    out
}

/// True when two identities share at least one variant.
pub fn same_identity(a: &str, b: &str) -> bool {
    let left = variants([Some(a)]);
    let right = variants([Some(b)]);
    !left.is_disjoint(&right)
}

fn is_platform_host(host: &str) -> bool {
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(host);
    PLATFORM_HOSTS.contains(&host)
}
