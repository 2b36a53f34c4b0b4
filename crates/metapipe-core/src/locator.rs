//! Locator normalization and policy checks.
//!
//! A locator is either a relative POSIX path or a URL. Both are reduced to a
//! canonical string so that two spellings of the same artifact compare equal.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

/// Which locator shapes a run accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LocatorPolicy {
    /// Accept `/abs/path` and `C:/path` locators.
    pub allow_absolute: bool,
    /// Accept `..` path segments.
    pub allow_parent_segments: bool,
    /// Accept URLs whose scheme is not http or https.
    pub allow_non_http_urls: bool,
}

/// Why a locator was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("locator is empty")]
    Empty,

    #[error("absolute path {0:?} is not allowed")]
    Absolute(String),

    #[error("parent-directory segment in {0:?} is not allowed")]
    ParentSegment(String),

    #[error("URL scheme {scheme:?} is not allowed in {locator:?}")]
    Scheme { scheme: String, locator: String },

    #[error("invalid URL {locator:?}: {reason}")]
    InvalidUrl { locator: String, reason: String },
}

/// Whether `raw` is shaped like a URL (`scheme://...`).
pub fn is_url(raw: &str) -> bool {
    match raw.find("://") {
        Some(idx) if idx > 0 => raw[..idx]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
        _ => false,
    }
}

/// Normalize and validate a locator against `policy`.
pub fn normalize_locator(raw: &str, policy: &LocatorPolicy) -> Result<String, LocatorError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LocatorError::Empty);
    }
    if is_url(trimmed) {
        canonicalize_url(trimmed, policy)
    } else {
        normalize_path(trimmed, policy)
    }
}

/// Lowercase scheme and host, strip default ports, drop the fragment.
pub fn canonicalize_url(raw: &str, policy: &LocatorPolicy) -> Result<String, LocatorError> {
    let mut url = Url::parse(raw).map_err(|e| LocatorError::InvalidUrl {
        locator: raw.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = url.scheme().to_ascii_lowercase();
    if !policy.allow_non_http_urls && scheme != "http" && scheme != "https" {
        return Err(LocatorError::Scheme {
            scheme,
            locator: raw.to_string(),
        });
    }

    url.set_fragment(None);

    // Special schemes get lowercased hosts and default-port stripping from the
    // parser; other schemes keep their host verbatim, so lowercase it here.
    if let Some(host) = url.host_str().map(str::to_ascii_lowercase) {
        let _ = url.set_host(Some(&host));
    }
    if url.port().is_some() && url.port() == default_port(&scheme) {
        let _ = url.set_port(None);
    }

    Ok(url.to_string())
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Forward slashes, no `.` segments, no empty segments.
pub fn normalize_path(raw: &str, policy: &LocatorPolicy) -> Result<String, LocatorError> {
    let unified = raw.replace('\\', "/");
    let leading_slash = unified.starts_with('/');
    let absolute = leading_slash || has_drive_prefix(&unified);
    if absolute && !policy.allow_absolute {
        return Err(LocatorError::Absolute(raw.to_string()));
    }

    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if !policy.allow_parent_segments && segments.iter().any(|s| *s == "..") {
        return Err(LocatorError::ParentSegment(raw.to_string()));
    }
    if segments.is_empty() {
        return Err(LocatorError::Empty);
    }

    let joined = segments.join("/");
    Ok(if leading_slash {
        format!("/{joined}")
    } else {
        joined
    })
}

/// Root-relative POSIX path of `path`, or `None` when it is outside `root`.
pub fn relative_posix(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
