//! Input validation primitives.
//!
//! Provides ergonomic helpers for common validation patterns:
//! - Validating non-empty strings
//! - Checking git branch names and remote URLs before they are stored

use crate::error::{Error, Result};

/// Require a string to be non-empty after trimming.
///
/// Returns a reference to the trimmed string on success.
pub fn require_non_empty<'a>(value: &'a str, field: &str, message: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::validation_invalid_argument(field, message, None, None))
    } else {
        Ok(trimmed)
    }
}

/// Reject branch names git would refuse or that could escape the checkout
/// root when used as a path segment.
pub fn require_branch_name(branch: &str) -> Result<&str> {
    let branch = require_non_empty(branch, "branch", "Branch name cannot be empty")?;

    let problem = if branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("Branch name cannot contain whitespace")
    } else if branch.contains("..") {
        Some("Branch name cannot contain '..'")
    } else if branch.starts_with('-') || branch.starts_with('/') {
        Some("Branch name cannot start with '-' or '/'")
    } else if branch.ends_with('/') || branch.ends_with(".lock") || branch.contains("//") {
        Some("Branch name has an invalid path component")
    } else if branch.contains(['~', '^', ':', '?', '*', '[', '\\']) {
        Some("Branch name contains a character git does not allow")
    } else {
        None
    };

    match problem {
        Some(problem) => Err(Error::validation_invalid_argument(
            "branch",
            problem,
            Some(branch.to_string()),
            None,
        )),
        None => Ok(branch),
    }
}

/// Require a clone URL git can fetch without prompting: `http://` or
/// `https://` with a host, or a `file://` path for local mirrors.
pub fn require_remote_url(url: &str) -> Result<&str> {
    let url = require_non_empty(url, "url", "Repository URL cannot be empty")?;

    let valid = if let Some(path) = url.strip_prefix("file://") {
        path.starts_with('/')
    } else {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        let host = rest.and_then(|r| r.split('/').next()).unwrap_or("");
        !host.rsplit('@').next().unwrap_or("").is_empty()
    };

    if !valid || url.contains(char::is_whitespace) {
        return Err(Error::validation_invalid_argument(
            "url",
            "Repository URL must be an http(s) or file:// URL",
            Some(url.to_string()),
            None,
        ));
    }

    Ok(url)
}
