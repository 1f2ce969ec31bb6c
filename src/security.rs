#![forbid(unsafe_code)]

//! Shared security helpers: refusing to run as root and validating the
//! client-supplied tokens before they are handed to the extractor.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

use crate::error::{JobError, JobResult};

const MAX_URL_LEN: usize = 2048;
const MAX_FORMAT_ID_LEN: usize = 128;

/// Fails fast when the backend is started as root. The extractor runs with
/// the backend's privileges and writes into the downloads root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Checks that `raw` is an absolute http(s) URL with a host and returns its
/// trimmed form.
pub fn validate_url(raw: &str) -> JobResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(JobError::validation("Please provide a video URL"));
    }
    if trimmed.len() > MAX_URL_LEN {
        return Err(JobError::validation("URL is too long"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(JobError::validation("URL contains control characters"));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| JobError::validation(format!("Please provide a valid URL ({err})")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobError::validation("Only http and https URLs are supported"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(JobError::validation("URL must include a host"));
    }
    Ok(trimmed.to_string())
}

/// Format selectors are short tokens such as `137`, `bestaudio` or
/// `best[height<=720]`. A leading `-` is refused so the value can never be
/// read as an option by the extractor.
pub fn validate_format_id(raw: &str) -> JobResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(JobError::validation("Please provide a format ID"));
    }
    if trimmed.len() > MAX_FORMAT_ID_LEN {
        return Err(JobError::validation("format ID is too long"));
    }
    if trimmed.starts_with('-') {
        return Err(JobError::validation("format ID must not start with '-'"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "_-+./[]<>=!?*,:~".contains(c);
    if let Some(bad) = trimmed.chars().find(|c| !allowed(*c)) {
        return Err(JobError::validation(format!(
            "format ID contains an unsupported character: {bad:?}"
        )));
    }
    Ok(trimmed.to_string())
}
