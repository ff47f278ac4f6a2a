//! Input validation utilities.
//!
//! Request bodies go through `validator`; session ids and cloud variable paths
//! are checked with the helpers below.

use regex::Regex;
use std::sync::LazyLock;
use validator::Validate;

use crate::error::HostError;
use crate::ids::{SESSION_ID_PREFIX, USER_SESSION_ID_PREFIX};

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^S-[A-Za-z0-9_\-:.]{1,128}$").expect("static regex")
});

static CLOUD_VARIABLE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(U|G)-[^.\s]+\.[A-Za-z0-9_.\-]+$").expect("static regex")
});

/// Validate a request body, returning a HostError::Validation on failure.
pub fn validate_request<T: Validate>(body: &T) -> Result<(), HostError> {
    body.validate().map_err(|e| HostError::Validation {
        message: format_validation_errors(e),
    })
}

fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Turn a requested custom session id into canonical form.
///
/// Blank input means "no custom id". Ids missing the `S-` prefix get it added.
pub fn normalize_custom_session_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with(SESSION_ID_PREFIX) {
        Some(trimmed.to_owned())
    } else {
        Some(format!("{SESSION_ID_PREFIX}{trimmed}"))
    }
}

pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

/// Owner of a user-scoped custom session id (`S-U-alice:lobby` → `U-alice`).
pub fn custom_session_id_owner(id: &str) -> Option<String> {
    let rest = id.strip_prefix(USER_SESSION_ID_PREFIX)?;
    let (name, _) = rest.split_once(':')?;
    if name.is_empty() {
        return None;
    }
    Some(format!("U-{name}"))
}

/// Cloud variable paths look like `U-owner.variable.name` or `G-group.variable`.
pub fn is_valid_cloud_variable_path(path: &str) -> bool {
    CLOUD_VARIABLE_PATH_RE.is_match(path)
}
