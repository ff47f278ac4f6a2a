//! Identifier generation for sessions and world records.
//!
//! Record ids use UUID v7 so they sort by creation time. Session ids only need
//! to be unique, so they use random v4 UUIDs.

use uuid::Uuid;

/// Every session id starts with this prefix.
pub const SESSION_ID_PREFIX: &str = "S-";

/// Prefix marking a session id as belonging to a user: `S-U-<name>:<suffix>`.
pub const USER_SESSION_ID_PREFIX: &str = "S-U-";

pub const RECORD_ID_PREFIX: &str = "R-";

pub fn generate_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn generate_record_id() -> String {
    format!("{RECORD_ID_PREFIX}{}", Uuid::now_v7())
}
