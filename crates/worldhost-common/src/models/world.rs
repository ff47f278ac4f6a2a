//! Observable state of a live world and the record it persists to.

use serde::{Deserialize, Serialize};

use super::startup::AccessLevel;

/// Settings currently in effect on a live world.
///
/// Startup parameters are applied onto this shape, and a restart regenerates
/// parameters from it, so anything changed on the live world survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSettings {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub access_level: AccessLevel,
    pub max_users: u32,
    pub hide_from_listing: bool,
    pub mobile_friendly: bool,
    pub use_custom_join_verifier: bool,
    /// `None` when away-kick is disabled.
    pub away_kick_minutes: Option<f32>,
    pub auto_sleep: bool,
    pub save_on_exit: bool,
    pub corresponding_world_id: Option<String>,
    pub parent_session_ids: Vec<String>,
    pub invite_request_handlers: Vec<String>,
    pub role_cloud_variable: Option<String>,
    pub allow_user_cloud_variable: Option<String>,
    pub deny_user_cloud_variable: Option<String>,
    pub required_user_join_cloud_variable: Option<String>,
    pub required_user_join_cloud_variable_deny_message: Option<String>,
}

/// A persisted world record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldRecord {
    pub record_id: String,
    pub owner_id: String,
    /// Set once the record has been saved at least once.
    pub url: Option<String>,
}

impl WorldRecord {
    pub fn new(record_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            owner_id: owner_id.into(),
            url: None,
        }
    }

    /// Canonical record URL: `record:///<owner>/<record>`.
    pub fn canonical_url(&self) -> String {
        format!("record:///{}/{}", self.owner_id, self.record_id)
    }
}
