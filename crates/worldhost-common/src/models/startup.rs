//! Startup parameters: the intent used to (re)create a world session.
//!
//! The same shape is accepted by the control API, read from the `start_worlds`
//! config section, and regenerated from a live session before a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

/// Who may discover and join a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Private,
    Lan,
    Contacts,
    ContactsPlus,
    RegisteredUsers,
    Anyone,
}

/// Where the world content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorldSource {
    /// A saved world record URL.
    Url(String),
    /// A built-in preset name.
    Preset(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StartupParameters {
    /// Disabled entries in `start_worlds` are skipped at boot.
    pub is_enabled: bool,

    #[validate(length(max = 256, message = "Session name must be at most 256 characters"))]
    pub session_name: Option<String>,

    /// Requested session id. Empty means "let the engine assign one".
    pub custom_session_id: Option<String>,

    #[validate(length(max = 4096))]
    pub description: Option<String>,

    #[validate(range(min = 1, max = 256, message = "max_users must be between 1 and 256"))]
    pub max_users: u32,

    pub access_level: AccessLevel,
    pub use_custom_join_verifier: bool,
    pub hide_from_public_listing: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub mobile_friendly: bool,

    pub load_world_url: Option<String>,
    pub load_world_preset_name: Option<String>,
    pub override_corresponding_world_id: Option<String>,
    pub force_port: Option<u16>,

    // Permissions
    pub keep_original_roles: bool,
    /// username → role name
    pub default_user_roles: BTreeMap<String, String>,
    pub role_cloud_variable: Option<String>,
    pub allow_user_cloud_variable: Option<String>,
    pub deny_user_cloud_variable: Option<String>,
    pub required_user_join_cloud_variable: Option<String>,
    pub required_user_join_cloud_variable_deny_message: Option<String>,

    /// Minutes before an away user is kicked; ≤0 disables.
    pub away_kick_minutes: f64,
    pub parent_session_ids: Vec<String>,

    // Invites
    pub auto_invite_usernames: Vec<String>,
    pub auto_invite_message: Option<String>,
    pub invite_request_handler_usernames: Vec<String>,
    pub join_allowed_user_ids: Vec<String>,

    /// Owner for "save as" records; falls back to the logged-in identity.
    pub save_as_owner: Option<String>,

    // Supervision policy (seconds; ≤0 disables)
    pub auto_recover: bool,
    pub idle_restart_interval_secs: f64,
    pub forced_restart_interval_secs: f64,
    pub auto_save_interval_secs: f64,
    pub save_on_exit: bool,

    pub auto_sleep: bool,
    pub wait_for_login: bool,
}

impl Default for StartupParameters {
    fn default() -> Self {
        Self {
            is_enabled: true,
            session_name: None,
            custom_session_id: None,
            description: None,
            max_users: 16,
            access_level: AccessLevel::default(),
            use_custom_join_verifier: false,
            hide_from_public_listing: None,
            tags: None,
            mobile_friendly: false,
            load_world_url: None,
            load_world_preset_name: None,
            override_corresponding_world_id: None,
            force_port: None,
            keep_original_roles: false,
            default_user_roles: BTreeMap::new(),
            role_cloud_variable: None,
            allow_user_cloud_variable: None,
            deny_user_cloud_variable: None,
            required_user_join_cloud_variable: None,
            required_user_join_cloud_variable_deny_message: None,
            away_kick_minutes: -1.0,
            parent_session_ids: Vec::new(),
            auto_invite_usernames: Vec::new(),
            auto_invite_message: None,
            invite_request_handler_usernames: Vec::new(),
            join_allowed_user_ids: Vec::new(),
            save_as_owner: None,
            auto_recover: true,
            idle_restart_interval_secs: -1.0,
            forced_restart_interval_secs: -1.0,
            auto_save_interval_secs: -1.0,
            save_on_exit: false,
            auto_sleep: true,
            wait_for_login: false,
        }
    }
}

impl StartupParameters {
    /// Resolve the world source. A URL wins over a preset; blank values count as absent.
    pub fn world_source(&self) -> Option<WorldSource> {
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        non_blank(&self.load_world_url)
            .map(WorldSource::Url)
            .or_else(|| non_blank(&self.load_world_preset_name).map(WorldSource::Preset))
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        interval_from_secs(self.auto_save_interval_secs)
    }

    pub fn idle_restart_interval(&self) -> Option<Duration> {
        interval_from_secs(self.idle_restart_interval_secs)
    }

    pub fn forced_restart_interval(&self) -> Option<Duration> {
        interval_from_secs(self.forced_restart_interval_secs)
    }
}

/// Interval settings use seconds. Any value ≤0, non-finite, or too large for a
/// `Duration` means "disabled".
pub fn interval_from_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}
