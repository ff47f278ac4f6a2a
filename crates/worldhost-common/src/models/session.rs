//! Session views returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::startup::{AccessLevel, StartupParameters};
use super::world::WorldRecord;

/// Where a session's supervisor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Running,
    /// Final save and teardown in progress.
    Stopping,
    /// Torn down; a replacement session is being started.
    Restarting,
    Stopped,
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub access_level: AccessLevel,
    pub user_count: usize,
    pub max_users: u32,
    pub state: SupervisorState,
    pub started_at: DateTime<Utc>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub idle_since: Option<DateTime<Utc>>,
    pub saving: bool,
    pub startup_parameters: StartupParameters,
}

/// Result of an explicit or background save request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved { record: WorldRecord },
    /// Another save on the same session is in flight; nothing was done.
    AlreadySaving,
    /// The world is not in a state where saving is permitted.
    NotSavable,
    Failed { message: String },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}
