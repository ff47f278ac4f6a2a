//! Contract between the session core and the simulation engine.
//!
//! The engine owns the worlds. The core only holds `Arc<dyn World>` handles and
//! routes every mutation through [`EngineContext`], the engine's single
//! serialized execution context.

pub mod context;
pub mod memory;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;

use worldhost_common::models::{WorldRecord, WorldSettings, WorldSource};

pub use context::EngineContext;
pub use memory::{EngineEvent, EngineEventKind, InMemoryEngine, InMemoryEngineConfig, InMemoryWorld};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldState {
    Initializing,
    Running,
    Failed(String),
}

/// Published by the engine whenever a world crashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldFailure {
    pub session_id: String,
    pub reason: String,
}

/// What the engine needs to open a world.
#[derive(Debug, Clone)]
pub struct WorldStartSettings {
    /// `None` lets the engine assign an id.
    pub session_id: Option<String>,
    pub source: WorldSource,
    pub force_port: Option<u16>,
    pub wait_for_login: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine execution context is closed")]
    ContextClosed,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("failed to open world: {0}")]
    OpenFailed(String),

    #[error("save failed: {0}")]
    SaveFailed(String),

    #[error("{0}")]
    Rejected(String),
}

/// The shared simulation runtime.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn context(&self) -> &EngineContext;

    /// Begin opening a world. The returned world starts out `Initializing`.
    async fn open_world(&self, settings: WorldStartSettings) -> Result<Arc<dyn World>, EngineError>;

    fn subscribe_failures(&self) -> broadcast::Receiver<WorldFailure>;

    /// Id of the logged-in identity, `None` when anonymous.
    fn current_user_id(&self) -> Option<String>;

    /// Whether the logged-in identity may write records owned by `owner_id`.
    fn has_write_access(&self, owner_id: &str) -> bool;

    /// Engine-side bookkeeping when a world is formally exited. May hang; callers
    /// bound it with a timeout.
    async fn exit_world(&self, session_id: &str) -> Result<(), EngineError>;
}

/// A live world owned by the engine.
///
/// Plain getters are safe from any task. Methods documented as mutations must
/// be called from inside [`EngineContext::run`]. Long-running mutations only
/// start there and hand back a future that completes off the context; use
/// [`EngineContext::start`] for those.
pub trait World: Send + Sync + 'static {
    fn session_id(&self) -> &str;
    fn state(&self) -> WorldState;
    fn is_destroyed(&self) -> bool;
    /// Users present, including the host.
    fn user_count(&self) -> usize;
    fn settings(&self) -> WorldSettings;
    fn can_save(&self) -> bool;
    fn corresponding_record(&self) -> Option<WorldRecord>;

    /// Mutation.
    fn apply_settings(&self, settings: WorldSettings);
    /// Mutation.
    fn set_corresponding_record(&self, record: WorldRecord);
    /// Mutation.
    fn allow_user_to_join(&self, user_id: &str);
    /// Mutation.
    fn clear_default_roles(&self);
    /// Mutation. Fails when the role does not exist in this world.
    fn set_default_role(&self, username: &str, role: &str) -> Result<(), EngineError>;
    /// Mutation. Idempotent.
    fn destroy(&self);

    /// Mutation. Starts persisting the world into `record`; the future resolves
    /// to the record with its URL filled in.
    fn save(&self, record: WorldRecord) -> BoxFuture<'static, Result<WorldRecord, EngineError>>;
    /// Mutation. Starts loading the item at `url` into the scene.
    fn spawn_item(&self, url: &str) -> BoxFuture<'static, Result<(), EngineError>>;
    /// Mutation. Starts sending an invite, optionally preceded by `message`.
    fn send_invite(
        &self,
        username: &str,
        message: Option<&str>,
    ) -> BoxFuture<'static, Result<(), EngineError>>;
}
