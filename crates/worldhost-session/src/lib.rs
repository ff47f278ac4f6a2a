//! # worldhost-session
//!
//! Starts, supervises, autosaves, idles-out, force-restarts, recovers and stops
//! world sessions running on a single shared [`Engine`].
//!
//! - [`SessionManager`] is the facade used by the control API and the host binary.
//! - Each registered session is a [`RunningSession`] owned by the [`SessionRegistry`]
//!   and driven by its own supervisor task.
//! - Every world mutation goes through the engine's serialized [`EngineContext`].

pub mod configure;
pub mod engine;
pub mod manager;
pub mod record;
pub mod registry;
mod supervisor;

pub use engine::{
    Engine, EngineContext, EngineError, InMemoryEngine, World, WorldFailure, WorldStartSettings,
    WorldState,
};
pub use manager::{ManagerSettings, SessionManager};
pub use record::{RestartReason, RunningSession, SessionPolicy, SessionTimers, TickPlan};
pub use registry::SessionRegistry;
