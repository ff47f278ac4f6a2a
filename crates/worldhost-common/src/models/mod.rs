//! Data models shared between the session core, the control API and configuration.

pub mod session;
pub mod startup;
pub mod world;

pub use session::{SaveOutcome, SessionInfo, SupervisorState};
pub use startup::{AccessLevel, StartupParameters, WorldSource};
pub use world::{WorldRecord, WorldSettings};
