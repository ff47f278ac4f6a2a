//! API route modules.

pub mod health;
pub mod host;
pub mod sessions;
