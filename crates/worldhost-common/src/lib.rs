//! # worldhost-common
//!
//! Shared types, configuration, error handling, and utilities used across all worldhost crates.
//! This is the foundation layer: no session logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod validation;
