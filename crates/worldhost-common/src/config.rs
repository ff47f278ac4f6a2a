//! Host configuration loaded from a config file and environment variables.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > worldhost.toml > defaults

use serde::Deserialize;
use std::time::Duration;

use crate::models::StartupParameters;

/// Load configuration.
///
/// `path` names the config file without extension (`worldhost` → `worldhost.toml`).
/// A missing file is not an error; defaults and environment still apply.
pub fn init(path: &str) -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 7870)?
        .set_default("host.shutdown_timeout_secs", 30)?
        .set_default("host.supervisor_tick_ms", 1000)?
        .set_default("host.init_poll_ms", 100)?
        .set_default("host.world_exit_timeout_secs", 10)?
        .set_default("engine.init_delay_ms", 250)?
        .add_source(config::File::with_name(path).required(false))
        // WORLDHOST_SERVER__PORT, WORLDHOST_HOST__SHUTDOWN_TIMEOUT_SECS, ...
        .add_source(
            config::Environment::with_prefix("WORLDHOST")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub host: HostConfig,
    pub engine: EngineConfig,
    /// Worlds started when the host boots.
    #[serde(default)]
    pub start_worlds: Vec<StartupParameters>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Control API bind address.
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// How long `StopAll` may take before remaining sessions are abandoned.
    pub shutdown_timeout_secs: u64,
    pub supervisor_tick_ms: u64,
    /// Poll interval while a freshly opened world is initializing.
    pub init_poll_ms: u64,
    /// Upper bound on the detached engine "exit world" call during teardown.
    pub world_exit_timeout_secs: u64,
    /// Item URLs spawned into every newly started world.
    #[serde(default)]
    pub auto_spawn_items: Vec<String>,
}

impl HostConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms.max(1))
    }

    pub fn init_poll(&self) -> Duration {
        Duration::from_millis(self.init_poll_ms.max(1))
    }

    pub fn world_exit_timeout(&self) -> Duration {
        Duration::from_secs(self.world_exit_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Identity the host is logged in as. `None` runs anonymously, which
    /// disables saving to user-owned records.
    pub user_id: Option<String>,
    /// Simulated world initialization time for the bundled in-memory engine.
    pub init_delay_ms: u64,
}
