//! Session lifecycle manager: the facade over the engine and the registry.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use worldhost_common::config::HostConfig;
use worldhost_common::error::{HostError, HostResult};
use worldhost_common::models::{SaveOutcome, StartupParameters, WorldRecord};
use worldhost_common::validation::{
    custom_session_id_owner, is_valid_session_id, normalize_custom_session_id, validate_request,
};

use crate::configure;
use crate::engine::{Engine, EngineError, World, WorldStartSettings, WorldState};
use crate::record::RunningSession;
use crate::registry::SessionRegistry;
use crate::supervisor;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub supervisor_tick: Duration,
    pub init_poll: Duration,
    pub world_exit_timeout: Duration,
    /// Item URLs loaded into every new world.
    pub auto_spawn_items: Vec<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            supervisor_tick: Duration::from_secs(1),
            init_poll: Duration::from_millis(100),
            world_exit_timeout: Duration::from_secs(10),
            auto_spawn_items: Vec::new(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(host: &HostConfig) -> Self {
        Self {
            supervisor_tick: host.supervisor_tick(),
            init_poll: host.init_poll(),
            world_exit_timeout: host.world_exit_timeout(),
            auto_spawn_items: host.auto_spawn_items.clone(),
        }
    }
}

/// Starts, stops and saves sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    registry: SessionRegistry,
    settings: ManagerSettings,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn Engine>, registry: SessionRegistry, settings: ManagerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                registry,
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Cancelled once the host begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuse new starts and signal the host to drain.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Shutdown requested");
            self.inner.shutdown.cancel();
        }
    }

    /// Open a world, wait for it to initialize, apply `params`, register the
    /// session and spawn its supervisor.
    ///
    /// Nothing is registered unless every step succeeds. `cancel` aborts the
    /// wait for initialization.
    pub async fn start_world(
        &self,
        params: StartupParameters,
        cancel: CancellationToken,
    ) -> HostResult<Arc<RunningSession>> {
        self.start_world_boxed(params, cancel).await
    }

    /// Boxed so the supervisor can restart sessions through it.
    pub(crate) fn start_world_boxed(
        &self,
        params: StartupParameters,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, HostResult<Arc<RunningSession>>> {
        let this = self.clone();
        Box::pin(async move { this.start_world_inner(params, cancel).await })
    }

    async fn start_world_inner(
        self,
        mut params: StartupParameters,
        cancel: CancellationToken,
    ) -> HostResult<Arc<RunningSession>> {
        if self.is_shutting_down() {
            return Err(HostError::ShuttingDown);
        }
        validate_request(&params)?;
        let source = params.world_source().ok_or_else(|| {
            HostError::validation("Require load_world_url or load_world_preset_name")
        })?;
        params.custom_session_id = self.sanitize_session_id(params.custom_session_id.as_deref())?;

        let engine = self.inner.engine.clone();
        let world = engine
            .open_world(WorldStartSettings {
                session_id: params.custom_session_id.clone(),
                source,
                force_port: params.force_port,
                wait_for_login: params.wait_for_login,
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open world");
                HostError::StartFailed {
                    message: e.to_string(),
                }
            })?;

        self.wait_until_running(&world, &cancel).await?;

        if let Err(e) = configure::apply_parameters(engine.as_ref(), &world, &params).await {
            tracing::error!(session = %world.session_id(), error = %e, "Failed to apply startup parameters");
            self.discard(&world).await;
            return Err(HostError::StartFailed {
                message: e.to_string(),
            });
        }

        let session = Arc::new(RunningSession::new(
            world,
            engine,
            params,
            CancellationToken::new(),
        ));

        let failures = self.inner.engine.subscribe_failures();
        let (registered_tx, registered_rx) = oneshot::channel();
        let handle = tokio::spawn(supervisor::supervise(
            self.clone(),
            session.clone(),
            failures,
            registered_rx,
        ));
        session.attach_supervisor(handle);

        if let Err(e) = self.inner.registry.insert(session.clone()).await {
            tracing::error!(session = %session.id(), "Engine reported a duplicate session id");
            session.cancel_token().cancel();
            drop(registered_tx);
            session.join().await;
            return Err(e);
        }

        // Shutdown may have begun while the world was opening; stop_all
        // snapshots the registry after that, so back out instead.
        if self.is_shutting_down() {
            tracing::info!(session = %session.id(), "Shutdown began during start, discarding world");
            self.inner.registry.remove_if_same(&session).await;
            session.cancel_token().cancel();
            drop(registered_tx);
            session.join().await;
            return Err(HostError::ShuttingDown);
        }
        let _ = registered_tx.send(());

        tracing::info!(
            session = %session.id(),
            world = %session.world().settings().name,
            "World started"
        );
        self.spawn_auto_items(&session);
        Ok(session)
    }

    /// Normalize a requested custom id. Invalid ids and ids owned by someone
    /// other than the logged-in identity are rejected.
    fn sanitize_session_id(&self, raw: Option<&str>) -> HostResult<Option<String>> {
        let Some(id) = raw.and_then(normalize_custom_session_id) else {
            return Ok(None);
        };

        if !is_valid_session_id(&id) {
            tracing::warn!(session = %id, "Invalid custom session id");
            return Err(HostError::validation(format!("Invalid custom session id: {id}")));
        }

        let owner = custom_session_id_owner(&id);
        let current = self.inner.engine.current_user_id();
        if owner != current {
            tracing::warn!(
                session = %id,
                current = current.as_deref().unwrap_or("anonymous"),
                "Cannot use a session id owned by another user"
            );
            return Err(HostError::validation(format!(
                "Session id {id} is not owned by the logged-in user"
            )));
        }

        Ok(Some(id))
    }

    async fn wait_until_running(
        &self,
        world: &Arc<dyn World>,
        cancel: &CancellationToken,
    ) -> HostResult<()> {
        loop {
            match world.state() {
                WorldState::Running => return Ok(()),
                WorldState::Failed(reason) => {
                    tracing::error!(session = %world.session_id(), reason = %reason, "World failed to start");
                    self.discard(world).await;
                    return Err(HostError::StartFailed { message: reason });
                }
                WorldState::Initializing => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.discard(world).await;
                    return Err(HostError::Cancelled);
                }
                _ = tokio::time::sleep(self.inner.settings.init_poll) => {}
            }
        }
    }

    /// Destroy a world that never became a session.
    async fn discard(&self, world: &Arc<dyn World>) {
        let target = world.clone();
        if let Err(e) = self
            .inner
            .engine
            .context()
            .run(move || target.destroy())
            .await
        {
            tracing::error!(session = %world.session_id(), error = %e, "Failed to discard world");
        }
    }

    fn spawn_auto_items(&self, session: &RunningSession) {
        let items = self.inner.settings.auto_spawn_items.clone();
        if items.is_empty() {
            return;
        }
        let world = session.world().clone();
        let engine = self.inner.engine.clone();
        tokio::spawn(async move {
            for item in items {
                let target = world.clone();
                let url = item.clone();
                if let Err(e) = engine.context().start(move || target.spawn_item(&url)).await {
                    tracing::warn!(session = %world.session_id(), item = %item, error = %e, "Auto-spawn failed");
                }
            }
        });
    }

    /// Stop a session and wait until it is saved and torn down. Unknown ids are a no-op.
    pub async fn stop_world(&self, id: &str) {
        let Some(session) = self.inner.registry.remove(id).await else {
            return;
        };
        tracing::info!(session = %id, "Stopping world");
        session.cancel_token().cancel();
        session.join().await;
    }

    /// Cancel every session, then wait for each until `deadline` fires.
    pub async fn stop_all(&self, deadline: CancellationToken) {
        let sessions = self.inner.registry.snapshot().await;
        tracing::info!(count = sessions.len(), "Stopping all worlds");

        for session in &sessions {
            session.cancel_token().cancel();
        }

        for (done, session) in sessions.iter().enumerate() {
            tokio::select! {
                biased;
                _ = deadline.cancelled() => {
                    tracing::warn!(
                        remaining = sessions.len() - done,
                        "Shutdown deadline reached, abandoning remaining sessions"
                    );
                    return;
                }
                _ = session.join() => {}
            }
        }
    }

    pub async fn get_session(&self, id: &str) -> HostResult<Arc<RunningSession>> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| HostError::not_found("Session"))
    }

    pub async fn list_sessions(&self) -> Vec<Arc<RunningSession>> {
        let mut sessions = self.inner.registry.snapshot().await;
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    pub async fn save_world(&self, id: &str) -> HostResult<SaveOutcome> {
        let session = self.get_session(id).await?;
        Ok(session.save().await)
    }

    pub async fn save_world_as(&self, id: &str, make_current: bool) -> HostResult<WorldRecord> {
        let session = self.get_session(id).await?;
        session.save_as(make_current).await
    }

    pub async fn allow_user_to_join(&self, id: &str, user_id: &str) -> HostResult<()> {
        let session = self.get_session(id).await?;
        session
            .allow_user_to_join(user_id)
            .await
            .map_err(engine_failure)
    }

    pub async fn invite_user(&self, id: &str, user_id: &str) -> HostResult<()> {
        let session = self.get_session(id).await?;
        session.invite_user(user_id).await.map_err(engine_failure)
    }

    /// Startup parameters that would recreate every running session as it is now.
    pub async fn startup_config_to_restore(&self) -> Vec<StartupParameters> {
        self.list_sessions()
            .await
            .iter()
            .map(|session| session.generate_startup_parameters())
            .collect()
    }
}

fn engine_failure(e: EngineError) -> HostError {
    HostError::Internal(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEventKind, InMemoryEngine, InMemoryEngineConfig};
    use worldhost_common::models::SupervisorState;

    fn engine_with(config: InMemoryEngineConfig) -> Arc<InMemoryEngine> {
        Arc::new(InMemoryEngine::new(config))
    }

    fn logged_in() -> InMemoryEngineConfig {
        InMemoryEngineConfig {
            user_id: Some("U-host".into()),
            ..Default::default()
        }
    }

    fn manager(engine: &Arc<InMemoryEngine>) -> SessionManager {
        SessionManager::new(engine.clone(), SessionRegistry::new(), ManagerSettings::default())
    }

    fn preset() -> StartupParameters {
        StartupParameters {
            load_world_preset_name: Some("Grid".into()),
            ..Default::default()
        }
    }

    fn event_time(engine: &InMemoryEngine, kind: EngineEventKind) -> Option<tokio::time::Instant> {
        engine
            .events()
            .into_iter()
            .find(|e| e.kind == kind)
            .map(|e| e.at)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_preset_registers_session() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        let session = manager.start_world(preset(), CancellationToken::new()).await.unwrap();
        assert!(!session.id().is_empty());

        let listed: Vec<String> = manager
            .list_sessions()
            .await
            .iter()
            .map(|s| s.id().to_owned())
            .collect();
        assert_eq!(listed, vec![session.id().to_owned()]);
        assert_eq!(session.state(), SupervisorState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_id_gets_prefix() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        let params = StartupParameters {
            custom_session_id: Some("U-host:lobby".into()),
            ..preset()
        };
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        assert_eq!(session.id(), "S-U-host:lobby");
        assert_eq!(
            session.parameters().custom_session_id.as_deref(),
            Some("S-U-host:lobby")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_custom_id_is_rejected() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        let params = StartupParameters {
            custom_session_id: Some("U-someone-else:lobby".into()),
            ..preset()
        };
        let result = manager.start_world(params, CancellationToken::new()).await;
        assert!(matches!(result, Err(HostError::Validation { .. })));
        assert!(manager.list_sessions().await.is_empty());
        assert!(engine.worlds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_world_source_is_rejected() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        let result = manager
            .start_world(StartupParameters::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HostError::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initialization_registers_nothing() {
        let engine = engine_with(InMemoryEngineConfig {
            init_delay: Duration::from_millis(350),
            ..logged_in()
        });
        let manager = manager(&engine);
        engine.fail_next_init("missing assets");

        let result = manager.start_world(preset(), CancellationToken::new()).await;
        match result {
            Err(HostError::StartFailed { message }) => assert_eq!(message, "missing assets"),
            other => panic!("unexpected result: {:?}", other.map(|s| s.id().to_owned())),
        }
        assert!(manager.list_sessions().await.is_empty());
        assert!(engine.worlds()[0].is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_surfaces_as_start_failed() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        engine.fail_next_open("no such preset");

        let result = manager.start_world(preset(), CancellationToken::new()).await;
        assert!(matches!(result, Err(HostError::StartFailed { .. })));
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_session_id_fails_loudly() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let params = StartupParameters {
            custom_session_id: Some("U-host:lobby".into()),
            ..preset()
        };

        let first = manager
            .start_world(params.clone(), CancellationToken::new())
            .await
            .unwrap();
        let second = manager.start_world(params, CancellationToken::new()).await;
        assert!(matches!(second, Err(HostError::DuplicateSession(_))));

        // the first session is untouched, the duplicate world is gone
        let registered = manager.get_session("S-U-host:lobby").await.unwrap();
        assert!(Arc::ptr_eq(&registered, &first));
        assert!(!first.world().is_destroyed());
        let worlds = engine.worlds();
        assert_eq!(worlds.len(), 2);
        assert!(worlds[1].is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_world_tears_down_before_returning() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let session = manager.start_world(preset(), CancellationToken::new()).await.unwrap();
        let id = session.id().to_owned();

        manager.stop_world(&id).await;

        assert!(matches!(
            manager.get_session(&id).await,
            Err(HostError::NotFound { .. })
        ));
        assert!(session.world().is_destroyed());
        assert_eq!(session.state(), SupervisorState::Stopped);

        // idempotent
        manager.stop_world(&id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_engine_exit_does_not_block_stop() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        engine.set_exit_hangs(true);
        let session = manager.start_world(preset(), CancellationToken::new()).await.unwrap();

        let started = tokio::time::Instant::now();
        manager.stop_world(session.id()).await;

        assert!(started.elapsed() < manager.settings().world_exit_timeout);
        assert!(session.world().is_destroyed());
        assert_eq!(session.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_autosave_keeps_session_running() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        engine.fail_saves(Some("disk full".into()));
        let params = StartupParameters {
            auto_save_interval_secs: 2.0,
            ..preset()
        };

        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(engine.count_events(&EngineEventKind::SaveFailed) >= 1);
        assert_eq!(session.state(), SupervisorState::Running);
        assert!(manager.get_session(session.id()).await.is_ok());
        assert!(session.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_autosave() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            auto_save_interval_secs: 2.0,
            save_on_exit: false,
            ..preset()
        };
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        engine.set_save_delay(Duration::from_secs(5));

        // autosave begins on the 3s tick and runs until 8s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(session.is_saving());
        manager.stop_world(session.id()).await;

        let events = engine.events_for(session.id());
        let saved = events.iter().position(|k| *k == EngineEventKind::Saved);
        let destroyed = events.iter().position(|k| *k == EngineEventKind::Destroyed);
        assert!(saved.is_some(), "autosave was cut short: {events:?}");
        assert!(saved < destroyed);
        assert!(!events.contains(&EngineEventKind::SaveFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_on_autosave_tick_reloads_saved_record() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            auto_save_interval_secs: 2.0,
            forced_restart_interval_secs: 2.5,
            ..preset()
        };
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        engine.set_save_delay(Duration::from_secs(1));

        // both fire on the 3s tick
        tokio::time::sleep(Duration::from_millis(4500)).await;

        let events = engine.events_for(session.id());
        let saved = events.iter().position(|k| *k == EngineEventKind::Saved);
        let destroyed = events.iter().position(|k| *k == EngineEventKind::Destroyed);
        assert!(saved.is_some(), "autosave lost to restart: {events:?}");
        assert!(saved < destroyed);
        assert!(!events.contains(&EngineEventKind::SaveFailed));

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0].id(), session.id());
        let reloaded = sessions[0].parameters().load_world_url.unwrap();
        assert!(reloaded.starts_with("record:///U-host/R-"));
        assert_eq!(session.parameters().load_world_url, Some(reloaded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_interval_disables_autosave() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let params = StartupParameters {
            auto_save_interval_secs: 1e20,
            forced_restart_interval_secs: f64::MAX,
            ..preset()
        };

        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        assert_eq!(session.policy().autosave, None);
        assert_eq!(session.policy().forced_restart, None);
        assert_eq!(session.state(), SupervisorState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_save_only_when_dirty() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let params = StartupParameters {
            save_on_exit: true,
            ..preset()
        };

        let clean = manager
            .start_world(params.clone(), CancellationToken::new())
            .await
            .unwrap();
        manager.stop_world(clean.id()).await;
        assert_eq!(engine.events_for(clean.id()).iter().filter(|k| **k == EngineEventKind::Saved).count(), 0);

        let busy = manager.start_world(params, CancellationToken::new()).await.unwrap();
        engine.world(busy.id()).unwrap().set_user_count(3);
        manager.stop_world(busy.id()).await;

        let events = engine.events_for(busy.id());
        let saved = events.iter().position(|k| *k == EngineEventKind::Saved);
        let destroyed = events.iter().position(|k| *k == EngineEventKind::Destroyed);
        assert!(saved.is_some());
        assert!(saved < destroyed);
        assert!(busy.parameters().load_world_url.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_save_reports_already_saving() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let session = manager.start_world(preset(), CancellationToken::new()).await.unwrap();
        engine.set_save_delay(Duration::from_secs(3));

        let slow = {
            let manager = manager.clone();
            let id = session.id().to_owned();
            tokio::spawn(async move { manager.save_world(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.is_saving());

        let second = manager.save_world(session.id()).await.unwrap();
        assert_eq!(second, SaveOutcome::AlreadySaving);

        let first = slow.await.unwrap().unwrap();
        assert!(first.is_saved());
        assert_eq!(engine.count_events(&EngineEventKind::SaveStarted), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_mints_record_for_unowned_world() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let params = StartupParameters {
            load_world_url: Some("record:///U-stranger/R-public".into()),
            ..Default::default()
        };
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();

        let SaveOutcome::Saved { record } = manager.save_world(session.id()).await.unwrap() else {
            panic!("save should succeed");
        };
        assert_eq!(record.owner_id, "U-host");
        assert_ne!(record.record_id, "R-public");
        assert_eq!(session.world().corresponding_record(), Some(record.clone()));
        assert_eq!(session.parameters().load_world_url, record.url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_as_copy_keeps_current_record() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let params = StartupParameters {
            load_world_url: Some("record:///U-host/R-home".into()),
            ..Default::default()
        };
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();

        let copy = manager.save_world_as(session.id(), false).await.unwrap();
        assert_ne!(copy.record_id, "R-home");
        assert_eq!(session.world().corresponding_record().unwrap().record_id, "R-home");

        let moved = manager.save_world_as(session.id(), true).await.unwrap();
        assert_eq!(session.world().corresponding_record(), Some(moved.clone()));
        assert_eq!(session.parameters().load_world_url, moved.url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_on_unknown_session() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        assert!(matches!(manager.save_world("S-nope").await, Err(HostError::NotFound { .. })));
        assert!(matches!(
            manager.save_world_as("S-nope", true).await,
            Err(HostError::NotFound { .. })
        ));
        assert!(matches!(
            manager.allow_user_to_join("S-nope", "U-bob").await,
            Err(HostError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_then_idle_restart() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            auto_save_interval_secs: 5.0,
            idle_restart_interval_secs: 10.0,
            ..preset()
        };

        let t0 = tokio::time::Instant::now();
        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        let first_id = session.id().to_owned();
        engine.world(&first_id).unwrap().set_user_count(1);

        tokio::time::sleep(Duration::from_secs(14)).await;

        let saved_at = event_time(&engine, EngineEventKind::Saved).expect("autosave ran");
        let destroyed_at = event_time(&engine, EngineEventKind::Destroyed).expect("world restarted");
        assert!(saved_at >= t0 + Duration::from_secs(5));
        assert!(destroyed_at >= t0 + Duration::from_secs(10));
        assert!(saved_at < destroyed_at);

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0].id(), first_id);
        assert_eq!(session.state(), SupervisorState::Stopped);
        // the replacement reloads what was saved
        assert!(sessions[0].parameters().load_world_url.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_restart_with_active_users() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 4,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            forced_restart_interval_secs: 3.0,
            ..preset()
        };

        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert!(session.world().is_destroyed());
        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0].id(), session.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restarts_only_with_auto_recover() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);

        let recovering = manager.start_world(preset(), CancellationToken::new()).await.unwrap();
        let fragile = manager
            .start_world(
                StartupParameters {
                    auto_recover: false,
                    ..preset()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        engine.fail_world(recovering.id(), "boom");
        engine.fail_world(fragile.id(), "boom");
        recovering.join().await;
        fragile.join().await;

        let ids: Vec<String> = manager
            .list_sessions()
            .await
            .iter()
            .map(|s| s.id().to_owned())
            .collect();
        assert_eq!(ids.len(), 1);
        assert!(!ids.contains(&recovering.id().to_owned()));
        assert!(!ids.contains(&fragile.id().to_owned()));
        assert!(recovering.world().is_destroyed());
        assert!(fragile.world().is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eager_save_when_last_user_leaves() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            save_on_exit: true,
            ..preset()
        };

        let session = manager.start_world(params, CancellationToken::new()).await.unwrap();
        engine.world(session.id()).unwrap().set_user_count(1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(engine.count_events(&EngineEventKind::Saved), 1);
        assert!(!session.is_dirty());

        // nothing changed since that save, so stopping does not save again
        manager.stop_world(session.id()).await;
        assert_eq!(engine.count_events(&EngineEventKind::Saved), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_honours_deadline() {
        let engine = engine_with(InMemoryEngineConfig {
            initial_user_count: 2,
            ..logged_in()
        });
        let manager = manager(&engine);
        let params = StartupParameters {
            save_on_exit: true,
            ..preset()
        };
        let a = manager.start_world(params.clone(), CancellationToken::new()).await.unwrap();
        let b = manager.start_world(params, CancellationToken::new()).await.unwrap();
        engine.set_save_delay(Duration::from_secs(60));

        manager.shutdown();
        let deadline = CancellationToken::new();
        let timer = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            timer.cancel();
        });

        let started = tokio::time::Instant::now();
        manager.stop_all(deadline).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());

        let late = manager.start_world(preset(), CancellationToken::new()).await;
        assert!(matches!(late, Err(HostError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_finishing_during_shutdown_is_discarded() {
        let engine = engine_with(InMemoryEngineConfig {
            init_delay: Duration::from_millis(500),
            ..logged_in()
        });
        let manager = manager(&engine);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start_world(preset(), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.shutdown();
        manager.stop_all(CancellationToken::new()).await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HostError::ShuttingDown)));
        assert!(manager.list_sessions().await.is_empty());
        let worlds = engine.worlds();
        assert_eq!(worlds.len(), 1);
        assert!(worlds[0].is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_spawn_items_are_loaded() {
        let engine = engine_with(logged_in());
        let manager = SessionManager::new(
            engine.clone(),
            SessionRegistry::new(),
            ManagerSettings {
                auto_spawn_items: vec!["item:///tools".into(), "item:///lights".into()],
                ..Default::default()
            },
        );

        let session = manager.start_world(preset(), CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = engine.events_for(session.id());
        assert!(events.contains(&EngineEventKind::ItemSpawned("item:///tools".into())));
        assert!(events.contains(&EngineEventKind::ItemSpawned("item:///lights".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_config_reflects_live_changes() {
        let engine = engine_with(logged_in());
        let manager = manager(&engine);
        let session = manager
            .start_world(
                StartupParameters {
                    session_name: Some("Lobby".into()),
                    auto_save_interval_secs: 300.0,
                    ..preset()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        engine
            .world(session.id())
            .unwrap()
            .edit_settings(|s| s.name = "Renamed Lobby".into());
        manager.allow_user_to_join(session.id(), "U-bob").await.unwrap();

        let restore = manager.startup_config_to_restore().await;
        assert_eq!(restore.len(), 1);
        assert_eq!(restore[0].session_name.as_deref(), Some("Renamed Lobby"));
        assert_eq!(restore[0].auto_save_interval_secs, 300.0);
        assert_eq!(restore[0].join_allowed_user_ids, vec!["U-bob".to_string()]);
        assert_eq!(restore[0].load_world_preset_name.as_deref(), Some("Grid"));
    }
}
