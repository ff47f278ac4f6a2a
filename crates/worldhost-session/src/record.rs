//! Session record: one live world plus the intent and timers that supervise it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use worldhost_common::error::{HostError, HostResult};
use worldhost_common::ids;
use worldhost_common::models::{
    SaveOutcome, SessionInfo, StartupParameters, SupervisorState, WorldRecord,
};

use crate::engine::{Engine, EngineError, World};

/// Supervision intervals fixed at session creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPolicy {
    pub autosave: Option<Duration>,
    pub idle_restart: Option<Duration>,
    pub forced_restart: Option<Duration>,
    pub auto_recover: bool,
}

impl SessionPolicy {
    pub fn from_parameters(params: &StartupParameters) -> Self {
        Self {
            autosave: params.autosave_interval(),
            idle_restart: params.idle_restart_interval(),
            forced_restart: params.forced_restart_interval(),
            auto_recover: params.auto_recover,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Idle,
    Forced,
    Crashed,
}

/// What one supervisor tick decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub autosave: bool,
    /// Users just left and the world saves on exit: save now rather than at shutdown.
    pub save_on_empty: bool,
    pub restart: Option<RestartReason>,
}

/// Monotonic timing state advanced once per supervisor tick.
#[derive(Debug, Clone)]
pub struct SessionTimers {
    pub started_at: Instant,
    pub idle_began_at: Option<Instant>,
    pub last_saved_at: Option<Instant>,
    pub last_autosave_attempt: Option<Instant>,
    pub last_user_count: usize,
    /// Last time users other than the host were seen.
    pub last_active_at: Option<Instant>,
}

impl SessionTimers {
    pub fn new(started_at: Instant, user_count: usize) -> Self {
        Self {
            started_at,
            idle_began_at: None,
            last_saved_at: None,
            last_autosave_attempt: None,
            last_user_count: user_count,
            last_active_at: (user_count > 1).then_some(started_at),
        }
    }

    /// Advance by one tick.
    ///
    /// `savable` means the world can be saved and no save is in flight.
    pub fn tick(
        &mut self,
        policy: &SessionPolicy,
        now: Instant,
        user_count: usize,
        savable: bool,
        save_on_exit: bool,
    ) -> TickPlan {
        let mut plan = TickPlan::default();

        if let Some(interval) = policy.autosave {
            let since = [
                Some(self.started_at),
                self.last_saved_at,
                self.last_autosave_attempt,
            ]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started_at);

            if savable && now.saturating_duration_since(since) > interval {
                plan.autosave = true;
                self.last_autosave_attempt = Some(now);
            }
        }

        let became_idle = user_count <= 1 && self.last_user_count > 1;
        if user_count > 1 {
            self.idle_began_at = None;
            self.last_active_at = Some(now);
        } else if became_idle {
            self.idle_began_at = Some(now);
            self.last_active_at = Some(now);
        }

        if became_idle && save_on_exit && savable && !plan.autosave {
            plan.save_on_empty = true;
        }

        if let (Some(interval), Some(began)) = (policy.idle_restart, self.idle_began_at) {
            if now.saturating_duration_since(began) > interval {
                plan.restart = Some(RestartReason::Idle);
                return plan;
            }
        }

        if let Some(interval) = policy.forced_restart {
            if now.saturating_duration_since(self.started_at) > interval {
                plan.restart = Some(RestartReason::Forced);
                return plan;
            }
        }

        self.last_user_count = user_count;
        plan
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        self.idle_began_at
            .map(|began| now.saturating_duration_since(began))
            .unwrap_or_default()
    }

    pub fn running_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn mark_saved(&mut self, now: Instant) {
        self.last_saved_at = Some(now);
    }

    /// Users are present, or were present after the last successful save.
    pub fn is_dirty(&self, user_count: usize) -> bool {
        if user_count > 1 {
            return true;
        }
        match (self.last_active_at, self.last_saved_at) {
            (Some(active), Some(saved)) => active > saved,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

pub struct RunningSession {
    id: String,
    world: Arc<dyn World>,
    engine: Arc<dyn Engine>,
    params: RwLock<StartupParameters>,
    policy: SessionPolicy,
    timers: Mutex<SessionTimers>,
    started_at_utc: DateTime<Utc>,
    cancel: CancellationToken,
    save_lock: Arc<tokio::sync::Mutex<()>>,
    state: watch::Sender<SupervisorState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RunningSession {
    pub fn new(
        world: Arc<dyn World>,
        engine: Arc<dyn Engine>,
        params: StartupParameters,
        cancel: CancellationToken,
    ) -> Self {
        let timers = SessionTimers::new(Instant::now(), world.user_count());
        let (state, _) = watch::channel(SupervisorState::Running);
        Self {
            id: world.session_id().to_owned(),
            policy: SessionPolicy::from_parameters(&params),
            params: RwLock::new(params),
            world,
            engine,
            timers: Mutex::new(timers),
            started_at_utc: Utc::now(),
            cancel,
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
            state,
            supervisor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn parameters(&self) -> StartupParameters {
        self.params.read().clone()
    }

    pub fn timers(&self) -> SessionTimers {
        self.timers.lock().clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    pub fn is_saving(&self) -> bool {
        self.save_lock.try_lock().is_err()
    }

    pub fn is_dirty(&self) -> bool {
        self.timers.lock().is_dirty(self.world.user_count())
    }

    pub(crate) fn attach_supervisor(&self, handle: JoinHandle<()>) {
        *self.supervisor.lock() = Some(handle);
    }

    /// Wait until the supervisor has fully torn this session down.
    pub async fn join(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(session = %self.id, error = %e, "Supervisor task failed");
                self.set_state(SupervisorState::Stopped);
            }
        }

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SupervisorState::Stopped).await;
    }

    pub(crate) fn tick(&self, now: Instant) -> TickPlan {
        let user_count = self.world.user_count();
        let savable = self.world.can_save() && !self.is_saving();
        let save_on_exit = self.world.settings().save_on_exit;
        self.timers
            .lock()
            .tick(&self.policy, now, user_count, savable, save_on_exit)
    }

    /// Save into the current record. A save already in flight makes this a no-op.
    pub async fn save(&self) -> SaveOutcome {
        if !self.world.can_save() {
            return SaveOutcome::NotSavable;
        }
        let Some(slot) = self.try_lock_saves() else {
            return SaveOutcome::AlreadySaving;
        };
        self.save_with(&slot).await
    }

    /// Claim the save slot, waiting for an in-flight save to finish. Holding
    /// the guard keeps every other save out.
    pub(crate) async fn lock_saves(&self) -> OwnedMutexGuard<()> {
        self.save_lock.clone().lock_owned().await
    }

    pub(crate) fn try_lock_saves(&self) -> Option<OwnedMutexGuard<()>> {
        self.save_lock.clone().try_lock_owned().ok()
    }

    /// Save into the current record under an already claimed slot.
    pub(crate) async fn save_with(&self, _slot: &OwnedMutexGuard<()>) -> SaveOutcome {
        if !self.world.can_save() {
            return SaveOutcome::NotSavable;
        }
        self.save_locked().await
    }

    async fn save_locked(&self) -> SaveOutcome {
        let result = async {
            let record = self.resolve_save_record()?;
            self.swap_record(record.clone()).await?;
            let saved = self.save_on_context(record).await?;
            self.swap_record(saved.clone()).await?;
            Ok::<_, EngineError>(saved)
        }
        .await;

        match result {
            Ok(saved) => {
                self.record_saved(&saved);
                tracing::info!(session = %self.id, record = %saved.record_id, "World saved");
                SaveOutcome::Saved { record: saved }
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "World save failed");
                SaveOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Preset worlds get a fresh record. Records we cannot write are re-minted
    /// under the logged-in identity.
    fn resolve_save_record(&self) -> Result<WorldRecord, EngineError> {
        let mint = || {
            self.engine
                .current_user_id()
                .map(|owner| WorldRecord::new(ids::generate_record_id(), owner))
                .ok_or(EngineError::NotLoggedIn)
        };

        match self.world.corresponding_record() {
            Some(record) if self.engine.has_write_access(&record.owner_id) => Ok(record),
            _ => mint(),
        }
    }

    async fn swap_record(&self, record: WorldRecord) -> Result<(), EngineError> {
        let world = self.world.clone();
        self.engine
            .context()
            .run(move || world.set_corresponding_record(record))
            .await
    }

    async fn save_on_context(&self, record: WorldRecord) -> Result<WorldRecord, EngineError> {
        let world = self.world.clone();
        self.engine.context().start(move || world.save(record)).await
    }

    fn record_saved(&self, saved: &WorldRecord) {
        self.timers.lock().mark_saved(Instant::now());
        let url = saved.url.clone().unwrap_or_else(|| saved.canonical_url());
        self.params.write().load_world_url = Some(url);
    }

    /// Save a copy under a new record owned by `save_as_owner` (or the logged-in
    /// identity). With `make_current` the live session switches to the copy.
    pub async fn save_as(&self, make_current: bool) -> HostResult<WorldRecord> {
        if !self.world.can_save() {
            return Err(HostError::SaveFailed {
                message: "world cannot be saved in its current state".into(),
            });
        }
        let Some(_slot) = self.try_lock_saves() else {
            return Err(HostError::AlreadySaving);
        };

        let owner = self
            .params
            .read()
            .save_as_owner
            .clone()
            .filter(|o| !o.trim().is_empty())
            .or_else(|| self.engine.current_user_id())
            .ok_or_else(|| HostError::SaveFailed {
                message: "no owner for the new record".into(),
            })?;
        let record = WorldRecord::new(ids::generate_record_id(), owner);

        let result = async {
            if make_current {
                self.swap_record(record.clone()).await?;
            }
            let saved = self.save_on_context(record).await?;
            if make_current {
                self.swap_record(saved.clone()).await?;
            }
            Ok::<_, EngineError>(saved)
        }
        .await;

        match result {
            Ok(saved) => {
                if make_current {
                    self.record_saved(&saved);
                }
                tracing::info!(
                    session = %self.id,
                    record = %saved.record_id,
                    make_current,
                    "World saved as new record"
                );
                Ok(saved)
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Save-as failed");
                Err(HostError::SaveFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Allow a user on the live world and remember it so restarts keep it.
    pub async fn allow_user_to_join(&self, user_id: &str) -> Result<(), EngineError> {
        let world = self.world.clone();
        let target = user_id.to_owned();
        self.engine
            .context()
            .run(move || world.allow_user_to_join(&target))
            .await?;

        let mut params = self.params.write();
        if !params.join_allowed_user_ids.iter().any(|u| u == user_id) {
            params.join_allowed_user_ids.push(user_id.to_owned());
        }
        Ok(())
    }

    pub async fn invite_user(&self, user_id: &str) -> Result<(), EngineError> {
        self.allow_user_to_join(user_id).await?;
        let world = self.world.clone();
        let target = user_id.to_owned();
        self.engine
            .context()
            .start(move || world.send_invite(&target, None))
            .await
    }

    /// Snapshot the live world merged with the intent it cannot report, so a
    /// restarted session comes back as it is now.
    pub fn generate_startup_parameters(&self) -> StartupParameters {
        let live = self.world.settings();
        let intent = self.params.read().clone();
        let secs = |d: Option<Duration>| d.map_or(-1.0, |d| d.as_secs_f64());

        StartupParameters {
            is_enabled: true,
            session_name: Some(live.name),
            description: live.description,
            max_users: live.max_users,
            access_level: live.access_level,
            use_custom_join_verifier: live.use_custom_join_verifier,
            hide_from_public_listing: Some(live.hide_from_listing),
            tags: Some(live.tags),
            mobile_friendly: live.mobile_friendly,
            role_cloud_variable: live.role_cloud_variable,
            allow_user_cloud_variable: live.allow_user_cloud_variable,
            deny_user_cloud_variable: live.deny_user_cloud_variable,
            required_user_join_cloud_variable: live.required_user_join_cloud_variable,
            required_user_join_cloud_variable_deny_message: live
                .required_user_join_cloud_variable_deny_message,
            away_kick_minutes: live.away_kick_minutes.map_or(-1.0, f64::from),
            parent_session_ids: live.parent_session_ids,
            save_on_exit: live.save_on_exit,
            auto_sleep: live.auto_sleep,
            save_as_owner: None,
            auto_recover: self.policy.auto_recover,
            idle_restart_interval_secs: secs(self.policy.idle_restart),
            forced_restart_interval_secs: secs(self.policy.forced_restart),
            auto_save_interval_secs: secs(self.policy.autosave),
            ..intent
        }
    }

    pub fn info(&self) -> SessionInfo {
        let now = Instant::now();
        let timers = self.timers.lock().clone();
        let settings = self.world.settings();

        SessionInfo {
            id: self.id.clone(),
            name: settings.name,
            description: settings.description,
            access_level: settings.access_level,
            user_count: self.world.user_count(),
            max_users: settings.max_users,
            state: self.state(),
            started_at: self.started_at_utc,
            last_saved_at: timers.last_saved_at.map(|at| wall_clock(now, at)),
            idle_since: timers.idle_began_at.map(|at| wall_clock(now, at)),
            saving: self.is_saving(),
            startup_parameters: self.parameters(),
        }
    }
}

fn wall_clock(now: Instant, at: Instant) -> DateTime<Utc> {
    let ago = chrono::Duration::from_std(now.saturating_duration_since(at))
        .unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - ago
}
