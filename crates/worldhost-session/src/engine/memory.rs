//! In-process engine.
//!
//! Used by the host binary when no external engine is wired in, and as the
//! engine double in tests. Worlds carry observable settings, a record, a user
//! count and an event log; behaviour knobs allow injecting slow or failing
//! opens, initializations, saves and crashes.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use worldhost_common::ids;
use worldhost_common::models::{AccessLevel, WorldRecord, WorldSettings, WorldSource};

use super::{Engine, EngineContext, EngineError, World, WorldFailure, WorldStartSettings, WorldState};

const ROLES: &[&str] = &["Admin", "Builder", "Moderator", "Guest", "Spectator"];

#[derive(Debug, Clone)]
pub struct InMemoryEngineConfig {
    pub user_id: Option<String>,
    pub init_delay: Duration,
    /// Users present in a freshly opened world, including the host.
    pub initial_user_count: usize,
    /// Destroyed worlds kept around for inspection; older ones are dropped.
    pub retained_destroyed_worlds: usize,
    /// Oldest events are dropped beyond this many.
    pub event_log_capacity: usize,
}

impl Default for InMemoryEngineConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            init_delay: Duration::ZERO,
            initial_user_count: 1,
            retained_destroyed_worlds: 16,
            event_log_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    Opened,
    SaveStarted,
    Saved,
    SaveFailed,
    Destroyed,
    Exited,
    ItemSpawned(String),
    InviteSent(String),
}

#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub session_id: String,
    pub kind: EngineEventKind,
    pub at: Instant,
}

#[derive(Default)]
struct Behavior {
    open_error: Option<String>,
    init_failure: Option<String>,
    save_delay: Duration,
    save_failure: Option<String>,
    exit_hangs: bool,
    writable_owners: HashSet<String>,
}

struct Shared {
    events: Mutex<VecDeque<EngineEvent>>,
    event_capacity: usize,
    behavior: Mutex<Behavior>,
}

impl Shared {
    fn record(&self, session_id: &str, kind: EngineEventKind) {
        let mut events = self.events.lock();
        if events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(EngineEvent {
            session_id: session_id.to_owned(),
            kind,
            at: Instant::now(),
        });
    }
}

pub struct InMemoryEngine {
    context: EngineContext,
    config: InMemoryEngineConfig,
    failures: broadcast::Sender<WorldFailure>,
    worlds: Mutex<Vec<Arc<InMemoryWorld>>>,
    shared: Arc<Shared>,
}

impl InMemoryEngine {
    /// Must be called from inside a tokio runtime.
    pub fn new(config: InMemoryEngineConfig) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            context: EngineContext::spawn(),
            failures,
            worlds: Mutex::new(Vec::new()),
            shared: Arc::new(Shared {
                events: Mutex::new(VecDeque::new()),
                event_capacity: config.event_log_capacity.max(1),
                behavior: Mutex::new(Behavior::default()),
            }),
            config,
        }
    }

    /// The most recently opened world with this id.
    pub fn world(&self, session_id: &str) -> Option<Arc<InMemoryWorld>> {
        self.worlds
            .lock()
            .iter()
            .rev()
            .find(|w| w.session_id == session_id)
            .cloned()
    }

    pub fn worlds(&self) -> Vec<Arc<InMemoryWorld>> {
        self.worlds.lock().clone()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.shared.events.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, session_id: &str) -> Vec<EngineEventKind> {
        self.shared
            .events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn count_events(&self, kind: &EngineEventKind) -> usize {
        self.shared
            .events
            .lock()
            .iter()
            .filter(|e| &e.kind == kind)
            .count()
    }

    /// The next `open_world` call fails outright.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.shared.behavior.lock().open_error = Some(reason.into());
    }

    /// The next opened world ends up `Failed` instead of `Running`.
    pub fn fail_next_init(&self, reason: impl Into<String>) {
        self.shared.behavior.lock().init_failure = Some(reason.into());
    }

    pub fn set_save_delay(&self, delay: Duration) {
        self.shared.behavior.lock().save_delay = delay;
    }

    pub fn fail_saves(&self, reason: Option<String>) {
        self.shared.behavior.lock().save_failure = reason;
    }

    pub fn set_exit_hangs(&self, hangs: bool) {
        self.shared.behavior.lock().exit_hangs = hangs;
    }

    pub fn grant_write_access(&self, owner_id: impl Into<String>) {
        self.shared
            .behavior
            .lock()
            .writable_owners
            .insert(owner_id.into());
    }

    /// Live receivers of world failure notifications.
    pub fn failure_subscribers(&self) -> usize {
        self.failures.receiver_count()
    }

    /// Remember a new world, forgetting the oldest destroyed ones beyond the
    /// retention limit.
    fn track(&self, world: Arc<InMemoryWorld>) {
        let mut worlds = self.worlds.lock();
        worlds.push(world);

        let destroyed = worlds.iter().filter(|w| w.is_destroyed()).count();
        let mut excess = destroyed.saturating_sub(self.config.retained_destroyed_worlds);
        if excess > 0 {
            worlds.retain(|w| {
                if excess > 0 && w.is_destroyed() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Crash a world: mark it failed and notify subscribers.
    pub fn fail_world(&self, session_id: &str, reason: impl Into<String>) -> bool {
        let Some(world) = self.world(session_id) else {
            return false;
        };
        let reason = reason.into();
        *world.state.lock() = WorldState::Failed(reason.clone());
        let _ = self.failures.send(WorldFailure {
            session_id: session_id.to_owned(),
            reason,
        });
        true
    }
}

#[async_trait]
impl Engine for InMemoryEngine {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    async fn open_world(&self, settings: WorldStartSettings) -> Result<Arc<dyn World>, EngineError> {
        let (open_error, init_failure) = {
            let mut behavior = self.shared.behavior.lock();
            (behavior.open_error.take(), behavior.init_failure.take())
        };
        if let Some(reason) = open_error {
            return Err(EngineError::OpenFailed(reason));
        }
        if settings.wait_for_login && self.config.user_id.is_none() {
            return Err(EngineError::NotLoggedIn);
        }

        let session_id = settings
            .session_id
            .clone()
            .unwrap_or_else(ids::generate_session_id);
        let initial_state = if self.config.init_delay.is_zero() {
            match &init_failure {
                Some(reason) => WorldState::Failed(reason.clone()),
                None => WorldState::Running,
            }
        } else {
            WorldState::Initializing
        };

        let world = Arc::new(InMemoryWorld::new(
            session_id,
            settings.source,
            initial_state,
            self.config.initial_user_count,
            self.config.user_id.is_some(),
            self.shared.clone(),
        ));
        self.shared.record(&world.session_id, EngineEventKind::Opened);
        self.track(world.clone());

        if !self.config.init_delay.is_zero() {
            let delay = self.config.init_delay;
            let initializing = world.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                *initializing.state.lock() = match init_failure {
                    Some(reason) => WorldState::Failed(reason),
                    None => WorldState::Running,
                };
            });
        }

        Ok(world as Arc<dyn World>)
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<WorldFailure> {
        self.failures.subscribe()
    }

    fn current_user_id(&self) -> Option<String> {
        self.config.user_id.clone()
    }

    fn has_write_access(&self, owner_id: &str) -> bool {
        self.config.user_id.as_deref() == Some(owner_id)
            || self.shared.behavior.lock().writable_owners.contains(owner_id)
    }

    async fn exit_world(&self, session_id: &str) -> Result<(), EngineError> {
        self.shared.record(session_id, EngineEventKind::Exited);
        let hangs = self.shared.behavior.lock().exit_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct WorldInner {
    settings: WorldSettings,
    record: Option<WorldRecord>,
    allowed_users: Vec<String>,
    default_roles: BTreeMap<String, String>,
}

pub struct InMemoryWorld {
    session_id: String,
    state: Mutex<WorldState>,
    destroyed: Arc<AtomicBool>,
    user_count: AtomicUsize,
    logged_in: bool,
    inner: Mutex<WorldInner>,
    shared: Arc<Shared>,
}

impl InMemoryWorld {
    fn new(
        session_id: String,
        source: WorldSource,
        state: WorldState,
        user_count: usize,
        logged_in: bool,
        shared: Arc<Shared>,
    ) -> Self {
        let (name, record) = match &source {
            WorldSource::Preset(preset) => (preset.clone(), None),
            WorldSource::Url(url) => ("World".to_owned(), parse_record_url(url)),
        };
        let settings = WorldSettings {
            name,
            access_level: AccessLevel::Private,
            max_users: 16,
            auto_sleep: true,
            ..Default::default()
        };

        Self {
            session_id,
            state: Mutex::new(state),
            destroyed: Arc::new(AtomicBool::new(false)),
            user_count: AtomicUsize::new(user_count),
            logged_in,
            inner: Mutex::new(WorldInner {
                settings,
                record,
                ..Default::default()
            }),
            shared,
        }
    }

    pub fn set_user_count(&self, count: usize) {
        self.user_count.store(count, Ordering::SeqCst);
    }

    pub fn allowed_users(&self) -> Vec<String> {
        self.inner.lock().allowed_users.clone()
    }

    pub fn default_roles(&self) -> BTreeMap<String, String> {
        self.inner.lock().default_roles.clone()
    }

    /// Change a setting as if a user edited it in-world.
    pub fn edit_settings(&self, edit: impl FnOnce(&mut WorldSettings)) {
        edit(&mut self.inner.lock().settings);
    }
}

impl World for InMemoryWorld {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn state(&self) -> WorldState {
        self.state.lock().clone()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn user_count(&self) -> usize {
        self.user_count.load(Ordering::SeqCst)
    }

    fn settings(&self) -> WorldSettings {
        self.inner.lock().settings.clone()
    }

    fn can_save(&self) -> bool {
        self.logged_in && !self.is_destroyed() && self.state() == WorldState::Running
    }

    fn corresponding_record(&self) -> Option<WorldRecord> {
        self.inner.lock().record.clone()
    }

    fn apply_settings(&self, settings: WorldSettings) {
        self.inner.lock().settings = settings;
    }

    fn set_corresponding_record(&self, record: WorldRecord) {
        self.inner.lock().record = Some(record);
    }

    fn allow_user_to_join(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        if !inner.allowed_users.iter().any(|u| u == user_id) {
            inner.allowed_users.push(user_id.to_owned());
        }
    }

    fn clear_default_roles(&self) {
        self.inner.lock().default_roles.clear();
    }

    fn set_default_role(&self, username: &str, role: &str) -> Result<(), EngineError> {
        let Some(role) = ROLES.iter().find(|r| r.eq_ignore_ascii_case(role)) else {
            return Err(EngineError::Rejected(format!("role {role} not available")));
        };
        self.inner
            .lock()
            .default_roles
            .insert(username.to_owned(), (*role).to_owned());
        Ok(())
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.record(&self.session_id, EngineEventKind::Destroyed);
        }
    }

    fn save(&self, record: WorldRecord) -> BoxFuture<'static, Result<WorldRecord, EngineError>> {
        self.shared.record(&self.session_id, EngineEventKind::SaveStarted);
        let shared = self.shared.clone();
        let destroyed = self.destroyed.clone();
        let session_id = self.session_id.clone();

        Box::pin(async move {
            let delay = shared.behavior.lock().save_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let failure = shared.behavior.lock().save_failure.clone();
            let failure = failure.or_else(|| {
                destroyed
                    .load(Ordering::SeqCst)
                    .then(|| "world destroyed during save".to_owned())
            });
            if let Some(reason) = failure {
                shared.record(&session_id, EngineEventKind::SaveFailed);
                return Err(EngineError::SaveFailed(reason));
            }

            let url = record.canonical_url();
            shared.record(&session_id, EngineEventKind::Saved);
            Ok(WorldRecord {
                url: Some(url),
                ..record
            })
        })
    }

    fn spawn_item(&self, url: &str) -> BoxFuture<'static, Result<(), EngineError>> {
        let result = if self.is_destroyed() {
            Err(EngineError::Rejected("world destroyed".into()))
        } else {
            self.shared
                .record(&self.session_id, EngineEventKind::ItemSpawned(url.to_owned()));
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn send_invite(
        &self,
        username: &str,
        _message: Option<&str>,
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        let result = if self.logged_in {
            self.shared
                .record(&self.session_id, EngineEventKind::InviteSent(username.to_owned()));
            Ok(())
        } else {
            Err(EngineError::NotLoggedIn)
        };
        Box::pin(async move { result })
    }
}

/// `record:///<owner>/<record>` → record reference.
fn parse_record_url(url: &str) -> Option<WorldRecord> {
    let path = url.strip_prefix("record:///")?;
    let (owner, record_id) = path.split_once('/')?;
    if owner.is_empty() || record_id.is_empty() {
        return None;
    }
    Some(WorldRecord {
        record_id: record_id.to_owned(),
        owner_id: owner.to_owned(),
        url: Some(url.to_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset(name: &str) -> WorldStartSettings {
        WorldStartSettings {
            session_id: None,
            source: WorldSource::Preset(name.into()),
            force_port: None,
            wait_for_login: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_world_initializes_after_delay() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig {
            init_delay: Duration::from_millis(250),
            ..Default::default()
        });
        let world = engine.open_world(preset("Grid")).await.unwrap();
        assert_eq!(world.state(), WorldState::Initializing);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(world.state(), WorldState::Running);
        assert!(world.session_id().starts_with("S-"));
        assert_eq!(world.settings().name, "Grid");
    }

    #[tokio::test]
    async fn test_url_source_carries_record() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig::default());
        let world = engine
            .open_world(WorldStartSettings {
                source: WorldSource::Url("record:///U-alice/R-1".into()),
                ..preset("unused")
            })
            .await
            .unwrap();

        let record = world.corresponding_record().unwrap();
        assert_eq!(record.owner_id, "U-alice");
        assert_eq!(record.record_id, "R-1");
    }

    #[tokio::test]
    async fn test_destroy_is_recorded_once() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig::default());
        let world = engine.open_world(preset("Grid")).await.unwrap();
        world.destroy();
        world.destroy();
        assert_eq!(
            engine.events_for(world.session_id()),
            vec![EngineEventKind::Opened, EngineEventKind::Destroyed]
        );
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig::default());
        let world = engine.open_world(preset("Grid")).await.unwrap();
        let mut failures = engine.subscribe_failures();

        assert!(engine.fail_world(world.session_id(), "physics exploded"));
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.session_id, world.session_id());
        assert_eq!(world.state(), WorldState::Failed("physics exploded".into()));
    }

    #[tokio::test]
    async fn test_unknown_role_is_rejected() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig::default());
        let world = engine.open_world(preset("Grid")).await.unwrap();
        assert!(world.set_default_role("bob", "builder").is_ok());
        assert!(world.set_default_role("bob", "Overlord").is_err());
    }

    #[tokio::test]
    async fn test_destroyed_worlds_and_events_are_bounded() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig {
            retained_destroyed_worlds: 2,
            event_log_capacity: 5,
            ..Default::default()
        });

        let mut ids = Vec::new();
        for _ in 0..4 {
            let world = engine.open_world(preset("Grid")).await.unwrap();
            ids.push(world.session_id().to_owned());
            world.destroy();
        }
        let live = engine.open_world(preset("Grid")).await.unwrap();

        let kept: Vec<String> = engine
            .worlds()
            .iter()
            .map(|w| w.session_id().to_owned())
            .collect();
        assert_eq!(kept, vec![ids[2].clone(), ids[3].clone(), live.session_id().to_owned()]);
        assert!(engine.world(&ids[0]).is_none());

        let events = engine.events();
        assert_eq!(events.len(), 5);
        let last = events.last().unwrap();
        assert_eq!(last.session_id, live.session_id());
        assert_eq!(last.kind, EngineEventKind::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_starts_when_called_and_finishes_later() {
        let engine = InMemoryEngine::new(InMemoryEngineConfig {
            user_id: Some("U-host".into()),
            ..Default::default()
        });
        engine.set_save_delay(Duration::from_secs(2));
        let world = engine.open_world(preset("Grid")).await.unwrap();

        let pending = world.save(WorldRecord::new("R-1", "U-host"));
        assert_eq!(
            engine.events_for(world.session_id()),
            vec![EngineEventKind::Opened, EngineEventKind::SaveStarted]
        );

        let saved = pending.await.unwrap();
        assert_eq!(saved.url.as_deref(), Some("record:///U-host/R-1"));
        assert_eq!(engine.count_events(&EngineEventKind::Saved), 1);
    }
}
