//! Per-session supervisor task.
//!
//! Ticks once per `supervisor_tick` until the session is cancelled, its world is
//! destroyed, or a restart is due. On exit it removes the session from the
//! registry before touching the world, then either restarts it under fresh
//! parameters or saves and tears it down.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedMutexGuard, broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use worldhost_common::models::{SaveOutcome, SupervisorState};

use crate::engine::{WorldFailure, WorldState};
use crate::manager::SessionManager;
use crate::record::{RestartReason, RunningSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    Destroyed,
    Crashed,
    Restart(RestartReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrashAction {
    /// Shutdown already in progress; not a real crash.
    Ignore,
    Restart,
    Stop,
}

fn crash_action(cancelled: bool, auto_recover: bool) -> CrashAction {
    match (cancelled, auto_recover) {
        (true, _) => CrashAction::Ignore,
        (false, true) => CrashAction::Restart,
        (false, false) => CrashAction::Stop,
    }
}

/// Failure notifications for one session. Owns its receiver, so dropping the
/// subscription detaches it from the engine's failure channel.
struct FailureSubscription {
    rx: broadcast::Receiver<WorldFailure>,
    session: Arc<RunningSession>,
}

impl FailureSubscription {
    fn new(rx: broadcast::Receiver<WorldFailure>, session: Arc<RunningSession>) -> Self {
        Self { rx, session }
    }

    /// Next failure of this session's world. Pends forever once the engine
    /// closes the channel.
    async fn next(&mut self) -> WorldFailure {
        loop {
            match self.rx.recv().await {
                Ok(failure) if failure.session_id == self.session.id() => return failure,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %self.session.id(), skipped, "Missed world failure notifications");
                    if let WorldState::Failed(reason) = self.session.world().state() {
                        return WorldFailure {
                            session_id: self.session.id().to_owned(),
                            reason,
                        };
                    }
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

/// `failures` must be subscribed before the session becomes visible to callers,
/// so a crash right after registration is not missed.
pub(crate) async fn supervise(
    manager: SessionManager,
    session: Arc<RunningSession>,
    failures: broadcast::Receiver<WorldFailure>,
    registered: oneshot::Receiver<()>,
) {
    if registered.await.is_err() {
        tracing::debug!(session = %session.id(), "Session was never registered, discarding world");
        destroy_world(&manager, &session).await;
        session.set_state(SupervisorState::Stopped);
        return;
    }

    let exit = run(&manager, &session, failures).await;
    finish(&manager, &session, exit).await;
}

async fn run(
    manager: &SessionManager,
    session: &Arc<RunningSession>,
    failures: broadcast::Receiver<WorldFailure>,
) -> LoopExit {
    let mut failures = FailureSubscription::new(failures, session.clone());

    let period = manager.settings().supervisor_tick;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cancel = session.cancel_token().clone();
    let name = session.world().settings().name;

    loop {
        if session.world().is_destroyed() {
            return LoopExit::Destroyed;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return LoopExit::Cancelled,

            failure = failures.next() => {
                match crash_action(cancel.is_cancelled(), session.policy().auto_recover) {
                    CrashAction::Ignore => {}
                    CrashAction::Restart => {
                        tracing::warn!(session = %session.id(), world = %name, reason = %failure.reason, "World has crashed! Restarting...");
                        return LoopExit::Restart(RestartReason::Crashed);
                    }
                    CrashAction::Stop => {
                        tracing::warn!(session = %session.id(), world = %name, reason = %failure.reason, "World has crashed!");
                        return LoopExit::Crashed;
                    }
                }
            }

            _ = ticker.tick() => {
                let now = Instant::now();
                let plan = session.tick(now);

                if plan.autosave || plan.save_on_empty {
                    // Claimed here so teardown queues behind this save.
                    if let Some(slot) = session.try_lock_saves() {
                        spawn_background_save(session.clone(), slot, plan.save_on_empty);
                    }
                }

                if let Some(reason) = plan.restart {
                    let timers = session.timers();
                    match reason {
                        RestartReason::Idle => tracing::info!(
                            session = %session.id(),
                            world = %name,
                            idle_secs = timers.idle_for(now).as_secs(),
                            "World has been idle, restarting"
                        ),
                        _ => tracing::info!(
                            session = %session.id(),
                            world = %name,
                            running_secs = timers.running_for(now).as_secs(),
                            "World reached its forced restart interval, restarting"
                        ),
                    }
                    return LoopExit::Restart(reason);
                }
            }
        }
    }
}

fn spawn_background_save(
    session: Arc<RunningSession>,
    slot: OwnedMutexGuard<()>,
    on_empty: bool,
) {
    tokio::spawn(async move {
        if on_empty {
            tracing::info!(session = %session.id(), "Last user left, saving early");
        } else {
            tracing::info!(session = %session.id(), "Autosaving");
        }
        match session.save_with(&slot).await {
            SaveOutcome::Saved { .. } | SaveOutcome::Failed { .. } => {}
            outcome => tracing::debug!(session = %session.id(), ?outcome, "Background save skipped"),
        }
    });
}

async fn finish(manager: &SessionManager, session: &Arc<RunningSession>, exit: LoopExit) {
    tracing::info!(session = %session.id(), ?exit, "World has stopped");

    // Always deregister before touching the world.
    manager.registry().remove_if_same(session).await;

    let restart = matches!(exit, LoopExit::Restart(_)) && !session.cancel_token().is_cancelled();
    if restart {
        session.set_state(SupervisorState::Restarting);
        // An in-flight save finishes first and its record is what restarts.
        let slot = session.lock_saves().await;
        let params = session.generate_startup_parameters();
        destroy_world(manager, session).await;
        drop(slot);
        tokio::task::yield_now().await;

        match manager
            .start_world_boxed(params, manager.shutdown_token())
            .await
        {
            Ok(next) => tracing::info!(
                session = %session.id(),
                replacement = %next.id(),
                "Session restarted"
            ),
            Err(e) => tracing::error!(session = %session.id(), error = %e, "Failed to restart session"),
        }
        session.set_state(SupervisorState::Stopped);
        return;
    }

    session.set_state(SupervisorState::Stopping);
    let slot = session.lock_saves().await;
    let world = session.world();
    if world.settings().save_on_exit && world.can_save() && session.is_dirty() {
        tracing::info!(session = %session.id(), "Saving before exit");
        match session.save_with(&slot).await {
            SaveOutcome::Saved { .. } => {}
            outcome => tracing::warn!(session = %session.id(), ?outcome, "Final save did not complete"),
        }
    }

    spawn_exit_world(manager, session.id().to_owned());
    destroy_world(manager, session).await;
    drop(slot);
    session.set_state(SupervisorState::Stopped);
}

/// Engine exit bookkeeping can hang; run it detached and bounded.
fn spawn_exit_world(manager: &SessionManager, session_id: String) {
    let engine = manager.engine().clone();
    let timeout = manager.settings().world_exit_timeout;
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, engine.exit_world(&session_id)).await {
            Ok(Ok(())) => tracing::debug!(session = %session_id, "World exited"),
            Ok(Err(e)) => tracing::warn!(session = %session_id, error = %e, "World exit failed"),
            Err(_) => tracing::warn!(session = %session_id, "World exit timed out"),
        }
    });
}

async fn destroy_world(manager: &SessionManager, session: &RunningSession) {
    let world = session.world().clone();
    let destroyed = manager
        .engine()
        .context()
        .run(move || {
            if !world.is_destroyed() {
                world.destroy();
            }
        })
        .await;
    if let Err(e) = destroyed {
        tracing::error!(session = %session.id(), error = %e, "Failed to destroy world");
    }
}
