//! Async driver around the runtime state machine.
//!
//! [`RuntimeHandle::start`] spawns one tokio task per supervised app. The task
//! owns the [`Machine`], the spawn slot and the pending timer, and processes
//! its mailbox strictly in arrival order. Effects produced by each transition
//! are executed right after it, outside the machine.
//!
//! ```text
//! owner ──commands──┐
//! spawn actor ──────┼──► mailbox ──► Machine::handle ──► effects
//! timers ───────────┘                                  ├─ spawn / terminate actor
//!                                                      ├─ arm / cancel timer
//!                                                      ├─ Publisher::publish
//!                                                      └─ Diagnostics::capture
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use ulid::Ulid;

use crate::config::{AppConfig, ScriptRunner, SupervisorSettings};
use crate::diagnostics::Diagnostics;
use crate::events::{Command, RuntimeEvent, SpawnId, TimerKind};
use crate::machine::{Effect, Machine, RuntimeSnapshot, RuntimeStatus, Step};
use crate::model::LogEntry;
use crate::publisher::Publisher;
use crate::spawn::{SpawnHandle, SpawnInput, SpawnReporter, SpawnSlot, Spawner};

const MAILBOX_CAPACITY: usize = 256;

/// Messages delivered to a supervisor task.
#[derive(Debug)]
pub enum Mail {
    Event(RuntimeEvent),
    Snapshot(oneshot::Sender<RuntimeSnapshot>),
    LogsSince {
        after: Option<Ulid>,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Shutdown,
}

/// Errors returned by [`RuntimeHandle`] methods.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// The supervisor task has shut down.
    #[error("runtime supervisor for {subdomain} is not running")]
    Closed { subdomain: String },
}

/// Shared services a supervisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub spawner: Arc<dyn Spawner>,
    pub publisher: Publisher,
    pub diagnostics: Arc<dyn Diagnostics>,
}

/// Cloneable handle to a running supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    subdomain: String,
    tx: mpsc::Sender<Mail>,
    status: watch::Receiver<RuntimeStatus>,
}

impl RuntimeHandle {
    /// Creates the supervisor and launches its first spawn attempt.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        app: AppConfig,
        runner: ScriptRunner,
        settings: SupervisorSettings,
        collaborators: Collaborators,
    ) -> Self {
        let subdomain = app.subdomain.clone();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (machine, initial) = Machine::new(app, settings, Utc::now());
        let (status_tx, status) = watch::channel(machine.status());
        let driver = Driver {
            machine,
            runner,
            slot: SpawnSlot::default(),
            timer: None,
            mailbox: tx.downgrade(),
            status: status_tx,
            collaborators,
        };
        let span = info_span!("runtime", subdomain = %subdomain);
        tokio::spawn(driver.run(rx, initial).instrument(span));
        Self {
            subdomain,
            tx,
            status,
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Tears down the current actor and spawns a fresh attempt.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.command(Command::Restart).await
    }

    pub async fn clear_logs(&self) -> Result<(), SupervisorError> {
        self.command(Command::ClearLogs).await
    }

    /// Records an externally observed error without changing state.
    pub async fn save_error(
        &self,
        message: impl Into<String>,
        command: Option<String>,
    ) -> Result<(), SupervisorError> {
        self.command(Command::SaveError {
            message: message.into(),
            command,
        })
        .await
    }

    /// Signals that someone is still using the app.
    pub async fn update_heartbeat(&self, created_at: DateTime<Utc>) -> Result<(), SupervisorError> {
        self.command(Command::UpdateHeartbeat { created_at }).await
    }

    /// Full copy of the context, taken after every previously sent command.
    pub async fn snapshot(&self) -> Result<RuntimeSnapshot, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Mail::Snapshot(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Log entries appended after `after`, in order.
    pub async fn logs_since(&self, after: Option<Ulid>) -> Result<Vec<LogEntry>, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Mail::LogsSince { after, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Latest published status.
    pub fn status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.clone()
    }

    /// Terminates the spawn actor and stops the supervisor task.
    ///
    /// Returns once the mailbox is closed.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.send(Mail::Shutdown).await?;
        self.tx.closed().await;
        Ok(())
    }

    async fn command(&self, command: Command) -> Result<(), SupervisorError> {
        self.send(Mail::Event(RuntimeEvent::Command(command))).await
    }

    async fn send(&self, mail: Mail) -> Result<(), SupervisorError> {
        self.tx.send(mail).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SupervisorError {
        SupervisorError::Closed {
            subdomain: self.subdomain.clone(),
        }
    }
}

struct Driver {
    machine: Machine,
    runner: ScriptRunner,
    slot: SpawnSlot,
    timer: Option<CancellationToken>,
    mailbox: mpsc::WeakSender<Mail>,
    status: watch::Sender<RuntimeStatus>,
    collaborators: Collaborators,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::Receiver<Mail>, initial: Step) {
        info!("supervisor started");
        self.apply(initial);
        while let Some(mail) = rx.recv().await {
            match mail {
                Mail::Event(event) => {
                    let step = self.machine.handle(event, Utc::now());
                    self.apply(step);
                }
                Mail::Snapshot(reply) => {
                    let _ = reply.send(self.machine.snapshot());
                }
                Mail::LogsSince { after, reply } => {
                    let _ = reply.send(self.machine.logs_since(after));
                }
                Mail::Shutdown => break,
            }
        }
        self.cancel_timer();
        self.slot.terminate_all();
        info!("supervisor stopped");
    }

    fn apply(&mut self, step: Step) {
        if !step.entered.is_empty() {
            let state = self.machine.state();
            info!(
                state = ?state,
                tag = state.tag().as_str(),
                generation = self.machine.generation(),
                "entered state"
            );
        }
        for effect in step.effects {
            match effect {
                Effect::Spawn { spawn, attempt } => self.spawn(spawn, attempt),
                Effect::Terminate { spawn } => self.slot.terminate(spawn),
                Effect::ArmTimer {
                    kind,
                    generation,
                    after,
                } => self.arm_timer(kind, generation, after),
                Effect::CancelTimer => self.cancel_timer(),
                Effect::Publish(notification) => self.collaborators.publisher.publish(notification),
                Effect::ReportUnhandled(report) => self.collaborators.diagnostics.capture(report),
            }
        }
        debug_assert_eq!(self.slot.current(), self.machine.context().spawn);
        self.status.send_replace(self.machine.status());
    }

    fn spawn(&mut self, spawn: SpawnId, attempt: u32) {
        debug!(%spawn, attempt, "launching spawn actor");
        let cancel = CancellationToken::new();
        self.collaborators.spawner.spawn(SpawnInput {
            app: self.machine.context().app_config.clone(),
            attempt,
            runner: self.runner.clone(),
            reporter: SpawnReporter::new(spawn, self.mailbox.clone()),
            cancel: cancel.clone(),
        });
        self.slot.occupy(SpawnHandle::new(spawn, cancel));
    }

    fn arm_timer(&mut self, kind: TimerKind, generation: u64, after: Duration) {
        self.cancel_timer();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    _ = tokio::time::sleep(after) => {
                        if let Some(tx) = mailbox.upgrade() {
                            let _ = tx.send(Mail::Event(RuntimeEvent::Timer { kind, generation })).await;
                        }
                    }
                }
            }
            .in_current_span(),
        );
        self.timer = Some(token);
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::diagnostics::RecordingDiagnostics;
    use crate::events::{SpawnError, SpawnErrorKind, SpawnEvent};
    use crate::machine::State;
    use crate::model::LogKind;
    use crate::publisher::Notification;

    struct FakeSpawner {
        tx: mpsc::UnboundedSender<SpawnInput>,
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, input: SpawnInput) {
            let _ = self.tx.send(input);
        }
    }

    struct Harness {
        handle: RuntimeHandle,
        spawned: mpsc::UnboundedReceiver<SpawnInput>,
        publisher: Publisher,
        diagnostics: RecordingDiagnostics,
    }

    fn app() -> AppConfig {
        AppConfig {
            subdomain: "blog".to_string(),
            cwd: PathBuf::from("/tmp/blog"),
            script: "dev".to_string(),
            base_port: 3000,
            install: None,
            env: HashMap::new(),
        }
    }

    fn start() -> Harness {
        let (tx, spawned) = mpsc::unbounded_channel();
        let publisher = Publisher::new(64);
        let diagnostics = RecordingDiagnostics::default();
        let handle = RuntimeHandle::start(
            app(),
            ScriptRunner::parse("npm run").unwrap(),
            SupervisorSettings::default(),
            Collaborators {
                spawner: Arc::new(FakeSpawner { tx }),
                publisher: publisher.clone(),
                diagnostics: Arc::new(diagnostics.clone()),
            },
        );
        Harness {
            handle,
            spawned,
            publisher,
            diagnostics,
        }
    }

    async fn wait_for_state(handle: &RuntimeHandle, state: State) -> RuntimeStatus {
        let mut rx = handle.watch_status();
        let status = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.state == state))
            .await
            .expect("state reached in time")
            .expect("supervisor alive")
            .clone();
        status
    }

    fn failure(kind: SpawnErrorKind) -> SpawnEvent {
        SpawnEvent::Error(SpawnError::new(kind, "failed"))
    }

    #[tokio::test(start_paused = true)]
    async fn idles_out_after_missing_heartbeats() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        assert_eq!(first.attempt, 0);
        assert_eq!(first.app.subdomain, "blog");

        first.reporter.report(SpawnEvent::Started { port: 4000 }).await;
        let status = wait_for_state(&h.handle, State::Running).await;
        assert_eq!(status.port, Some(4000));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.handle.status().state, State::PendingShutdown);
        assert_eq!(h.handle.status().port, Some(4000));
        assert!(!first.cancel.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = h.handle.status();
        assert_eq!(status.state, State::Stopped);
        assert_eq!(status.port, None);
        assert!(first.cancel.is_cancelled());
        assert!(h.spawned.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_pending_shutdown_alive() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        first.reporter.report(SpawnEvent::Started { port: 3000 }).await;
        wait_for_state(&h.handle, State::Running).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.handle.status().state, State::PendingShutdown);

        h.handle.update_heartbeat(Utc::now()).await.unwrap();
        wait_for_state(&h.handle, State::Running).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.handle.status().state, State::Running);
        assert!(!first.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_while_stopped_spawns_again() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        first.reporter.report(SpawnEvent::Started { port: 3000 }).await;
        wait_for_state(&h.handle, State::Running).await;
        first.reporter.report(SpawnEvent::Exited).await;
        wait_for_state(&h.handle, State::Stopped).await;

        h.handle.update_heartbeat(Utc::now()).await.unwrap();
        let second = h.spawned.recv().await.unwrap();
        assert_eq!(second.attempt, 0);
        let status = wait_for_state(&h.handle, State::SpawningRuntime).await;
        assert_eq!(status.log_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_gives_up() {
        let mut h = start();
        for expected_attempt in 0..3 {
            let input = h.spawned.recv().await.unwrap();
            assert_eq!(input.attempt, expected_attempt);
            input.reporter.report(failure(SpawnErrorKind::Timeout)).await;
        }
        let status = wait_for_state(&h.handle, State::Error).await;
        assert_eq!(status.retry_count, 3);
        assert_eq!(status.error_count, 3);
        assert!(h.spawned.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_context_and_spawns_fresh() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        first.reporter.report(failure(SpawnErrorKind::PortTaken)).await;
        let second = h.spawned.recv().await.unwrap();
        assert_eq!(second.attempt, 1);
        assert!(first.cancel.is_cancelled());

        h.handle.restart().await.unwrap();
        let third = h.spawned.recv().await.unwrap();
        assert_eq!(third.attempt, 0);
        assert!(second.cancel.is_cancelled());

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, State::SpawningRuntime);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.port, None);
        assert!(snapshot.errors.is_empty());
        let messages: Vec<_> = snapshot.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["Restarting server..."]);
    }

    #[tokio::test(start_paused = true)]
    async fn log_changes_are_published() {
        let mut h = start();
        let mut notifications = h.publisher.subscribe();
        let first = h.spawned.recv().await.unwrap();
        first
            .reporter
            .report(SpawnEvent::Log {
                message: "compiling".to_string(),
                kind: LogKind::Normal,
            })
            .await;
        let received = notifications.recv().await.unwrap();
        assert_eq!(
            received,
            Notification::LogUpdated {
                subdomain: "blog".to_string()
            }
        );

        h.handle.clear_logs().await.unwrap();
        notifications.recv().await.unwrap();
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.logs.is_empty());
        assert_eq!(snapshot.state, State::SpawningRuntime);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn logs_since_returns_only_unseen_entries() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        for message in ["compiling", "compiled"] {
            first
                .reporter
                .report(SpawnEvent::Log {
                    message: message.to_string(),
                    kind: LogKind::Normal,
                })
                .await;
        }
        let all = h.handle.logs_since(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let newer = h.handle.logs_since(Some(all[0].id)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].message, "compiled");
        assert!(h.handle.logs_since(Some(all[1].id)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reports_reach_diagnostics() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        h.handle.restart().await.unwrap();
        h.spawned.recv().await.unwrap();

        first.reporter.report(SpawnEvent::Exited).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, State::SpawningRuntime);
        let reports = h.diagnostics.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].subdomain, "blog");
    }

    #[tokio::test(start_paused = true)]
    async fn save_error_does_not_change_state() {
        let mut h = start();
        h.spawned.recv().await.unwrap();
        h.handle
            .save_error("health check failed", Some("GET /".to_string()))
            .await
            .unwrap();
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, State::SpawningRuntime);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].message, "GET /: health check failed");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_actor_and_closes_handle() {
        let mut h = start();
        let first = h.spawned.recv().await.unwrap();
        h.handle.shutdown().await.unwrap();
        assert!(first.cancel.is_cancelled());
        assert_eq!(
            h.handle.restart().await,
            Err(SupervisorError::Closed {
                subdomain: "blog".to_string()
            })
        );
        assert!(!first.reporter.report(SpawnEvent::Exited).await);
    }
}
