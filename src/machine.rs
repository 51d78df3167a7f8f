//! The runtime supervisor state machine.
//!
//! [`Machine`] holds the current [`State`] and the [`RuntimeContext`] of one
//! supervised app. Feeding it a [`RuntimeEvent`] mutates the context and
//! returns a [`Step`]: the states entered while handling the event and the
//! [`Effect`]s the driver has to carry out (spawning or terminating the
//! spawn actor, arming timers, publishing notifications). Nothing in here
//! touches a process, a clock or a channel, so every transition can be
//! exercised synchronously.
//!
//! Global handlers run before state-local ones. Transient states
//! (`Restarting`, `MaybeRetrying`) run their body on entry and move on
//! within the same step.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};
use ulid::{Generator, Ulid};

use crate::config::{AppConfig, SupervisorSettings};
use crate::diagnostics::UnhandledEvent;
use crate::events::{Command, RuntimeEvent, SpawnError, SpawnEvent, SpawnId, TimerKind};
use crate::model::{ErrorEntry, ErrorKind, LogEntry, LogKind};
use crate::publisher::Notification;

const RESTARTING_MESSAGE: &str = "Restarting server...";
const STARTED_MESSAGE: &str = "Server started";

/// Lifecycle states of a supervised app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    SpawningRuntime,
    Running,
    PendingShutdown,
    Stopped,
    Restarting,
    MaybeRetrying,
    Error,
}

impl State {
    /// Externally observable status of this state.
    pub fn tag(self) -> Tag {
        match self {
            State::SpawningRuntime | State::Restarting | State::MaybeRetrying => Tag::Loading,
            State::Running | State::PendingShutdown => Tag::Ready,
            State::Stopped => Tag::Stopped,
            State::Error => Tag::Error,
        }
    }

    // States that are only reachable after a successful start report.
    fn holds_port(self) -> bool {
        matches!(self, State::Running | State::PendingShutdown)
    }

    fn has_timer(self) -> bool {
        matches!(self, State::Running | State::PendingShutdown)
    }
}

/// Status label callers use without knowing internal state names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Loading,
    Ready,
    Stopped,
    Error,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Loading => "loading",
            Tag::Ready => "ready",
            Tag::Stopped => "stopped",
            Tag::Error => "error",
        }
    }
}

/// Side effects requested by a transition, executed in order by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Launch a spawn actor occupying the slot under `spawn`.
    Spawn { spawn: SpawnId, attempt: u32 },
    /// Ask the spawn actor to stop. Does not wait for it.
    Terminate { spawn: SpawnId },
    /// Deliver a `Timer` event carrying `generation` after `after`.
    ArmTimer {
        kind: TimerKind,
        generation: u64,
        after: Duration,
    },
    /// Drop any pending timer.
    CancelTimer,
    Publish(Notification),
    ReportUnhandled(UnhandledEvent),
}

/// Outcome of handling one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    /// States entered, in order. Empty if the event caused no transition.
    pub entered: Vec<State>,
    pub effects: Vec<Effect>,
}

/// Mutable data owned by one supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub app_config: AppConfig,
    pub logs: Vec<LogEntry>,
    pub errors: Vec<ErrorEntry>,
    pub port: Option<u16>,
    pub retry_count: u32,
    pub last_heartbeat: DateTime<Utc>,
    /// The single spawn slot.
    pub spawn: Option<SpawnId>,
}

/// Compact view of a supervisor, cheap enough to publish after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub subdomain: String,
    pub state: State,
    pub tag: Tag,
    pub port: Option<u16>,
    pub retry_count: u32,
    pub log_count: usize,
    pub error_count: usize,
    pub last_heartbeat: DateTime<Utc>,
}

/// Full copy of a supervisor's state and context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub subdomain: String,
    pub state: State,
    pub tag: Tag,
    pub port: Option<u16>,
    pub retry_count: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub logs: Vec<LogEntry>,
    pub errors: Vec<ErrorEntry>,
}

/// One supervisor's state machine.
pub struct Machine {
    state: State,
    context: RuntimeContext,
    settings: SupervisorSettings,
    generation: u64,
    next_spawn: u64,
    log_ids: Generator,
}

impl Machine {
    /// Creates the machine in `SpawningRuntime`.
    ///
    /// The returned step carries the initial `Spawn` effect.
    pub fn new(app_config: AppConfig, settings: SupervisorSettings, now: DateTime<Utc>) -> (Self, Step) {
        let mut machine = Self {
            state: State::SpawningRuntime,
            context: RuntimeContext {
                app_config,
                logs: Vec::new(),
                errors: Vec::new(),
                port: None,
                retry_count: 0,
                last_heartbeat: now,
                spawn: None,
            },
            settings,
            generation: 0,
            next_spawn: 0,
            log_ids: Generator::new(),
        };
        let mut step = Step::default();
        step.entered.push(State::SpawningRuntime);
        machine.enter(now, &mut step);
        (machine, step)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn tag(&self) -> Tag {
        self.state.tag()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn subdomain(&self) -> &str {
        &self.context.app_config.subdomain
    }

    /// Generation of the current state; timers armed on entry carry it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            subdomain: self.subdomain().to_string(),
            state: self.state,
            tag: self.tag(),
            port: self.context.port,
            retry_count: self.context.retry_count,
            log_count: self.context.logs.len(),
            error_count: self.context.errors.len(),
            last_heartbeat: self.context.last_heartbeat,
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            subdomain: self.subdomain().to_string(),
            state: self.state,
            tag: self.tag(),
            port: self.context.port,
            retry_count: self.context.retry_count,
            last_heartbeat: self.context.last_heartbeat,
            logs: self.context.logs.clone(),
            errors: self.context.errors.clone(),
        }
    }

    /// Log entries appended after `after`, or all of them for `None`.
    ///
    /// Log ids only grow, so entries past a clear are still returned.
    pub fn logs_since(&self, after: Option<Ulid>) -> Vec<LogEntry> {
        let logs = &self.context.logs;
        let start = match after {
            Some(after) => logs.partition_point(|entry| entry.id <= after),
            None => 0,
        };
        logs[start..].to_vec()
    }

    /// Handles one event.
    pub fn handle(&mut self, event: RuntimeEvent, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();
        match event {
            RuntimeEvent::Command(command) => self.on_command(command, now, &mut step),
            RuntimeEvent::Spawn { spawn, event } => {
                if self.context.spawn == Some(spawn) {
                    self.on_spawn_event(spawn, event, now, &mut step);
                } else {
                    self.unhandled(RuntimeEvent::Spawn { spawn, event }, &mut step);
                }
            }
            RuntimeEvent::Timer { kind, generation } => {
                self.on_timer(kind, generation, now, &mut step)
            }
        }
        step
    }

    fn on_command(&mut self, command: Command, now: DateTime<Utc>, step: &mut Step) {
        match command {
            Command::Restart => self.transition(State::Restarting, now, step),
            Command::ClearLogs => {
                self.context.logs.clear();
                self.publish_logs(step);
            }
            Command::SaveError { message, command } => {
                self.context.errors.push(ErrorEntry::new(
                    ErrorKind::Saved,
                    &message,
                    command.as_deref(),
                    now,
                ));
            }
            Command::UpdateHeartbeat { created_at } => {
                self.context.last_heartbeat = created_at;
                match self.state {
                    State::PendingShutdown => self.transition(State::Running, now, step),
                    State::Stopped => self.transition(State::Restarting, now, step),
                    _ => {}
                }
            }
        }
    }

    fn on_spawn_event(&mut self, spawn: SpawnId, event: SpawnEvent, now: DateTime<Utc>, step: &mut Step) {
        match event {
            SpawnEvent::Started { port } if self.state == State::SpawningRuntime => {
                self.context.port = Some(port);
                self.append_log(STARTED_MESSAGE, LogKind::Normal, now);
                self.publish_logs(step);
                self.transition(State::Running, now, step);
            }
            event @ SpawnEvent::Started { .. } => {
                self.unhandled(RuntimeEvent::Spawn { spawn, event }, step);
            }
            SpawnEvent::Log { message, kind } => {
                self.append_log(&message, kind, now);
                self.publish_logs(step);
            }
            SpawnEvent::Exited => self.transition(State::Stopped, now, step),
            SpawnEvent::Error(err) => self.on_spawn_error(err, now, step),
        }
    }

    fn on_spawn_error(&mut self, err: SpawnError, now: DateTime<Utc>, step: &mut Step) {
        debug!(kind = err.kind.as_label(), message = %err.message, "spawn actor reported failure");
        self.context.errors.push(ErrorEntry::new(
            ErrorKind::Runtime,
            &err.message,
            err.command.as_deref(),
            now,
        ));
        let target = if err.kind.is_retryable() {
            State::MaybeRetrying
        } else {
            State::Error
        };
        self.transition(target, now, step);
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64, now: DateTime<Utc>, step: &mut Step) {
        if generation != self.generation {
            trace!(?kind, generation, current = self.generation, "ignoring stale timer");
            return;
        }
        match (self.state, kind) {
            (State::Running, TimerKind::Idle) => self.transition(State::PendingShutdown, now, step),
            (State::PendingShutdown, TimerKind::Shutdown) => {
                self.terminate_spawn(step);
                self.transition(State::Stopped, now, step);
            }
            _ => self.unhandled(RuntimeEvent::Timer { kind, generation }, step),
        }
    }

    fn transition(&mut self, target: State, now: DateTime<Utc>, step: &mut Step) {
        debug!(from = ?self.state, to = ?target, "state transition");
        self.exit(target, step);
        self.state = target;
        step.entered.push(target);
        self.enter(now, step);
    }

    fn exit(&mut self, target: State, step: &mut Step) {
        if self.state.has_timer() {
            step.effects.push(Effect::CancelTimer);
        }
        if self.state.holds_port() && !target.holds_port() {
            self.context.port = None;
        }
        self.generation += 1;
    }

    fn enter(&mut self, now: DateTime<Utc>, step: &mut Step) {
        match self.state {
            State::SpawningRuntime => {
                self.terminate_spawn(step);
                self.next_spawn += 1;
                let spawn = SpawnId(self.next_spawn);
                self.context.spawn = Some(spawn);
                step.effects.push(Effect::Spawn {
                    spawn,
                    attempt: self.context.retry_count,
                });
            }
            State::Running => self.arm_timer(TimerKind::Idle, self.settings.idle_timeout, step),
            State::PendingShutdown => {
                self.arm_timer(TimerKind::Shutdown, self.settings.shutdown_timeout, step)
            }
            State::Stopped => {
                self.terminate_spawn(step);
                self.context.port = None;
                self.context.retry_count = 0;
            }
            State::Restarting => {
                self.terminate_spawn(step);
                self.context.errors.clear();
                self.context.logs.clear();
                self.context.port = None;
                self.context.retry_count = 0;
                self.append_log(RESTARTING_MESSAGE, LogKind::Normal, now);
                self.publish_logs(step);
                self.transition(State::SpawningRuntime, now, step);
            }
            State::MaybeRetrying => {
                self.context.retry_count += 1;
                if self.context.retry_count < self.settings.max_retries {
                    self.transition(State::SpawningRuntime, now, step);
                } else {
                    warn!(
                        subdomain = %self.subdomain(),
                        retries = self.context.retry_count,
                        "max retries exceeded"
                    );
                    self.transition(State::Error, now, step);
                }
            }
            State::Error => {
                self.terminate_spawn(step);
                self.context.port = None;
            }
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration, step: &mut Step) {
        step.effects.push(Effect::ArmTimer {
            kind,
            generation: self.generation,
            after,
        });
    }

    // Terminate-then-clear; a no-op on an empty slot.
    fn terminate_spawn(&mut self, step: &mut Step) {
        if let Some(spawn) = self.context.spawn.take() {
            step.effects.push(Effect::Terminate { spawn });
        }
    }

    fn append_log(&mut self, message: &str, kind: LogKind, now: DateTime<Utc>) {
        let id = self
            .log_ids
            .generate_from_datetime(SystemTime::from(now))
            .unwrap_or_else(|_| Ulid::new());
        self.context.logs.push(LogEntry {
            id,
            created_at: now,
            message: message.to_string(),
            kind,
        });
    }

    fn publish_logs(&self, step: &mut Step) {
        step.effects.push(Effect::Publish(Notification::LogUpdated {
            subdomain: self.subdomain().to_string(),
        }));
    }

    fn unhandled(&self, event: RuntimeEvent, step: &mut Step) {
        step.effects.push(Effect::ReportUnhandled(UnhandledEvent {
            subdomain: self.subdomain().to_string(),
            state: self.state,
            event,
        }));
    }
}
