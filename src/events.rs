//! Event definitions for the runtime supervisor.
//!
//! A supervisor's mailbox carries three kinds of input: commands from its
//! owner, reports from the spawn actor it owns, and its own delayed timer
//! events. They are all folded into [`RuntimeEvent`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::LogKind;

/// Identifies one spawn actor instance within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SpawnId(pub u64);

impl fmt::Display for SpawnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spawn-{}", self.0)
    }
}

/// Failure categories a spawn actor can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnErrorKind {
    InstallFailed,
    PackageJson,
    UnsupportedScript,
    PortTaken,
    Timeout,
    Unknown,
}

impl SpawnErrorKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, SpawnErrorKind::PortTaken | SpawnErrorKind::Timeout)
    }

    /// Stable label used in logs and event names.
    pub fn as_label(self) -> &'static str {
        match self {
            SpawnErrorKind::InstallFailed => "install-failed",
            SpawnErrorKind::PackageJson => "package-json",
            SpawnErrorKind::UnsupportedScript => "unsupported-script",
            SpawnErrorKind::PortTaken => "port-taken",
            SpawnErrorKind::Timeout => "timeout",
            SpawnErrorKind::Unknown => "unknown",
        }
    }
}

/// A typed startup failure reported by a spawn actor.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{}: {}", .kind.as_label(), .message)]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub message: String,
    /// The command that failed, when one is known.
    pub command: Option<String>,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Everything a spawn actor reports back to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpawnEvent {
    /// The app accepts connections on `port`.
    Started { port: u16 },
    /// A line of output.
    Log { message: String, kind: LogKind },
    /// The process ended without a typed classification.
    Exited,
    /// A typed failure.
    Error(SpawnError),
}

impl SpawnEvent {
    /// Short name used when reporting unhandled events.
    pub fn name(&self) -> String {
        match self {
            SpawnEvent::Started { .. } => "spawn.started".to_string(),
            SpawnEvent::Log { .. } => "spawn.log".to_string(),
            SpawnEvent::Exited => "spawn.exited".to_string(),
            SpawnEvent::Error(err) => format!("spawn.error.{}", err.kind.as_label()),
        }
    }
}

/// Commands accepted from a supervisor's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Restart,
    ClearLogs,
    SaveError {
        message: String,
        command: Option<String>,
    },
    UpdateHeartbeat {
        created_at: DateTime<Utc>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Restart => "restart",
            Command::ClearLogs => "clear_logs",
            Command::SaveError { .. } => "save_error",
            Command::UpdateHeartbeat { .. } => "update_heartbeat",
        }
    }
}

/// Delayed self-events a supervisor schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Fires when a running app received no heartbeat for the idle window.
    Idle,
    /// Fires when a pending shutdown was not cancelled in time.
    Shutdown,
}

/// Input to the supervisor state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Command(Command),
    Spawn { spawn: SpawnId, event: SpawnEvent },
    Timer { kind: TimerKind, generation: u64 },
}

impl RuntimeEvent {
    pub fn name(&self) -> String {
        match self {
            RuntimeEvent::Command(command) => command.name().to_string(),
            RuntimeEvent::Spawn { event, .. } => event.name(),
            RuntimeEvent::Timer { kind: TimerKind::Idle, .. } => "timer.idle".to_string(),
            RuntimeEvent::Timer { kind: TimerKind::Shutdown, .. } => "timer.shutdown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_failures_are_retryable() {
        let retryable: Vec<_> = [
            SpawnErrorKind::InstallFailed,
            SpawnErrorKind::PackageJson,
            SpawnErrorKind::UnsupportedScript,
            SpawnErrorKind::PortTaken,
            SpawnErrorKind::Timeout,
            SpawnErrorKind::Unknown,
        ]
        .into_iter()
        .filter(|kind| kind.is_retryable())
        .collect();
        assert_eq!(retryable, vec![SpawnErrorKind::PortTaken, SpawnErrorKind::Timeout]);
    }

    #[test]
    fn spawn_error_display_includes_label() {
        let err = SpawnError::new(SpawnErrorKind::PortTaken, "3000 in use").with_command("npm run dev");
        assert_eq!(err.to_string(), "port-taken: 3000 in use");
        assert_eq!(SpawnEvent::Error(err).name(), "spawn.error.port-taken");
    }
}
