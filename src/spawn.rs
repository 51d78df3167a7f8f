//! The seam between a supervisor and the actor that launches its app.
//!
//! A supervisor owns at most one spawn actor at a time. It hands the actor a
//! [`SpawnInput`] and keeps a [`SpawnHandle`] in its [`SpawnSlot`]; the actor
//! reports back through the [`SpawnReporter`] it was given. Terminating an
//! actor only cancels its token: the supervisor never waits for the process
//! to go away.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{AppConfig, ScriptRunner};
use crate::events::{RuntimeEvent, SpawnEvent, SpawnId};
use crate::supervisor::Mail;

/// Launches spawn actors. Implementations must not block.
pub trait Spawner: Send + Sync {
    fn spawn(&self, input: SpawnInput);
}

/// Everything a spawn actor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct SpawnInput {
    pub app: AppConfig,
    /// Retry count at spawn time; 0 for a fresh start.
    pub attempt: u32,
    pub runner: ScriptRunner,
    pub reporter: SpawnReporter,
    /// Cancelled when the supervisor terminates this actor.
    pub cancel: CancellationToken,
}

/// Sends reports from one spawn actor to its supervisor's mailbox.
#[derive(Debug, Clone)]
pub struct SpawnReporter {
    spawn: SpawnId,
    tx: mpsc::WeakSender<Mail>,
}

impl SpawnReporter {
    pub(crate) fn new(spawn: SpawnId, tx: mpsc::WeakSender<Mail>) -> Self {
        Self { spawn, tx }
    }

    pub fn spawn_id(&self) -> SpawnId {
        self.spawn
    }

    /// Delivers `event`. Returns `false` once the supervisor is gone.
    pub async fn report(&self, event: SpawnEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        let mail = Mail::Event(RuntimeEvent::Spawn {
            spawn: self.spawn,
            event,
        });
        tx.send(mail).await.is_ok()
    }
}

/// Ownership record of a live spawn actor.
#[derive(Debug)]
pub struct SpawnHandle {
    spawn: SpawnId,
    cancel: CancellationToken,
}

impl SpawnHandle {
    pub fn new(spawn: SpawnId, cancel: CancellationToken) -> Self {
        Self { spawn, cancel }
    }

    pub fn id(&self) -> SpawnId {
        self.spawn
    }

    fn terminate(self) {
        self.cancel.cancel();
    }
}

/// Single-slot arena for the supervisor's spawn actor.
#[derive(Debug, Default)]
pub struct SpawnSlot {
    current: Option<SpawnHandle>,
}

impl SpawnSlot {
    pub fn current(&self) -> Option<SpawnId> {
        self.current.as_ref().map(SpawnHandle::id)
    }

    /// Stores `handle`, terminating any previous occupant first.
    pub fn occupy(&mut self, handle: SpawnHandle) {
        if let Some(previous) = self.current.take() {
            warn!(previous = %previous.id(), next = %handle.id(), "spawn slot was still occupied");
            previous.terminate();
        }
        self.current = Some(handle);
    }

    /// Terminates and clears the slot if it holds `spawn`.
    ///
    /// Safe to call on an empty slot or with an id that already left.
    pub fn terminate(&mut self, spawn: SpawnId) {
        match self.current.take() {
            Some(handle) if handle.id() == spawn => {
                debug!(%spawn, "terminating spawn actor");
                handle.terminate();
            }
            other => {
                trace!(%spawn, "spawn actor already gone");
                self.current = other;
            }
        }
    }

    pub fn terminate_all(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_is_idempotent() {
        let cancel = CancellationToken::new();
        let mut slot = SpawnSlot::default();
        slot.occupy(SpawnHandle::new(SpawnId(1), cancel.clone()));
        assert_eq!(slot.current(), Some(SpawnId(1)));

        slot.terminate(SpawnId(1));
        assert!(cancel.is_cancelled());
        assert_eq!(slot.current(), None);
        slot.terminate(SpawnId(1));
        slot.terminate_all();
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn terminate_ignores_other_ids() {
        let cancel = CancellationToken::new();
        let mut slot = SpawnSlot::default();
        slot.occupy(SpawnHandle::new(SpawnId(2), cancel.clone()));
        slot.terminate(SpawnId(1));
        assert!(!cancel.is_cancelled());
        assert_eq!(slot.current(), Some(SpawnId(2)));
    }

    #[test]
    fn occupy_replaces_and_terminates_previous() {
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let mut slot = SpawnSlot::default();
        slot.occupy(SpawnHandle::new(SpawnId(1), first.clone()));
        slot.occupy(SpawnHandle::new(SpawnId(2), second.clone()));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(slot.current(), Some(SpawnId(2)));
    }

    #[tokio::test]
    async fn reporter_tags_events_with_spawn_id() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = SpawnReporter::new(SpawnId(7), tx.downgrade());
        assert!(reporter.report(SpawnEvent::Exited).await);
        match rx.recv().await {
            Some(Mail::Event(RuntimeEvent::Spawn { spawn, event })) => {
                assert_eq!(spawn, SpawnId(7));
                assert_eq!(event, SpawnEvent::Exited);
            }
            _ => panic!("expected a spawn event"),
        }
        drop(rx);
        assert!(!reporter.report(SpawnEvent::Exited).await);
        drop(tx);
        assert!(!reporter.report(SpawnEvent::Exited).await);
    }
}
