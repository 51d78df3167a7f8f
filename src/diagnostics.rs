//! Reporting of events a supervisor did not expect.
//!
//! Unexpected events are never fatal and never silently dropped: the
//! supervisor hands them to a [`Diagnostics`] sink together with its
//! identity and current state.

#[cfg(test)]
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

use crate::events::RuntimeEvent;
use crate::machine::State;

/// An event received in a state that has no handler for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhandledEvent {
    pub subdomain: String,
    pub state: State,
    pub event: RuntimeEvent,
}

/// Capture hook for unhandled events.
pub trait Diagnostics: Send + Sync {
    fn capture(&self, report: UnhandledEvent);
}

/// Writes each report as a `warn` line with the event payload as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn capture(&self, report: UnhandledEvent) {
        let payload = serde_json::to_string(&report.event).unwrap_or_else(|_| report.event.name());
        warn!(
            subdomain = %report.subdomain,
            state = ?report.state,
            event = %report.event.name(),
            %payload,
            "unhandled runtime event"
        );
    }
}

/// Keeps every report in memory.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct RecordingDiagnostics {
    reports: Arc<Mutex<Vec<UnhandledEvent>>>,
}

#[cfg(test)]
impl RecordingDiagnostics {
    pub fn reports(&self) -> Vec<UnhandledEvent> {
        match self.reports.lock() {
            Ok(reports) => reports.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
impl Diagnostics for RecordingDiagnostics {
    fn capture(&self, report: UnhandledEvent) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report),
            Err(poisoned) => poisoned.into_inner().push(report),
        }
    }
}
