//! Observability events emitted by the certificate lifecycle engine.
//!
//! Components never touch a process-wide metrics registry. Each one is handed
//! an [`ObservabilitySink`] and reports [`Observation`]s to it; the binary
//! decides whether those end up in Prometheus, in a test recorder, or nowhere.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

/// A single observability event
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Wall-clock duration of one issuance workflow run
    IssuanceDuration {
        /// Certificate request the run was for
        request: String,
        /// Elapsed time in seconds
        seconds: f64,
        /// Whether the run ended with a written secret
        success: bool,
    },
    /// Days until the stored certificate expires
    ///
    /// `-1` means the value could not be computed (no secret, or the stored
    /// certificate could not be parsed).
    DaysRemaining {
        /// Certificate request name
        request: String,
        /// Base (ACME DNS) domain of the request
        base_domain: String,
        /// Whole days remaining, floored; negative once expired
        days: i64,
    },
}

impl Observation {
    /// Short event kind, used for logging and as a metric family hint
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::IssuanceDuration { .. } => "issuance-duration",
            Observation::DaysRemaining { .. } => "days-remaining",
        }
    }
}

/// Receiver for observability events
pub trait ObservabilitySink: Send + Sync + fmt::Debug {
    /// Record one event
    fn record(&self, observation: Observation);
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record(&self, observation: Observation) {
        trace!(kind = observation.kind(), "Dropping observation");
    }
}

/// Sink that keeps every event in memory
///
/// Used by tests and by the CLI to print what a run would have reported.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Observation>>,
}

impl RecordingSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, in order
    pub fn events(&self) -> Vec<Observation> {
        self.events.lock().clone()
    }

    /// Recorded days-remaining values for a request
    pub fn days_remaining_for(&self, request: &str) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Observation::DaysRemaining {
                    request: r, days, ..
                } if r == request => Some(*days),
                _ => None,
            })
            .collect()
    }

    /// Number of issuance-duration samples recorded for a request
    pub fn issuance_samples_for(&self, request: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| {
                matches!(event, Observation::IssuanceDuration { request: r, .. } if r == request)
            })
            .count()
    }
}

impl ObservabilitySink for RecordingSink {
    fn record(&self, observation: Observation) {
        self.events.lock().push(observation);
    }
}
