//! Events passed from instance workers to the recorder.

use std::time::Duration;

/// What happened inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A hop confirmed with a successful receipt.
    TxSucceeded {
        /// Time from accepted submission to observed confirmation.
        latency: Duration,
    },
    /// A hop confirmed with a failed receipt.
    TxFailed,
    /// The instance finished its transfer loop.
    InstanceStopped,
    /// The instance funded both accounts and entered its transfer loop.
    InstanceStarted,
}

/// A single outcome or lifecycle transition reported by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Index of the emitting instance.
    pub instance: usize,
    pub kind: EventKind,
}

impl Event {
    pub fn new(instance: usize, kind: EventKind) -> Self {
        Self { instance, kind }
    }

    /// Confirmation latency in whole milliseconds, for successful hops only.
    pub fn latency_ms(&self) -> Option<u64> {
        match self.kind {
            EventKind::TxSucceeded { latency } => Some(latency.as_millis() as u64),
            _ => None,
        }
    }
}
