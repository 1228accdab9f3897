//! Tallies and the reports built from them.

use std::fmt;
use std::time::Duration;

use tracing::info;

/// Outcome counts over some span of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Hops confirmed as successful.
    pub succeeded: u64,
    /// Hops confirmed as failed.
    pub failed: u64,
    /// Sum of confirmation latencies of successful hops, in milliseconds.
    pub latency_ms: u64,
}

impl Tally {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.succeeded += 1;
        self.latency_ms += latency_ms;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Mean confirmation latency of successful hops.
    pub fn average_cost_ms(&self) -> Option<f64> {
        (self.succeeded > 0).then(|| self.latency_ms as f64 / self.succeeded as f64)
    }

    /// Successful hops per second over `elapsed`.
    pub fn tps(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }
}

/// Which cadence produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Activity since the previous window report.
    Window,
    /// Periodic snapshot of the whole run so far.
    Snapshot,
    /// Emitted once when the run ends.
    Final,
}

/// A throughput report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub kind: ReportKind,
    /// Span the counts cover.
    pub elapsed: Duration,
    pub succeeded: u64,
    pub failed: u64,
    /// Instances still running when the report was built.
    pub live: usize,
    /// Instances that have stopped.
    pub dead: usize,
    /// Mean confirmation latency; `None` without successes.
    pub average_cost_ms: Option<f64>,
    pub tps: f64,
}

impl Report {
    pub fn new(kind: ReportKind, tally: &Tally, elapsed: Duration, live: usize, dead: usize) -> Self {
        Self {
            kind,
            elapsed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            live,
            dead,
            average_cost_ms: tally.average_cost_ms(),
            tps: tally.tps(elapsed),
        }
    }

    /// Emits the report through `tracing`.
    pub fn log(&self) {
        let message = match self.kind {
            ReportKind::Window => "Data since last record",
            ReportKind::Snapshot => "Total data",
            ReportKind::Final => "Final total data",
        };
        info!(
            duration_s = self.elapsed.as_secs_f64(),
            succeeded = self.succeeded,
            failed = self.failed,
            running = self.live,
            dead = self.dead,
            average_confirm_ms = ?self.average_cost_ms,
            tps = self.tps,
            "{message}"
        );
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: duration {:.3} s, succeeded {}, failed {}, running {}, dead {}, ",
            self.kind,
            self.elapsed.as_secs_f64(),
            self.succeeded,
            self.failed,
            self.live,
            self.dead,
        )?;
        match self.average_cost_ms {
            Some(cost) => write!(f, "avg confirm {cost:.1} ms, ")?,
            None => write!(f, "avg confirm n/a, ")?,
        }
        write!(f, "tps {:.3}", self.tps)
    }
}
