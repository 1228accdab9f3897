//! Single-consumer aggregation of instance events.
//!
//! The [`Recorder`] owns every aggregate counter of a run. It drains the shared
//! event channel, keeps all-time totals plus a rolling window, and emits
//! [`Report`]s on two cadences:
//!
//! - a window report every [`ReportIntervals::window`], covering the hops seen
//!   since the previous window report
//! - a snapshot every [`ReportIntervals::snapshot`], covering the whole run
//!
//! Periodic reports are skipped while the span they cover has no successful
//! hop. The final report is always produced.

mod report;

pub use report::{Report, ReportKind, Tally};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{Event, EventKind, ReportIntervals};

/// Aggregates events from all instances of a run.
#[derive(Debug)]
pub struct Recorder {
    intervals: ReportIntervals,
    started_at: Instant,
    window_started: Instant,
    last_snapshot: Instant,
    totals: Tally,
    window: Tally,
    live: usize,
    dead: usize,
    started: usize,
    seen_live: bool,
}

impl Recorder {
    pub fn new(intervals: ReportIntervals) -> Self {
        let now = Instant::now();
        Self {
            intervals,
            started_at: now,
            window_started: now,
            last_snapshot: now,
            totals: Tally::default(),
            window: Tally::default(),
            live: 0,
            dead: 0,
            started: 0,
            seen_live: false,
        }
    }

    /// Folds one event into the counters and returns the periodic reports
    /// that became due.
    pub fn observe(&mut self, event: Event) -> Vec<Report> {
        match event.kind {
            EventKind::TxSucceeded { .. } => {
                let latency_ms = event.latency_ms().unwrap_or_default();
                self.totals.record_success(latency_ms);
                self.window.record_success(latency_ms);
            }
            EventKind::TxFailed => {
                self.totals.record_failure();
                self.window.record_failure();
            }
            EventKind::InstanceStarted => {
                self.live += 1;
                self.started += 1;
                self.seen_live = true;
            }
            EventKind::InstanceStopped => {
                if self.live == 0 {
                    warn!(instance = event.instance, "Stop event without a running instance");
                } else {
                    self.live -= 1;
                    self.dead += 1;
                }
            }
        }

        let mut reports = Vec::new();
        if self.is_finished() {
            return reports;
        }

        let now = Instant::now();
        if self.totals.succeeded > 0 && now - self.last_snapshot >= self.intervals.snapshot {
            reports.push(Report::new(
                ReportKind::Snapshot,
                &self.totals,
                now - self.started_at,
                self.live,
                self.dead,
            ));
            self.last_snapshot = now;
        }
        if self.window.succeeded > 0 && now - self.window_started >= self.intervals.window {
            reports.push(Report::new(
                ReportKind::Window,
                &self.window,
                now - self.window_started,
                self.live,
                self.dead,
            ));
            self.window = Tally::default();
            self.window_started = now;
        }
        reports
    }

    /// True once every started instance has stopped again.
    pub fn is_finished(&self) -> bool {
        self.seen_live && self.live == 0
    }

    /// Report over the whole run, built regardless of the success count.
    pub fn final_report(&self) -> Report {
        Report::new(
            ReportKind::Final,
            &self.totals,
            self.started_at.elapsed(),
            self.live,
            self.dead,
        )
    }

    pub fn totals(&self) -> &Tally {
        &self.totals
    }

    pub fn window(&self) -> &Tally {
        &self.window
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn dead(&self) -> usize {
        self.dead
    }

    /// Number of `InstanceStarted` events seen.
    pub fn started_instances(&self) -> usize {
        self.started
    }

    /// Drains `events` until the run finishes or every sender is gone, then
    /// logs and returns the final report.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Report {
        info!(
            window_s = self.intervals.window.as_secs_f64(),
            snapshot_s = self.intervals.snapshot.as_secs_f64(),
            "Recorder started"
        );

        while let Some(event) = events.recv().await {
            for report in self.observe(event) {
                report.log();
            }
            if self.is_finished() {
                break;
            }
        }

        let report = self.final_report();
        report.log();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn success(instance: usize, ms: u64) -> Event {
        Event::new(
            instance,
            EventKind::TxSucceeded {
                latency: Duration::from_millis(ms),
            },
        )
    }

    fn kind(instance: usize, kind: EventKind) -> Event {
        Event::new(instance, kind)
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_plus_dead_matches_started() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        let events = [
            kind(0, EventKind::InstanceStarted),
            kind(1, EventKind::InstanceStarted),
            success(0, 10),
            kind(0, EventKind::InstanceStopped),
            kind(2, EventKind::InstanceStarted),
            kind(1, EventKind::TxFailed),
            kind(2, EventKind::InstanceStopped),
            kind(1, EventKind::InstanceStopped),
        ];

        for event in events {
            recorder.observe(event);
            assert_eq!(recorder.live() + recorder.dead(), recorder.started_instances());
        }
        assert!(recorder.is_finished());
        assert_eq!(recorder.dead(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishes_only_after_going_live() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        assert!(!recorder.is_finished());

        recorder.observe(kind(0, EventKind::InstanceStarted));
        recorder.observe(kind(1, EventKind::InstanceStarted));
        recorder.observe(kind(0, EventKind::InstanceStopped));
        assert!(!recorder.is_finished());

        recorder.observe(kind(1, EventKind::InstanceStopped));
        assert!(recorder.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_stop_keeps_counters_consistent() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        recorder.observe(kind(4, EventKind::InstanceStopped));

        assert_eq!(recorder.live(), 0);
        assert_eq!(recorder.dead(), 0);
        assert!(!recorder.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_report_is_exact_mean() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        recorder.observe(kind(0, EventKind::InstanceStarted));
        assert!(recorder.observe(success(0, 90)).is_empty());
        assert!(recorder.observe(success(0, 110)).is_empty());
        recorder.observe(kind(0, EventKind::TxFailed));

        advance(Duration::from_secs(5)).await;
        let reports = recorder.observe(success(0, 160));

        assert_eq!(reports.len(), 1);
        let report = reports[0];
        assert_eq!(report.kind, ReportKind::Window);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.average_cost_ms, Some(120.0));
        assert_eq!(report.elapsed, Duration::from_secs(5));
        assert_eq!(report.tps, 3.0 / 5.0);

        // The window restarts, the totals do not.
        assert_eq!(*recorder.window(), Tally::default());
        assert_eq!(recorder.totals().succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_without_success_is_not_reported() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        recorder.observe(kind(0, EventKind::InstanceStarted));

        advance(Duration::from_secs(30)).await;
        assert!(recorder.observe(kind(0, EventKind::TxFailed)).is_empty());
        assert!(recorder.observe(kind(0, EventKind::TxFailed)).is_empty());

        // The window keeps accumulating until a success makes it reportable.
        let reports = recorder.observe(success(0, 50));
        let window = reports.iter().find(|r| r.kind == ReportKind::Window).unwrap();
        assert_eq!(window.failed, 2);
        assert_eq!(window.succeeded, 1);
        assert_eq!(window.elapsed, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_covers_whole_run() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        recorder.observe(kind(0, EventKind::InstanceStarted));

        let mut reports = Vec::new();
        for _ in 0..4 {
            advance(Duration::from_secs(5)).await;
            reports = recorder.observe(success(0, 200));
        }

        // At 20s the snapshot fires alongside the window report.
        let snapshot = reports.iter().find(|r| r.kind == ReportKind::Snapshot).unwrap();
        assert_eq!(snapshot.succeeded, 4);
        assert_eq!(snapshot.elapsed, Duration::from_secs(20));
        assert!(reports.iter().any(|r| r.kind == ReportKind::Window));

        advance(Duration::from_secs(20)).await;
        let reports = recorder.observe(success(0, 400));
        let snapshot = reports.iter().find(|r| r.kind == ReportKind::Snapshot).unwrap();
        assert_eq!(snapshot.succeeded, 5);
        assert_eq!(snapshot.elapsed, Duration::from_secs(40));
        assert_eq!(snapshot.average_cost_ms, Some(240.0));
        assert_eq!(snapshot.live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_periodic_report_on_final_stop() {
        let mut recorder = Recorder::new(ReportIntervals::default());
        recorder.observe(kind(0, EventKind::InstanceStarted));
        recorder.observe(success(0, 10));

        advance(Duration::from_secs(60)).await;
        assert!(recorder.observe(kind(0, EventKind::InstanceStopped)).is_empty());

        let report = recorder.final_report();
        assert_eq!(report.kind, ReportKind::Final);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.dead, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_report_without_successes() {
        let recorder = Recorder::new(ReportIntervals::default());
        let report = recorder.final_report();

        assert_eq!(report.average_cost_ms, None);
        assert_eq!(report.tps, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(kind(0, EventKind::TxFailed)).await.unwrap();
        drop(tx);

        let report = Recorder::new(ReportIntervals::default()).run(rx).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_terminates_once_all_workers_stop() {
        let (tx, rx) = mpsc::channel(2);
        let recorder = tokio::spawn(Recorder::new(ReportIntervals::default()).run(rx));

        // The test keeps `tx` alive, so only the stop accounting can end the run.
        let mut workers = Vec::new();
        for id in 0..5 {
            let tx = tx.clone();
            workers.push(tokio::spawn(async move {
                tx.send(kind(id, EventKind::InstanceStarted)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                for round in 0..id as u64 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    tx.send(success(id, 100 + round)).await.unwrap();
                }
                tx.send(kind(id, EventKind::InstanceStopped)).await.unwrap();
            }));
        }

        // All instances start before any can stop, so the run covers them all.
        let report = recorder.await.unwrap();
        assert_eq!(report.dead, 5);
        assert_eq!(report.live, 0);
        assert_eq!(report.succeeded, (0..5).sum::<u64>());
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
