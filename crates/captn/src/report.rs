//! Report Builder (C12) and the `Reporter` logging seam.
//!
//! The reference stack never pulls in `tracing`/`log`; its ambient
//! "observability" layer is a small trait threaded as `&mut dyn Reporter`
//! into every long-running operation (SPEC_FULL.md §A.3). `captn` follows
//! the same shape so tests can capture output with an in-memory `Reporter`
//! instead of asserting against stdout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UpdateOutcome;

/// The logging seam every long-running component writes user-visible
/// events through. `captn-cli` supplies an implementation that honors
/// `--log-level`; tests use [`RecordingReporter`].
pub trait Reporter {
    fn debug(&mut self, msg: &str) {
        let _ = msg;
    }
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A `Reporter` that discards everything. Useful as a default in tests that
/// don't care about log output.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Captures every call in order, tagged by level, for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    pub lines: Vec<(Level, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Reporter for RecordingReporter {
    fn debug(&mut self, msg: &str) {
        self.lines.push((Level::Debug, msg.to_string()));
    }
    fn info(&mut self, msg: &str) {
        self.lines.push((Level::Info, msg.to_string()));
    }
    fn warn(&mut self, msg: &str) {
        self.lines.push((Level::Warn, msg.to_string()));
    }
    fn error(&mut self, msg: &str) {
        self.lines.push((Level::Error, msg.to_string()));
    }
}

impl RecordingReporter {
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines
            .iter()
            .any(|(l, msg)| *l == level && msg.contains(needle))
    }
}

/// Per-image registry statistics gathered during discovery, surfaced in
/// the final report (§4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub image: String,
    pub candidates_listed: usize,
    pub pages_crawled: u32,
    pub retries: u32,
}

/// The structured per-run outcome consumed by the notification sink (§4.12).
/// This crate does not fix a wire format; callers serialize as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<UpdateOutcome>,
    pub registry_stats: Vec<RegistryStats>,
    pub dry_run: bool,
}

/// Accumulates outcomes and registry stats over the course of one run.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    started_at: Option<DateTime<Utc>>,
    outcomes: Vec<UpdateOutcome>,
    registry_stats: Vec<RegistryStats>,
    dry_run: bool,
}

impl ReportBuilder {
    pub fn new(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        ReportBuilder {
            started_at: Some(started_at),
            outcomes: Vec::new(),
            registry_stats: Vec::new(),
            dry_run,
        }
    }

    pub fn record_outcome(&mut self, outcome: UpdateOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn record_registry_stats(&mut self, stats: RegistryStats) {
        self.registry_stats.push(stats);
    }

    pub fn build(self, finished_at: DateTime<Utc>) -> Report {
        Report {
            started_at: self.started_at.unwrap_or(finished_at),
            finished_at,
            outcomes: self.outcomes,
            registry_stats: self.registry_stats,
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Durations, FinalState};

    fn outcome(name: &str, state: FinalState) -> UpdateOutcome {
        UpdateOutcome {
            container: name.to_string(),
            plan: None,
            steps_applied: 0,
            final_state: state,
            reason: None,
            durations: Durations::default(),
            script_results: Vec::new(),
        }
    }

    #[test]
    fn recording_reporter_captures_levels() {
        let mut r = RecordingReporter::default();
        r.info("hello");
        r.warn("careful");
        assert!(r.contains(Level::Info, "hello"));
        assert!(r.contains(Level::Warn, "careful"));
        assert!(!r.contains(Level::Error, "hello"));
    }

    #[test]
    fn report_builder_collects_every_outcome() {
        let now = Utc::now();
        let mut builder = ReportBuilder::new(now, false);
        builder.record_outcome(outcome("a", FinalState::Updated));
        builder.record_outcome(outcome("b", FinalState::Skipped));

        let report = builder.build(now);
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.dry_run);
    }
}
