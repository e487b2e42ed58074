// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregating test outcomes into a report.
//!
//! Workers send [`Outcome`]s through an [`OutcomeSender`]; the [`ResultCollector`] is the single
//! consumer, and is the only thing that ever mutates the results of a run.

mod junit;

use crate::{
    errors::{FinalizeError, RecordError, WriteReportError},
    outcome::{Outcome, OutcomeStatus, SkipReason},
    test_case::TestId,
    time::StopwatchStart,
};
use camino::Utf8Path;
use cascade_metadata::{OutcomeSummary, StatusCounts};
use chrono::{DateTime, FixedOffset};
use indexmap::{IndexMap, IndexSet};
use quick_junit::ReportUuid;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Creates a channel for sending outcomes to a [`ResultCollector`].
pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (OutcomeSender { sender }, OutcomeReceiver { receiver })
}

/// The sending half of an outcome channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct OutcomeSender {
    sender: mpsc::UnboundedSender<Outcome>,
}

impl OutcomeSender {
    /// Sends an outcome to the collector.
    ///
    /// If the collector has gone away, the outcome is dropped.
    pub fn send(&self, outcome: Outcome) {
        if let Err(error) = self.sender.send(outcome) {
            debug!(id = %error.0.id, "collector is gone, dropping outcome");
        }
    }
}

/// The receiving half of an outcome channel, consumed by [`ResultCollector::consume`].
#[derive(Debug)]
pub struct OutcomeReceiver {
    receiver: mpsc::UnboundedReceiver<Outcome>,
}

/// Gathers per-test outcomes into an [`AggregatedReport`].
#[derive(Debug)]
pub struct ResultCollector {
    run_id: ReportUuid,
    stopwatch: StopwatchStart,
    expected: IndexSet<TestId>,
    outcomes: IndexMap<TestId, Outcome>,
    cancelled: bool,
}

impl ResultCollector {
    /// Creates a collector expecting one outcome for each test in `expected`.
    pub fn new(run_id: ReportUuid, expected: impl IntoIterator<Item = TestId>) -> Self {
        Self {
            run_id,
            stopwatch: crate::time::stopwatch(),
            expected: expected.into_iter().collect(),
            outcomes: IndexMap::new(),
            cancelled: false,
        }
    }

    /// The run ID.
    pub fn run_id(&self) -> ReportUuid {
        self.run_id
    }

    /// Records an outcome.
    ///
    /// Returns an error if an outcome was already recorded for the same test. Outcomes for tests
    /// that weren't expected are accepted and reported after the expected ones.
    pub fn record(&mut self, outcome: Outcome) -> Result<(), RecordError> {
        if self.outcomes.contains_key(&outcome.id) {
            return Err(RecordError::DuplicateResult { id: outcome.id });
        }
        if !self.expected.contains(&outcome.id) {
            debug!(id = %outcome.id, "recording outcome for unexpected test");
        }
        self.outcomes.insert(outcome.id.clone(), outcome);
        Ok(())
    }

    /// Records that a test was not run.
    pub fn record_skipped(&mut self, id: TestId, reason: SkipReason) -> Result<(), RecordError> {
        self.record(Outcome::skipped(id, reason))
    }

    /// Marks the run as cancelled. Tests without an outcome are then reported as skipped rather
    /// than failing [`finalize`](Self::finalize).
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Returns true if the run was marked as cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Records every outcome sent through `receiver`, until all senders are dropped.
    pub async fn consume(&mut self, mut receiver: OutcomeReceiver) -> Result<(), RecordError> {
        while let Some(outcome) = receiver.receiver.recv().await {
            self.record(outcome)?;
        }
        Ok(())
    }

    /// Produces the aggregated report.
    ///
    /// Outcomes are ordered as the tests were expected, followed by any unexpected ones in the
    /// order they were recorded.
    pub fn finalize(mut self) -> Result<AggregatedReport, FinalizeError> {
        let missing: Vec<_> = self
            .expected
            .iter()
            .filter(|id| !self.outcomes.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            if !self.cancelled {
                return Err(FinalizeError::RunIncomplete { missing });
            }
            for id in missing {
                self.outcomes
                    .insert(id.clone(), Outcome::skipped(id, SkipReason::Cancelled));
            }
        }

        let mut outcomes = Vec::with_capacity(self.outcomes.len());
        for id in &self.expected {
            if let Some(outcome) = self.outcomes.shift_remove(id) {
                outcomes.push(outcome);
            }
        }
        outcomes.extend(self.outcomes.into_values());

        let snapshot = self.stopwatch.snapshot();
        let counts = StatusCounts::from_statuses(outcomes.iter().map(|outcome| outcome.status));
        Ok(AggregatedReport {
            run_id: self.run_id,
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
            cancelled: self.cancelled,
            outcomes,
            counts,
        })
    }
}

/// The outcomes of a run, with summary counts.
#[derive(Clone, Debug)]
pub struct AggregatedReport {
    run_id: ReportUuid,
    start_time: DateTime<FixedOffset>,
    elapsed: Duration,
    cancelled: bool,
    outcomes: Vec<Outcome>,
    counts: StatusCounts,
}

impl AggregatedReport {
    /// The run ID.
    pub fn run_id(&self) -> ReportUuid {
        self.run_id
    }

    /// The time at which collection started.
    pub fn start_time(&self) -> DateTime<FixedOffset> {
        self.start_time
    }

    /// The time between the start of collection and finalization.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Returns true if the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The outcomes, in order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Looks up the outcome for a test.
    pub fn get(&self, id: &TestId) -> Option<&Outcome> {
        self.outcomes.iter().find(|outcome| &outcome.id == id)
    }

    /// Counts of outcomes by status.
    pub fn counts(&self) -> &StatusCounts {
        &self.counts
    }

    /// The number of outcomes with the given status.
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.counts.get(status)
    }

    /// The ratio of passing tests to executed tests. Skipped tests are excluded.
    pub fn pass_ratio(&self) -> Option<f64> {
        self.counts.pass_ratio()
    }

    /// Returns true if the run wasn't cancelled and no executed test failed.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.counts.failed() == 0
    }

    /// Serializable summaries of every outcome, in order.
    pub fn outcome_summaries(&self) -> Vec<OutcomeSummary> {
        self.outcomes.iter().map(Outcome::to_summary).collect()
    }

    /// Renders this report as JUnit XML, with one test suite per project.
    pub fn to_junit(&self, report_name: &str) -> quick_junit::Report {
        junit::to_junit_report(self, report_name)
    }

    /// Writes this report as JUnit XML to `path`, creating parent directories as needed.
    pub fn write_junit(&self, path: &Utf8Path, report_name: &str) -> Result<(), WriteReportError> {
        junit::write_junit_report(&self.to_junit(report_name), path)
    }
}
