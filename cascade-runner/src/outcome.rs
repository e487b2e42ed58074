// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outcomes of supervised test executions.

use crate::{errors::ChildError, test_case::TestId};
use bytes::Bytes;
use camino::Utf8PathBuf;
pub use cascade_metadata::{CrashSignal, ExitCodeKind, OutcomeStatus};
use cascade_metadata::{DispositionSummary, OutcomeSummary};
use chrono::{DateTime, FixedOffset, Local};
use smol_str::SmolStr;
use std::{fmt, time::Duration};

/// How a supervised process ended, in platform-independent form.
///
/// Each disposition maps to exactly one [`OutcomeStatus`].
#[derive(Clone, Debug)]
pub enum ExitDisposition {
    /// The process exited on its own with this exit code.
    Exited(i32),

    /// The process was terminated by a signal it didn't handle (or, on Windows, an unhandled
    /// exception).
    Signaled(CrashSignal),

    /// The process didn't exit before its timeout, and was terminated.
    TimedOut,

    /// The process could not be started, or could not be waited on.
    SpawnFailed(ChildError),

    /// The run was cancelled while the process was running, and it was terminated.
    Cancelled,
}

impl ExitDisposition {
    /// Returns the outcome status for this disposition.
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Self::Exited(0) => OutcomeStatus::Pass,
            Self::Exited(_) => OutcomeStatus::Fail,
            Self::Signaled(_) => OutcomeStatus::Crash,
            Self::TimedOut => OutcomeStatus::Timeout,
            Self::SpawnFailed(_) | Self::Cancelled => OutcomeStatus::Error,
        }
    }

    fn to_summary(&self) -> DispositionSummary {
        match self {
            Self::Exited(code) => DispositionSummary::Exited {
                code: *code,
                code_kind: ExitCodeKind::from_code(*code),
            },
            Self::Signaled(signal) => DispositionSummary::Signaled { signal: *signal },
            Self::TimedOut => DispositionSummary::TimedOut,
            Self::SpawnFailed(error) => DispositionSummary::SpawnFailed {
                message: DisplayErrorChain(error).to_string(),
            },
            Self::Cancelled => DispositionSummary::Cancelled,
        }
    }
}

/// The reason a test was not run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The owning project failed to build.
    BuildFailed {
        /// The owning project.
        project: SmolStr,
    },

    /// The owning project was skipped because one of its dependencies didn't build.
    BuildSkipped {
        /// The owning project.
        project: SmolStr,
    },

    /// The run was cancelled before the test started.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildFailed { project } => write!(f, "project `{project}` failed to build"),
            Self::BuildSkipped { project } => write!(f, "project `{project}` was not built"),
            Self::Cancelled => write!(f, "run was cancelled"),
        }
    }
}

/// A report artifact found on disk after a test process ended.
///
/// The contents are opaque: they never affect the outcome status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReportArtifact {
    /// The path the artifact was read from.
    pub path: Utf8PathBuf,

    /// The contents of the artifact.
    pub contents: Bytes,
}

/// The result of running one test case.
///
/// Every test case yields exactly one outcome, including tests that crashed before producing any
/// output and tests that were never run.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// The test this outcome is for.
    pub id: TestId,

    /// The classified status.
    pub status: OutcomeStatus,

    /// How the process ended, or `None` if it never ran.
    pub disposition: Option<ExitDisposition>,

    /// The reason the test was skipped, if it was.
    pub skip_reason: Option<SkipReason>,

    /// The time at which the process was started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the process ran for.
    pub duration: Duration,

    /// Captured standard output.
    pub stdout: Bytes,

    /// Captured standard error.
    pub stderr: Bytes,

    /// The report artifact found on disk after the process ended.
    pub report_artifact: Option<ReportArtifact>,

    /// True if the process left its output pipes open after it exited, typically because a
    /// grandchild inherited them.
    pub leaked: bool,

    /// True if the run was cancelled while this test was running.
    pub cancelled: bool,
}

impl Outcome {
    /// Creates an outcome for a test that was not run.
    pub fn skipped(id: TestId, reason: SkipReason) -> Self {
        Self {
            id,
            status: OutcomeStatus::Skipped,
            disposition: None,
            cancelled: matches!(reason, SkipReason::Cancelled),
            skip_reason: Some(reason),
            start_time: Local::now().fixed_offset(),
            duration: Duration::ZERO,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            report_artifact: None,
            leaked: false,
        }
    }

    /// The exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.disposition {
            Some(ExitDisposition::Exited(code)) => Some(*code),
            _ => None,
        }
    }

    /// The terminating signal, if the process crashed.
    pub fn signal(&self) -> Option<CrashSignal> {
        match &self.disposition {
            Some(ExitDisposition::Signaled(signal)) => Some(*signal),
            _ => None,
        }
    }

    /// The classification of the exit code, per the fixture exit-code convention.
    pub fn exit_code_kind(&self) -> Option<ExitCodeKind> {
        self.exit_code().map(ExitCodeKind::from_code)
    }

    /// A short description of why this outcome is not a pass, or `None` if it passed.
    pub fn failure_message(&self) -> Option<String> {
        match (&self.disposition, &self.skip_reason) {
            (_, Some(reason)) => Some(format!("skipped: {reason}")),
            (Some(ExitDisposition::Exited(0)), _) => None,
            (Some(ExitDisposition::Exited(code)), _) => Some(format!(
                "exited with code {code} ({})",
                ExitCodeKind::from_code(*code).description()
            )),
            (Some(ExitDisposition::Signaled(signal)), _) => {
                Some(format!("terminated by signal {signal}"))
            }
            (Some(ExitDisposition::TimedOut), _) => Some(format!(
                "timed out after {:.3}s",
                self.duration.as_secs_f64()
            )),
            (Some(ExitDisposition::SpawnFailed(error)), _) => {
                Some(DisplayErrorChain(error).to_string())
            }
            (Some(ExitDisposition::Cancelled), _) => Some("run was cancelled".to_owned()),
            (None, None) => None,
        }
    }

    /// Converts this outcome into its serializable form.
    pub fn to_summary(&self) -> OutcomeSummary {
        let disposition = match &self.disposition {
            Some(disposition) => disposition.to_summary(),
            None => DispositionSummary::NotRun,
        };
        OutcomeSummary::new(
            self.id.project().clone(),
            self.id.name().clone(),
            self.status,
            disposition,
            self.duration.as_secs_f64(),
            self.leaked,
            self.report_artifact
                .as_ref()
                .map(|artifact| artifact.path.clone()),
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

/// Displays an error along with its chain of sources, separated by `: `.
pub(crate) struct DisplayErrorChain<E>(pub(crate) E);

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
