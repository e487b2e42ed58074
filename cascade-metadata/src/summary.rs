// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{ExitCodeKind, SummaryReadError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, io};

/// Root element for a serializable summary of a cascade run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct RunSummary {
    /// A unique identifier for this run.
    pub run_id: String,

    /// Whether the run was cancelled before it completed.
    pub cancelled: bool,

    /// Per-project build results, in build order.
    pub builds: Vec<BuildSummary>,

    /// Per-test outcomes, in the order they were recorded.
    pub outcomes: Vec<OutcomeSummary>,

    /// Counts of outcomes by status.
    pub counts: StatusCounts,
}

impl RunSummary {
    /// Creates a new run summary.
    pub fn new(
        run_id: impl Into<String>,
        cancelled: bool,
        builds: Vec<BuildSummary>,
        outcomes: Vec<OutcomeSummary>,
    ) -> Self {
        let counts = StatusCounts::from_statuses(outcomes.iter().map(|o| o.status));
        Self {
            run_id: run_id.into(),
            cancelled,
            builds,
            outcomes,
            counts,
        }
    }

    /// Parses a run summary from a JSON string.
    pub fn parse_json(json: impl AsRef<str>) -> Result<Self, SummaryReadError> {
        serde_json::from_str(json.as_ref()).map_err(SummaryReadError::Json)
    }

    /// Reads a run summary from a JSON reader.
    pub fn from_reader(reader: impl io::Read) -> Result<Self, SummaryReadError> {
        serde_json::from_reader(reader).map_err(|err| {
            if err.is_io() {
                SummaryReadError::Io(err.into())
            } else {
                SummaryReadError::Json(err)
            }
        })
    }
}

/// The build status of a project.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    /// The project has not been started yet.
    Pending,

    /// The project's build action is running.
    Building,

    /// The project was built successfully.
    Success,

    /// The project's build action failed.
    Failed,

    /// The project was not built, because a dependency failed or the run was cancelled.
    Skipped,
}

impl BuildStatus {
    /// Returns true if this is a terminal state.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The classified status of a single test execution.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    /// The process exited with code 0.
    Pass,

    /// The process exited with a nonzero code.
    Fail,

    /// The process did not exit before its timeout and was terminated.
    Timeout,

    /// The process was terminated by a signal it did not handle.
    Crash,

    /// The process could not be started, or the run was cancelled while it was running.
    Error,

    /// The test was not run because its owning project was not built.
    Skipped,
}

impl OutcomeStatus {
    /// Returns true if this status counts towards pass/fail ratios.
    pub fn is_executed(self) -> bool {
        !matches!(self, Self::Skipped)
    }

    /// Returns true if this status is a success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Timeout => "TIMEOUT",
            Self::Crash => "CRASH",
            Self::Error => "ERROR",
            Self::Skipped => "SKIP",
        };
        f.write_str(s)
    }
}

/// Counts of outcomes by status.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusCounts {
    /// The number of tests that passed.
    pub pass: usize,

    /// The number of tests that failed.
    pub fail: usize,

    /// The number of tests that timed out.
    pub timeout: usize,

    /// The number of tests that crashed.
    pub crash: usize,

    /// The number of tests that could not be run to completion.
    pub error: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,
}

impl StatusCounts {
    /// Computes counts from an iterator of statuses.
    pub fn from_statuses(statuses: impl IntoIterator<Item = OutcomeStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(status);
        }
        counts
    }

    /// Increments the count for `status`.
    pub fn add(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Pass => self.pass += 1,
            OutcomeStatus::Fail => self.fail += 1,
            OutcomeStatus::Timeout => self.timeout += 1,
            OutcomeStatus::Crash => self.crash += 1,
            OutcomeStatus::Error => self.error += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
    }

    /// Returns the count for `status`.
    pub fn get(&self, status: OutcomeStatus) -> usize {
        match status {
            OutcomeStatus::Pass => self.pass,
            OutcomeStatus::Fail => self.fail,
            OutcomeStatus::Timeout => self.timeout,
            OutcomeStatus::Crash => self.crash,
            OutcomeStatus::Error => self.error,
            OutcomeStatus::Skipped => self.skipped,
        }
    }

    /// The total number of outcomes, including skipped ones.
    pub fn total(&self) -> usize {
        self.executed() + self.skipped
    }

    /// The number of outcomes that were executed, i.e. everything but skipped tests.
    pub fn executed(&self) -> usize {
        self.pass + self.failed()
    }

    /// The number of executed outcomes that were not a pass.
    pub fn failed(&self) -> usize {
        self.fail + self.timeout + self.crash + self.error
    }

    /// Returns the ratio of passing tests to executed tests, or `None` if nothing was executed.
    ///
    /// Skipped tests are excluded.
    pub fn pass_ratio(&self) -> Option<f64> {
        let executed = self.executed();
        (executed > 0).then(|| self.pass as f64 / executed as f64)
    }
}

/// A signal that terminated a supervised process, in platform-independent form.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashSignal {
    /// Abnormal termination (`SIGABRT`, or a fail-fast exception on Windows).
    Abort,

    /// Bus error (`SIGBUS`).
    Bus,

    /// Arithmetic fault (`SIGFPE`, or an integer divide-by-zero exception on Windows).
    FloatingPoint,

    /// Illegal instruction (`SIGILL`).
    IllegalInstruction,

    /// Invalid memory access (`SIGSEGV`, or an access violation on Windows).
    Segmentation,

    /// Trace or breakpoint trap (`SIGTRAP`).
    Trap,

    /// Forced kill (`SIGKILL`).
    Kill,

    /// Termination request (`SIGTERM`).
    Terminate,

    /// Interrupt (`SIGINT`).
    Interrupt,

    /// Hangup (`SIGHUP`).
    Hangup,

    /// Quit (`SIGQUIT`).
    Quit,

    /// Broken pipe (`SIGPIPE`).
    Pipe,

    /// Alarm clock (`SIGALRM`).
    Alarm,

    /// Any other platform-specific signal or exception code.
    Other(i32),
}

impl fmt::Display for CrashSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "SIGABRT",
            Self::Bus => "SIGBUS",
            Self::FloatingPoint => "SIGFPE",
            Self::IllegalInstruction => "SIGILL",
            Self::Segmentation => "SIGSEGV",
            Self::Trap => "SIGTRAP",
            Self::Kill => "SIGKILL",
            Self::Terminate => "SIGTERM",
            Self::Interrupt => "SIGINT",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::Pipe => "SIGPIPE",
            Self::Alarm => "SIGALRM",
            Self::Other(code) => return write!(f, "signal {code}"),
        };
        f.write_str(s)
    }
}

/// How a supervised process ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "kind")]
pub enum DispositionSummary {
    /// The process exited normally.
    Exited {
        /// The exit code.
        code: i32,

        /// The meaning of the exit code.
        code_kind: ExitCodeKind,
    },

    /// The process was terminated by a signal.
    Signaled {
        /// The signal.
        signal: CrashSignal,
    },

    /// The process timed out and was terminated.
    TimedOut,

    /// The process could not be spawned.
    SpawnFailed {
        /// The error message.
        message: String,
    },

    /// The run was cancelled while the process was running.
    Cancelled,

    /// The process was never started.
    NotRun,
}

/// A serializable summary of a project build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct BuildSummary {
    /// The name of the project.
    pub project: SmolStr,

    /// The final build status.
    pub status: BuildStatus,

    /// The reason the build failed or was skipped, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Artifacts produced by the build.
    #[serde(default)]
    pub artifacts: Vec<Utf8PathBuf>,

    /// Time taken by the build action, in seconds.
    pub time_taken_secs: f64,
}

impl BuildSummary {
    /// Creates a new build summary.
    pub fn new(
        project: impl Into<SmolStr>,
        status: BuildStatus,
        reason: Option<String>,
        artifacts: Vec<Utf8PathBuf>,
        time_taken_secs: f64,
    ) -> Self {
        Self {
            project: project.into(),
            status,
            reason,
            artifacts,
            time_taken_secs,
        }
    }
}

/// A serializable summary of a single test outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct OutcomeSummary {
    /// The project the test belongs to.
    pub project: SmolStr,

    /// The name of the test.
    pub name: SmolStr,

    /// The classified status.
    pub status: OutcomeStatus,

    /// How the process ended.
    pub disposition: DispositionSummary,

    /// Time taken by the test, in seconds.
    pub time_taken_secs: f64,

    /// Whether the process left its output pipes open after exiting.
    #[serde(default)]
    pub leaked: bool,

    /// The report artifact found on disk after the process ended, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_artifact: Option<Utf8PathBuf>,

    /// Captured standard output, lossily converted to UTF-8.
    #[serde(default)]
    pub stdout: String,

    /// Captured standard error, lossily converted to UTF-8.
    #[serde(default)]
    pub stderr: String,
}

impl OutcomeSummary {
    /// Creates a new outcome summary.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<SmolStr>,
        name: impl Into<SmolStr>,
        status: OutcomeStatus,
        disposition: DispositionSummary,
        time_taken_secs: f64,
        leaked: bool,
        report_artifact: Option<Utf8PathBuf>,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            status,
            disposition,
            time_taken_secs,
            leaked,
            report_artifact,
            stdout,
            stderr,
        }
    }
}
