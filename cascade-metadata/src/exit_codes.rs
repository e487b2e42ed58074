// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Documented exit codes for a process driving a cascade run.
///
/// Drivers built on top of `cascade-runner` should exit with one of these codes so that callers
/// can tell build failures apart from test failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum CascadeExitCode {}

impl CascadeExitCode {
    /// No errors occurred and every scheduled test passed.
    pub const OK: i32 = 0;

    /// No tests were scheduled, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// The project graph was invalid: an unknown dependency, a cycle, or a shared build
    /// directory.
    pub const INVALID_GRAPH: i32 = 97;

    /// A user issue happened while setting up a run, for example a configuration error.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed, timed out, crashed or could not be started.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// One or more projects failed to build.
    pub const BUILD_FAILED: i32 = 101;

    /// The run was cancelled before it completed.
    pub const CANCELLED: i32 = 102;

    /// Writing a report to disk produced an error.
    pub const WRITE_REPORT_ERROR: i32 = 110;
}

/// Exit codes used by binaries supervised by cascade.
///
/// Test and benchmark binaries are expected to follow this convention. The supervisor only
/// needs "zero or nonzero" to classify an outcome, but the precise code is preserved and
/// classified with [`ExitCodeKind`] for diagnostics.
pub enum ProbeExitCode {}

impl ProbeExitCode {
    /// The binary ran successfully.
    pub const SUCCESS: i32 = 0;

    /// An assertion or logic check failed.
    pub const FAILURE: i32 = 1;

    /// The binary was invoked incorrectly or its environment was misconfigured.
    pub const USAGE_ERROR: i32 = 2;
}

/// The meaning of a process exit code, per [`ProbeExitCode`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ExitCodeKind {
    /// Exit code 0.
    Success,

    /// Exit code 1: an assertion or logic failure.
    Failure,

    /// Exit code 2: a usage or configuration error.
    UsageError,

    /// Any other exit code.
    Other {
        /// The exit code.
        code: i32,
    },
}

impl ExitCodeKind {
    /// Classifies an exit code.
    pub fn from_code(code: i32) -> Self {
        match code {
            ProbeExitCode::SUCCESS => Self::Success,
            ProbeExitCode::FAILURE => Self::Failure,
            ProbeExitCode::USAGE_ERROR => Self::UsageError,
            code => Self::Other { code },
        }
    }

    /// Returns a short human-readable description.
    pub fn description(self) -> String {
        match self {
            Self::Success => "success".to_owned(),
            Self::Failure => "assertion failure".to_owned(),
            Self::UsageError => "usage or configuration error".to_owned(),
            Self::Other { code } => format!("exit code {code}"),
        }
    }
}
