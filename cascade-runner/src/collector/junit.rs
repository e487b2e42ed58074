// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Code to generate JUnit XML reports from aggregated outcomes.

use super::AggregatedReport;
use crate::{
    errors::WriteReportError,
    outcome::{ExitDisposition, Outcome, OutcomeStatus},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use smol_str::SmolStr;
use std::fs::File;

static PROCESS_FAILED_TO_START: &str = "(process failed to start)";

pub(super) fn to_junit_report(report: &AggregatedReport, report_name: &str) -> Report {
    // One suite per project, in the order projects first appear.
    let mut test_suites: IndexMap<SmolStr, TestSuite> = IndexMap::new();
    for outcome in report.outcomes() {
        let project = outcome.id.project();
        test_suites
            .entry(project.clone())
            .or_insert_with(|| TestSuite::new(project.as_str()))
            .add_test_case(to_test_case(outcome));
    }

    let mut junit = Report::new(report_name);
    junit
        .set_report_uuid(report.run_id())
        .set_timestamp(report.start_time())
        .set_time(report.elapsed())
        .add_test_suites(test_suites.into_values());
    junit
}

pub(super) fn write_junit_report(junit: &Report, path: &Utf8Path) -> Result<(), WriteReportError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|error| WriteReportError::Fs {
            file: dir.to_owned(),
            error,
        })?;
    }

    let f = File::create(path).map_err(|error| WriteReportError::Fs {
        file: path.to_owned(),
        error,
    })?;
    junit
        .serialize(f)
        .map_err(|error| WriteReportError::Junit {
            file: path.to_owned(),
            error: Box::new(error),
        })
}

fn to_test_case(outcome: &Outcome) -> TestCase {
    let mut status = match outcome.status {
        OutcomeStatus::Pass => TestCaseStatus::success(),
        OutcomeStatus::Skipped => TestCaseStatus::skipped(),
        OutcomeStatus::Fail | OutcomeStatus::Timeout | OutcomeStatus::Crash => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
            status.set_type(failure_type(outcome));
            status
        }
        OutcomeStatus::Error => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
            status.set_type(failure_type(outcome));
            status
        }
    };
    if let Some(message) = outcome.failure_message() {
        status.set_message(message);
    }

    let mut testcase = TestCase::new(outcome.id.name().as_str(), status);
    // classname is required by the JUnit format; use the project name, matching the suite.
    testcase.set_classname(outcome.id.project().as_str());

    if outcome.status.is_executed() {
        testcase
            .set_timestamp(outcome.start_time)
            .set_time(outcome.duration);
    }

    // Output is only stored for executed tests that didn't pass.
    match &outcome.disposition {
        Some(ExitDisposition::SpawnFailed(_)) => {
            testcase
                .set_system_out(PROCESS_FAILED_TO_START)
                .set_system_err(PROCESS_FAILED_TO_START);
        }
        Some(_) if !outcome.status.is_success() => {
            testcase
                .set_system_out(String::from_utf8_lossy(&outcome.stdout).into_owned())
                .set_system_err(String::from_utf8_lossy(&outcome.stderr).into_owned());
        }
        _ => {}
    }

    testcase
}

fn failure_type(outcome: &Outcome) -> String {
    let ty = match &outcome.disposition {
        Some(ExitDisposition::Exited(code)) => format!("test failure with exit code {code}"),
        Some(ExitDisposition::Signaled(signal)) => format!("test crash with signal {signal}"),
        Some(ExitDisposition::TimedOut) => "test timeout".to_owned(),
        Some(ExitDisposition::SpawnFailed(_)) => "execution failure".to_owned(),
        Some(ExitDisposition::Cancelled) => "test cancelled".to_owned(),
        None => "test not run".to_owned(),
    };
    if outcome.leaked {
        format!("{ty}, and leaked handles")
    } else {
        ty
    }
}
