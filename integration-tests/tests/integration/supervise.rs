// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervising the probe binary directly.

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use cascade_metadata::{ExitCodeKind, OutcomeStatus};
use cascade_runner::{cancel::CancelHandle, supervisor::ProcessSupervisor};
use color_eyre::Result;
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

fn supervisor() -> ProcessSupervisor {
    let mut supervisor = ProcessSupervisor::new();
    supervisor.set_default_timeout(Duration::from_secs(30));
    supervisor
}

#[tokio::test]
async fn pass_writes_report() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let test = probe_with_report(dir.path(), "core", "pass", ["pass"]).build();

    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(outcome.exit_code_kind(), Some(ExitCodeKind::Success));
    let artifact = outcome.report_artifact.expect("report artifact is attached");
    assert_eq!(artifact.path, report_path(dir.path(), "pass"));
    assert_eq!(&artifact.contents[..], b"pass");
    assert!(
        String::from_utf8_lossy(&outcome.stdout).contains("[cascade-probe] pass"),
        "stdout captured"
    );
    Ok(())
}

#[tokio::test]
async fn failure_preserves_exit_code_and_report() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let test = probe_with_report(dir.path(), "core", "fails", ["fail", "1"]).build();

    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.exit_code(), Some(1));
    assert_eq!(outcome.exit_code_kind(), Some(ExitCodeKind::Failure));
    let artifact = outcome.report_artifact.expect("report artifact is attached");
    assert_eq!(&artifact.contents[..], b"fail 1");
    Ok(())
}

#[tokio::test]
async fn usage_error_is_classified() {
    let test = probe("core", "misused", ["no-such-mode"]).build();

    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.exit_code_kind(), Some(ExitCodeKind::UsageError));
    assert!(
        String::from_utf8_lossy(&outcome.stderr).contains("unknown mode `no-such-mode`"),
        "stderr: {}",
        String::from_utf8_lossy(&outcome.stderr)
    );
}

#[cfg(unix)]
#[tokio::test]
async fn crash_after_report_keeps_artifact() -> Result<()> {
    use cascade_metadata::CrashSignal;

    let dir = Utf8TempDir::new()?;
    let supervisor = supervisor();
    let cancel = CancelHandle::new();

    let segv = probe_with_report(dir.path(), "core", "segv", ["crash", "segv"]).build();
    let outcome = supervisor.execute(&segv, &cancel).await;
    assert_eq!(outcome.status, OutcomeStatus::Crash);
    assert_eq!(outcome.signal(), Some(CrashSignal::Segmentation));
    assert_eq!(outcome.exit_code(), None);
    let artifact = outcome.report_artifact.expect("report artifact is attached");
    assert_eq!(&artifact.contents[..], b"crash segv");

    let abort = probe_with_report(dir.path(), "core", "abort", ["crash", "abort"]).build();
    let outcome = supervisor.execute(&abort, &cancel).await;
    assert_eq!(outcome.status, OutcomeStatus::Crash);
    assert_eq!(outcome.signal(), Some(CrashSignal::Abort));
    assert!(outcome.report_artifact.is_some());
    Ok(())
}

#[tokio::test]
async fn timeout_terminates_process() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let test = probe_with_report(dir.path(), "core", "sleeper", ["sleep", "2000"])
        .timeout(Duration::from_millis(500))
        .build();

    let start = Instant::now();
    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;
    let elapsed = start.elapsed();

    assert_eq!(outcome.status, OutcomeStatus::Timeout);
    assert!(
        elapsed < Duration::from_millis(1900),
        "terminated before the sleep finished (took {elapsed:?})"
    );
    assert!(outcome.duration >= Duration::from_millis(500));

    // The probe records its pid before sleeping, and is killed before it can overwrite the report.
    let artifact = outcome.report_artifact.expect("report artifact is attached");
    let contents = String::from_utf8(artifact.contents.to_vec())?;
    let pid: i32 = contents
        .strip_prefix("sleeping pid=")
        .unwrap_or_else(|| panic!("unexpected report contents: {contents}"))
        .parse()?;
    #[cfg(unix)]
    assert!(!process_exists(pid), "process {pid} is no longer running");
    #[cfg(not(unix))]
    let _ = pid;
    Ok(())
}

#[tokio::test]
async fn env_overrides_are_applied() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let supervisor = supervisor();
    let cancel = CancelHandle::new();
    let args = ["env", "FOO=BAR", "SPAM=EGGS"];

    let both = probe_with_report(dir.path(), "core", "env-both", args)
        .env("FOO", "BAR")
        .env("SPAM", "EGGS")
        .build();
    let outcome = supervisor.execute(&both, &cancel).await;
    assert_eq!(outcome.status, OutcomeStatus::Pass);

    let no_spam = probe_with_report(dir.path(), "core", "env-no-spam", args)
        .env("FOO", "BAR")
        .build();
    let outcome = supervisor.execute(&no_spam, &cancel).await;
    assert_eq!(outcome.status, OutcomeStatus::Fail);
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    assert!(stderr.contains("SPAM is not set"), "stderr: {stderr}");
    assert!(!stderr.contains("FOO"), "stderr: {stderr}");

    let wrong_foo = probe_with_report(dir.path(), "core", "env-wrong-foo", args)
        .env("FOO", "BAZ")
        .env("SPAM", "EGGS")
        .build();
    let outcome = supervisor.execute(&wrong_foo, &cancel).await;
    assert_eq!(outcome.status, OutcomeStatus::Fail);
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    assert!(
        stderr.contains("FOO is `BAZ`, expected `BAR`"),
        "stderr: {stderr}"
    );
    Ok(())
}

#[tokio::test]
async fn working_directory_is_applied() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let work = dir.path().join("work");
    std::fs::create_dir(&work)?;

    // The report path is relative, and resolves against the working directory.
    let test = probe("core", "cwd", ["cwd", work.as_str()])
        .cwd(&work)
        .report_path("cwd.report")
        .report_path_as_arg(true)
        .build();
    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;

    assert_eq!(
        outcome.status,
        OutcomeStatus::Pass,
        "stderr: {}",
        String::from_utf8_lossy(&outcome.stderr)
    );
    let artifact = outcome.report_artifact.expect("report artifact is attached");
    assert_eq!(artifact.path, work.join("cwd.report"));
    Ok(())
}

#[tokio::test]
async fn missing_program_is_an_error() {
    let test = cascade_runner::test_case::TestCase::builder(
        cascade_runner::test_case::TestId::new("core", "missing"),
        "/nonexistent/cascade-probe",
    )
    .build();

    let outcome = supervisor().execute(&test, &CancelHandle::new()).await;

    assert_eq!(outcome.status, OutcomeStatus::Error);
    assert!(outcome.failure_message().is_some());
    assert!(outcome.report_artifact.is_none());
}

#[tokio::test]
async fn cancellation_stops_running_test() -> Result<()> {
    let test = probe("core", "sleeper", ["sleep", "5000"]).build();
    let cancel = CancelHandle::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    let start = Instant::now();
    let outcome = supervisor().execute(&test, &cancel).await;
    canceller.await?;

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(outcome.status, OutcomeStatus::Error);
    assert!(outcome.cancelled);
    Ok(())
}
