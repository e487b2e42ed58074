// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process supervision for test and benchmark binaries.
//!
//! [`ProcessSupervisor::execute`] runs one [`TestCase`] to completion: it spawns the process,
//! captures its output, enforces the timeout, and classifies how the process ended. Every call
//! produces exactly one [`Outcome`], whatever happens to the process.

mod output;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod unix;
        use unix as os;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod windows;
        use windows as os;
    } else {
        compile_error!("unsupported target platform");
    }
}

use crate::{
    cancel::CancelHandle,
    config::CascadeProfile,
    errors::ChildError,
    outcome::{ExitDisposition, Outcome, ReportArtifact},
    test_case::TestCase,
    time::StopwatchSnapshot,
};
use camino::{Utf8Path, Utf8PathBuf};
use output::{ChildAccumulator, ChildOutput};
use std::{io, process::Stdio, sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// Runs test cases as child processes, one [`Outcome`] per test case.
#[derive(Clone, Debug)]
pub struct ProcessSupervisor {
    default_timeout: Duration,
    grace_period: Duration,
    leak_timeout: Duration,
}

impl ProcessSupervisor {
    /// The timeout used for test cases that don't declare one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    /// The time a process is given to exit after being asked to terminate.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

    /// The time output pipes are given to close after a process exits.
    pub const DEFAULT_LEAK_TIMEOUT: Duration = Duration::from_millis(100);

    /// Creates a new supervisor with the default timeouts.
    pub fn new() -> Self {
        Self {
            default_timeout: Self::DEFAULT_TIMEOUT,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            leak_timeout: Self::DEFAULT_LEAK_TIMEOUT,
        }
    }

    /// Creates a new supervisor with the timeouts configured in `profile`.
    pub fn from_profile(profile: &CascadeProfile<'_>) -> Self {
        Self {
            default_timeout: profile.timeout(),
            grace_period: profile.grace_period(),
            leak_timeout: profile.leak_timeout(),
        }
    }

    /// Sets the timeout for test cases that don't declare one.
    pub fn set_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the grace period between a termination request and a forced kill.
    ///
    /// A zero grace period kills immediately.
    pub fn set_grace_period(&mut self, grace_period: Duration) -> &mut Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets how long output pipes may stay open after the process exits before the outcome is
    /// flagged as leaky.
    pub fn set_leak_timeout(&mut self, leak_timeout: Duration) -> &mut Self {
        self.leak_timeout = leak_timeout;
        self
    }

    /// Runs `test_case` to completion and classifies the result.
    ///
    /// The process is always reaped before this returns. If `cancel` fires while the process is
    /// running, the process is terminated and the outcome is tagged as cancelled.
    #[instrument(level = "debug", skip_all, fields(test = %test_case.id()))]
    pub async fn execute(&self, test_case: &TestCase, cancel: &CancelHandle) -> Outcome {
        let report_path = test_case.resolved_report_path();
        if let Some(path) = &report_path {
            remove_stale_report(path).await;
        }

        let timeout = test_case.timeout().unwrap_or(self.default_timeout);
        let stopwatch = crate::time::stopwatch();
        let (disposition, output, leaked) = self.run_child(test_case, timeout, cancel).await;
        let snapshot = stopwatch.snapshot();

        let report_artifact = match report_path {
            Some(path) => read_report_artifact(path).await,
            None => None,
        };

        debug!(
            status = %disposition.status(),
            duration = ?snapshot.duration,
            leaked,
            "test finished",
        );

        make_outcome(test_case, disposition, snapshot, output, report_artifact, leaked)
    }

    async fn run_child(
        &self,
        test_case: &TestCase,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> (ExitDisposition, ChildOutput, bool) {
        let mut cmd = test_case.make_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        os::set_process_group(&mut cmd);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        // Without a job object, termination falls back to the child alone.
        let job = os::create_job().ok();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                let error = ChildError::Spawn {
                    program: test_case.program().to_owned(),
                    error: Arc::new(error),
                };
                debug!(%error, "failed to spawn test process");
                return (
                    ExitDisposition::SpawnFailed(error),
                    ChildOutput::default(),
                    false,
                );
            }
        };
        let _ = os::assign_process_to_job(&child, job.as_ref());

        let mut acc = ChildAccumulator::new(child.stdout.take(), child.stderr.take());
        let mut sleep = std::pin::pin!(tokio::time::sleep(timeout));
        let mut terminated = None;

        let res = loop {
            tokio::select! {
                biased;

                res = child.wait() => break res,
                () = &mut sleep, if terminated.is_none() => {
                    // An exit that raced with the timer is a normal exit.
                    if let Ok(Some(status)) = child.try_wait() {
                        break Ok(status);
                    }
                    debug!(?timeout, "test timed out, terminating");
                    os::terminate_child(&mut child, &mut acc, job.as_ref(), self.grace_period)
                        .await;
                    terminated = Some(ExitDisposition::TimedOut);
                }
                () = cancel.cancelled(), if terminated.is_none() => {
                    if let Ok(Some(status)) = child.try_wait() {
                        break Ok(status);
                    }
                    debug!("run cancelled, terminating test");
                    os::terminate_child(&mut child, &mut acc, job.as_ref(), self.grace_period)
                        .await;
                    terminated = Some(ExitDisposition::Cancelled);
                }
                () = acc.fill_buf(), if !acc.is_done() => {}
            }
        };

        let leaked = detect_fd_leaks(&mut acc, self.leak_timeout).await;
        for error in &acc.errors {
            warn!(%error, "error while capturing test output");
        }

        let disposition = match (terminated, res) {
            (Some(disposition), _) => disposition,
            (None, Ok(status)) => os::exit_disposition(status),
            (None, Err(error)) => ExitDisposition::SpawnFailed(ChildError::Wait {
                program: test_case.program().to_owned(),
                error: Arc::new(error),
            }),
        };

        (disposition, acc.freeze(), leaked)
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn make_outcome(
    test_case: &TestCase,
    disposition: ExitDisposition,
    snapshot: StopwatchSnapshot,
    output: ChildOutput,
    report_artifact: Option<ReportArtifact>,
    leaked: bool,
) -> Outcome {
    Outcome {
        id: test_case.id().clone(),
        status: disposition.status(),
        cancelled: matches!(disposition, ExitDisposition::Cancelled),
        disposition: Some(disposition),
        skip_reason: None,
        start_time: snapshot.start_time,
        duration: snapshot.duration,
        stdout: output.stdout,
        stderr: output.stderr,
        report_artifact,
        leaked,
    }
}

/// After a child process has exited, checks whether it leaked its output pipes to long-running
/// grandchildren.
///
/// Returns true if the pipes stayed open for longer than `leak_timeout`.
async fn detect_fd_leaks(acc: &mut ChildAccumulator, leak_timeout: Duration) -> bool {
    let mut sleep = std::pin::pin!(tokio::time::sleep(leak_timeout));
    loop {
        tokio::select! {
            biased;

            // Both branches check `is_done` so the `else` branch is hit as soon as the pipes
            // are closed.
            () = acc.fill_buf(), if !acc.is_done() => {}
            () = &mut sleep, if !acc.is_done() => break true,
            else => break false,
        }
    }
}

async fn remove_stale_report(path: &Utf8Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(%path, "removed stale report artifact"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(%path, %error, "failed to remove stale report artifact"),
    }
}

async fn read_report_artifact(path: Utf8PathBuf) -> Option<ReportArtifact> {
    match tokio::fs::read(&path).await {
        Ok(contents) => Some(ReportArtifact {
            path,
            contents: contents.into(),
        }),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(%path, "no report artifact written");
            None
        }
        Err(error) => {
            warn!(%path, %error, "failed to read report artifact");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        outcome::{CrashSignal, OutcomeStatus},
        test_case::TestId,
    };
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    fn sh(name: &str, script: &str) -> crate::test_case::TestCaseBuilder {
        TestCase::builder(TestId::new("supervisor", name), "/bin/sh").args(["-c", script])
    }

    fn supervisor() -> ProcessSupervisor {
        let mut supervisor = ProcessSupervisor::new();
        supervisor
            .set_default_timeout(Duration::from_secs(30))
            .set_grace_period(Duration::from_millis(500));
        supervisor
    }

    #[tokio::test]
    async fn exit_codes_are_classified() {
        let cancel = CancelHandle::new();

        let pass = supervisor()
            .execute(&sh("pass", "echo hello").build(), &cancel)
            .await;
        assert_eq!(pass.status, OutcomeStatus::Pass);
        assert_eq!(pass.exit_code(), Some(0));
        assert_eq!(&pass.stdout[..], b"hello\n");
        assert!(!pass.leaked);

        let fail = supervisor()
            .execute(&sh("fail", "echo oops >&2; exit 3").build(), &cancel)
            .await;
        assert_eq!(fail.status, OutcomeStatus::Fail);
        assert_eq!(fail.exit_code(), Some(3));
        assert_eq!(&fail.stderr[..], b"oops\n");
        assert_eq!(fail.signal(), None);
    }

    #[tokio::test]
    async fn timeout_terminates_process() {
        let case = sh("slow", "sleep 5")
            .timeout(Duration::from_millis(200))
            .build();
        let outcome = supervisor().execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(
            outcome.duration < Duration::from_secs(4),
            "process was terminated early (took {:?})",
            outcome.duration
        );
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn zero_grace_period_kills_immediately() {
        let case = sh("stubborn", "trap '' TERM; sleep 5")
            .timeout(Duration::from_millis(200))
            .build();
        let mut supervisor = supervisor();
        supervisor.set_grace_period(Duration::ZERO);
        let outcome = supervisor.execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(outcome.duration < Duration::from_secs(4));
    }

    /// Zombies count as gone: a reparented process may not be reaped promptly.
    fn is_running(pid: libc::pid_t) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // The state comes right after the parenthesized command name.
            Ok(stat) => {
                stat.rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next())
                    != Some('Z')
            }
            Err(_) if cfg!(target_os = "linux") => false,
            Err(_) => unsafe { libc::kill(pid, 0) == 0 },
        }
    }

    #[tokio::test]
    async fn termination_reaches_descendants_that_ignore_sigterm() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let pid_file = dir.path().join("grandchild.pid");
        // The shell exits on SIGTERM well within the grace period, while the grandchild ignores
        // it and would otherwise keep running.
        let script = format!(
            r#"sh -c 'trap "" TERM; echo $$ > {pid_file}; exec sleep 30' & sleep 10"#
        );
        let case = sh("stubborn-grandchild", &script)
            .timeout(Duration::from_millis(500))
            .build();
        let mut supervisor = supervisor();
        supervisor.set_grace_period(Duration::from_secs(5));
        let outcome = supervisor.execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(
            outcome.duration < Duration::from_secs(4),
            "shell exited before the grace period ran out (took {:?})",
            outcome.duration
        );

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .expect("grandchild wrote its pid")
            .trim()
            .parse()
            .expect("pid is numeric");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while is_running(pid) {
            assert!(
                std::time::Instant::now() < deadline,
                "grandchild {pid} survived termination"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn signal_is_classified_as_crash() {
        let case = sh("segv", "kill -SEGV $$").build();
        let outcome = supervisor().execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Crash);
        assert_eq!(outcome.signal(), Some(CrashSignal::Segmentation));
        assert_eq!(outcome.exit_code(), None);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let case = TestCase::builder(TestId::new("supervisor", "missing"), "/no/such/binary")
            .build();
        let outcome = supervisor().execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(matches!(
            outcome.disposition,
            Some(ExitDisposition::SpawnFailed(ChildError::Spawn { .. }))
        ));
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let cancel = CancelHandle::new();
        let case = sh("cancelled", "sleep 5").build();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let outcome = supervisor().execute(&case, &cancel).await;
        canceller.await.expect("canceller didn't panic");

        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.cancelled);
        assert!(matches!(
            outcome.disposition,
            Some(ExitDisposition::Cancelled)
        ));
    }

    #[tokio::test]
    async fn report_artifact_is_attached_on_failure() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let case = sh("report", "echo '<testsuite/>' > report.xml; exit 1")
            .cwd(dir.path())
            .report_path("report.xml")
            .build();
        let outcome = supervisor().execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Fail);
        let artifact = outcome.report_artifact.expect("artifact attached");
        assert_eq!(artifact.path, dir.path().join("report.xml"));
        assert_eq!(&artifact.contents[..], b"<testsuite/>\n");
    }

    #[tokio::test]
    async fn stale_report_is_removed() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let report = dir.path().join("stale.xml");
        std::fs::write(&report, "old").expect("wrote stale report");

        let case = sh("stale", "exit 0")
            .cwd(dir.path())
            .report_path(report.clone())
            .build();
        let outcome = supervisor().execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Pass);
        assert_eq!(outcome.report_artifact, None);
        assert!(!report.exists());
    }

    #[tokio::test]
    async fn leaked_pipes_are_flagged() {
        let case = sh("leaky", "sleep 2 &").build();
        let mut supervisor = supervisor();
        supervisor.set_leak_timeout(Duration::from_millis(50));
        let outcome = supervisor.execute(&case, &CancelHandle::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Pass);
        assert!(outcome.leaked);
    }
}
