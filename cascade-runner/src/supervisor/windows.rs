// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::output::ChildAccumulator;
use crate::outcome::{CrashSignal, ExitDisposition};
use std::{process::ExitStatus, time::Duration};
use tokio::process::Child;
pub(super) use win32job::Job;
use win32job::JobError;
use windows_sys::Win32::System::JobObjects::TerminateJobObject;

const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
const STATUS_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
const STATUS_INTEGER_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
const STATUS_STACK_OVERFLOW: u32 = 0xC000_00FD;
const STATUS_STACK_BUFFER_OVERRUN: u32 = 0xC000_0409;

/// Error-severity NTSTATUS values have both of the top bits set.
const NT_ERROR_MASK: u32 = 0xC000_0000;

/// Processes are grouped with a job object after spawning, so there's nothing to configure
/// up front.
pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

/// Creates a job object that a test process and its descendants are assigned to.
///
/// Breakaway is allowed so tests that manage their own job objects keep working.
pub(super) fn create_job() -> Result<Job, JobError> {
    Job::create_with_limit_info(win32job::ExtendedLimitInfo::new().limit_breakaway_ok())
}

pub(super) fn assign_process_to_job(child: &Child, job: Option<&Job>) -> Result<(), JobError> {
    // The handle is only missing if the child was already reaped.
    if let (Some(job), Some(handle)) = (job, child.raw_handle()) {
        job.assign_process(handle as isize)?;
    }
    Ok(())
}

pub(super) fn exit_disposition(status: ExitStatus) -> ExitDisposition {
    let Some(code) = status.code() else {
        return ExitDisposition::Exited(-1);
    };
    // An unhandled exception shows up as an exit code carrying an error NTSTATUS.
    let raw = code as u32;
    if raw & NT_ERROR_MASK == NT_ERROR_MASK {
        ExitDisposition::Signaled(crash_signal(raw))
    } else {
        ExitDisposition::Exited(code)
    }
}

fn crash_signal(nt_status: u32) -> CrashSignal {
    match nt_status {
        STATUS_ACCESS_VIOLATION | STATUS_STACK_OVERFLOW => CrashSignal::Segmentation,
        STATUS_ILLEGAL_INSTRUCTION => CrashSignal::IllegalInstruction,
        STATUS_INTEGER_DIVIDE_BY_ZERO => CrashSignal::FloatingPoint,
        STATUS_STACK_BUFFER_OVERRUN => CrashSignal::Abort,
        other => CrashSignal::Other(other as i32),
    }
}

/// Terminates the child along with everything in its job object.
///
/// Windows has no graceful termination request for console processes, so the grace period is
/// unused and the process tree is killed right away.
pub(super) async fn terminate_child(
    child: &mut Child,
    child_acc: &mut ChildAccumulator,
    job: Option<&Job>,
    _grace_period: Duration,
) {
    if let Some(job) = job {
        // SAFETY: the handle is owned by `job`, which outlives this call.
        unsafe { TerminateJobObject(job.handle() as _, 1) };
    }
    if child.id().is_none() {
        return;
    }
    // Failure here means the process exited already.
    let _ = child.start_kill();

    loop {
        tokio::select! {
            () = child_acc.fill_buf(), if !child_acc.is_done() => {}
            _ = child.wait() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::windows::process::ExitStatusExt;
    use test_case::test_case;

    #[test_case(STATUS_ACCESS_VIOLATION, CrashSignal::Segmentation; "access violation")]
    #[test_case(STATUS_STACK_BUFFER_OVERRUN, CrashSignal::Abort; "buffer overrun")]
    #[test_case(0xC000_0135, CrashSignal::Other(0xC000_0135_u32 as i32); "dll not found")]
    fn nt_status_mapping(raw: u32, expected: CrashSignal) {
        let disposition = exit_disposition(ExitStatus::from_raw(raw));
        assert!(
            matches!(disposition, ExitDisposition::Signaled(signal) if signal == expected),
            "unexpected disposition: {disposition:?}"
        );
    }

    #[test]
    fn plain_exit_codes_are_not_crashes() {
        let disposition = exit_disposition(ExitStatus::from_raw(3));
        assert!(
            matches!(disposition, ExitDisposition::Exited(3)),
            "unexpected disposition: {disposition:?}"
        );
    }

    #[tokio::test]
    async fn job_termination_kills_the_process_tree() {
        let job = create_job().expect("job object created");

        // `cmd` waits on a grandchild `ping`, which only the job object can reach directly.
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.args(["/C", "ping -n 30 127.0.0.1"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().expect("spawned cmd");
        assign_process_to_job(&child, Some(&job)).expect("assigned to job");

        let start = std::time::Instant::now();
        let mut acc = ChildAccumulator::new(child.stdout.take(), child.stderr.take());
        terminate_child(&mut child, &mut acc, Some(&job), Duration::ZERO).await;

        let status = child.try_wait().expect("child can be polled");
        assert!(status.is_some(), "child was reaped");
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
