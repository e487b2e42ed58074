// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::output::ChildAccumulator;
use crate::outcome::{CrashSignal, ExitDisposition};
use libc::{SIGKILL, SIGTERM};
use std::{
    convert::Infallible,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::ExitStatus,
    time::Duration,
};
use tokio::process::Child;

/// Pre-execution configuration on Unix.
///
/// This puts the child in its own process group, so that it and any processes it spawns can be
/// signalled together.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Process groups cover descendants on Unix, so there's no job object.
pub(super) struct Job(());

pub(super) fn create_job() -> Result<Job, Infallible> {
    Ok(Job(()))
}

pub(super) fn assign_process_to_job(_child: &Child, _job: Option<&Job>) -> Result<(), Infallible> {
    Ok(())
}

pub(super) fn exit_disposition(status: ExitStatus) -> ExitDisposition {
    match status.signal() {
        Some(signal) => ExitDisposition::Signaled(crash_signal(signal)),
        // A process that wasn't killed by a signal always has an exit code.
        None => ExitDisposition::Exited(status.code().unwrap_or(-1)),
    }
}

fn crash_signal(signal: libc::c_int) -> CrashSignal {
    match signal {
        libc::SIGABRT => CrashSignal::Abort,
        libc::SIGBUS => CrashSignal::Bus,
        libc::SIGFPE => CrashSignal::FloatingPoint,
        libc::SIGILL => CrashSignal::IllegalInstruction,
        libc::SIGSEGV => CrashSignal::Segmentation,
        libc::SIGTRAP => CrashSignal::Trap,
        libc::SIGKILL => CrashSignal::Kill,
        libc::SIGTERM => CrashSignal::Terminate,
        libc::SIGINT => CrashSignal::Interrupt,
        libc::SIGHUP => CrashSignal::Hangup,
        libc::SIGQUIT => CrashSignal::Quit,
        libc::SIGPIPE => CrashSignal::Pipe,
        libc::SIGALRM => CrashSignal::Alarm,
        other => CrashSignal::Other(other),
    }
}

/// Terminates the child's process group: SIGTERM first, then SIGKILL once the grace period
/// runs out or the child exits, whichever comes first.
///
/// The group is always sent SIGKILL at the end, so descendants that ignore SIGTERM don't
/// outlive the child. Output continues to be collected while waiting.
pub(super) async fn terminate_child(
    child: &mut Child,
    child_acc: &mut ChildAccumulator,
    _job: Option<&Job>,
    grace_period: Duration,
) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    // The child leads its own process group, so a negative PID addresses the whole group.
    let pgid = -(pid as libc::pid_t);

    if grace_period.is_zero() {
        unsafe { libc::kill(pgid, SIGKILL) };
        return;
    }

    unsafe { libc::kill(pgid, SIGTERM) };

    let mut sleep = std::pin::pin!(tokio::time::sleep(grace_period));
    loop {
        tokio::select! {
            () = child_acc.fill_buf(), if !child_acc.is_done() => {}
            _ = child.wait() => break,
            () = &mut sleep => break,
        }
    }

    // Either the grace period ran out or the leader exited. Anything left in the group gets a
    // hard shutdown; ESRCH just means the group is already empty.
    unsafe { libc::kill(pgid, SIGKILL) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(libc::SIGSEGV, CrashSignal::Segmentation; "segv")]
    #[test_case(libc::SIGABRT, CrashSignal::Abort; "abort")]
    #[test_case(libc::SIGKILL, CrashSignal::Kill; "kill")]
    #[test_case(libc::SIGUSR1, CrashSignal::Other(libc::SIGUSR1); "other")]
    fn signal_mapping(raw: libc::c_int, expected: CrashSignal) {
        let disposition = exit_disposition(ExitStatus::from_raw(raw));
        assert!(
            matches!(disposition, ExitDisposition::Signaled(signal) if signal == expected),
            "unexpected disposition: {disposition:?}"
        );
    }

    #[test]
    fn exit_code_mapping() {
        // Wait statuses encode the exit code in the second byte.
        let disposition = exit_disposition(ExitStatus::from_raw(2 << 8));
        assert!(
            matches!(disposition, ExitDisposition::Exited(2)),
            "unexpected disposition: {disposition:?}"
        );
    }
}
