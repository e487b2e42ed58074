// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use cascade_runner::test_case::{TestCase, TestCaseBuilder, TestId};

pub(crate) fn probe_path() -> &'static str {
    env!("CARGO_BIN_EXE_cascade-probe")
}

/// A test case that runs `cascade-probe` with the given mode arguments.
pub(crate) fn probe<I, S>(project: &str, name: &str, args: I) -> TestCaseBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    TestCase::builder(TestId::new(project, name), probe_path()).args(args)
}

/// Like [`probe`], with the report artifact written to `<dir>/<name>.report`.
pub(crate) fn probe_with_report<I, S>(
    dir: &Utf8Path,
    project: &str,
    name: &str,
    args: I,
) -> TestCaseBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    probe(project, name, args)
        .report_path(report_path(dir, name))
        .report_path_as_arg(true)
}

pub(crate) fn report_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{name}.report"))
}

/// Returns true if a process with this pid exists.
#[cfg(unix)]
pub(crate) fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 performs error checking only.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
