// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture binary supervised by cascade's integration tests.
//!
//! Usage: `cascade-probe <mode> [mode-args...] [report-path]`
//!
//! Modes:
//!
//! * `pass`: exit 0.
//! * `fail <code>`: exit with the given code.
//! * `sleep <ms>`: sleep, then exit 0.
//! * `crash <segv|abort>`: die from the given signal.
//! * `env <KEY=VALUE>...`: exit 0 if every variable is set to its value, 1 otherwise.
//! * `cwd <dir>`: exit 0 if the working directory is `dir`, 1 otherwise.
//!
//! Following the process-boundary convention, the final argument (if any remains after the mode's
//! own arguments) is the path the report artifact is written to. The report is written before
//! the probe exits or crashes.

use cascade_metadata::ProbeExitCode;
use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
    time::Duration,
};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((mode, rest)) = args.split_first() else {
        usage("no mode specified");
    };

    match mode.as_str() {
        "pass" => {
            let report = report_path(rest, 0);
            finish(report.as_deref(), "pass", ProbeExitCode::SUCCESS);
        }
        "fail" => {
            let code = parse_arg::<i32>(rest, "fail <code>");
            let report = report_path(rest, 1);
            finish(report.as_deref(), &format!("fail {code}"), code);
        }
        "sleep" => {
            let ms = parse_arg::<u64>(rest, "sleep <ms>");
            let report = report_path(rest, 1);
            // Record the pid up front so that tests can check the process is gone.
            write_report(report.as_deref(), &format!("sleeping pid={}", process::id()));
            std::thread::sleep(Duration::from_millis(ms));
            finish(report.as_deref(), "slept", ProbeExitCode::SUCCESS);
        }
        "crash" => {
            let Some(kind) = rest.first() else {
                usage("crash <segv|abort>");
            };
            let report = report_path(rest, 1);
            write_report(report.as_deref(), &format!("crash {kind}"));
            crash(kind);
        }
        "env" => {
            let pairs: Vec<&String> = rest.iter().take_while(|arg| arg.contains('=')).collect();
            let report = report_path(rest, pairs.len());
            let mut errors = Vec::new();
            for pair in pairs {
                let (key, expected) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
                match env::var(key) {
                    Ok(actual) if actual == expected => {}
                    Ok(actual) => errors.push(format!("{key} is `{actual}`, expected `{expected}`")),
                    Err(_) => errors.push(format!("{key} is not set")),
                }
            }
            check(report.as_deref(), "env", errors);
        }
        "cwd" => {
            let Some(expected) = rest.first() else {
                usage("cwd <dir>");
            };
            let report = report_path(rest, 1);
            let mut errors = Vec::new();
            match (env::current_dir(), fs::canonicalize(expected)) {
                (Ok(actual), Ok(expected)) => {
                    let actual = fs::canonicalize(&actual).unwrap_or(actual);
                    if actual != expected {
                        errors.push(format!(
                            "cwd is `{}`, expected `{}`",
                            actual.display(),
                            expected.display()
                        ));
                    }
                }
                (Err(error), _) => errors.push(format!("cannot read cwd: {error}")),
                (_, Err(error)) => errors.push(format!("cannot resolve `{expected}`: {error}")),
            }
            check(report.as_deref(), "cwd", errors);
        }
        other => usage(&format!("unknown mode `{other}`")),
    }
}

fn report_path(rest: &[String], consumed: usize) -> Option<PathBuf> {
    match &rest[consumed.min(rest.len())..] {
        [] => None,
        [path] => Some(PathBuf::from(path)),
        _ => usage("too many arguments"),
    }
}

fn parse_arg<T: std::str::FromStr>(rest: &[String], expected: &str) -> T {
    match rest.first().map(|arg| arg.parse()) {
        Some(Ok(value)) => value,
        _ => usage(expected),
    }
}

fn check(report: Option<&Path>, mode: &str, errors: Vec<String>) -> ! {
    if errors.is_empty() {
        finish(report, &format!("{mode} ok"), ProbeExitCode::SUCCESS);
    }
    for error in &errors {
        eprintln!("[cascade-probe] {error}");
    }
    finish(
        report,
        &format!("{mode} failed: {}", errors.join("; ")),
        ProbeExitCode::FAILURE,
    );
}

fn finish(report: Option<&Path>, contents: &str, code: i32) -> ! {
    write_report(report, contents);
    println!("[cascade-probe] {contents}");
    process::exit(code);
}

fn write_report(report: Option<&Path>, contents: &str) {
    if let Some(path) = report {
        if let Err(error) = fs::write(path, contents) {
            eprintln!("[cascade-probe] failed to write report to {}: {error}", path.display());
            process::exit(ProbeExitCode::USAGE_ERROR);
        }
    }
}

fn usage(message: &str) -> ! {
    eprintln!("[cascade-probe] usage error: {message}");
    process::exit(ProbeExitCode::USAGE_ERROR);
}

#[cfg(unix)]
fn crash(kind: &str) -> ! {
    match kind {
        "segv" => {
            // The Rust runtime installs a SIGSEGV handler for stack overflow detection. Restore the
            // default disposition so that raising the signal terminates the process.
            // SAFETY: resetting a signal disposition and raising a signal are async-signal-safe.
            unsafe {
                libc::signal(libc::SIGSEGV, libc::SIG_DFL);
                libc::raise(libc::SIGSEGV);
            }
            unreachable!("SIGSEGV should have terminated the process")
        }
        "abort" => process::abort(),
        other => usage(&format!("unknown crash kind `{other}`")),
    }
}

#[cfg(not(unix))]
fn crash(kind: &str) -> ! {
    match kind {
        "segv" | "abort" => process::abort(),
        other => usage(&format!("unknown crash kind `{other}`")),
    }
}
