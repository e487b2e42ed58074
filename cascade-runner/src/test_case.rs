// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test cases: the unit of work run under supervision.

use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use std::{collections::BTreeMap, fmt, time::Duration};

/// The identity of a test: its owning project plus its name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TestId {
    project: SmolStr,
    name: SmolStr,
}

impl TestId {
    /// Creates a new test identity.
    pub fn new(project: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// The name of the project this test belongs to.
    pub fn project(&self) -> &SmolStr {
        &self.project
    }

    /// The name of the test within its project.
    pub fn name(&self) -> &SmolStr {
        &self.name
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.project, self.name)
    }
}

/// A test or benchmark binary invocation.
///
/// Test cases are immutable once built. Create them with [`TestCase::builder`].
#[derive(Clone, Debug)]
pub struct TestCase {
    id: TestId,
    program: Utf8PathBuf,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    report_path: Option<Utf8PathBuf>,
    kind: TestKind,
}

impl TestCase {
    /// Starts building a test case that runs `program`.
    pub fn builder(id: TestId, program: impl Into<Utf8PathBuf>) -> TestCaseBuilder {
        TestCaseBuilder {
            id,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            report_path: None,
            report_path_as_arg: false,
            kind: TestKind::default(),
        }
    }

    /// The identity of this test.
    pub fn id(&self) -> &TestId {
        &self.id
    }

    /// The program to run.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The arguments passed to the program.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The working directory. If unset, the current directory is inherited.
    pub fn cwd(&self) -> Option<&Utf8Path> {
        self.cwd.as_deref()
    }

    /// Environment overrides applied on top of the ambient environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// The timeout declared for this test. If unset, the runner's default applies.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The path at which the test is expected to write its report artifact, if any.
    pub fn report_path(&self) -> Option<&Utf8Path> {
        self.report_path.as_deref()
    }

    /// Which class of run this test belongs to.
    pub fn kind(&self) -> TestKind {
        self.kind
    }

    /// The report path resolved against the working directory.
    pub(crate) fn resolved_report_path(&self) -> Option<Utf8PathBuf> {
        let path = self.report_path.as_deref()?;
        match &self.cwd {
            Some(cwd) if path.is_relative() => Some(cwd.join(path)),
            _ => Some(path.to_owned()),
        }
    }

    /// Builds the command for this test case.
    ///
    /// The ambient environment is inherited, with this test's overrides applied on top.
    pub(crate) fn make_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd
    }
}

/// Builder for [`TestCase`].
#[derive(Clone, Debug)]
#[must_use]
pub struct TestCaseBuilder {
    id: TestId,
    program: Utf8PathBuf,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    report_path: Option<Utf8PathBuf>,
    report_path_as_arg: bool,
    kind: TestKind,
}

impl TestCaseBuilder {
    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout for this test.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declares the path at which the test writes its report artifact.
    ///
    /// Relative paths are resolved against the working directory.
    pub fn report_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// If true, the report path is passed to the program as its final argument.
    pub fn report_path_as_arg(mut self, as_arg: bool) -> Self {
        self.report_path_as_arg = as_arg;
        self
    }

    /// Marks this test as a performance test or a nightly test.
    pub fn kind(mut self, kind: TestKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builds the test case.
    pub fn build(self) -> TestCase {
        let mut args = self.args;
        if self.report_path_as_arg {
            if let Some(path) = &self.report_path {
                args.push(path.to_string());
            }
        }

        TestCase {
            id: self.id,
            program: self.program,
            args,
            cwd: self.cwd,
            env: self.env,
            timeout: self.timeout,
            report_path: self.report_path,
            kind: self.kind,
        }
    }
}

/// The class of run a test belongs to.
///
/// Performance tests only run in runs that ask for them, and never alongside other tests.
/// Nightly tests run alongside regular tests, but only when requested.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum TestKind {
    /// A regular test.
    #[default]
    Regular,

    /// A performance test.
    Perf,

    /// A long-running test meant for nightly runs.
    Nightly,
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use std::ffi::OsString;

    #[test]
    fn report_path_is_final_argument() {
        let case = TestCase::builder(TestId::new("core", "test_foo"), "/bin/test_foo")
            .args(["--verbose"])
            .report_path("results/test_foo.xml")
            .arg("--quick")
            .report_path_as_arg(true)
            .build();

        assert_eq!(case.args(), ["--verbose", "--quick", "results/test_foo.xml"]);
        assert_eq!(case.id().to_string(), "core::test_foo");
    }

    #[test]
    fn report_path_resolves_against_cwd() {
        let case = TestCase::builder(TestId::new("core", "a"), "/bin/a")
            .cwd("/work/core")
            .report_path("out/a.xml")
            .build();
        assert_eq!(
            case.resolved_report_path(),
            Some(Utf8PathBuf::from("/work/core/out/a.xml"))
        );
        // The report path isn't passed unless requested.
        assert!(case.args().is_empty());

        let absolute = TestCase::builder(TestId::new("core", "b"), "/bin/b")
            .cwd("/work/core")
            .report_path("/reports/b.xml")
            .build();
        assert_eq!(
            absolute.resolved_report_path(),
            Some(Utf8PathBuf::from("/reports/b.xml"))
        );
    }

    #[test]
    fn command_applies_overrides() {
        let case = TestCase::builder(TestId::new("core", "env"), "/bin/env-check")
            .env("FOO", "BAR")
            .env("SPAM", "EGGS")
            .cwd("/tmp")
            .build();
        assert_eq!(
            case.env(),
            &btreemap! {
                "FOO".to_owned() => "BAR".to_owned(),
                "SPAM".to_owned() => "EGGS".to_owned(),
            }
        );
        let cmd = case.make_command();

        let envs: Vec<_> = cmd
            .get_envs()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect();
        assert_eq!(
            envs,
            vec![
                (OsString::from("FOO"), Some(OsString::from("BAR"))),
                (OsString::from("SPAM"), Some(OsString::from("EGGS"))),
            ]
        );
        assert_eq!(cmd.get_current_dir(), Some(std::path::Path::new("/tmp")));
    }
}
