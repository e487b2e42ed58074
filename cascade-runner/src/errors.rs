// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by cascade.

use crate::test_case::TestId;
use camino::Utf8PathBuf;
use cascade_metadata::CascadeExitCode;
use config::ConfigError;
use smol_str::SmolStr;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse cascade config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
///
/// Returned by [`ConfigParseError::kind`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to cascade.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a [`ThreadCount`](crate::config::ThreadCount) value from
/// a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for thread count: {input}")]
pub struct ThreadCountParseError {
    input: String,
}

impl ThreadCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error in the shape of a [`ProjectGraph`](crate::graph::ProjectGraph).
///
/// These errors are fatal to a run, and are always reported before any project is built.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// A project with this name was already added.
    #[error("project `{name}` was added more than once")]
    DuplicateProject {
        /// The name of the project.
        name: SmolStr,
    },

    /// A project depends on a project that isn't in the graph.
    #[error("project `{project}` depends on unknown project `{dependency}`")]
    UnknownDependency {
        /// The project declaring the dependency.
        project: SmolStr,

        /// The name of the missing dependency.
        dependency: SmolStr,
    },

    /// The dependency relation contains at least one cycle.
    #[error(
        "dependency cycle detected among projects: {}",
        DisplayCycles(.cycles),
    )]
    CyclicDependency {
        /// Every project that could not be ordered, in input order.
        ///
        /// This includes the projects in each cycle as well as their dependents.
        remaining: Vec<SmolStr>,

        /// The strongly connected components that form the cycles, each in input order.
        cycles: Vec<Vec<SmolStr>>,
    },

    /// Two projects declare the same build output directory.
    #[error("projects `{first}` and `{second}` share the build directory `{dir}`")]
    SharedBuildDir {
        /// The shared directory.
        dir: Utf8PathBuf,

        /// The project that declared the directory first.
        first: SmolStr,

        /// The project that declared the directory second.
        second: SmolStr,
    },
}

struct DisplayCycles<'a>(&'a [Vec<SmolStr>]);

impl fmt::Display for DisplayCycles<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cycle) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}]", cycle.join(", "))?;
        }
        Ok(())
    }
}

/// The reason a project build did not succeed.
///
/// Build errors are local to a project: dependents are skipped, but independent projects
/// continue to be built.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The toolchain reported that the build action failed.
    #[error("build action failed")]
    ActionFailed {
        /// The diagnostic produced by the toolchain.
        diagnostic: String,
    },

    /// The toolchain adapter panicked while building the project.
    #[error("build action panicked: {message}")]
    Panicked {
        /// The panic message, if one could be extracted.
        message: String,
    },

    /// The project was skipped because a dependency did not build.
    #[error("dependency `{dependency}` did not build")]
    DependencyFailed {
        /// The project whose failure caused this one to be skipped.
        dependency: SmolStr,
    },

    /// The project was skipped because the run was cancelled.
    #[error("run was cancelled before the project was built")]
    Cancelled,
}

/// An error that occurred while starting or waiting on a child process.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChildError {
    /// The process could not be spawned.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The program that was being spawned.
        program: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },

    /// The process was spawned, but waiting on it failed.
    #[error("failed to wait on `{program}`")]
    Wait {
        /// The program that was running.
        program: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },
}

/// An error that occurred while reading a child process's output.
#[derive(Clone, Debug, Error)]
pub enum ChildFdError {
    /// An error occurred while reading standard output.
    #[error("error reading standard output")]
    ReadStdout(#[source] Arc<std::io::Error>),

    /// An error occurred while reading standard error.
    #[error("error reading standard error")]
    ReadStderr(#[source] Arc<std::io::Error>),
}

/// An error returned by [`ResultCollector::record`](crate::collector::ResultCollector::record).
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// An outcome was already recorded for this test.
    #[error("an outcome was already recorded for test `{id}`")]
    DuplicateResult {
        /// The test identity.
        id: TestId,
    },
}

/// An error returned by [`ResultCollector::finalize`](crate::collector::ResultCollector::finalize).
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum FinalizeError {
    /// Some expected tests have no outcome, and the run was not cancelled.
    #[error("run is incomplete: {} tests have no outcome", .missing.len())]
    RunIncomplete {
        /// The tests with no outcome, in the order they were expected.
        missing: Vec<TestId>,
    },
}

/// An error that occurred while initializing logging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitLoggingError {
    /// The log filter environment variable is not valid UTF-8.
    #[error("{var} is not valid UTF-8")]
    NotUnicode {
        /// The environment variable.
        var: &'static str,
    },

    /// The log filter could not be parsed.
    #[error("unable to parse {var}")]
    Parse {
        /// The environment variable.
        var: &'static str,

        /// The underlying error.
        #[source]
        error: tracing_subscriber::filter::ParseError,
    },
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while building a [`Runner`](crate::runner::Runner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),
}

impl RunnerBuildError {
    /// The exit code a driver process should use for this error.
    pub fn exit_code(&self) -> i32 {
        CascadeExitCode::SETUP_ERROR
    }
}

/// An error that occurred while writing a report to disk.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteReportError {
    /// An error occurred while operating on the file system.
    #[error("error operating on path {file}")]
    Fs {
        /// The file being operated on.
        file: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// An error occurred while producing JUnit XML.
    #[error("error writing JUnit output to {file}")]
    Junit {
        /// The output file.
        file: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An error occurred while producing the JSON summary.
    #[error("error writing JSON summary to {file}")]
    Json {
        /// The output file.
        file: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that occurred while adding a pattern to a
/// [`TestFilter`](crate::test_filter::TestFilter).
#[derive(Debug, Error)]
#[error("invalid test pattern `{pattern}`")]
pub struct TestFilterBuilderError {
    pattern: String,
    #[source]
    error: regex::Error,
}

impl TestFilterBuilderError {
    pub(crate) fn new(pattern: impl Into<String>, error: regex::Error) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }

    /// The pattern that failed to compile.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// An error that occurred while reading the list of tests that failed in the previous run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadFailedListError {
    /// The file could not be read.
    #[error("error reading failed test list at {path}")]
    Read {
        /// The path to the list.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// The file isn't a JSON array of test identities.
    #[error("error parsing failed test list at {path}")]
    Parse {
        /// The path to the list.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that prevented a run from completing.
///
/// Build and test failures are not errors: they are reported through
/// [`RunReport`](crate::runner::RunReport).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The project graph is invalid.
    #[error("invalid project graph")]
    Graph(#[from] GraphError),

    /// Two test cases share the same identity.
    #[error("test `{id}` was declared more than once")]
    DuplicateTestId {
        /// The duplicated identity.
        id: TestId,
    },

    /// A test case belongs to a project that isn't in the graph.
    #[error("test `{id}` belongs to unknown project `{}`", .id.project())]
    UnknownTestProject {
        /// The test identity.
        id: TestId,
    },

    /// The list of previously failed tests could not be read.
    #[error("error selecting previously failed tests")]
    ReadFailedList(#[from] ReadFailedListError),

    /// An outcome could not be recorded.
    #[error("error recording test outcome")]
    Record(#[from] RecordError),

    /// The collector could not produce a report.
    #[error("error finalizing test results")]
    Finalize(#[from] FinalizeError),

    /// A report could not be written.
    #[error("error writing report")]
    WriteReport(#[from] WriteReportError),
}

impl RunError {
    /// The exit code a driver process should use for this error, per [`CascadeExitCode`].
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Graph(_) => CascadeExitCode::INVALID_GRAPH,
            Self::DuplicateTestId { .. }
            | Self::UnknownTestProject { .. }
            | Self::ReadFailedList(_) => CascadeExitCode::SETUP_ERROR,
            Self::WriteReport(_) => CascadeExitCode::WRITE_REPORT_ERROR,
            // Collector errors are internal, so they get the generic failure code.
            Self::Record(_) | Self::Finalize(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn cyclic_dependency_display() {
        let err = GraphError::CyclicDependency {
            remaining: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            cycles: vec![vec!["a".into(), "b".into()], vec!["c".into()]],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected among projects: [a, b]; [c]"
        );
    }

    #[test]
    fn profile_not_found_sorts_profiles() {
        let err = ProfileNotFound::new("missing", ["default", "ci", "bench"]);
        assert_eq!(
            err.to_string(),
            "profile `missing` not found (known profiles: bench, ci, default)"
        );
    }

    #[test_case(
        RunError::from(GraphError::CyclicDependency { remaining: vec!["a".into()], cycles: vec![] }),
        CascadeExitCode::INVALID_GRAPH;
        "graph"
    )]
    #[test_case(
        RunError::DuplicateTestId { id: TestId::new("a", "t") },
        CascadeExitCode::SETUP_ERROR;
        "duplicate test"
    )]
    #[test_case(
        RunError::UnknownTestProject { id: TestId::new("missing", "t") },
        CascadeExitCode::SETUP_ERROR;
        "unknown project"
    )]
    #[test_case(
        RunError::from(WriteReportError::Fs {
            file: "out/summary.json".into(),
            error: std::io::Error::other("disk full"),
        }),
        CascadeExitCode::WRITE_REPORT_ERROR;
        "write report"
    )]
    fn run_error_exit_codes(err: RunError, expected: i32) {
        assert_eq!(err.exit_code(), expected, "{err}");
    }
}
