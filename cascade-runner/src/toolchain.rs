// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The boundary between cascade and the tools that actually build projects.
//!
//! cascade never compiles anything itself. Each project is built by handing a [`BuildAction`] to
//! a [`ToolchainAdapter`], which performs it synchronously and reports a [`BuildOutcome`].

use crate::graph::{Project, ProjectIndex};
use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::debug;

/// A request to build one project.
///
/// Produced fresh for every build attempt.
#[derive(Clone, Debug)]
pub struct BuildAction {
    /// The project being built.
    pub project: ProjectIndex,

    /// The name of the project being built.
    pub name: SmolStr,

    /// The directory the build runs in: the project root.
    pub working_dir: Utf8PathBuf,

    /// The directory build outputs are written to. Exclusively owned by this project.
    pub output_dir: Utf8PathBuf,

    /// Environment overrides, applied on top of the ambient environment.
    pub env: BTreeMap<String, String>,

    /// The opaque build command, as an argument vector.
    pub command: Vec<String>,
}

impl BuildAction {
    /// Creates the build action for a project.
    pub fn for_project(project: &Project) -> Self {
        Self {
            project: project.index(),
            name: project.name().clone(),
            working_dir: project.root().to_owned(),
            output_dir: project.output_dir().to_owned(),
            env: project.env().clone(),
            command: project.command().to_vec(),
        }
    }
}

/// The result of performing a [`BuildAction`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildOutcome {
    /// Whether the build succeeded.
    pub success: bool,

    /// Files produced by the build.
    pub artifacts: Vec<Utf8PathBuf>,

    /// Human-readable diagnostic output, typically the tool's combined output.
    pub diagnostic: String,
}

impl BuildOutcome {
    /// A successful outcome with the given artifacts.
    pub fn success(artifacts: Vec<Utf8PathBuf>) -> Self {
        Self {
            success: true,
            artifacts,
            diagnostic: String::new(),
        }
    }

    /// A failed outcome with the given diagnostic.
    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Performs build actions.
///
/// `build` is called on a blocking worker thread, and may be called concurrently for independent
/// projects.
pub trait ToolchainAdapter: Send + Sync {
    /// Performs the build action, returning whether it succeeded.
    fn build(&self, action: &BuildAction) -> BuildOutcome;
}

impl<F> ToolchainAdapter for F
where
    F: Fn(&BuildAction) -> BuildOutcome + Send + Sync,
{
    fn build(&self, action: &BuildAction) -> BuildOutcome {
        self(action)
    }
}

/// A [`ToolchainAdapter`] that runs each project's build command as a process.
///
/// The command runs in the project root with the project's environment overrides. Once it
/// succeeds, every file under the output directory is reported as an artifact. A project without
/// a build command has nothing to build, and succeeds with whatever its output directory already
/// holds.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandToolchain;

impl CommandToolchain {
    /// Creates a new command toolchain.
    pub fn new() -> Self {
        Self
    }
}

impl ToolchainAdapter for CommandToolchain {
    fn build(&self, action: &BuildAction) -> BuildOutcome {
        if let Err(error) = std::fs::create_dir_all(&action.output_dir) {
            return BuildOutcome::failure(format!(
                "failed to create output directory `{}`: {error}",
                action.output_dir
            ));
        }

        if let Some((program, args)) = action.command.split_first() {
            debug!(project = %action.name, command = ?action.command, "running build command");

            let mut expr = duct::cmd(program, args)
                .dir(action.working_dir.as_std_path())
                .stdin_null()
                .stderr_to_stdout()
                .stdout_capture()
                .unchecked();
            for (key, value) in &action.env {
                expr = expr.env(key, value);
            }

            let output = match expr.run() {
                Ok(output) => output,
                Err(error) => {
                    return BuildOutcome::failure(format!("failed to run `{program}`: {error}"));
                }
            };
            let diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.status.success() {
                return BuildOutcome {
                    success: false,
                    artifacts: Vec::new(),
                    diagnostic,
                };
            }

            match list_artifacts(&action.output_dir) {
                Ok(artifacts) => BuildOutcome {
                    success: true,
                    artifacts,
                    diagnostic,
                },
                Err(error) => BuildOutcome::failure(format!(
                    "failed to list artifacts in `{}`: {error}",
                    action.output_dir
                )),
            }
        } else {
            match list_artifacts(&action.output_dir) {
                Ok(artifacts) => BuildOutcome::success(artifacts),
                Err(error) => BuildOutcome::failure(format!(
                    "failed to list artifacts in `{}`: {error}",
                    action.output_dir
                )),
            }
        }
    }
}

/// Lists every file under `dir`, sorted by path.
fn list_artifacts(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, walkdir::Error> {
    let mut artifacts = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Non-UTF-8 file names can't be reported; skip them.
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => artifacts.push(path),
            Err(path) => debug!("skipping non-UTF-8 artifact path {}", path.display()),
        }
    }
    Ok(artifacts)
}
