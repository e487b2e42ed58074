// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Full runs: graph, builds, tests, and reports.

use crate::fixtures::*;
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use cascade_metadata::{BuildStatus, CascadeExitCode, OutcomeStatus, RunSummary};
use cascade_runner::{
    config::CascadeConfig,
    errors::{GraphError, RunError},
    failed_list::FailedList,
    graph::{ProjectGraph, ProjectSpec},
    outcome::SkipReason,
    runner::RunnerBuilder,
    signal::SignalHandlerKind,
    test_case::TestId,
    toolchain::{BuildAction, BuildOutcome, ToolchainAdapter},
};
use color_eyre::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    fs::File,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// A toolchain that fails the named projects and records every build it's asked to perform.
#[derive(Debug, Default)]
struct RecordingToolchain {
    failing: Vec<&'static str>,
    built: Mutex<Vec<String>>,
}

impl RecordingToolchain {
    fn failing(failing: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            failing,
            built: Mutex::new(Vec::new()),
        })
    }

    fn built(&self) -> Vec<String> {
        let mut built = self.built.lock().unwrap().clone();
        built.sort();
        built
    }
}

impl ToolchainAdapter for RecordingToolchain {
    fn build(&self, action: &BuildAction) -> BuildOutcome {
        self.built.lock().unwrap().push(action.name.to_string());
        if self.failing.contains(&action.name.as_str()) {
            BuildOutcome::failure(format!("{}: compile error", action.name))
        } else {
            BuildOutcome::success(Vec::new())
        }
    }
}

/// `app -> lib -> base`, plus an independent `tools` project.
fn sample_graph(root: &Utf8Path) -> Result<ProjectGraph> {
    let mut graph = ProjectGraph::new();
    graph.add_project(ProjectSpec::new("base", root.join("base")))?;
    graph.add_project(ProjectSpec::new("lib", root.join("lib")).with_dependencies(["base"]))?;
    graph.add_project(ProjectSpec::new("app", root.join("app")).with_dependencies(["lib"]))?;
    graph.add_project(ProjectSpec::new("tools", root.join("tools")))?;
    Ok(graph)
}

fn write_config(root: &Utf8Path, contents: &str) -> Result<CascadeConfig> {
    std::fs::create_dir_all(root.join(".config"))?;
    std::fs::write(root.join(CascadeConfig::CONFIG_PATH), contents)?;
    Ok(CascadeConfig::from_sources(root, None)?)
}

#[test]
fn failed_dependency_skips_dependents() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let root = dir.path();
    let config = write_config(
        root,
        indoc! {r#"
            [profile.ci]
            build-threads = 2
            test-threads = 2
            timeout = "10s"

            [profile.ci.junit]
            path = "junit.xml"
            report-name = "integration"
        "#},
    )?;
    let profile = config.profile("ci")?;

    let toolchain = RecordingToolchain::failing(vec!["lib"]);
    let tests = vec![
        probe_with_report(root, "base", "base-pass", ["pass"]).build(),
        probe_with_report(root, "base", "base-fail", ["fail", "1"]).build(),
        probe("lib", "lib-pass", ["pass"]).build(),
        probe("app", "app-pass", ["pass"]).build(),
        probe("tools", "tools-pass", ["pass"]).build(),
    ];

    let summary_path = root.join("out/summary.json");
    let mut builder = RunnerBuilder::default();
    builder.set_summary_path(summary_path.clone());
    let runner = builder.build(&profile, SignalHandlerKind::Noop)?;
    let report = runner.execute(&sample_graph(root)?, toolchain.clone(), tests)?;

    // `app` is never handed to the toolchain.
    assert_eq!(toolchain.built(), vec!["base", "lib", "tools"]);

    let status = |name: &str| {
        report
            .builds
            .iter()
            .find(|result| result.name.as_str() == name)
            .map(|result| result.status)
    };
    assert_eq!(status("base"), Some(BuildStatus::Success));
    assert_eq!(status("lib"), Some(BuildStatus::Failed));
    assert_eq!(status("app"), Some(BuildStatus::Skipped));
    assert_eq!(status("tools"), Some(BuildStatus::Success));

    let outcome = |project: &str, name: &str| {
        report
            .report
            .get(&TestId::new(project, name))
            .cloned()
            .unwrap_or_else(|| panic!("outcome for {project}::{name}"))
    };
    assert_eq!(outcome("base", "base-pass").status, OutcomeStatus::Pass);
    let base_fail = outcome("base", "base-fail");
    assert_eq!(base_fail.status, OutcomeStatus::Fail);
    assert_eq!(base_fail.exit_code(), Some(1));
    assert!(base_fail.report_artifact.is_some());
    assert_eq!(
        outcome("lib", "lib-pass").skip_reason,
        Some(SkipReason::BuildFailed {
            project: "lib".into()
        })
    );
    assert_eq!(
        outcome("app", "app-pass").skip_reason,
        Some(SkipReason::BuildSkipped {
            project: "app".into()
        })
    );
    assert_eq!(outcome("tools", "tools-pass").status, OutcomeStatus::Pass);

    assert_eq!(report.exit_code(), CascadeExitCode::BUILD_FAILED);

    // Reports.
    let summary = RunSummary::from_reader(File::open(&summary_path)?)?;
    assert_eq!(summary.run_id, report.run_id.to_string());
    assert!(!summary.cancelled);
    assert_eq!(summary.outcomes.len(), 5);
    assert_eq!(summary.counts.pass, 2);
    assert_eq!(summary.counts.fail, 1);
    assert_eq!(summary.counts.skipped, 2);

    let junit = std::fs::read_to_string(profile.store_dir().join("junit.xml"))?;
    assert!(junit.contains(r#"<testsuites name="integration""#), "{junit}");
    assert!(junit.contains(r#"<testsuite name="base""#), "{junit}");
    assert!(junit.contains("test failure with exit code 1"), "{junit}");

    Ok(())
}

#[test]
fn passing_run_exits_ok() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let root = dir.path();
    let config = CascadeConfig::default_config(root);
    let profile = config.profile(CascadeConfig::DEFAULT_PROFILE)?;

    let mut graph = ProjectGraph::new();
    graph.add_project(ProjectSpec::new("solo", root.join("solo")))?;
    let toolchain = RecordingToolchain::failing(Vec::new());

    let runner = RunnerBuilder::default().build(&profile, SignalHandlerKind::Noop)?;
    let tests = vec![
        probe("solo", "one", ["pass"]).build(),
        probe("solo", "two", ["pass"]).build(),
    ];
    let report = runner.execute(&graph, toolchain, tests)?;

    assert!(report.report.is_success());
    assert_eq!(report.report.pass_ratio(), Some(1.0));
    assert_eq!(report.exit_code(), CascadeExitCode::OK);

    let runner = RunnerBuilder::default().build(&profile, SignalHandlerKind::Noop)?;
    let report = runner.execute(&graph, RecordingToolchain::failing(Vec::new()), Vec::new())?;
    assert_eq!(report.exit_code(), CascadeExitCode::NO_TESTS_RUN);
    Ok(())
}

#[test]
fn cyclic_graph_is_rejected_before_building() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let root = dir.path();
    let config = CascadeConfig::default_config(root);
    let profile = config.profile(CascadeConfig::DEFAULT_PROFILE)?;

    let mut graph = ProjectGraph::new();
    graph.add_project(ProjectSpec::new("a", root.join("a")).with_dependencies(["b"]))?;
    graph.add_project(ProjectSpec::new("b", root.join("b")).with_dependencies(["a"]))?;
    let toolchain = RecordingToolchain::failing(Vec::new());

    let runner = RunnerBuilder::default().build(&profile, SignalHandlerKind::Noop)?;
    let err = runner
        .execute(&graph, toolchain.clone(), vec![probe("a", "t", ["pass"]).build()])
        .expect_err("cyclic graph is rejected");

    assert!(
        matches!(err, RunError::Graph(GraphError::CyclicDependency { .. })),
        "{err:?}"
    );
    assert_eq!(err.exit_code(), CascadeExitCode::INVALID_GRAPH);
    assert!(toolchain.built().is_empty(), "nothing was built");
    Ok(())
}

#[test]
fn cancellation_mid_run() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let root = dir.path();
    let config = write_config(
        root,
        indoc! {r#"
            [profile.default]
            test-threads = 1
            grace-period = "1s"
        "#},
    )?;
    let profile = config.profile(CascadeConfig::DEFAULT_PROFILE)?;

    let mut graph = ProjectGraph::new();
    graph.add_project(ProjectSpec::new("solo", root.join("solo")))?;

    let runner = RunnerBuilder::default().build(&profile, SignalHandlerKind::Noop)?;
    let cancel = runner.cancel_handle();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        cancel.cancel();
    });

    // With one test thread, `second` can only start after `first` finishes.
    let tests = vec![
        probe("solo", "first", ["sleep", "5000"]).build(),
        probe("solo", "second", ["pass"]).build(),
    ];
    let start = Instant::now();
    let report = runner.execute(&graph, RecordingToolchain::failing(Vec::new()), tests)?;
    canceller.join().expect("canceller thread panicked");

    assert!(start.elapsed() < Duration::from_secs(4), "run was cut short");
    assert!(report.report.is_cancelled());
    assert_eq!(report.exit_code(), CascadeExitCode::CANCELLED);

    let first = report
        .report
        .get(&TestId::new("solo", "first"))
        .expect("outcome for first");
    assert!(first.cancelled);
    assert_eq!(first.status, OutcomeStatus::Error);

    let second = report
        .report
        .get(&TestId::new("solo", "second"))
        .expect("outcome for second");
    assert_eq!(second.status, OutcomeStatus::Skipped);
    assert_eq!(second.skip_reason, Some(SkipReason::Cancelled));
    Ok(())
}

#[test]
fn failed_only_reruns_previous_failures() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let root = dir.path();
    let config = CascadeConfig::default_config(root);
    let profile = config.profile(CascadeConfig::DEFAULT_PROFILE)?;

    let mut graph = ProjectGraph::new();
    graph.add_project(ProjectSpec::new("solo", root.join("solo")))?;
    let tests = || {
        vec![
            probe("solo", "good", ["pass"]).build(),
            probe("solo", "bad", ["fail", "1"]).build(),
            probe("solo", "worse", ["fail", "3"]).build(),
        ]
    };

    let runner = RunnerBuilder::default().build(&profile, SignalHandlerKind::Noop)?;
    let report = runner.execute(&graph, RecordingToolchain::failing(Vec::new()), tests())?;
    assert_eq!(report.exit_code(), CascadeExitCode::TEST_RUN_FAILED);

    let failed = FailedList::load(profile.store_dir())?;
    assert_eq!(
        failed.iter().collect::<Vec<_>>(),
        vec!["solo::bad", "solo::worse"]
    );

    let mut builder = RunnerBuilder::default();
    builder.set_failed_only(true);
    let runner = builder.build(&profile, SignalHandlerKind::Noop)?;
    let report = runner.execute(&graph, RecordingToolchain::failing(Vec::new()), tests())?;

    let ran: Vec<_> = report
        .report
        .outcomes()
        .iter()
        .map(|outcome| outcome.id.to_string())
        .collect();
    assert_eq!(ran, vec!["solo::bad", "solo::worse"]);

    // With nothing recorded as failing, nothing is selected.
    FailedList::default().write(profile.store_dir())?;
    let mut builder = RunnerBuilder::default();
    builder.set_failed_only(true);
    let runner = builder.build(&profile, SignalHandlerKind::Noop)?;
    let report = runner.execute(&graph, RecordingToolchain::failing(Vec::new()), tests())?;
    assert!(report.report.outcomes().is_empty());
    assert_eq!(report.exit_code(), CascadeExitCode::NO_TESTS_RUN);
    Ok(())
}
