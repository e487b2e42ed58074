// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The top-level driver for a run.
//!
//! A [`Runner`] owns a Tokio runtime and wires everything together: it resolves the build order,
//! builds projects through the [`Scheduler`], runs the selected tests of successfully built
//! projects under the [`ProcessSupervisor`], and aggregates the outcomes with a
//! [`ResultCollector`].
//!
//! After a run that wasn't cancelled, the tests that failed are recorded in the profile's store
//! directory as a [`FailedList`], so that the next run can select only those.

use crate::{
    cancel::CancelHandle,
    collector::{AggregatedReport, ResultCollector, outcome_channel},
    config::{CascadeProfile, SkipPolicy, ThreadCount},
    errors::{BuildError, RunError, RunnerBuildError, WriteReportError},
    failed_list::FailedList,
    graph::{ProjectGraph, ProjectIndex},
    outcome::{Outcome, SkipReason},
    scheduler::{BuildResult, Scheduler},
    signal::{SignalHandler, SignalHandlerKind},
    supervisor::ProcessSupervisor,
    test_case::{TestCase, TestId},
    test_filter::{FilterMatch, TestFilter},
    toolchain::ToolchainAdapter,
};
use camino::{Utf8Path, Utf8PathBuf};
use cascade_metadata::{BuildStatus, CascadeExitCode, RunSummary};
use futures::StreamExt;
use quick_junit::ReportUuid;
use smol_str::SmolStr;
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    fs::File,
    io::BufWriter,
    sync::Arc,
};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Runner options.
#[derive(Debug, Default)]
pub struct RunnerBuilder {
    build_threads: Option<ThreadCount>,
    test_threads: Option<ThreadCount>,
    skip_policy: Option<SkipPolicy>,
    summary_path: Option<Utf8PathBuf>,
    filter: TestFilter,
    failed_only: bool,
    max_runs: u32,
}

impl RunnerBuilder {
    /// Sets the number of projects to build simultaneously, overriding the profile.
    pub fn set_build_threads(&mut self, build_threads: ThreadCount) -> &mut Self {
        self.build_threads = Some(build_threads);
        self
    }

    /// Sets the number of tests to run simultaneously, overriding the profile.
    pub fn set_test_threads(&mut self, test_threads: ThreadCount) -> &mut Self {
        self.test_threads = Some(test_threads);
        self
    }

    /// Sets the skip policy, overriding the profile.
    pub fn set_skip_policy(&mut self, skip_policy: SkipPolicy) -> &mut Self {
        self.skip_policy = Some(skip_policy);
        self
    }

    /// Writes a JSON [`RunSummary`] to this path once the run finishes.
    pub fn set_summary_path(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.summary_path = Some(path.into());
        self
    }

    /// Selects the tests to run. By default, every regular test runs.
    pub fn set_filter(&mut self, filter: TestFilter) -> &mut Self {
        self.filter = filter;
        self
    }

    /// If true, only the tests that failed in the previous run with this profile are run.
    ///
    /// This narrows the selection made by the filter.
    pub fn set_failed_only(&mut self, failed_only: bool) -> &mut Self {
        self.failed_only = failed_only;
        self
    }

    /// Runs the selected tests repeatedly until a run fails, or `max_runs` runs have passed.
    ///
    /// Projects are only built once. 0 and 1 both mean a single run.
    pub fn set_repeat_until_fail(&mut self, max_runs: u32) -> &mut Self {
        self.max_runs = max_runs;
        self
    }

    /// Creates a new runner.
    pub fn build(
        self,
        profile: &CascadeProfile<'_>,
        signal_handler: SignalHandlerKind,
    ) -> Result<Runner, RunnerBuildError> {
        let build_threads = self
            .build_threads
            .unwrap_or_else(|| profile.build_threads())
            .compute();
        let test_threads = self
            .test_threads
            .unwrap_or_else(|| profile.test_threads())
            .compute();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("cascade-runner-worker")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(Runner {
            inner: RunnerInner {
                run_id: ReportUuid::new_v4(),
                build_threads,
                test_threads,
                skip_policy: self.skip_policy.unwrap_or_else(|| profile.skip_policy()),
                supervisor: ProcessSupervisor::from_profile(profile),
                cancel: CancelHandle::new(),
                max_runs: self.max_runs.max(1),
            },
            filter: self.filter,
            failed_only: self.failed_only,
            store_dir: profile.store_dir().to_owned(),
            junit: profile.junit().map(|junit| JunitOutput {
                path: junit.path().to_owned(),
                report_name: junit.report_name().to_owned(),
            }),
            summary_path: self.summary_path,
            signal_handler,
            runtime,
        })
    }
}

#[derive(Clone, Debug)]
struct JunitOutput {
    path: Utf8PathBuf,
    report_name: String,
}

/// Context for a run.
///
/// Created using [`RunnerBuilder::build`].
#[derive(Debug)]
pub struct Runner {
    inner: RunnerInner,
    filter: TestFilter,
    failed_only: bool,
    store_dir: Utf8PathBuf,
    junit: Option<JunitOutput>,
    summary_path: Option<Utf8PathBuf>,
    signal_handler: SignalHandler,
    runtime: Runtime,
}

impl Runner {
    /// The unique ID of this run.
    pub fn run_id(&self) -> ReportUuid {
        self.inner.run_id
    }

    /// Returns a handle that cancels this run.
    ///
    /// Cancelling stops new builds and tests from starting, and terminates running tests.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel.clone()
    }

    /// Builds every project in `graph`, then runs the selected `tests` for the projects that
    /// built.
    ///
    /// Build and test failures are reported through the returned [`RunReport`]. Errors are
    /// returned only for an invalid graph or test list, or if a report couldn't be read or
    /// written.
    pub fn execute(
        mut self,
        graph: &ProjectGraph,
        adapter: Arc<dyn ToolchainAdapter>,
        tests: Vec<TestCase>,
    ) -> Result<RunReport, RunError> {
        let order = graph.resolve_order()?;
        check_tests(graph, &tests)?;
        let tests = self.select_tests(tests)?;

        info!(
            run_id = %self.inner.run_id,
            projects = order.len(),
            tests = tests.len(),
            "starting run"
        );

        let inner = &self.inner;
        let signal_handler = &mut self.signal_handler;
        let res = self.runtime.block_on(async move {
            let run = inner.run(graph, &order, adapter, tests);
            let signals = forward_signals(signal_handler, &inner.cancel);
            tokio::select! {
                res = run => res,
                never = signals => match never {},
            }
        });

        // Child processes might keep the runtime stuck if it's dropped the normal way. Shut it
        // down aggressively, being OK with leaked resources.
        self.runtime.shutdown_background();

        let report = res?;
        if !report.report.is_cancelled() {
            let failed = FailedList::from_report(&report.report);
            failed.write(&self.store_dir)?;
            debug!(failed = failed.len(), store_dir = %self.store_dir, "recorded failed tests");
        }
        if let Some(junit) = &self.junit {
            report
                .report
                .write_junit(&junit.path, &junit.report_name)?;
            debug!(path = %junit.path, "wrote JUnit report");
        }
        if let Some(path) = &self.summary_path {
            report.write_summary(path)?;
            debug!(%path, "wrote run summary");
        }

        info!(
            passed = report.report.counts().pass,
            failed = report.report.counts().failed(),
            skipped = report.report.counts().skipped,
            cancelled = report.report.is_cancelled(),
            runs = report.runs,
            "run finished"
        );
        Ok(report)
    }

    fn select_tests(&mut self, tests: Vec<TestCase>) -> Result<Vec<TestCase>, RunError> {
        if self.failed_only {
            let failed = FailedList::load(&self.store_dir)?;
            debug!(failed = failed.len(), "selecting previously failed tests");
            self.filter.set_failed_only(failed);
        }

        let total = tests.len();
        let selected: Vec<_> = tests
            .into_iter()
            .filter(|test| match self.filter.filter_match(test) {
                FilterMatch::Matches => true,
                FilterMatch::Mismatch { reason } => {
                    debug!(test = %test.id(), %reason, "test filtered out");
                    false
                }
            })
            .collect();

        if self.failed_only && selected.is_empty() {
            warn!("no previously failed tests found");
        }
        if selected.len() < total {
            info!(
                selected = selected.len(),
                filtered_out = total - selected.len(),
                "selected tests"
            );
        }
        Ok(selected)
    }
}

#[derive(Debug)]
struct RunnerInner {
    run_id: ReportUuid,
    build_threads: usize,
    test_threads: usize,
    skip_policy: SkipPolicy,
    supervisor: ProcessSupervisor,
    cancel: CancelHandle,
    max_runs: u32,
}

impl RunnerInner {
    async fn run(
        &self,
        graph: &ProjectGraph,
        order: &[ProjectIndex],
        adapter: Arc<dyn ToolchainAdapter>,
        tests: Vec<TestCase>,
    ) -> Result<RunReport, RunError> {
        let mut scheduler = Scheduler::new(graph, self.build_threads);
        scheduler.set_skip_policy(self.skip_policy);
        let builds = scheduler.run(order, adapter, &self.cancel).await;

        let build_results: HashMap<&SmolStr, &BuildResult> =
            builds.iter().map(|result| (&result.name, result)).collect();

        let mut runnable = Vec::with_capacity(tests.len());
        let mut skipped = Vec::new();
        for test in &tests {
            let project = test.id().project();
            match build_results.get(project).map(|result| (result.status, &result.error)) {
                Some((BuildStatus::Success, _)) => runnable.push(test),
                Some((BuildStatus::Failed, _)) => skipped.push((
                    test.id(),
                    SkipReason::BuildFailed {
                        project: project.clone(),
                    },
                )),
                Some((_, Some(BuildError::Cancelled))) => {
                    skipped.push((test.id(), SkipReason::Cancelled))
                }
                _ => skipped.push((
                    test.id(),
                    SkipReason::BuildSkipped {
                        project: project.clone(),
                    },
                )),
            }
        }

        debug!(
            runnable = runnable.len(),
            test_threads = self.test_threads,
            "running tests"
        );

        let mut runs = 0;
        let report = loop {
            runs += 1;
            let report = self.run_tests(&tests, &runnable, &skipped).await?;
            if runs >= self.max_runs || !report.is_success() || report.counts().executed() == 0 {
                break report;
            }
            info!(run = runs, max_runs = self.max_runs, "all tests passed, running again");
        };

        Ok(RunReport {
            run_id: self.run_id,
            runs,
            builds,
            report,
        })
    }

    /// Runs `runnable` once, recording `skipped` alongside.
    async fn run_tests(
        &self,
        tests: &[TestCase],
        runnable: &[&TestCase],
        skipped: &[(&TestId, SkipReason)],
    ) -> Result<AggregatedReport, RunError> {
        let mut collector =
            ResultCollector::new(self.run_id, tests.iter().map(|test| test.id().clone()));
        for (id, reason) in skipped {
            collector.record_skipped((*id).clone(), reason.clone())?;
        }

        let (sender, receiver) = outcome_channel();
        let supervisor = &self.supervisor;
        let cancel = &self.cancel;
        let execute_all = async move {
            let sender = &sender;
            futures::stream::iter(runnable.iter().copied())
                .for_each_concurrent(self.test_threads.max(1), move |test| async move {
                    let outcome = if cancel.is_cancelled() {
                        Outcome::skipped(test.id().clone(), SkipReason::Cancelled)
                    } else {
                        supervisor.execute(test, cancel).await
                    };
                    if !outcome.status.is_success() && outcome.status.is_executed() {
                        warn!(
                            test = %outcome.id,
                            status = %outcome.status,
                            "{}",
                            outcome.failure_message().unwrap_or_default(),
                        );
                    }
                    sender.send(outcome);
                })
                .await;
            // `sender` is dropped here, which lets the collector finish.
        };

        let ((), consumed) = futures::join!(execute_all, collector.consume(receiver));
        consumed?;

        if self.cancel.is_cancelled() {
            collector.cancel();
        }
        Ok(collector.finalize()?)
    }
}

/// Turns shutdown signals into run-wide cancellation. Never completes.
async fn forward_signals(signal_handler: &mut SignalHandler, cancel: &CancelHandle) -> Infallible {
    while let Some(event) = signal_handler.recv().await {
        info!(?event, "received signal, cancelling run");
        cancel.cancel();
    }
    std::future::pending().await
}

fn check_tests(graph: &ProjectGraph, tests: &[TestCase]) -> Result<(), RunError> {
    let mut seen = HashSet::with_capacity(tests.len());
    for test in tests {
        if graph.get(test.id().project()).is_none() {
            return Err(RunError::UnknownTestProject {
                id: test.id().clone(),
            });
        }
        if !seen.insert(test.id()) {
            return Err(RunError::DuplicateTestId {
                id: test.id().clone(),
            });
        }
    }
    Ok(())
}

/// The results of a run: per-project builds and the aggregated test report.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// The unique ID of the run.
    pub run_id: ReportUuid,

    /// The number of times the selected tests were run. More than 1 only when repeating until
    /// failure.
    pub runs: u32,

    /// Per-project build results, in build order.
    pub builds: Vec<BuildResult>,

    /// The aggregated test outcomes.
    pub report: AggregatedReport,
}

impl RunReport {
    /// Returns true if any project failed to build.
    pub fn has_build_failures(&self) -> bool {
        self.builds
            .iter()
            .any(|result| result.status == BuildStatus::Failed)
    }

    /// The exit code a driver process should use, per [`CascadeExitCode`].
    pub fn exit_code(&self) -> i32 {
        let counts = self.report.counts();
        if self.report.is_cancelled() {
            CascadeExitCode::CANCELLED
        } else if self.has_build_failures() {
            CascadeExitCode::BUILD_FAILED
        } else if counts.failed() > 0 {
            CascadeExitCode::TEST_RUN_FAILED
        } else if counts.executed() == 0 {
            CascadeExitCode::NO_TESTS_RUN
        } else {
            CascadeExitCode::OK
        }
    }

    /// Converts this report into its serializable form.
    pub fn to_summary(&self) -> RunSummary {
        RunSummary::new(
            self.run_id.to_string(),
            self.report.is_cancelled(),
            self.builds.iter().map(BuildResult::to_summary).collect(),
            self.report.outcome_summaries(),
        )
    }

    /// Writes the JSON summary to `path`, creating parent directories as needed.
    pub fn write_summary(&self, path: &Utf8Path) -> Result<(), WriteReportError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|error| WriteReportError::Fs {
                file: dir.to_owned(),
                error,
            })?;
        }
        let f = File::create(path).map_err(|error| WriteReportError::Fs {
            file: path.to_owned(),
            error,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(f), &self.to_summary()).map_err(|error| {
            WriteReportError::Json {
                file: path.to_owned(),
                error,
            }
        })
    }
}
