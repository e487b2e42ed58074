// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building projects in dependency order.
//!
//! The [`Scheduler`] is a single coordinator that owns every project's [`BuildStatus`]. Builds
//! run on blocking worker threads and report back over a channel; the coordinator commits each
//! result before admitting any project that depends on it.

use crate::{
    cancel::CancelHandle,
    config::SkipPolicy,
    errors::BuildError,
    graph::{ProjectGraph, ProjectIndex},
    toolchain::{BuildAction, BuildOutcome, ToolchainAdapter},
};
use camino::Utf8PathBuf;
use cascade_metadata::{BuildStatus, BuildSummary};
use smol_str::SmolStr;
use std::{
    any::Any,
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinError};
use tracing::{debug, info, warn};

/// The result of building, or not building, one project.
#[derive(Clone, Debug)]
pub struct BuildResult {
    /// The project.
    pub project: ProjectIndex,

    /// The project's name.
    pub name: SmolStr,

    /// The final status: one of `Success`, `Failed` or `Skipped`.
    pub status: BuildStatus,

    /// Why the project failed or was skipped.
    pub error: Option<BuildError>,

    /// Files produced by the build.
    pub artifacts: Vec<Utf8PathBuf>,

    /// How long the build took. Zero for skipped projects.
    pub duration: Duration,
}

impl BuildResult {
    fn skipped(project: ProjectIndex, name: SmolStr, error: BuildError) -> Self {
        Self {
            project,
            name,
            status: BuildStatus::Skipped,
            error: Some(error),
            artifacts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Returns true if the project built successfully.
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    /// A human-readable reason for a failure or skip, including the toolchain's diagnostic.
    pub fn reason(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        match error {
            BuildError::ActionFailed { diagnostic } if !diagnostic.is_empty() => {
                Some(format!("{error}:\n{diagnostic}"))
            }
            _ => Some(error.to_string()),
        }
    }

    /// Converts this result into its serializable form.
    pub fn to_summary(&self) -> BuildSummary {
        BuildSummary::new(
            self.name.clone(),
            self.status,
            self.reason(),
            self.artifacts.clone(),
            self.duration.as_secs_f64(),
        )
    }
}

/// Builds projects in dependency order with bounded parallelism.
#[derive(Debug)]
pub struct Scheduler<'g> {
    graph: &'g ProjectGraph,
    max_parallelism: usize,
    skip_policy: SkipPolicy,
}

impl<'g> Scheduler<'g> {
    /// Creates a scheduler for `graph` that runs at most `max_parallelism` builds at once.
    ///
    /// A parallelism of 0 is treated as 1.
    pub fn new(graph: &'g ProjectGraph, max_parallelism: usize) -> Self {
        Self {
            graph,
            max_parallelism: max_parallelism.max(1),
            skip_policy: SkipPolicy::default(),
        }
    }

    /// Sets how skips caused by failed dependencies are accounted for.
    pub fn set_skip_policy(&mut self, skip_policy: SkipPolicy) -> &mut Self {
        self.skip_policy = skip_policy;
        self
    }

    /// Builds the projects in `order`, which must be a valid build order such as the one returned
    /// by [`ProjectGraph::resolve_order`].
    ///
    /// Dependencies that aren't part of `order` are treated as already built. Returns one result
    /// per project, in `order`.
    pub async fn run(
        &self,
        order: &[ProjectIndex],
        adapter: Arc<dyn ToolchainAdapter>,
        cancel: &CancelHandle,
    ) -> Vec<BuildResult> {
        self.run_to_completion(order, adapter, cancel).await.finish()
    }

    async fn run_to_completion(
        &self,
        order: &[ProjectIndex],
        adapter: Arc<dyn ToolchainAdapter>,
        cancel: &CancelHandle,
    ) -> RunState {
        let mut state = RunState::new(self.graph, order);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut in_flight = 0;
        let mut cancel_seen = false;

        debug!(
            projects = order.len(),
            max_parallelism = self.max_parallelism,
            "starting builds"
        );

        loop {
            if !cancel_seen && cancel.is_cancelled() {
                cancel_seen = true;
                state.skip_pending_cancelled();
            }

            while in_flight < self.max_parallelism {
                if let Some((pos, error)) = state.queued_skips.pop_front() {
                    // The skip occupies a slot until the coordinator processes it.
                    state.trace("slot", pos);
                    let _ = sender.send(Completion::Skipped { pos, error });
                } else if let Some(Reverse(pos)) = state.ready.pop() {
                    self.spawn_build(&mut state, pos, &adapter, &sender);
                } else {
                    break;
                }
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                biased;

                completion = receiver.recv() => {
                    // The coordinator holds a sender, so the channel never closes.
                    let Some(completion) = completion else { break };
                    in_flight -= 1;
                    self.commit(&mut state, completion);
                }
                () = cancel.cancelled(), if !cancel_seen => {
                    info!("cancelling remaining builds");
                    cancel_seen = true;
                    state.skip_pending_cancelled();
                }
            }
        }

        state
    }

    fn spawn_build(
        &self,
        state: &mut RunState,
        pos: usize,
        adapter: &Arc<dyn ToolchainAdapter>,
        sender: &mpsc::UnboundedSender<Completion>,
    ) {
        let project = self.graph.project(state.order[pos]);
        state.statuses[pos] = BuildStatus::Building;
        state.trace("slot", pos);
        debug!(project = %project.name(), "building project");

        let action = BuildAction::for_project(project);
        let adapter = adapter.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            let stopwatch = crate::time::stopwatch();
            let result = tokio::task::spawn_blocking(move || adapter.build(&action)).await;
            let duration = stopwatch.snapshot().duration;
            let _ = sender.send(Completion::Built {
                pos,
                result,
                duration,
            });
        });
    }

    fn commit(&self, state: &mut RunState, completion: Completion) {
        match completion {
            Completion::Built {
                pos,
                result,
                duration,
            } => {
                state.trace("commit", pos);
                let ix = state.order[pos];
                let name = self.graph.project(ix).name().clone();
                let result = match result {
                    Ok(outcome) => built_result(ix, name, outcome, duration),
                    Err(error) => BuildResult {
                        project: ix,
                        name,
                        status: BuildStatus::Failed,
                        error: Some(BuildError::Panicked {
                            message: join_error_message(error),
                        }),
                        artifacts: Vec::new(),
                        duration,
                    },
                };

                state.statuses[pos] = result.status;
                if result.is_success() {
                    debug!(project = %result.name, ?duration, "project built");
                    state.release_dependents(pos);
                } else {
                    warn!(project = %result.name, "project failed to build");
                    self.skip_dependents(state, pos);
                }
                state.results[pos] = Some(result);
            }
            Completion::Skipped { pos, error } => {
                state.trace("commit", pos);
                let ix = state.order[pos];
                let name = self.graph.project(ix).name().clone();
                state.results[pos] = Some(BuildResult::skipped(ix, name, error));
            }
        }
    }

    fn skip_dependents(&self, state: &mut RunState, failed_pos: usize) {
        let failed = self.graph.project(state.order[failed_pos]).name().clone();
        for dependent in self.graph.transitive_dependents(state.order[failed_pos]) {
            let Some(pos) = state.position_of(dependent) else {
                continue;
            };
            if state.statuses[pos] != BuildStatus::Pending {
                continue;
            }

            state.statuses[pos] = BuildStatus::Skipped;
            let error = BuildError::DependencyFailed {
                dependency: failed.clone(),
            };
            debug!(
                project = %self.graph.project(dependent).name(),
                dependency = %failed,
                "skipping project",
            );
            match self.skip_policy {
                SkipPolicy::Immediate => {
                    state.trace("commit", pos);
                    let name = self.graph.project(dependent).name().clone();
                    state.results[pos] = Some(BuildResult::skipped(dependent, name, error));
                }
                SkipPolicy::ConsumeSlot => state.queued_skips.push_back((pos, error)),
            }
        }
    }
}

/// A message from a worker to the coordinator.
enum Completion {
    Built {
        pos: usize,
        result: Result<BuildOutcome, JoinError>,
        duration: Duration,
    },
    Skipped {
        pos: usize,
        error: BuildError,
    },
}

/// Coordinator-owned state, indexed by position in the build order.
struct RunState {
    order: Vec<ProjectIndex>,
    // Maps project index to position in `order`.
    positions: Vec<Option<usize>>,
    statuses: Vec<BuildStatus>,
    remaining_deps: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BinaryHeap<Reverse<usize>>,
    queued_skips: VecDeque<(usize, BuildError)>,
    results: Vec<Option<BuildResult>>,
    names: Vec<SmolStr>,
    // Slot admissions and result commits, in the order the coordinator performed them.
    #[cfg(test)]
    trace: Vec<String>,
}

impl RunState {
    fn new(graph: &ProjectGraph, order: &[ProjectIndex]) -> Self {
        let mut positions = vec![None; graph.len()];
        for (pos, ix) in order.iter().enumerate() {
            positions[ix.index()] = Some(pos);
        }

        let mut remaining_deps = vec![0; order.len()];
        let mut dependents = vec![Vec::new(); order.len()];
        for (pos, &ix) in order.iter().enumerate() {
            for dep in graph.dependencies(ix) {
                if let Some(dep_pos) = positions[dep.index()] {
                    remaining_deps[pos] += 1;
                    dependents[dep_pos].push(pos);
                }
            }
        }

        let ready = remaining_deps
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        Self {
            order: order.to_vec(),
            positions,
            statuses: vec![BuildStatus::Pending; order.len()],
            remaining_deps,
            dependents,
            ready,
            queued_skips: VecDeque::new(),
            results: vec![None; order.len()],
            names: order
                .iter()
                .map(|&ix| graph.project(ix).name().clone())
                .collect(),
            #[cfg(test)]
            trace: Vec::new(),
        }
    }

    #[cfg_attr(not(test), expect(unused_variables))]
    fn trace(&mut self, event: &str, pos: usize) {
        #[cfg(test)]
        self.trace.push(format!("{event}:{}", self.names[pos]));
    }

    fn position_of(&self, ix: ProjectIndex) -> Option<usize> {
        self.positions.get(ix.index()).copied().flatten()
    }

    fn release_dependents(&mut self, pos: usize) {
        for &dependent in &self.dependents[pos] {
            self.remaining_deps[dependent] -= 1;
            if self.remaining_deps[dependent] == 0
                && self.statuses[dependent] == BuildStatus::Pending
            {
                self.ready.push(Reverse(dependent));
            }
        }
    }

    fn skip_pending_cancelled(&mut self) {
        self.ready.clear();
        for pos in 0..self.order.len() {
            if self.statuses[pos] == BuildStatus::Pending {
                self.statuses[pos] = BuildStatus::Skipped;
                self.results[pos] = Some(BuildResult::skipped(
                    self.order[pos],
                    self.names[pos].clone(),
                    BuildError::Cancelled,
                ));
            }
        }
    }

    fn finish(self) -> Vec<BuildResult> {
        let Self {
            order,
            results,
            names,
            ..
        } = self;
        results
            .into_iter()
            .zip(order.into_iter().zip(names))
            .map(|(result, (ix, name))| {
                // Only reachable if `order` wasn't a valid build order.
                result.unwrap_or_else(|| BuildResult::skipped(ix, name, BuildError::Cancelled))
            })
            .collect()
    }
}

fn built_result(
    project: ProjectIndex,
    name: SmolStr,
    outcome: BuildOutcome,
    duration: Duration,
) -> BuildResult {
    let BuildOutcome {
        success,
        artifacts,
        diagnostic,
    } = outcome;
    if success {
        BuildResult {
            project,
            name,
            status: BuildStatus::Success,
            error: None,
            artifacts,
            duration,
        }
    } else {
        BuildResult {
            project,
            name,
            status: BuildStatus::Failed,
            error: Some(BuildError::ActionFailed { diagnostic }),
            artifacts,
            duration,
        }
    }
}

fn join_error_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => panic_message(payload),
        Err(error) => error.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}
