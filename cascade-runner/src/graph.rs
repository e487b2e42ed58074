// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The project graph.
//!
//! A [`ProjectGraph`] is an arena of [`Project`]s, each addressed by a [`ProjectIndex`]. The graph
//! is immutable once built: build status is tracked separately by the
//! [`Scheduler`](crate::scheduler::Scheduler).

use crate::errors::GraphError;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, map::Entry};
use petgraph::{
    Direction,
    algo::kosaraju_scc,
    graph::{DiGraph, NodeIndex},
};
use smol_str::SmolStr;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap},
    fmt,
};
use tracing::debug;

/// An index into a [`ProjectGraph`].
///
/// Indexes follow the order in which projects were added.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ProjectIndex(usize);

impl ProjectIndex {
    /// Returns the underlying index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ProjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The declaration of a project, passed into [`ProjectGraph::add_project`].
#[derive(Clone, Debug)]
pub struct ProjectSpec {
    name: SmolStr,
    root: Utf8PathBuf,
    dependencies: Vec<SmolStr>,
    output_dir: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    command: Vec<String>,
}

impl ProjectSpec {
    /// Creates a new project declaration with the given name and root directory.
    pub fn new(name: impl Into<SmolStr>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            dependencies: Vec::new(),
            output_dir: None,
            env: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    /// Adds dependencies on the named projects.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Sets the build output directory. Defaults to `<root>/build`.
    pub fn with_output_dir(mut self, output_dir: impl Into<Utf8PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    /// Adds an environment override for the build action.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the build command, as an argument vector.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }
}

/// A project registered in a [`ProjectGraph`].
#[derive(Clone, Debug)]
pub struct Project {
    index: ProjectIndex,
    name: SmolStr,
    root: Utf8PathBuf,
    dependencies: Vec<SmolStr>,
    output_dir: Utf8PathBuf,
    env: BTreeMap<String, String>,
    command: Vec<String>,
}

impl Project {
    /// The default name of the build directory, relative to the project root.
    pub const DEFAULT_BUILD_DIR: &'static str = "build";

    /// Returns the index of this project within its graph.
    pub fn index(&self) -> ProjectIndex {
        self.index
    }

    /// Returns the name of this project.
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// Returns the root directory of this project.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the names of the projects this project depends on, in declaration order.
    pub fn dependency_names(&self) -> &[SmolStr] {
        &self.dependencies
    }

    /// Returns the build output directory of this project.
    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// Returns the environment overrides for the build action.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Returns the build command.
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// A set of projects and the dependencies between them.
#[derive(Clone, Debug, Default)]
pub struct ProjectGraph {
    projects: IndexMap<SmolStr, Project>,
}

impl ProjectGraph {
    /// Creates a new, empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a project.
    ///
    /// Dependency names are not checked here: projects may be added in any order, and
    /// dependencies are validated by [`validate`](Self::validate) and
    /// [`resolve_order`](Self::resolve_order).
    pub fn add_project(&mut self, spec: ProjectSpec) -> Result<ProjectIndex, GraphError> {
        let index = ProjectIndex(self.projects.len());
        match self.projects.entry(spec.name.clone()) {
            Entry::Occupied(_) => Err(GraphError::DuplicateProject { name: spec.name }),
            Entry::Vacant(entry) => {
                let ProjectSpec {
                    name,
                    root,
                    dependencies,
                    output_dir,
                    env,
                    command,
                } = spec;

                // Repeated dependency declarations carry no extra meaning.
                let mut deduped = Vec::with_capacity(dependencies.len());
                for dep in dependencies {
                    if !deduped.contains(&dep) {
                        deduped.push(dep);
                    }
                }

                let output_dir = output_dir.unwrap_or_else(|| root.join(Project::DEFAULT_BUILD_DIR));
                entry.insert(Project {
                    index,
                    name,
                    root,
                    dependencies: deduped,
                    output_dir,
                    env,
                    command,
                });
                Ok(index)
            }
        }
    }

    /// Returns the number of projects in the graph.
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Returns true if the graph has no projects.
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Returns the project at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index does not belong to this graph.
    pub fn project(&self, index: ProjectIndex) -> &Project {
        &self.projects[index.0]
    }

    /// Looks up a project by name.
    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    /// Iterates over all projects in input order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Project> + '_ {
        self.projects.values()
    }

    /// Checks that every dependency refers to a known project, and that no two projects share a
    /// build directory.
    pub fn validate(&self) -> Result<(), GraphError> {
        for project in self.projects.values() {
            for dep in &project.dependencies {
                if !self.projects.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        project: project.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut owners: HashMap<&Utf8Path, &SmolStr> = HashMap::new();
        for project in self.projects.values() {
            if let Some(first) = owners.insert(&project.output_dir, &project.name) {
                return Err(GraphError::SharedBuildDir {
                    dir: project.output_dir.clone(),
                    first: first.clone(),
                    second: project.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Returns every project such that each one comes after all of its dependencies.
    ///
    /// Ties among projects that are ready at the same time are broken by input order, so the
    /// result is deterministic. If the dependency relation has a cycle, no partial order is
    /// returned.
    pub fn resolve_order(&self) -> Result<Vec<ProjectIndex>, GraphError> {
        self.validate()?;

        let graph = self.to_petgraph();
        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(ix, _)| Reverse(ix))
            .collect();

        let mut order = Vec::with_capacity(self.projects.len());
        while let Some(Reverse(ix)) = ready.pop() {
            order.push(ProjectIndex(ix));
            for dependent in graph.neighbors_directed(NodeIndex::new(ix), Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependent.index()));
                }
            }
        }

        if order.len() == self.projects.len() {
            debug!(count = order.len(), "resolved build order");
            return Ok(order);
        }

        let remaining = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(ix, _)| self.projects[ix].name.clone())
            .collect();

        let mut cycles: Vec<Vec<usize>> = kosaraju_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut ixs: Vec<_> = scc.into_iter().map(|node| node.index()).collect();
                ixs.sort_unstable();
                ixs
            })
            .collect();
        cycles.sort_unstable();

        let cycles = cycles
            .into_iter()
            .map(|ixs| {
                ixs.into_iter()
                    .map(|ix| self.projects[ix].name.clone())
                    .collect()
            })
            .collect();

        Err(GraphError::CyclicDependency { remaining, cycles })
    }

    /// Returns the direct dependencies of a project, in declaration order.
    ///
    /// Dependencies that don't name a known project are omitted.
    pub fn dependencies(&self, index: ProjectIndex) -> impl Iterator<Item = ProjectIndex> + '_ {
        self.project(index)
            .dependencies
            .iter()
            .filter_map(|dep| self.projects.get_index_of(dep).map(ProjectIndex))
    }

    /// Returns the projects that directly depend on a project, in input order.
    pub fn dependents(&self, index: ProjectIndex) -> impl Iterator<Item = ProjectIndex> + '_ {
        let name = &self.project(index).name;
        self.projects
            .values()
            .filter(move |project| project.dependencies.contains(name))
            .map(|project| project.index)
    }

    /// Returns every project that directly or indirectly depends on a project, in input order.
    ///
    /// The project itself is not included, even if it is part of a cycle.
    pub fn transitive_dependents(&self, index: ProjectIndex) -> Vec<ProjectIndex> {
        let reverse = self.reverse_adjacency();
        let mut seen = vec![false; self.projects.len()];
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &dependent in &reverse[current.0] {
                if !seen[dependent.0] {
                    seen[dependent.0] = true;
                    stack.push(dependent);
                }
            }
        }
        seen[index.0] = false;

        seen.into_iter()
            .enumerate()
            .filter_map(|(ix, seen)| seen.then_some(ProjectIndex(ix)))
            .collect()
    }

    /// For each project, the list of projects that directly depend on it.
    pub(crate) fn reverse_adjacency(&self) -> Vec<Vec<ProjectIndex>> {
        let mut reverse = vec![Vec::new(); self.projects.len()];
        for project in self.projects.values() {
            for dep in self.dependencies(project.index) {
                reverse[dep.0].push(project.index);
            }
        }
        reverse
    }

    /// Builds a petgraph graph whose node indexes match project indexes, with an edge from each
    /// dependency to its dependent.
    fn to_petgraph(&self) -> DiGraph<ProjectIndex, ()> {
        let mut graph = DiGraph::with_capacity(self.projects.len(), self.projects.len());
        for project in self.projects.values() {
            graph.add_node(project.index);
        }
        for project in self.projects.values() {
            for dep in self.dependencies(project.index) {
                graph.add_edge(NodeIndex::new(dep.0), NodeIndex::new(project.index.0), ());
            }
        }
        graph
    }
}
