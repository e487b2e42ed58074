// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for cascade: dependency-ordered builds and supervised test execution.
//!
//! The basic flow of a run is:
//!
//! 1. Declare projects in a [`ProjectGraph`](graph::ProjectGraph) and resolve a build order.
//! 2. Build projects through a [`ToolchainAdapter`](toolchain::ToolchainAdapter), scheduled by the
//!    [`Scheduler`](scheduler::Scheduler) so that no project starts before its dependencies
//!    succeed.
//! 3. Run the [`TestCase`](test_case::TestCase)s selected by a
//!    [`TestFilter`](test_filter::TestFilter) for successfully built projects, under the
//!    [`ProcessSupervisor`](supervisor::ProcessSupervisor).
//! 4. Aggregate every [`Outcome`](outcome::Outcome) in a
//!    [`ResultCollector`](collector::ResultCollector), and write reports.
//!
//! [`Runner`](runner::Runner) drives all of these steps.

pub mod cancel;
pub mod collector;
pub mod config;
pub mod errors;
pub mod failed_list;
pub mod graph;
pub mod outcome;
pub mod output;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod supervisor;
pub mod test_case;
pub mod test_filter;
mod time;
pub mod toolchain;
