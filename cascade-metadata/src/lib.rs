// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable data models for cascade runs.
//!
//! `cascade-runner` produces a [`RunSummary`] at the end of every run. The types here are stable,
//! serializable views over that data, intended to be consumed by other tools without depending
//! on the runner itself.
//!
//! This crate also documents the exit code conventions used by cascade and by the binaries it
//! supervises: see [`CascadeExitCode`] and [`ProbeExitCode`].

mod errors;
mod exit_codes;
mod summary;

pub use errors::*;
pub use exit_codes::*;
pub use summary::*;
