// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests
//!
//! These tests drive real processes: the `cascade-probe` helper binary built from
//! `test-helpers/probe.rs`, which Cargo exposes to this test target as
//! `CARGO_BIN_EXE_cascade-probe`.

mod fixtures;
mod run;
mod supervise;

#[test]
fn probe_is_built() {
    let path = camino::Utf8Path::new(fixtures::probe_path());
    assert!(path.is_file(), "probe binary exists at {path}");
}
