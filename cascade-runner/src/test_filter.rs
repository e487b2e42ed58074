// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Selecting which tests a run executes.
//!
//! A [`TestFilter`] matches each test's `project::name` identity against regex patterns, and its
//! [`TestKind`] against the kinds requested for the run. Tests that don't match are left out of
//! the run entirely.

use crate::{
    errors::TestFilterBuilderError,
    failed_list::FailedList,
    test_case::{TestCase, TestKind},
};
use regex::Regex;
use std::fmt;

/// Selects tests by identity and kind.
///
/// The default filter selects every regular test.
#[derive(Clone, Debug, Default)]
pub struct TestFilter {
    patterns: Vec<Regex>,
    excludes: Vec<Regex>,
    perf: bool,
    nightly: bool,
    failed_only: Option<FailedList>,
}

impl TestFilter {
    /// Creates a filter that selects every regular test.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an include pattern.
    ///
    /// Once any include pattern is set, a test is selected only if at least one of them matches
    /// somewhere in its `project::name` identity.
    pub fn add_pattern(&mut self, pattern: &str) -> Result<&mut Self, TestFilterBuilderError> {
        self.patterns.push(compile(pattern)?);
        Ok(self)
    }

    /// Adds an exclude pattern. A test matching any exclude pattern is never selected.
    pub fn add_exclude(&mut self, pattern: &str) -> Result<&mut Self, TestFilterBuilderError> {
        self.excludes.push(compile(pattern)?);
        Ok(self)
    }

    /// If true, selects performance tests instead of regular and nightly ones.
    pub fn set_perf(&mut self, perf: bool) -> &mut Self {
        self.perf = perf;
        self
    }

    /// If true, nightly tests are selected along with regular tests.
    pub fn set_nightly(&mut self, nightly: bool) -> &mut Self {
        self.nightly = nightly;
        self
    }

    /// Narrows the selection to tests in `failed`.
    pub fn set_failed_only(&mut self, failed: FailedList) -> &mut Self {
        self.failed_only = Some(failed);
        self
    }

    /// Returns whether `test` is selected, and if not, why.
    pub fn filter_match(&self, test: &TestCase) -> FilterMatch {
        if let Some(reason) = self.kind_mismatch(test.kind()) {
            return FilterMatch::Mismatch { reason };
        }

        let id = test.id().to_string();
        if !self.patterns.is_empty() && !self.patterns.iter().any(|re| re.is_match(&id)) {
            return FilterMatch::Mismatch {
                reason: MismatchReason::Pattern,
            };
        }
        if self.excludes.iter().any(|re| re.is_match(&id)) {
            return FilterMatch::Mismatch {
                reason: MismatchReason::Excluded,
            };
        }

        if let Some(failed) = &self.failed_only
            && !failed.contains(test.id())
        {
            return FilterMatch::Mismatch {
                reason: MismatchReason::NotFailed,
            };
        }

        FilterMatch::Matches
    }

    fn kind_mismatch(&self, kind: TestKind) -> Option<MismatchReason> {
        match (kind, self.perf) {
            (TestKind::Perf, true) | (TestKind::Regular, false) => None,
            (TestKind::Nightly, false) if self.nightly => None,
            (TestKind::Perf, false) => Some(MismatchReason::Perf),
            (TestKind::Nightly, false) => Some(MismatchReason::Nightly),
            (TestKind::Regular | TestKind::Nightly, true) => Some(MismatchReason::NotPerf),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, TestFilterBuilderError> {
    Regex::new(pattern).map_err(|error| TestFilterBuilderError::new(pattern, error))
}

/// Whether a test is selected by a [`TestFilter`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterMatch {
    /// The test is selected.
    Matches,

    /// The test is left out of the run.
    Mismatch {
        /// Why the test was left out.
        reason: MismatchReason,
    },
}

impl FilterMatch {
    /// Returns true if the test is selected.
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matches)
    }
}

/// The reason a test was left out of a run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MismatchReason {
    /// No include pattern matched.
    Pattern,

    /// An exclude pattern matched.
    Excluded,

    /// The test is a performance test, and this isn't a performance run.
    Perf,

    /// This is a performance run, and the test isn't a performance test.
    NotPerf,

    /// The test is a nightly test, and nightly tests weren't requested.
    Nightly,

    /// Only previously failed tests were requested, and this test didn't fail.
    NotFailed,
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern => write!(f, "didn't match any pattern"),
            Self::Excluded => write!(f, "matched an exclude pattern"),
            Self::Perf => write!(f, "is a performance test"),
            Self::NotPerf => write!(f, "isn't a performance test"),
            Self::Nightly => write!(f, "is a nightly test"),
            Self::NotFailed => write!(f, "didn't fail in the previous run"),
        }
    }
}
