// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests that failed in the previous run.
//!
//! After every run that isn't cancelled, the identities of the tests that failed are written to
//! `.failed.json` in the profile's store directory, as a JSON array of `project::name` strings.
//! A later run can use the list to select only those tests again.

use crate::{
    collector::AggregatedReport,
    errors::{ReadFailedListError, WriteReportError},
    test_case::TestId,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{collections::BTreeSet, fs::File, io, io::BufWriter};

/// The set of tests that failed in a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FailedList {
    ids: BTreeSet<String>,
}

impl FailedList {
    /// The name of the file within the store directory.
    pub const FILE_NAME: &'static str = ".failed.json";

    /// The location of the list within `store_dir`.
    pub fn path(store_dir: &Utf8Path) -> Utf8PathBuf {
        store_dir.join(Self::FILE_NAME)
    }

    /// Collects the tests that ran and didn't pass.
    ///
    /// Skipped tests and tests interrupted by cancellation aren't counted as failures.
    pub fn from_report(report: &AggregatedReport) -> Self {
        report
            .outcomes()
            .iter()
            .filter(|outcome| {
                outcome.status.is_executed() && !outcome.status.is_success() && !outcome.cancelled
            })
            .map(|outcome| outcome.id.clone())
            .collect()
    }

    /// Reads the list from `store_dir`.
    ///
    /// A missing file means no test failed, or no run happened yet.
    pub fn load(store_dir: &Utf8Path) -> Result<Self, ReadFailedListError> {
        let path = Self::path(store_dir);
        let f = match File::open(&path) {
            Ok(f) => f,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => return Err(ReadFailedListError::Read { path, error }),
        };
        let ids: Vec<String> = serde_json::from_reader(io::BufReader::new(f))
            .map_err(|error| ReadFailedListError::Parse { path, error })?;
        Ok(Self {
            ids: ids.into_iter().collect(),
        })
    }

    /// Writes the list to `store_dir`, replacing the previous one.
    pub fn write(&self, store_dir: &Utf8Path) -> Result<(), WriteReportError> {
        std::fs::create_dir_all(store_dir).map_err(|error| WriteReportError::Fs {
            file: store_dir.to_owned(),
            error,
        })?;
        let path = Self::path(store_dir);
        let f = File::create(&path).map_err(|error| WriteReportError::Fs {
            file: path.clone(),
            error,
        })?;
        serde_json::to_writer(BufWriter::new(f), &self.ids)
            .map_err(|error| WriteReportError::Json { file: path, error })
    }

    /// Returns true if `id` failed.
    pub fn contains(&self, id: &TestId) -> bool {
        self.ids.contains(&id.to_string())
    }

    /// The number of failed tests.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if no test failed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The failed test identities, sorted.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl FromIterator<TestId> for FailedList {
    fn from_iter<I: IntoIterator<Item = TestId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|id| id.to_string()).collect(),
        }
    }
}
