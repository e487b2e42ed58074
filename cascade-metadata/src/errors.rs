// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt};

/// An error that occurs while reading a [`RunSummary`](crate::RunSummary) back from JSON.
#[derive(Debug)]
pub enum SummaryReadError {
    /// Reading the input failed.
    Io(std::io::Error),

    /// The input was not a valid run summary.
    Json(serde_json::Error),
}

impl fmt::Display for SummaryReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(_) => write!(f, "reading cascade run summary failed"),
            Self::Json(_) => write!(f, "parsing cascade run summary JSON failed"),
        }
    }
}

impl error::Error for SummaryReadError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}
