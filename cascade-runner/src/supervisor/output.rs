// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output capture for supervised processes.

use crate::errors::ChildFdError;
use bytes::{Bytes, BytesMut};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStderr, ChildStdout},
};

/// The size of each buffered reader's buffer, and the initial size of each accumulator.
///
/// This size is not totally arbitrary, but rather the (normal) page size on most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// A `BufReader` over an `AsyncRead` that tracks whether the reader is done.
pub(super) struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    pub(super) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    async fn fill_buf(&mut self, acc: &mut BytesMut) -> Result<(), io::Error> {
        if self.done {
            return Ok(());
        }

        match self.reader.fill_buf().await {
            Ok(buf) => {
                acc.extend_from_slice(buf);
                if buf.is_empty() {
                    self.done = true;
                }
                let len = buf.len();
                self.reader.consume(len);
                Ok(())
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedBufReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.is_done())
}

async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: &mut Option<FusedBufReader<R>>,
    acc: &mut BytesMut,
) -> Result<(), io::Error> {
    match reader {
        Some(reader) => reader.fill_buf(acc).await,
        None => Ok(()),
    }
}

/// Output and read errors accumulated from a child process's stdout and stderr.
pub(super) struct ChildAccumulator {
    stdout: Option<FusedBufReader<ChildStdout>>,
    stderr: Option<FusedBufReader<ChildStderr>>,
    stdout_acc: BytesMut,
    stderr_acc: BytesMut,
    pub(super) errors: Vec<ChildFdError>,
}

impl ChildAccumulator {
    pub(super) fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout: stdout.map(FusedBufReader::new),
            stderr: stderr.map(FusedBufReader::new),
            stdout_acc: BytesMut::with_capacity(CHUNK_SIZE),
            stderr_acc: BytesMut::with_capacity(CHUNK_SIZE),
            errors: Vec::new(),
        }
    }

    /// Returns true once both pipes have been closed.
    pub(super) fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }

    /// Reads one chunk of available output from whichever pipe is ready first.
    ///
    /// This operation is cancel-safe, since the underlying [`AsyncBufReadExt::fill_buf`]
    /// operation is cancel-safe. It pends forever once both pipes are done, so callers guard it
    /// with [`is_done`](Self::is_done).
    pub(super) async fn fill_buf(&mut self) {
        let res = tokio::select! {
            res = fill_buf_opt(&mut self.stdout, &mut self.stdout_acc), if !is_done_opt(&self.stdout) => {
                res.map_err(|error| ChildFdError::ReadStdout(Arc::new(error)))
            }
            res = fill_buf_opt(&mut self.stderr, &mut self.stderr_acc), if !is_done_opt(&self.stderr) => {
                res.map_err(|error| ChildFdError::ReadStderr(Arc::new(error)))
            }
            else => std::future::pending().await,
        };
        if let Err(error) = res {
            self.errors.push(error);
        }
    }

    /// Marks the collection as done, returning the captured output.
    pub(super) fn freeze(self) -> ChildOutput {
        ChildOutput {
            stdout: self.stdout_acc.freeze(),
            stderr: self.stderr_acc.freeze(),
        }
    }
}

/// Captured output of a child process.
#[derive(Clone, Debug, Default)]
pub(super) struct ChildOutput {
    pub(super) stdout: Bytes,
    pub(super) stderr: Bytes,
}
