// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run-wide cancellation.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A handle used to cancel a run, and to observe cancellation.
///
/// Clones share the same state: cancelling through any clone cancels all of them. Cancellation is
/// one-way and idempotent.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Creates a new, uncancelled handle.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        let changed = self.sender.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
        if changed {
            debug!("run cancellation requested");
        }
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Waits until cancellation is requested.
    ///
    /// This is cancel-safe, and returns immediately if the handle was already cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender is kept alive by `self`, so this can't fail.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
