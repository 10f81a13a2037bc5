//! Ordered completion gate.
//!
//! Physical writes complete in any order: records of different streams race,
//! and a record that wraps past the end of the file is two device writes.
//! The gate holds each completion in a min-heap until every lower LSN has
//! completed too, and only then advances the log's highest completed LSN.

use crate::error::{LogError, LogResult};
use crate::types::Lsn;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::watch;
use tracing::trace;

/// Published gate progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    /// LSN of the highest record with every lower record complete.
    highest_completed: Lsn,
    /// LSN of the first record not yet drained.
    next_expected: Lsn,
    failed: bool,
}

#[derive(Debug)]
struct GateState {
    progress: Progress,
    held: BinaryHeap<Reverse<(Lsn, Lsn)>>,
    failure: Option<String>,
}

/// Reorder buffer between "write issued" and "write completed".
#[derive(Debug)]
pub(crate) struct CompletionGate {
    state: Mutex<GateState>,
    sender: watch::Sender<Progress>,
}

impl CompletionGate {
    /// Creates a gate expecting `next_expected` to complete first.
    pub(crate) fn new(next_expected: Lsn, highest_completed: Lsn) -> Self {
        let progress = Progress {
            highest_completed,
            next_expected,
            failed: false,
        };
        let (sender, _) = watch::channel(progress);
        Self {
            state: Mutex::new(GateState {
                progress,
                held: BinaryHeap::new(),
                failure: None,
            }),
            sender,
        }
    }

    /// Records that the record spanning `[lsn, next)` is durable.
    pub(crate) fn complete(&self, lsn: Lsn, next: Lsn) {
        let mut state = self.state.lock();
        state.held.push(Reverse((lsn, next)));

        let before = state.progress;
        while let Some(Reverse((low, end))) = state.held.peek().copied() {
            if low != state.progress.next_expected {
                break;
            }
            state.held.pop();
            state.progress.highest_completed = low;
            state.progress.next_expected = end;
        }
        if state.progress == before {
            trace!(lsn = %lsn, waiting_for = %before.next_expected, "completion held");
            return;
        }
        trace!(
            highest_completed = %state.progress.highest_completed,
            held = state.held.len(),
            "completions drained"
        );
        self.sender.send_replace(state.progress);
    }

    /// Fails every current and future waiter.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(reason.into());
        }
        state.progress.failed = true;
        self.sender.send_replace(state.progress);
    }

    /// LSN of the highest record with every lower record complete.
    pub(crate) fn highest_completed(&self) -> Lsn {
        self.state.lock().progress.highest_completed
    }

    fn failure(&self) -> LogError {
        LogError::Faulted {
            reason: self
                .state
                .lock()
                .failure
                .clone()
                .unwrap_or_else(|| "write failed".to_string()),
        }
    }

    /// Waits until the record at `lsn` and every record below it completed.
    ///
    /// # Errors
    ///
    /// Returns `Faulted` if the gate failed first.
    pub(crate) async fn wait_for(&self, lsn: Lsn) -> LogResult<()> {
        let mut receiver = self.sender.subscribe();
        loop {
            let progress = *receiver.borrow_and_update();
            if progress.next_expected > lsn {
                return Ok(());
            }
            if progress.failed {
                return Err(self.failure());
            }
            receiver.changed().await.map_err(|_| LogError::Closed)?;
        }
    }
}
