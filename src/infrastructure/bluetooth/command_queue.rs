//! Single-flight Command Queue
//!
//! The transport accepts one outstanding operation per link. Commands wait
//! here in FIFO order and the next one is only issued once the completion
//! signal of the previous one has been observed.

use crate::domain::error::LinkError;
use crate::domain::models::Command;
use crate::infrastructure::bluetooth::transport::LinkHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Something commands can be issued against.
pub trait CommandLink {
    fn dispatch(&self, command: &Command) -> Result<(), LinkError>;
}

impl CommandLink for LinkHandle {
    fn dispatch(&self, command: &Command) -> Result<(), LinkError> {
        LinkHandle::dispatch(self, command)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Command>,
    /// True iff one command was handed to the link and its completion is outstanding.
    busy: bool,
}

/// Pending commands and the busy flag, guarded together.
#[derive(Debug, Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail, then try to issue the head.
    pub fn enqueue(&self, command: Command, link: Option<&dyn CommandLink>) {
        let mut state = self.state.lock();
        trace!("Queueing {}", command);
        state.pending.push_back(command);
        Self::dispatch_locked(&mut state, link);
    }

    /// Issue the head of the queue unless a command is already in flight.
    pub fn try_dispatch_next(&self, link: Option<&dyn CommandLink>) {
        let mut state = self.state.lock();
        Self::dispatch_locked(&mut state, link);
    }

    /// Completion signal (success or error) for the in-flight command.
    pub fn complete(&self, link: Option<&dyn CommandLink>) {
        let mut state = self.state.lock();
        if !state.busy {
            warn!("Completion signal without a command in flight");
        }
        state.busy = false;
        Self::dispatch_locked(&mut state, link);
    }

    /// Drop every pending command and forget the in-flight one.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.pending.is_empty() {
            debug!("Dropping {} queued command(s)", state.pending.len());
        }
        state.pending.clear();
        state.busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    // The whole check-busy, pop, mark-busy, issue sequence runs under the
    // lock, so concurrent enqueue and completion cannot double-dispatch.
    fn dispatch_locked(state: &mut QueueState, link: Option<&dyn CommandLink>) {
        loop {
            if state.busy {
                trace!("Busy, waiting for completion");
                return;
            }

            let Some(command) = state.pending.pop_front() else {
                return;
            };

            let Some(link) = link else {
                warn!(
                    "{}, dropping {} and {} queued command(s)",
                    LinkError::NoLink,
                    command,
                    state.pending.len()
                );
                state.pending.clear();
                return;
            };

            state.busy = true;
            match link.dispatch(&command) {
                Ok(()) => {
                    debug!("Dispatched {}", command);
                    return;
                }
                Err(e) => {
                    // Not requeued; the caller resubmits if it still cares.
                    warn!("Dispatch of {} failed: {}", command, e);
                    state.busy = false;
                }
            }
        }
    }
}
