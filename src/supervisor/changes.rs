//! State changes waiting to be relayed upstream.
//!
//! Changes queue up while the client is disconnected. At most
//! [`PENDING_PER_AGENT`] undelivered changes are kept per agent and the
//! oldest are dropped first, so a crash-looping agent cannot grow the backlog
//! and the newest status of every agent always survives.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::transport::protocol::StateChanged;

pub const PENDING_PER_AGENT: usize = 4;

#[derive(Default)]
pub struct ChangeQueue {
    pending: Mutex<VecDeque<StateChanged>>,
    ready: Notify,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: StateChanged) {
        let mut pending = self.pending.lock();
        let queued = pending
            .iter()
            .filter(|c| c.agent_id == change.agent_id)
            .count();
        if queued >= PENDING_PER_AGENT {
            let oldest = pending.iter().position(|c| c.agent_id == change.agent_id);
            if let Some(stale) = oldest.and_then(|i| pending.remove(i)) {
                debug!(
                    agent_id = %stale.agent_id,
                    status = %stale.status,
                    "Dropping stale state change"
                );
            }
        }
        pending.push_back(change);
        drop(pending);
        self.ready.notify_one();
    }

    /// Wait for the oldest pending change. Cancel safe.
    pub async fn pop(&self) -> StateChanged {
        loop {
            let next = self.pending.lock().pop_front();
            if let Some(change) = next {
                return change;
            }
            self.ready.notified().await;
        }
    }
}
