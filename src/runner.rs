//! Concurrent execution of Actions and Jobs.
//!
//! Each unit runs in its own task under a cancellation token that is a child
//! of the runner's lifetime token, bounded by a timeout. Results come back on
//! one channel per runner in completion order. The channel closes after the
//! lifetime token is cancelled and every started unit has reported.

pub mod fanin;

mod actions;
mod jobs;

pub use actions::{Action, ActionResult, ActionRunner};
pub use jobs::{Job, JobMessage, JobResult, JobRunner, JobSender};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Capacity of each runner's result channel.
const RESULTS_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("runner is shut down")]
    Closed,
}

/// ID → cancel token of units in flight.
///
/// Entries carry a generation so a finishing unit never removes the token of
/// a later unit that reused its ID.
#[derive(Default)]
struct CancelRegistry {
    next_generation: AtomicU64,
    tokens: Mutex<HashMap<String, (u64, CancellationToken)>>,
}

impl CancelRegistry {
    fn insert(&self, id: &str, token: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().insert(id.to_string(), (generation, token));
        generation
    }

    fn remove(&self, id: &str, generation: u64) {
        let mut tokens = self.tokens.lock();
        if tokens.get(id).is_some_and(|(g, _)| *g == generation) {
            tokens.remove(id);
        }
    }

    /// Cancel the unit registered under `id`. Returns whether one was found.
    fn cancel(&self, id: &str) -> bool {
        let token = self.tokens.lock().get(id).map(|(_, t)| t.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.tokens.lock().contains_key(id)
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tokens.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Drive `unit` until it finishes, its token is cancelled, or `timeout` elapses.
///
/// On timeout the token is cancelled too, so anything the unit spawned with
/// it observes the deadline.
async fn run_bounded<T, F>(
    token: &CancellationToken,
    timeout: Duration,
    unit: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        result = unit => result,
        () = token.cancelled() => Err(anyhow::anyhow!("canceled")),
        () = tokio::time::sleep(timeout) => {
            token.cancel();
            Err(anyhow::anyhow!("deadline exceeded after {timeout:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_generation_protects_reused_id() {
        let registry = CancelRegistry::default();
        let first = registry.insert("a", CancellationToken::new());
        let second_token = CancellationToken::new();
        let _second = registry.insert("a", second_token.clone());

        registry.remove("a", first);
        assert!(registry.contains("a"));

        assert!(registry.cancel("a"));
        assert!(second_token.is_cancelled());
    }

    #[test]
    fn registry_cancel_unknown_is_noop() {
        let registry = CancelRegistry::default();
        assert!(!registry.cancel("missing"));
        assert!(registry.ids().is_empty());
    }

    #[tokio::test]
    async fn run_bounded_reports_deadline() {
        let token = CancellationToken::new();
        let result: anyhow::Result<()> = run_bounded(&token, Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("deadline exceeded"));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn run_bounded_reports_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let result: anyhow::Result<()> =
            run_bounded(&token, Duration::from_secs(5), std::future::pending()).await;
        assert_eq!(result.unwrap_err().to_string(), "canceled");
    }
}
