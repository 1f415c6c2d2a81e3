//! One-shot Actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::fanin::FanIn;
use super::{run_bounded, CancelRegistry, RunnerError, RESULTS_CAP};

/// A bounded-duration unit of work returning bytes.
///
/// `run` should stop promptly once `cancel` fires; the runner also drops the
/// future on cancel or timeout.
#[async_trait]
pub trait Action: Send + Sync {
    fn id(&self) -> &str;
    fn action_type(&self) -> &str;
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<Vec<u8>>;
}

/// Outcome of one finished Action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub id: String,
    pub action_type: String,
    pub error: Option<String>,
    pub output: Vec<u8>,
}

pub struct ActionRunner {
    lifetime: CancellationToken,
    running: Arc<CancelRegistry>,
    fanin: Arc<FanIn<ActionResult>>,
}

impl ActionRunner {
    /// Create a runner bound to `lifetime`.
    ///
    /// The returned receiver yields one result per started action and ends
    /// after `lifetime` is cancelled and all started actions have finished.
    pub fn new(lifetime: CancellationToken) -> (Self, mpsc::Receiver<ActionResult>) {
        let (fanin, results) = FanIn::new(RESULTS_CAP);
        let fanin = Arc::new(fanin);

        let closer = Arc::clone(&fanin);
        let token = lifetime.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            closer.close();
        });

        let runner = Self {
            lifetime,
            running: Arc::new(CancelRegistry::default()),
            fanin,
        };
        (runner, results)
    }

    /// Start `action` in the background with the given timeout.
    ///
    /// IDs must be unique among running actions.
    pub fn start(&self, action: Box<dyn Action>, timeout: Duration) -> Result<(), RunnerError> {
        if self.lifetime.is_cancelled() {
            return Err(RunnerError::Closed);
        }

        let id = action.id().to_string();
        let token = self.lifetime.child_token();
        let generation = self.running.insert(&id, token.clone());
        let running = Arc::clone(&self.running);

        info!(action_id = %id, action_type = action.action_type(), ?timeout, "Starting action");
        let task_id = id.clone();
        let spawned = self.fanin.spawn(async move {
            let outcome = run_bounded(&token, timeout, action.run(token.clone())).await;
            running.remove(&task_id, generation);

            let (output, error) = match outcome {
                Ok(output) => (output, None),
                Err(e) => (Vec::new(), Some(format!("{e:#}"))),
            };
            debug!(action_id = %task_id, error = ?error, "Action finished");
            ActionResult {
                id: task_id,
                action_type: action.action_type().to_string(),
                error,
                output,
            }
        });

        if spawned.is_err() {
            self.running.remove(&id, generation);
        }
        spawned
    }

    /// Cancel a running action. Unknown or finished IDs are ignored.
    pub fn stop(&self, id: &str) {
        if self.running.cancel(id) {
            info!(action_id = %id, "Stopping action");
        }
    }

    /// IDs of actions still in flight.
    pub fn running(&self) -> Vec<String> {
        self.running.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SleepAction {
        id: String,
        sleep: Duration,
        output: &'static str,
        fail: bool,
    }

    impl SleepAction {
        fn boxed(id: &str, sleep: Duration, output: &'static str) -> Box<dyn Action> {
            Box::new(Self {
                id: id.to_string(),
                sleep,
                output,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Action for SleepAction {
        fn id(&self) -> &str {
            &self.id
        }

        fn action_type(&self) -> &str {
            "sleep"
        }

        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<Vec<u8>> {
            tokio::time::sleep(self.sleep).await;
            if self.fail {
                anyhow::bail!("exit status 1");
            }
            Ok(self.output.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn fast_result_first_then_timeout() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        runner
            .start(
                SleepAction::boxed("A", Duration::from_millis(100), "ok"),
                Duration::from_secs(1),
            )
            .unwrap();
        runner
            .start(
                SleepAction::boxed("B", Duration::from_secs(10), "late"),
                Duration::from_secs(1),
            )
            .unwrap();

        let a = results.recv().await.unwrap();
        assert_eq!(a.id, "A");
        assert_eq!(a.error, None);
        assert_eq!(a.output, b"ok");

        let b = results.recv().await.unwrap();
        assert_eq!(b.id, "B");
        assert!(b.output.is_empty());
        let err = b.error.unwrap();
        assert!(err.contains("deadline exceeded"), "{err}");

        lifetime.cancel();
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn timeout_surfaces_deadline_error() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        runner
            .start(
                SleepAction::boxed("slow", Duration::from_secs(10), ""),
                Duration::from_millis(50),
            )
            .unwrap();

        let result = results.recv().await.unwrap();
        assert!(result.error.unwrap().contains("deadline exceeded"));
        assert!(runner.running().is_empty());
    }

    #[tokio::test]
    async fn drain_delivers_one_result_per_start() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        for i in 0..20u64 {
            runner
                .start(
                    SleepAction::boxed(&format!("a{i}"), Duration::from_millis(5 * i), "x"),
                    Duration::from_secs(5),
                )
                .unwrap();
        }
        lifetime.cancel();

        let mut count = 0;
        while let Some(result) = results.recv().await {
            assert_eq!(result.action_type, "sleep");
            count += 1;
        }
        assert_eq!(count, 20);
        assert!(matches!(
            runner.start(SleepAction::boxed("late", Duration::ZERO, ""), Duration::from_secs(1)),
            Err(RunnerError::Closed)
        ));
    }

    #[tokio::test]
    async fn stop_cancels_only_that_action() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        runner
            .start(
                SleepAction::boxed("keep", Duration::from_millis(200), "kept"),
                Duration::from_secs(5),
            )
            .unwrap();
        runner
            .start(
                SleepAction::boxed("kill", Duration::from_secs(10), ""),
                Duration::from_secs(20),
            )
            .unwrap();
        assert_eq!(runner.running(), vec!["keep".to_string(), "kill".to_string()]);

        runner.stop("kill");
        let first = results.recv().await.unwrap();
        assert_eq!(first.id, "kill");
        assert_eq!(first.error.as_deref(), Some("canceled"));

        let second = results.recv().await.unwrap();
        assert_eq!(second.id, "keep");
        assert_eq!(second.output, b"kept");
    }

    #[tokio::test]
    async fn stop_unknown_or_finished_is_noop() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        runner.stop("never-started");

        runner
            .start(SleepAction::boxed("done", Duration::ZERO, "x"), Duration::from_secs(1))
            .unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.error, None);

        runner.stop("done");
        lifetime.cancel();
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_error_is_carried_in_result() {
        let lifetime = CancellationToken::new();
        let (runner, mut results) = ActionRunner::new(lifetime.clone());

        runner
            .start(
                Box::new(SleepAction {
                    id: "bad".to_string(),
                    sleep: Duration::ZERO,
                    output: "",
                    fail: true,
                }),
                Duration::from_secs(1),
            )
            .unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.error.as_deref(), Some("exit status 1"));
    }
}
