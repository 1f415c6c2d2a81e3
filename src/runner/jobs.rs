//! Long-running Jobs that report progress before their final result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::fanin::FanIn;
use super::{run_bounded, CancelRegistry, RunnerError, RESULTS_CAP};

#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> &str;
    fn job_type(&self) -> &str;
    fn timeout(&self) -> Duration;
    /// Run to completion, reporting progress through `sender`.
    async fn run(&self, cancel: CancellationToken, sender: JobSender) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub id: String,
    pub job_type: String,
    pub error: Option<String>,
    pub output: Vec<u8>,
}

/// Item on a [`JobRunner`]'s output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    Progress {
        job_id: String,
        timestamp: DateTime<Utc>,
        progress: serde_json::Value,
    },
    Result(JobResult),
}

/// Progress reporter handed to [`Job::run`].
#[derive(Clone)]
pub struct JobSender {
    job_id: String,
    tx: mpsc::Sender<JobMessage>,
}

impl JobSender {
    /// Queue a progress report. Dropped silently if nobody listens any more.
    pub async fn send(&self, progress: serde_json::Value) {
        let msg = JobMessage::Progress {
            job_id: self.job_id.clone(),
            timestamp: Utc::now(),
            progress,
        };
        if self.tx.send(msg).await.is_err() {
            debug!(job_id = %self.job_id, "Job output closed, dropping progress");
        }
    }
}

pub struct JobRunner {
    lifetime: CancellationToken,
    running: Arc<CancelRegistry>,
    fanin: Arc<FanIn<JobMessage>>,
}

impl JobRunner {
    /// Create a runner bound to `lifetime`; see [`super::ActionRunner::new`].
    pub fn new(lifetime: CancellationToken) -> (Self, mpsc::Receiver<JobMessage>) {
        let (fanin, messages) = FanIn::new(RESULTS_CAP);
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
        (runner, messages)
    }

    /// Start `job` in the background, bounded by its own timeout.
    pub fn start(&self, job: Box<dyn Job>) -> Result<(), RunnerError> {
        if self.lifetime.is_cancelled() {
            return Err(RunnerError::Closed);
        }

        let id = job.id().to_string();
        let timeout = job.timeout();
        let token = self.lifetime.child_token();
        let generation = self.running.insert(&id, token.clone());
        let running = Arc::clone(&self.running);

        info!(job_id = %id, job_type = job.job_type(), ?timeout, "Starting job");
        let task_id = id.clone();
        let spawned = self.fanin.spawn_with(move |tx| async move {
            let sender = JobSender {
                job_id: task_id.clone(),
                tx,
            };
            let outcome = run_bounded(&token, timeout, job.run(token.clone(), sender)).await;
            running.remove(&task_id, generation);

            let (output, error) = match outcome {
                Ok(output) => (output, None),
                Err(e) => (Vec::new(), Some(format!("{e:#}"))),
            };
            debug!(job_id = %task_id, error = ?error, "Job finished");
            JobMessage::Result(JobResult {
                id: task_id,
                job_type: job.job_type().to_string(),
                error,
                output,
            })
        });

        if spawned.is_err() {
            self.running.remove(&id, generation);
        }
        spawned
    }

    /// Cancel a running job. Unknown or finished IDs are ignored.
    pub fn stop(&self, id: &str) {
        if self.running.cancel(id) {
            info!(job_id = %id, "Stopping job");
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains(id)
    }
}
