//! State machine driving one supervised OS process.
//!
//! ```text
//! STARTING -> RUNNING -> WAITING -> STARTING ...
//! STARTING -> WAITING                 (failed to launch or exited early)
//! RUNNING  -> STOPPING -> STOPPED     (cancelled)
//! WAITING  -> STOPPING -> STOPPED     (cancelled while waiting)
//! ```
//!
//! Every state is sent on the change channel when it is entered, before its
//! work starts. After `Stopped` is sent the channel is closed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::logs::RingLog;
use crate::backoff::RestartBackoff;
use crate::config::ProcessConfig;
use crate::transport::protocol::AgentStatus;

/// Capacity of a process's change channel.
const CHANGES_CAP: usize = 10;

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessParams {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs; when non-empty they replace the inherited environment.
    pub env: Vec<String>,
}

/// Start supervising a process. Cancel `cancel` to stop it.
///
/// The returned receiver yields each state as it is entered and ends after
/// [`AgentStatus::Stopped`].
pub fn start(
    agent_id: String,
    params: ProcessParams,
    config: ProcessConfig,
    logs: Arc<RingLog>,
    backoff: RestartBackoff,
    cancel: CancellationToken,
) -> mpsc::Receiver<AgentStatus> {
    let (tx, rx) = mpsc::channel(CHANGES_CAP);
    let machine = Machine {
        agent_id,
        params,
        config,
        logs,
        backoff,
        cancel,
        changes: tx,
        child: None,
    };
    tokio::spawn(machine.run());
    rx
}

struct Machine {
    agent_id: String,
    params: ProcessParams,
    config: ProcessConfig,
    logs: Arc<RingLog>,
    backoff: RestartBackoff,
    cancel: CancellationToken,
    changes: mpsc::Sender<AgentStatus>,
    child: Option<Child>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Elapsed,
    Cancelled,
}

impl Machine {
    async fn run(mut self) {
        let mut state = AgentStatus::Starting;
        loop {
            debug!(agent_id = %self.agent_id, %state, "Entering state");
            // Observers that went away do not stop supervision.
            let _ = self.changes.send(state).await;

            state = match state {
                AgentStatus::Starting => self.starting().await,
                AgentStatus::Running => self.running().await,
                AgentStatus::Waiting => self.waiting().await,
                AgentStatus::Stopping => self.stopping().await,
                AgentStatus::Stopped => break,
            };
        }
        debug!(agent_id = %self.agent_id, "Process supervision finished");
    }

    async fn starting(&mut self) -> AgentStatus {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    error = %format!("{e:#}"),
                    "Failed to start process"
                );
                self.logs.push(&format!("failed to start: {e:#}"));
                return AgentStatus::Waiting;
            }
        };
        info!(agent_id = %self.agent_id, pid = ?child.id(), "Process started");

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = tokio::time::sleep(self.config.startup_window()) => Outcome::Elapsed,
            () = self.cancel.cancelled() => Outcome::Cancelled,
        };
        self.child = Some(child);

        match outcome {
            Outcome::Exited(status) => {
                self.child = None;
                warn!(agent_id = %self.agent_id, status = ?status, "Process exited during startup");
                AgentStatus::Waiting
            }
            Outcome::Elapsed => AgentStatus::Running,
            Outcome::Cancelled => AgentStatus::Stopping,
        }
    }

    async fn running(&mut self) -> AgentStatus {
        self.backoff.reset();

        let Some(child) = self.child.as_mut() else {
            return AgentStatus::Waiting;
        };
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = self.cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                self.child = None;
                warn!(agent_id = %self.agent_id, status = ?status, "Process exited unexpectedly");
                AgentStatus::Waiting
            }
            Outcome::Elapsed | Outcome::Cancelled => AgentStatus::Stopping,
        }
    }

    async fn waiting(&mut self) -> AgentStatus {
        let delay = self.backoff.next_delay();
        info!(
            agent_id = %self.agent_id,
            restarts = self.backoff.count(),
            ?delay,
            "Waiting before restart"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => AgentStatus::Starting,
            () = self.cancel.cancelled() => AgentStatus::Stopping,
        }
    }

    async fn stopping(&mut self) -> AgentStatus {
        let Some(mut child) = self.child.take() else {
            return AgentStatus::Stopped;
        };

        terminate(&self.agent_id, &mut child);
        match tokio::time::timeout(self.config.stop_grace(), child.wait()).await {
            Ok(Ok(status)) => {
                info!(agent_id = %self.agent_id, %status, "Process stopped");
            }
            Ok(Err(e)) => {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to wait for process");
            }
            Err(_) => {
                warn!(
                    agent_id = %self.agent_id,
                    grace = ?self.config.stop_grace(),
                    "Process did not exit in time, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(agent_id = %self.agent_id, error = %e, "Failed to kill process");
                }
            }
        }
        AgentStatus::Stopped
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.params.path);
        cmd.args(&self.params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !self.params.env.is_empty() {
            cmd.env_clear();
            for pair in &self.params.env {
                let (key, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.params.path.display()))?;

        if let Some(stdout) = child.stdout.take() {
            capture(self.agent_id.clone(), stdout, Arc::clone(&self.logs));
        }
        if let Some(stderr) = child.stderr.take() {
            capture(self.agent_id.clone(), stderr, Arc::clone(&self.logs));
        }
        Ok(child)
    }
}

/// Ask the process to exit. Falls back to kill where signals are unavailable.
fn terminate(agent_id: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(agent_id, error = %e, "Failed to send SIGTERM");
            }
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        debug!(agent_id, error = %e, "Failed to kill process");
    }
}

fn capture<R>(agent_id: String, stream: R, logs: Arc<RingLog>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(agent_id = %agent_id, "{line}");
            logs.push(&line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn config() -> ProcessConfig {
        ProcessConfig {
            startup_window_ms: 100,
            stop_grace_ms: 300,
            log_lines: 20,
        }
    }

    fn sh(script: &str) -> ProcessParams {
        ProcessParams {
            path: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    fn launch(
        params: ProcessParams,
    ) -> (mpsc::Receiver<AgentStatus>, CancellationToken, Arc<RingLog>) {
        let cancel = CancellationToken::new();
        let logs = Arc::new(RingLog::new(20, Vec::new()));
        let rx = start(
            "agent-1".to_string(),
            params,
            config(),
            Arc::clone(&logs),
            RestartBackoff::with_rng(StdRng::seed_from_u64(1)),
            cancel.clone(),
        );
        (rx, cancel, logs)
    }

    /// A machine driven by hand, one state at a time.
    fn machine(params: ProcessParams, backoff: RestartBackoff) -> Machine {
        let (changes, _rx) = mpsc::channel(CHANGES_CAP);
        Machine {
            agent_id: "agent-1".to_string(),
            params,
            config: config(),
            logs: Arc::new(RingLog::new(20, Vec::new())),
            backoff,
            cancel: CancellationToken::new(),
            changes,
            child: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<AgentStatus>) -> Option<AgentStatus> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no state change in time")
    }

    #[tokio::test]
    async fn runs_then_stops_on_cancel() {
        let (mut rx, cancel, logs) = launch(sh("echo hello; exec sleep 30"));

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Running));

        cancel.cancel();
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Stopping));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Stopped));
        assert_eq!(next(&mut rx).await, None);

        assert_eq!(logs.tail(0), vec!["hello"]);
    }

    #[tokio::test]
    async fn early_exit_goes_to_waiting_and_retries() {
        let (mut rx, cancel, _logs) = launch(sh("exit 1"));

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Waiting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Waiting));

        cancel.cancel();
        // Drain until the channel closes; the last state must be Stopped.
        let mut last = None;
        while let Some(state) = next(&mut rx).await {
            last = Some(state);
        }
        assert_eq!(last, Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn crash_after_running_goes_to_waiting() {
        let (mut rx, cancel, _logs) = launch(sh("sleep 0.3; exit 2"));

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Running));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Waiting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        cancel.cancel();
    }

    #[tokio::test]
    async fn clean_run_resets_restart_count() {
        let mut backoff = RestartBackoff::with_rng(StdRng::seed_from_u64(1));
        for _ in 0..5 {
            backoff.next_delay();
        }
        let mut machine = machine(sh("sleep 0.3; exit 2"), backoff);

        assert_eq!(machine.starting().await, AgentStatus::Running);
        assert_eq!(machine.backoff.count(), 5);

        assert_eq!(machine.running().await, AgentStatus::Waiting);
        assert_eq!(machine.backoff.count(), 0);

        // The next wait starts from the smallest window again.
        assert_eq!(machine.waiting().await, AgentStatus::Starting);
        assert_eq!(machine.backoff.count(), 1);
        assert_eq!(machine.backoff.window(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn early_exit_keeps_restart_count() {
        let mut backoff = RestartBackoff::with_rng(StdRng::seed_from_u64(1));
        backoff.next_delay();
        let mut machine = machine(sh("exit 1"), backoff);

        assert_eq!(machine.starting().await, AgentStatus::Waiting);
        assert_eq!(machine.backoff.count(), 1);
        assert_eq!(machine.waiting().await, AgentStatus::Starting);
        assert_eq!(machine.backoff.count(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_is_logged_and_retried() {
        let params = ProcessParams {
            path: PathBuf::from("/nonexistent/node_exporter"),
            args: Vec::new(),
            env: Vec::new(),
        };
        let (mut rx, cancel, logs) = launch(params);

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Waiting));
        assert!(logs.tail(1)[0].contains("failed to start"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn ignored_sigterm_is_followed_by_kill() {
        let (mut rx, cancel, _logs) = launch(sh("trap '' TERM; exec sleep 30"));

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Running));

        cancel.cancel();
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Stopping));
        let stopped = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("kill after grace period did not happen");
        assert_eq!(stopped, Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn env_replaces_inherited_environment() {
        let mut params = sh("echo \"v=$ONLY_VAR home=$HOME\"; exec sleep 30");
        params.env = vec!["ONLY_VAR=42".to_string(), "PATH=/usr/bin:/bin".to_string()];
        let (mut rx, cancel, logs) = launch(params);

        assert_eq!(next(&mut rx).await, Some(AgentStatus::Starting));
        assert_eq!(next(&mut rx).await, Some(AgentStatus::Running));
        assert_eq!(logs.tail(0), vec!["v=42 home="]);
        cancel.cancel();
    }
}
