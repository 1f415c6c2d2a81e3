//! Sub-agent supervision.
//!
//! The supervisor owns one process state machine per sub-agent ID. The
//! control plane pushes the complete desired set with `set_state`; agents
//! that disappeared or whose parameters changed are stopped, new ones are
//! started. Every state transition is published as a [`StateChanged`] event
//! for the client to relay upstream.

pub mod changes;
pub mod logs;
pub mod ports;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::RestartBackoff;
use crate::client::AgentSupervisor;
use crate::config::{Config, PathsConfig, ProcessConfig};
use crate::transport::protocol::{
    AgentProcessParams, AgentStatus, AgentType, QanCollect, SetState, StateChanged,
};

use changes::ChangeQueue;
use logs::RingLog;
use ports::PortRegistry;
use process::ProcessParams;

/// Capacity of the QAN collect queue.
const QAN_CAP: usize = 32;

const LISTEN_PORT_PLACEHOLDERS: [&str; 2] = ["{{ .listen_port }}", "{{.listen_port}}"];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no free listen port in {min}-{max}")]
    NoFreePort { min: u16, max: u16 },

    #[error("unknown agent {0}")]
    UnknownAgent(String),
}

/// Snapshot of one supervised sub-agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub listen_port: u16,
}

struct AgentProcess {
    params: AgentProcessParams,
    listen_port: u16,
    status: Arc<Mutex<AgentStatus>>,
    logs: Arc<RingLog>,
    cancel: CancellationToken,
    /// Cancelled after the state machine emitted `Stopped`.
    done: CancellationToken,
}

pub struct Supervisor {
    paths: PathsConfig,
    process: ProcessConfig,
    lifetime: CancellationToken,
    agents: tokio::sync::Mutex<HashMap<String, AgentProcess>>,
    ports: Mutex<PortRegistry>,
    changes: Arc<ChangeQueue>,
    qan_tx: mpsc::Sender<QanCollect>,
    qan_rx: tokio::sync::Mutex<mpsc::Receiver<QanCollect>>,
}

impl Supervisor {
    /// Create a supervisor. Cancelling `lifetime` stops every sub-agent.
    pub fn new(config: &Config, lifetime: CancellationToken) -> Self {
        let (qan_tx, qan_rx) = mpsc::channel(QAN_CAP);
        Self {
            paths: config.paths.clone(),
            process: config.process,
            lifetime,
            agents: tokio::sync::Mutex::new(HashMap::new()),
            ports: Mutex::new(PortRegistry::new(config.ports.min, config.ports.max)),
            changes: Arc::new(ChangeQueue::new()),
            qan_tx,
            qan_rx: tokio::sync::Mutex::new(qan_rx),
        }
    }

    /// Sender for query-analytics collectors embedded in the agent.
    pub fn qan_sender(&self) -> mpsc::Sender<QanCollect> {
        self.qan_tx.clone()
    }

    /// Bring the running sub-agents in line with `desired`.
    pub async fn set_state(&self, desired: HashMap<String, AgentProcessParams>) {
        let mut agents = self.agents.lock().await;

        let outdated: Vec<String> = agents
            .iter()
            .filter(|(id, agent)| desired.get(*id) != Some(&agent.params))
            .map(|(id, _)| id.clone())
            .collect();
        let stopping: Vec<(String, AgentProcess)> = outdated
            .into_iter()
            .filter_map(|id| agents.remove(&id).map(|agent| (id, agent)))
            .collect();
        join_all(
            stopping
                .into_iter()
                .map(|(id, agent)| self.stop_agent(id, agent)),
        )
        .await;

        let mut new_ids: Vec<String> = desired
            .keys()
            .filter(|id| !agents.contains_key(*id))
            .cloned()
            .collect();
        new_ids.sort_unstable();
        for id in new_ids {
            let Some(params) = desired.get(&id) else {
                continue;
            };
            match self.start_agent(&id, params.clone()) {
                Ok(agent) => {
                    agents.insert(id, agent);
                }
                Err(e) => warn!(agent_id = %id, error = %e, "Failed to start sub-agent"),
            }
        }
    }

    /// Stop every sub-agent and wait until they have exited.
    pub async fn stop_all(&self) {
        let mut agents = self.agents.lock().await;
        let stopping: Vec<(String, AgentProcess)> = agents.drain().collect();
        if stopping.is_empty() {
            return;
        }
        info!(count = stopping.len(), "Stopping all sub-agents");
        join_all(
            stopping
                .into_iter()
                .map(|(id, agent)| self.stop_agent(id, agent)),
        )
        .await;
    }

    /// Current sub-agents, sorted by ID.
    pub async fn agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.lock().await;
        let mut list: Vec<AgentInfo> = agents
            .iter()
            .map(|(id, agent)| AgentInfo {
                agent_id: id.clone(),
                agent_type: agent.params.agent_type,
                status: *agent.status.lock(),
                listen_port: agent.listen_port,
            })
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// Most recent output lines of a sub-agent. `limit == 0` returns all kept lines.
    pub async fn agent_logs(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, SupervisorError> {
        let agents = self.agents.lock().await;
        let agent = agents
            .get(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;
        Ok(agent.logs.tail(limit))
    }

    fn start_agent(
        &self,
        agent_id: &str,
        params: AgentProcessParams,
    ) -> Result<AgentProcess, SupervisorError> {
        let listen_port = self.ports.lock().reserve()?;
        let exec_path = self.paths.exporter(params.agent_type);
        let process_params = ProcessParams {
            path: exec_path.clone(),
            args: params.args.iter().map(|a| render(a, listen_port)).collect(),
            env: params.env.iter().map(|e| render(e, listen_port)).collect(),
        };
        info!(
            agent_id,
            agent_type = %params.agent_type,
            listen_port,
            path = %exec_path.display(),
            "Starting sub-agent"
        );

        let logs = Arc::new(RingLog::new(self.process.log_lines, params.redact_words.clone()));
        let cancel = self.lifetime.child_token();
        let done = CancellationToken::new();
        let status = Arc::new(Mutex::new(AgentStatus::Starting));

        let changes = process::start(
            agent_id.to_string(),
            process_params,
            self.process,
            Arc::clone(&logs),
            RestartBackoff::new(),
            cancel.clone(),
        );
        tokio::spawn(forward_changes(
            agent_id.to_string(),
            listen_port,
            exec_path,
            changes,
            Arc::clone(&status),
            Arc::clone(&self.changes),
            done.clone(),
        ));

        Ok(AgentProcess {
            params,
            listen_port,
            status,
            logs,
            cancel,
            done,
        })
    }

    async fn stop_agent(&self, agent_id: String, agent: AgentProcess) {
        debug!(agent_id = %agent_id, "Stopping sub-agent");
        agent.cancel.cancel();
        agent.done.cancelled().await;
        self.ports.lock().release(agent.listen_port);
        info!(agent_id = %agent_id, "Sub-agent stopped");
    }
}

#[async_trait]
impl AgentSupervisor for Supervisor {
    async fn next_change(&self) -> Option<StateChanged> {
        Some(self.changes.pop().await)
    }

    async fn next_qan(&self) -> Option<QanCollect> {
        self.qan_rx.lock().await.recv().await
    }

    async fn set_state(&self, state: SetState) {
        Supervisor::set_state(self, state.agent_processes).await;
    }

    async fn agent_logs(&self, agent_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Supervisor::agent_logs(self, agent_id, limit).await?)
    }
}

/// Relay one process's state changes until its channel closes.
async fn forward_changes(
    agent_id: String,
    listen_port: u16,
    exec_path: PathBuf,
    mut changes: mpsc::Receiver<AgentStatus>,
    status: Arc<Mutex<AgentStatus>>,
    events: Arc<ChangeQueue>,
    done: CancellationToken,
) {
    let process_exec_path = exec_path.display().to_string();
    while let Some(state) = changes.recv().await {
        *status.lock() = state;
        let event = StateChanged {
            agent_id: agent_id.clone(),
            status: state,
            listen_port,
            process_exec_path: process_exec_path.clone(),
        };
        events.push(event);
    }
    done.cancel();
}

fn render(template: &str, listen_port: u16) -> String {
    let port = listen_port.to_string();
    LISTEN_PORT_PLACEHOLDERS
        .iter()
        .fold(template.to_string(), |acc, placeholder| acc.replace(placeholder, &port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_listen_port() {
        assert_eq!(
            render("--web.listen-address=:{{ .listen_port }}", 42001),
            "--web.listen-address=:42001"
        );
        assert_eq!(render("PORT={{.listen_port}}", 7), "PORT=7");
        assert_eq!(render("--collector.diskstats", 7), "--collector.diskstats");
    }

    #[tokio::test]
    async fn agent_logs_for_unknown_agent_fails() {
        let supervisor = Supervisor::new(&Config::default(), CancellationToken::new());
        let err = supervisor.agent_logs("nope", 0).await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownAgent(id) if id == "nope"));
    }

    #[tokio::test]
    async fn relays_collected_qan() {
        let supervisor = Supervisor::new(&Config::default(), CancellationToken::new());
        let batch = QanCollect {
            agent_id: "qan-mysql".to_string(),
            metrics: serde_json::json!({ "queries": 12 }),
        };
        supervisor.qan_sender().send(batch.clone()).await.unwrap();
        assert_eq!(supervisor.next_qan().await, Some(batch));
    }
}
