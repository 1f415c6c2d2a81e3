//! Connection to the control plane.
//!
//! A [`Client`] covers one connection lifetime: it dials with backoff until
//! a stream passes the handshake, then runs three pumps until the first of
//! them exits:
//!
//! - results: Action/Job completions and Job progress, sent upstream;
//! - supervisor: sub-agent state changes and QAN data, sent upstream;
//! - dispatch: server requests, each answered exactly once.
//!
//! The first pump to exit tears the connection down, which makes the other
//! two exit as well. To reconnect, build a new `Client`.

mod dispatch;
mod handshake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::actions::{ActionRegistry, JobRegistry};
use crate::backoff::Backoff;
use crate::channel::{Channel, ChannelError, ChannelMetrics, CloseCause, InboundRequest};
use crate::checker::ConnectionChecker;
use crate::config::Config;
use crate::runner::{ActionResult, ActionRunner, JobMessage, JobRunner};
use crate::transport::protocol::{
    ActionResultPayload, AgentRequest, JobProgressPayload, JobResultPayload, QanCollect,
    RequestKind, SetState, StateChanged,
};
use crate::transport::{ConnectRequest, Dialer};

use dispatch::{Context, Dispatcher};
use handshake::Connection;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The sub-agent supervisor as seen by the client.
#[async_trait]
pub trait AgentSupervisor: Send + Sync {
    /// Next sub-agent state change. `None` once no more will come.
    async fn next_change(&self) -> Option<StateChanged>;
    /// Next batch of query analytics. `None` once no more will come.
    async fn next_qan(&self) -> Option<QanCollect>;
    async fn set_state(&self, state: SetState);
    async fn agent_logs(&self, agent_id: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to dial {address}: {message}")]
    Dial { address: String, message: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection lost: {0}")]
    Channel(CloseCause),

    #[error("cannot answer request of kind {0:?}")]
    UnsupportedRequest(RequestKind),

    #[error("client already started")]
    AlreadyStarted,

    #[error("canceled before connecting")]
    Cancelled,
}

/// What the server reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMetadata {
    pub server_version: String,
    pub agent_runs_on_node_id: String,
}

/// Snapshot for the local status surface.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub server: Option<ServerMetadata>,
    pub latency: Option<Duration>,
    pub clock_drift: Option<TimeDelta>,
    pub channel: Option<ChannelMetrics>,
}

pub struct Client {
    config: Config,
    dialer: Arc<dyn Dialer>,
    supervisor: Arc<dyn AgentSupervisor>,
    checker: Arc<dyn ConnectionChecker>,
    action_registry: ActionRegistry,
    job_registry: JobRegistry,
    started: AtomicBool,
    done: CancellationToken,
    status: RwLock<ConnectionStatus>,
    channel: Mutex<Option<Channel>>,
}

impl Client {
    pub fn new(
        config: Config,
        dialer: Arc<dyn Dialer>,
        supervisor: Arc<dyn AgentSupervisor>,
        checker: Arc<dyn ConnectionChecker>,
        action_registry: ActionRegistry,
        job_registry: JobRegistry,
    ) -> Self {
        Self {
            config,
            dialer,
            supervisor,
            checker,
            action_registry,
            job_registry,
            started: AtomicBool::new(false),
            done: CancellationToken::new(),
            status: RwLock::new(ConnectionStatus::default()),
            channel: Mutex::new(None),
        }
    }

    /// Connect and serve until the connection ends or `cancel` fires.
    ///
    /// Returns `Ok(())` only when stopped through `cancel` after connecting.
    /// May be called once.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyStarted);
        }

        let result = self.connect_and_serve(&cancel).await;
        self.status.write().connected = false;
        self.done.cancel();
        result
    }

    /// Resolves once `run` has returned and every pump has exited.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        let mut status = self.status.read().clone();
        status.channel = self.channel.lock().as_ref().map(Channel::metrics);
        status
    }

    async fn connect_and_serve(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let (Some(agent_id), Some(address)) = (self.config.agent_id(), self.config.server_address())
        else {
            error!("Agent ID or server address is not configured, not connecting");
            cancel.cancelled().await;
            return Err(ClientError::Config(
                "agent ID and server address must be set".to_string(),
            ));
        };

        let request = ConnectRequest {
            agent_id: agent_id.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            credentials: self.config.server.credentials(),
        };
        let connection = self.connect(address, &request, cancel).await?;
        self.serve(connection, cancel).await
    }

    /// Dial and handshake until one attempt succeeds or `cancel` fires.
    async fn connect(
        &self,
        address: &str,
        request: &ConnectRequest,
        cancel: &CancellationToken,
    ) -> Result<Connection, ClientError> {
        let timing = &self.config.connection;
        let mut backoff = Backoff::new(timing.backoff_min(), timing.backoff_max());
        let mut last_error = None;

        loop {
            let result = tokio::select! {
                result = self.attempt(address, request) => result,
                () = cancel.cancelled() => {
                    return Err(last_error.unwrap_or(ClientError::Cancelled));
                }
            };
            let e = match result {
                Ok(connection) => return Ok(connection),
                Err(e) => e,
            };

            let delay = backoff.delay();
            warn!(
                %address,
                error = %e,
                attempt = backoff.attempts(),
                ?delay,
                "Failed to connect, retrying"
            );
            last_error = Some(e);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Err(last_error.unwrap_or(ClientError::Cancelled));
                }
            }
        }
    }

    async fn attempt(
        &self,
        address: &str,
        request: &ConnectRequest,
    ) -> Result<Connection, ClientError> {
        let timing = &self.config.connection;
        let dial_timeout = timing.dial_timeout();
        info!(%address, "Connecting to control plane");

        let stream = tokio::time::timeout(dial_timeout, self.dialer.dial(address))
            .await
            .map_err(|_| ClientError::Dial {
                address: address.to_string(),
                message: format!("dial timeout after {dial_timeout:?}"),
            })?
            .map_err(|e| ClientError::Dial {
                address: address.to_string(),
                message: format!("{e:#}"),
            })?;

        handshake::perform(stream, request, timing.ping_timeout()).await
    }

    async fn serve(
        &self,
        connection: Connection,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let Connection {
            channel,
            requests,
            early_requests,
            metadata,
            latency,
            clock_drift,
        } = connection;
        info!(
            server_version = %metadata.server_version,
            node_id = %metadata.agent_runs_on_node_id,
            ?latency,
            drift_ms = clock_drift.num_milliseconds(),
            "Connected to control plane"
        );
        *self.status.write() = ConnectionStatus {
            connected: true,
            server: Some(metadata),
            latency: Some(latency),
            clock_drift: Some(clock_drift),
            channel: None,
        };
        *self.channel.lock() = Some(channel.clone());

        let teardown = cancel.child_token();
        let (actions, action_results) = ActionRunner::new(teardown.clone());
        let (jobs, job_messages) = JobRunner::new(teardown.clone());
        let dispatcher = Dispatcher::new(Context {
            supervisor: Arc::clone(&self.supervisor),
            checker: Arc::clone(&self.checker),
            action_registry: self.action_registry.clone(),
            job_registry: self.job_registry.clone(),
            actions,
            jobs,
            runner: self.config.runner,
        });

        let closer = async {
            teardown.cancelled().await;
            channel.close();
        };
        let ((), (), dispatched, ()) = tokio::join!(
            pump_results(
                &channel,
                action_results,
                job_messages,
                teardown.clone().drop_guard()
            ),
            pump_supervisor(&channel, self.supervisor.as_ref(), teardown.clone()),
            pump_requests(
                &channel,
                early_requests,
                requests,
                &dispatcher,
                teardown.clone().drop_guard()
            ),
            closer,
        );

        let cause = channel.wait().await;
        info!(%cause, "Disconnected from control plane");

        dispatched?;
        if cancel.is_cancelled() {
            Ok(())
        } else {
            Err(ClientError::Channel(cause))
        }
    }
}

async fn pump_results(
    channel: &Channel,
    mut actions: mpsc::Receiver<ActionResult>,
    mut jobs: mpsc::Receiver<JobMessage>,
    _teardown: DropGuard,
) {
    let (mut actions_open, mut jobs_open) = (true, true);
    while actions_open || jobs_open {
        let request = tokio::select! {
            result = actions.recv(), if actions_open => match result {
                Some(result) => action_result_request(result),
                None => {
                    actions_open = false;
                    continue;
                }
            },
            message = jobs.recv(), if jobs_open => match message {
                Some(message) => job_message_request(message),
                None => {
                    jobs_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = channel.send_request(request).await {
            warn!(error = %e, "Result was not delivered");
        }
    }
    debug!("Result pump finished");
}

async fn pump_supervisor(
    channel: &Channel,
    supervisor: &dyn AgentSupervisor,
    teardown: CancellationToken,
) {
    let _teardown = teardown.clone().drop_guard();
    loop {
        let request = tokio::select! {
            biased;
            () = teardown.cancelled() => break,
            change = supervisor.next_change() => match change {
                Some(change) => AgentRequest::StateChanged(change),
                None => break,
            },
            qan = supervisor.next_qan() => match qan {
                Some(qan) => AgentRequest::QanCollect(qan),
                None => break,
            },
        };

        match channel.send_request(request).await {
            Ok(_) => {}
            Err(ChannelError::Closed(cause)) => {
                debug!(%cause, "Supervisor event not delivered");
                break;
            }
            Err(e) => warn!(error = %e, "Supervisor event rejected"),
        }
    }
    debug!("Supervisor pump finished");
}

/// Answers requests held back during the handshake first, then the live queue.
async fn pump_requests(
    channel: &Channel,
    early_requests: Vec<InboundRequest>,
    mut requests: mpsc::Receiver<InboundRequest>,
    dispatcher: &Dispatcher,
    _teardown: DropGuard,
) -> Result<(), ClientError> {
    let mut early_requests = early_requests.into_iter();
    loop {
        let next = match early_requests.next() {
            Some(inbound) => Some(inbound),
            None => requests.recv().await,
        };
        let Some(InboundRequest { id, payload }) = next else {
            break;
        };
        let kind = payload.kind();
        debug!(request_id = id, ?kind, "Dispatching request");

        let Some(response) = dispatcher.handle(payload).await else {
            error!(request_id = id, ?kind, "Cannot answer request, stopping dispatch");
            return Err(ClientError::UnsupportedRequest(kind));
        };
        if let Err(e) = channel.send_response(id, response).await {
            debug!(request_id = id, error = %e, "Response not delivered");
            break;
        }
    }
    debug!("Dispatch pump finished");
    Ok(())
}

fn action_result_request(result: ActionResult) -> AgentRequest {
    AgentRequest::ActionResult(ActionResultPayload {
        action_id: result.id,
        output: result.output,
        done: true,
        error: result.error,
    })
}

fn job_message_request(message: JobMessage) -> AgentRequest {
    match message {
        JobMessage::Progress {
            job_id,
            timestamp,
            progress,
        } => AgentRequest::JobProgress(JobProgressPayload {
            job_id,
            timestamp,
            progress,
        }),
        JobMessage::Result(result) => AgentRequest::JobResult(JobResultPayload {
            job_id: result.id,
            timestamp: Utc::now(),
            output: result.output,
            error: result.error,
        }),
    }
}
