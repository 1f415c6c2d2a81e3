//! Dispatch of server-originated requests.
//!
//! Handlers are registered per [`RequestKind`]. A request whose kind has no
//! handler cannot be answered, so the caller stops dispatching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use super::AgentSupervisor;
use crate::actions::{ActionRegistry, JobRegistry};
use crate::checker::ConnectionChecker;
use crate::config::RunnerConfig;
use crate::runner::{ActionRunner, JobRunner};
use crate::transport::protocol::{AgentResponse, RequestKind, ServerRequest};

/// Everything a handler may touch.
pub(super) struct Context {
    pub supervisor: Arc<dyn AgentSupervisor>,
    pub checker: Arc<dyn ConnectionChecker>,
    pub action_registry: ActionRegistry,
    pub job_registry: JobRegistry,
    pub actions: ActionRunner,
    pub jobs: JobRunner,
    pub runner: RunnerConfig,
}

/// `None` means the request does not match the handler's kind.
type Reply = BoxFuture<'static, Option<AgentResponse>>;

type Handler = fn(Arc<Context>, ServerRequest) -> Reply;

pub(super) struct Dispatcher {
    context: Arc<Context>,
    handlers: HashMap<RequestKind, Handler>,
}

impl Dispatcher {
    pub fn new(context: Context) -> Self {
        let mut dispatcher = Self {
            context: Arc::new(context),
            handlers: HashMap::new(),
        };
        dispatcher.register(RequestKind::Ping, ping);
        dispatcher.register(RequestKind::SetState, set_state);
        dispatcher.register(RequestKind::StartAction, start_action);
        dispatcher.register(RequestKind::StopAction, stop_action);
        dispatcher.register(RequestKind::StartJob, start_job);
        dispatcher.register(RequestKind::StopJob, stop_job);
        dispatcher.register(RequestKind::JobStatus, job_status);
        dispatcher.register(RequestKind::CheckConnection, check_connection);
        dispatcher.register(RequestKind::AgentLogs, agent_logs);
        dispatcher
    }

    pub fn register(&mut self, kind: RequestKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    /// Answer `request`, or `None` if it cannot be answered.
    pub async fn handle(&self, request: ServerRequest) -> Option<AgentResponse> {
        let handler = self.handlers.get(&request.kind())?;
        handler(Arc::clone(&self.context), request).await
    }
}

/// `timeout_ms` if set and non-zero, else `default`.
fn effective_timeout(timeout_ms: Option<u64>, default: Duration) -> Duration {
    match timeout_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

fn ping(_ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        matches!(request, ServerRequest::Ping).then(|| AgentResponse::Pong {
            current_time: Utc::now(),
        })
    }
    .boxed()
}

fn set_state(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::SetState(state) = request else {
            return None;
        };
        info!(agents = state.agent_processes.len(), "Applying desired sub-agent state");
        ctx.supervisor.set_state(state).await;
        Some(AgentResponse::SetState)
    }
    .boxed()
}

fn start_action(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::StartAction(start) = request else {
            return None;
        };
        let timeout = effective_timeout(start.timeout_ms, ctx.runner.action_timeout());
        let started = ctx
            .action_registry
            .build(start.action_id.clone(), start.params)
            .and_then(|action| Ok(ctx.actions.start(action, timeout)?));

        let error = started.err().map(|e| {
            warn!(action_id = %start.action_id, error = %e, "Failed to start action");
            format!("{e:#}")
        });
        Some(AgentResponse::StartAction { error })
    }
    .boxed()
}

fn stop_action(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::StopAction { action_id } = request else {
            return None;
        };
        ctx.actions.stop(&action_id);
        Some(AgentResponse::StopAction)
    }
    .boxed()
}

fn start_job(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::StartJob(start) = request else {
            return None;
        };
        let timeout = effective_timeout(start.timeout_ms, ctx.runner.job_timeout());
        let started = ctx
            .job_registry
            .build(start.job_id.clone(), timeout, start.params)
            .and_then(|job| Ok(ctx.jobs.start(job)?));

        let error = started.err().map(|e| {
            warn!(job_id = %start.job_id, error = %e, "Failed to start job");
            format!("{e:#}")
        });
        Some(AgentResponse::StartJob { error })
    }
    .boxed()
}

fn stop_job(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::StopJob { job_id } = request else {
            return None;
        };
        ctx.jobs.stop(&job_id);
        Some(AgentResponse::StopJob)
    }
    .boxed()
}

fn job_status(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::JobStatus { job_id } = request else {
            return None;
        };
        Some(AgentResponse::JobStatus {
            alive: ctx.jobs.is_running(&job_id),
        })
    }
    .boxed()
}

fn check_connection(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::CheckConnection(check) = request else {
            return None;
        };
        let error = ctx.checker.check(&check).await.err().map(|e| format!("{e:#}"));
        Some(AgentResponse::CheckConnection { error })
    }
    .boxed()
}

fn agent_logs(ctx: Arc<Context>, request: ServerRequest) -> Reply {
    async move {
        let ServerRequest::AgentLogs { agent_id, limit } = request else {
            return None;
        };
        let logs = ctx
            .supervisor
            .agent_logs(&agent_id, limit)
            .await
            .unwrap_or_else(|e| {
                warn!(agent_id = %agent_id, error = %e, "Failed to read sub-agent logs");
                Vec::new()
            });
        Some(AgentResponse::AgentLogs { logs })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_missing_timeout_uses_default() {
        let default = Duration::from_secs(10);
        assert_eq!(effective_timeout(None, default), default);
        assert_eq!(effective_timeout(Some(0), default), default);
        assert_eq!(effective_timeout(Some(250), default), Duration::from_millis(250));
    }
}
