//! Control-plane protocol message types.
//!
//! Length-prefixed JSON protocol between the agent and the control plane.
//! Messages are framed as: [4-byte BE length][JSON payload]
//!
//! A connection starts with one [`ConnectRequest`] / [`ConnectResponse`]
//! exchange, after which both sides speak channel frames
//! ([`AgentMessage`] outbound, [`ServerMessage`] inbound).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// First frame written by the agent on a fresh stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub agent_id: String,
    pub agent_version: String,
    /// Opaque credentials, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Control plane answer to [`ConnectRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub agent_runs_on_node_id: String,
    /// Set when the control plane refuses the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frame sent from the agent to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Agent-originated request; the server answers with the same `id`.
    Request { id: u32, payload: AgentRequest },
    /// Answer to a server-originated request.
    Response { id: u32, payload: AgentResponse },
}

/// Frame sent from the control plane to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server-originated request; the agent must answer exactly once.
    Request { id: u32, payload: ServerRequest },
    /// Answer to an agent-originated request.
    Response {
        id: u32,
        #[serde(default)]
        payload: Option<ServerResponse>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Requests the agent sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    Ping,
    StateChanged(StateChanged),
    QanCollect(QanCollect),
    ActionResult(ActionResultPayload),
    JobProgress(JobProgressPayload),
    JobResult(JobResultPayload),
}

/// Responses the control plane gives to [`AgentRequest`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerResponse {
    Pong { current_time: DateTime<Utc> },
    StateChanged,
    QanCollect,
    ActionResult,
    JobProgress,
    JobResult,
}

/// Requests the control plane sends down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerRequest {
    Ping,
    SetState(SetState),
    StartAction(StartAction),
    StopAction { action_id: String },
    StartJob(StartJob),
    StopJob { job_id: String },
    JobStatus { job_id: String },
    CheckConnection(CheckConnection),
    AgentLogs {
        agent_id: String,
        #[serde(default)]
        limit: usize,
    },
    /// Any request kind this agent does not know about.
    #[serde(other)]
    Unknown,
}

impl ServerRequest {
    /// Discriminant used to look up a dispatch handler.
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Ping => RequestKind::Ping,
            Self::SetState(_) => RequestKind::SetState,
            Self::StartAction(_) => RequestKind::StartAction,
            Self::StopAction { .. } => RequestKind::StopAction,
            Self::StartJob(_) => RequestKind::StartJob,
            Self::StopJob { .. } => RequestKind::StopJob,
            Self::JobStatus { .. } => RequestKind::JobStatus,
            Self::CheckConnection(_) => RequestKind::CheckConnection,
            Self::AgentLogs { .. } => RequestKind::AgentLogs,
            Self::Unknown => RequestKind::Unknown,
        }
    }
}

/// Payload-free tag of a [`ServerRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    SetState,
    StartAction,
    StopAction,
    StartJob,
    StopJob,
    JobStatus,
    CheckConnection,
    AgentLogs,
    Unknown,
}

/// Responses the agent gives to [`ServerRequest`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResponse {
    Pong {
        current_time: DateTime<Utc>,
    },
    SetState,
    StartAction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StopAction,
    StartJob {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StopJob,
    JobStatus {
        alive: bool,
    },
    CheckConnection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AgentLogs {
        logs: Vec<String>,
    },
}

/// Desired set of sub-agent processes, keyed by agent ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetState {
    #[serde(default)]
    pub agent_processes: HashMap<String, AgentProcessParams>,
}

/// Sub-agent process types the supervisor knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    NodeExporter,
    MysqldExporter,
    MongodbExporter,
    PostgresExporter,
    ProxysqlExporter,
    RdsExporter,
    AzureDatabaseExporter,
    VmAgent,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NodeExporter => "node_exporter",
            Self::MysqldExporter => "mysqld_exporter",
            Self::MongodbExporter => "mongodb_exporter",
            Self::PostgresExporter => "postgres_exporter",
            Self::ProxysqlExporter => "proxysql_exporter",
            Self::RdsExporter => "rds_exporter",
            Self::AzureDatabaseExporter => "azure_database_exporter",
            Self::VmAgent => "vmagent",
        };
        f.write_str(name)
    }
}

/// Launch parameters for one sub-agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcessParams {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs; when non-empty they replace the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// Words replaced with `***` in captured output.
    #[serde(default)]
    pub redact_words: Vec<String>,
}

/// Sub-agent lifecycle status as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Waiting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub process_exec_path: String,
}

/// Query analytics bucket collected by a built-in agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QanCollect {
    pub agent_id: String,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResultPayload {
    pub action_id: String,
    #[serde(default)]
    pub output: Vec<u8>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgressPayload {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub progress: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultPayload {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub output: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAction {
    pub action_id: String,
    /// Zero or absent means "use the agent default".
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub params: ActionParams,
}

/// Parameters of every action kind the control plane may request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParams {
    PtSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    PtMysqlSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    PtPgSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    PtMongodbSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    MysqlExplain {
        dsn: String,
        query: String,
    },
    MysqlShowCreateTable {
        dsn: String,
        table: String,
    },
    MysqlShowTableStatus {
        dsn: String,
        table: String,
    },
    PostgresqlShowCreateTable {
        dsn: String,
        table: String,
    },
    MongodbExplain {
        dsn: String,
        query: String,
    },
}

impl ActionParams {
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::PtSummary { .. } => ActionKind::PtSummary,
            Self::PtMysqlSummary { .. } => ActionKind::PtMysqlSummary,
            Self::PtPgSummary { .. } => ActionKind::PtPgSummary,
            Self::PtMongodbSummary { .. } => ActionKind::PtMongodbSummary,
            Self::MysqlExplain { .. } => ActionKind::MysqlExplain,
            Self::MysqlShowCreateTable { .. } => ActionKind::MysqlShowCreateTable,
            Self::MysqlShowTableStatus { .. } => ActionKind::MysqlShowTableStatus,
            Self::PostgresqlShowCreateTable { .. } => ActionKind::PostgresqlShowCreateTable,
            Self::MongodbExplain { .. } => ActionKind::MongodbExplain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PtSummary,
    PtMysqlSummary,
    PtPgSummary,
    PtMongodbSummary,
    MysqlExplain,
    MysqlShowCreateTable,
    MysqlShowTableStatus,
    PostgresqlShowCreateTable,
    MongodbExplain,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PtSummary => "pt-summary",
            Self::PtMysqlSummary => "pt-mysql-summary",
            Self::PtPgSummary => "pt-pg-summary",
            Self::PtMongodbSummary => "pt-mongodb-summary",
            Self::MysqlExplain => "mysql-explain",
            Self::MysqlShowCreateTable => "mysql-show-create-table",
            Self::MysqlShowTableStatus => "mysql-show-table-status",
            Self::PostgresqlShowCreateTable => "postgresql-show-create-table",
            Self::MongodbExplain => "mongodb-explain",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJob {
    pub job_id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub params: JobParams,
}

/// Parameters of every job kind the control plane may request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    MysqlBackup { dsn: String, location: String },
    MongodbBackup { dsn: String, location: String },
    MysqlRestore { dsn: String, location: String, name: String },
    MongodbRestore { dsn: String, location: String, name: String },
}

impl JobParams {
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::MysqlBackup { .. } => JobKind::MysqlBackup,
            Self::MongodbBackup { .. } => JobKind::MongodbBackup,
            Self::MysqlRestore { .. } => JobKind::MysqlRestore,
            Self::MongodbRestore { .. } => JobKind::MongodbRestore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    MysqlBackup,
    MongodbBackup,
    MysqlRestore,
    MongodbRestore,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MysqlBackup => "mysql-backup",
            Self::MongodbBackup => "mongodb-backup",
            Self::MysqlRestore => "mysql-restore",
            Self::MongodbRestore => "mongodb-restore",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConnection {
    /// `host:port` of the service to check.
    pub address: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}
