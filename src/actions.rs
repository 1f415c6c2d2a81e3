//! Construction of Actions and Jobs from control-plane parameters.
//!
//! Each action or job kind maps to a builder. The agent ships builders for
//! the tool-based summary actions; database-specific kinds are registered by
//! whoever embeds the agent. Requests for a kind without a builder are
//! answered with an "unsupported" error.

mod process;

pub use process::ProcessAction;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::PathsConfig;
use crate::runner::{Action, Job};
use crate::transport::protocol::{ActionKind, ActionParams, JobKind, JobParams};

pub type ActionBuilder = Arc<dyn Fn(String, ActionParams) -> Result<Box<dyn Action>> + Send + Sync>;

pub type JobBuilder =
    Arc<dyn Fn(String, Duration, JobParams) -> Result<Box<dyn Job>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ActionRegistry {
    builders: HashMap<ActionKind, ActionBuilder>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tool-based summary actions wired to `paths`.
    pub fn with_builtin(paths: &PathsConfig) -> Self {
        let mut registry = Self::new();
        for (kind, tool) in [
            (ActionKind::PtSummary, "pt-summary"),
            (ActionKind::PtMysqlSummary, "pt-mysql-summary"),
            (ActionKind::PtPgSummary, "pt-pg-summary"),
            (ActionKind::PtMongodbSummary, "pt-mongodb-summary"),
        ] {
            let program = paths.tool(tool);
            registry.register(kind, move |id, params| {
                let args = tool_args(params)?;
                Ok(Box::new(ProcessAction::new(id, kind.to_string(), program.clone(), args)))
            });
        }
        registry
    }

    pub fn register<F>(&mut self, kind: ActionKind, builder: F)
    where
        F: Fn(String, ActionParams) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Arc::new(builder));
    }

    pub fn build(&self, id: String, params: ActionParams) -> Result<Box<dyn Action>> {
        let kind = params.kind();
        let builder = self
            .builders
            .get(&kind)
            .ok_or_else(|| anyhow::anyhow!("unsupported action kind: {kind}"))?;
        builder(id, params)
    }
}

fn tool_args(params: ActionParams) -> Result<Vec<String>> {
    match params {
        ActionParams::PtSummary { args }
        | ActionParams::PtMysqlSummary { args }
        | ActionParams::PtPgSummary { args }
        | ActionParams::PtMongodbSummary { args } => Ok(args),
        other => anyhow::bail!("{} is not a tool action", other.kind()),
    }
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    builders: HashMap<JobKind, JobBuilder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: JobKind, builder: F)
    where
        F: Fn(String, Duration, JobParams) -> Result<Box<dyn Job>> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Arc::new(builder));
    }

    pub fn build(&self, id: String, timeout: Duration, params: JobParams) -> Result<Box<dyn Job>> {
        let kind = params.kind();
        let builder = self
            .builders
            .get(&kind)
            .ok_or_else(|| anyhow::anyhow!("unsupported job kind: {kind}"))?;
        builder(id, timeout, params)
    }
}
