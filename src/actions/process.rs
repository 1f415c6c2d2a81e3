//! Action that runs an external tool and returns its output.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::runner::Action;

/// Runs `program args...` and returns stdout, with stderr appended when present.
///
/// A non-zero exit is an error carrying the exit status and stderr.
#[derive(Debug, Clone)]
pub struct ProcessAction {
    id: String,
    action_type: String,
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessAction {
    pub fn new(id: String, action_type: String, program: PathBuf, args: Vec<String>) -> Self {
        Self {
            id,
            action_type,
            program,
            args,
        }
    }
}

#[async_trait]
impl Action for ProcessAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn action_type(&self) -> &str {
        &self.action_type
    }

    #[instrument(
        skip(self, cancel),
        fields(action_id = %self.id, program = %self.program.display())
    )]
    async fn run(&self, cancel: CancellationToken) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        // Take pipe handles out so `child` stays in scope for kill-on-cancel
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) = tokio::select! {
            result = read_all => result?,
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                anyhow::bail!("killed");
            }
        };

        let status = child.wait().await.context("Failed to wait for process")?;
        debug!(exit_code = ?status.code(), "Tool finished");

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            anyhow::bail!("{status}: {}", stderr.trim());
        }

        let mut output = stdout_buf;
        if !stderr_buf.is_empty() {
            output.extend_from_slice(b"\n--- stderr ---\n");
            output.extend_from_slice(&stderr_buf);
        }
        Ok(output)
    }
}
