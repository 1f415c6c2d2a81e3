//! Reachability checks requested by the control plane before it adds a service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::protocol::CheckConnection;

/// Timeout used when the request does not carry one.
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait ConnectionChecker: Send + Sync {
    /// `Ok` if the service answered; the error text is reported upstream.
    async fn check(&self, request: &CheckConnection) -> Result<()>;
}

/// Checks that a TCP connection to the service address can be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectionChecker;

#[async_trait]
impl ConnectionChecker for TcpConnectionChecker {
    async fn check(&self, request: &CheckConnection) -> Result<()> {
        let timeout = match request.timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => DEFAULT_CHECK_TIMEOUT,
        };
        debug!(address = %request.address, ?timeout, "Checking connection");

        tokio::time::timeout(timeout, TcpStream::connect(&request.address))
            .await
            .map_err(|_| {
                anyhow::anyhow!("timeout after {timeout:?} connecting to {}", request.address)
            })?
            .with_context(|| format!("Failed to connect to {}", request.address))?;
        Ok(())
    }
}
