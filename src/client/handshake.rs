//! Validation of a freshly opened stream before normal traffic flows.
//!
//! The agent writes a [`ConnectRequest`] frame and reads the server's
//! [`ConnectResponse`] before the channel exists, so the connect metadata is
//! checked first. Then a ping/pong over the channel proves the control plane
//! answers end to end and measures latency and clock drift. A server that
//! rejects the agent or reports no version fails the attempt either way.
//!
//! Server requests that arrive before the pong are held back and handed to
//! dispatch once the handshake completes.

use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::{ClientError, ServerMetadata};
use crate::channel::{Channel, InboundRequest};
use crate::transport::protocol::{AgentRequest, ServerResponse};
use crate::transport::{read_frame, write_frame, ConnectRequest, ConnectResponse, Stream};

/// A stream that passed the handshake.
pub(super) struct Connection {
    pub channel: Channel,
    pub requests: mpsc::Receiver<InboundRequest>,
    /// Requests received while the handshake ping was in flight.
    pub early_requests: Vec<InboundRequest>,
    pub metadata: ServerMetadata,
    pub latency: Duration,
    pub clock_drift: TimeDelta,
}

/// Closes the channel on drop unless the handshake got through.
///
/// The handshake future may be dropped mid-ping when the client is
/// canceled; the receive task must not outlive it.
struct PendingChannel {
    channel: Channel,
    armed: bool,
}

impl PendingChannel {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            armed: true,
        }
    }

    fn into_channel(mut self) -> Channel {
        self.armed = false;
        self.channel.clone()
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        if self.armed {
            debug!("Handshake abandoned, closing channel");
            self.channel.close();
        }
    }
}

/// Run the whole handshake on `stream`, each step bounded by `timeout`.
#[instrument(skip_all, fields(agent_id = %request.agent_id))]
pub(super) async fn perform(
    mut stream: Stream,
    request: &ConnectRequest,
    timeout: Duration,
) -> Result<Connection, ClientError> {
    let exchange = async {
        write_frame(&mut *stream.writer, request).await?;
        read_frame::<_, ConnectResponse>(&mut *stream.reader).await
    };
    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ClientError::Handshake(format!("no connect response within {timeout:?}")))?
        .map_err(|e| ClientError::Handshake(format!("{e:#}")))?;

    if let Some(error) = response.error {
        return Err(ClientError::Handshake(format!("rejected by server: {error}")));
    }
    if response.server_version.is_empty() {
        return Err(ClientError::Handshake(
            "server did not report its version".to_string(),
        ));
    }
    let metadata = ServerMetadata {
        server_version: response.server_version,
        agent_runs_on_node_id: response.agent_runs_on_node_id,
    };
    debug!(server_version = %metadata.server_version, "Connect metadata received");

    let (channel, mut requests) = Channel::new(stream);
    let pending = PendingChannel::new(channel);

    // The inbound queue is bounded; keep draining it so the pong can be read.
    let mut early_requests = Vec::new();
    let measured = {
        let pong = ping(&pending.channel, timeout);
        tokio::pin!(pong);
        loop {
            tokio::select! {
                measured = &mut pong => break measured,
                Some(inbound) = requests.recv() => early_requests.push(inbound),
            }
        }
    };
    let (latency, clock_drift) = measured?;
    if !early_requests.is_empty() {
        debug!(count = early_requests.len(), "Requests received before pong");
    }

    Ok(Connection {
        channel: pending.into_channel(),
        requests,
        early_requests,
        metadata,
        latency,
        clock_drift,
    })
}

/// Ping the server and return the one-way latency and clock drift.
///
/// Latency is half the roundtrip; drift is the server clock minus the local
/// send time minus the latency.
async fn ping(channel: &Channel, timeout: Duration) -> Result<(Duration, TimeDelta), ClientError> {
    let sent_at = Utc::now();
    let started = Instant::now();

    let response = tokio::time::timeout(timeout, channel.send_request(AgentRequest::Ping))
        .await
        .map_err(|_| ClientError::Handshake(format!("no pong within {timeout:?}")))?
        .map_err(|e| ClientError::Handshake(format!("ping failed: {e}")))?;

    let current_time = match response {
        ServerResponse::Pong { current_time } => current_time,
        other => {
            return Err(ClientError::Handshake(format!(
                "unexpected response to ping: {other:?}"
            )));
        }
    };

    let latency = started.elapsed() / 2;
    let clock_drift =
        current_time - sent_at - TimeDelta::from_std(latency).unwrap_or_else(|_| TimeDelta::zero());
    debug!(?latency, drift_ms = clock_drift.num_milliseconds(), "Ping measured");
    Ok((latency, clock_drift))
}
