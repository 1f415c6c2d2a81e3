//! Bidirectional request/response multiplexer over one stream.
//!
//! A [`Channel`] owns both halves of an established [`Stream`]. A single
//! receiver task reads frames: responses are routed to the waiter registered
//! under their correlation ID, server-originated requests are pushed onto a
//! bounded queue handed out by [`Channel::new`]. All writes go through one
//! mutex so frames never interleave.
//!
//! The channel closes exactly once, on the first send/receive failure or an
//! explicit [`Channel::close`]. Closing releases every pending waiter with
//! the close cause and ends the inbound request queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::protocol::{AgentRequest, AgentResponse, ServerRequest, ServerResponse};
use crate::transport::{
    read_frame, write_frame, AgentMessage, BoxReader, BoxWriter, ServerMessage, Stream,
};

/// Capacity of the inbound request queue. A full queue stops the receiver,
/// which in turn stops reading from the stream.
const REQUESTS_CAP: usize = 32;

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseCause {
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("stream closed by peer")]
    Eof,
    #[error("channel closed")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel closed before a response arrived. Not retryable on this channel.
    #[error("channel closed: {0}")]
    Closed(CloseCause),
    /// The control plane answered with an error status.
    #[error("control plane error: {0}")]
    Remote(String),
}

/// Server-originated request waiting for exactly one [`Channel::send_response`].
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub id: u32,
    pub payload: ServerRequest,
}

/// Point-in-time copy of the channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    pub sent: u64,
    pub received: u64,
    pub responses: u64,
    pub unexpected_responses: u64,
    pub requests: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    responses: AtomicU64,
    unexpected_responses: AtomicU64,
    requests: AtomicU64,
}

type Waiter = oneshot::Sender<Result<ServerResponse, ChannelError>>;

struct Inner {
    writer: tokio::sync::Mutex<BoxWriter>,
    last_id: AtomicU32,
    pending: Mutex<HashMap<u32, Waiter>>,
    closed: CancellationToken,
    cause: OnceLock<CloseCause>,
    counters: Counters,
}

/// Cheap to clone; all clones share one stream.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Wrap an established stream and start the receiver task.
    ///
    /// Returns the channel and the queue of inbound server requests. The
    /// queue ends once the channel closes.
    pub fn new(stream: Stream) -> (Self, mpsc::Receiver<InboundRequest>) {
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(stream.writer),
            last_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            cause: OnceLock::new(),
            counters: Counters::default(),
        });
        let (tx, rx) = mpsc::channel(REQUESTS_CAP);
        tokio::spawn(receive_loop(Arc::clone(&inner), stream.reader, tx));
        (Self { inner }, rx)
    }

    /// Send a request and wait for its response.
    ///
    /// Returns `ChannelError::Closed` if the channel closes first; the caller
    /// must treat that as a definitive failure of this request.
    pub async fn send_request(
        &self,
        payload: AgentRequest,
    ) -> Result<ServerResponse, ChannelError> {
        let id = self
            .inner
            .last_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if let Some(cause) = self.inner.cause.get() {
                return Err(ChannelError::Closed(cause.clone()));
            }
            pending.insert(id, tx);
        }

        // A failed send closes the channel, which answers the waiter.
        let _ = self.inner.send(&AgentMessage::Request { id, payload }).await;

        rx.await
            .unwrap_or_else(|_| Err(ChannelError::Closed(self.inner.cause_or_shutdown())))
    }

    /// Answer a server-originated request.
    pub async fn send_response(&self, id: u32, payload: AgentResponse) -> Result<(), ChannelError> {
        self.inner.send(&AgentMessage::Response { id, payload }).await
    }

    /// Wait until the channel closes and return the cause.
    pub async fn wait(&self) -> CloseCause {
        self.inner.closed.cancelled().await;
        self.inner.cause_or_shutdown()
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.inner.close(CloseCause::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn metrics(&self) -> ChannelMetrics {
        let c = &self.inner.counters;
        ChannelMetrics {
            sent: c.sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            responses: c.responses.load(Ordering::Relaxed),
            unexpected_responses: c.unexpected_responses.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn send(&self, msg: &AgentMessage) -> Result<(), ChannelError> {
        if let Some(cause) = self.cause.get() {
            return Err(ChannelError::Closed(cause.clone()));
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, msg).await {
            drop(writer);
            warn!(error = %e, "Failed to send frame, closing channel");
            self.close(CloseCause::Send(format!("{e:#}")));
            return Err(ChannelError::Closed(self.cause_or_shutdown()));
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn complete(&self, id: u32, payload: Option<ServerResponse>, error: Option<String>) {
        let Some(waiter) = self.pending.lock().remove(&id) else {
            self.counters.unexpected_responses.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = id, "Response for unknown request ID");
            return;
        };
        self.counters.responses.fetch_add(1, Ordering::Relaxed);

        let result = match (payload, error) {
            (_, Some(e)) => Err(ChannelError::Remote(e)),
            (Some(p), None) => Ok(p),
            (None, None) => Err(ChannelError::Remote("empty response".to_string())),
        };
        // The requester may have given up; nothing to do then.
        let _ = waiter.send(result);
    }

    fn close(&self, cause: CloseCause) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }
        debug!(cause = %cause, "Closing channel");
        self.closed.cancel();

        let waiters: Vec<Waiter> = self.pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(ChannelError::Closed(cause.clone())));
        }
    }

    fn cause_or_shutdown(&self) -> CloseCause {
        self.cause.get().cloned().unwrap_or(CloseCause::Shutdown)
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    mut reader: BoxReader,
    requests: mpsc::Sender<InboundRequest>,
) {
    let cause = loop {
        let frame = tokio::select! {
            () = inner.closed.cancelled() => break None,
            frame = read_frame::<_, ServerMessage>(&mut reader) => frame,
        };

        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => break Some(classify_receive_error(&e)),
        };
        inner.counters.received.fetch_add(1, Ordering::Relaxed);

        match msg {
            ServerMessage::Response { id, payload, error } => inner.complete(id, payload, error),
            ServerMessage::Request { id, payload } => {
                inner.counters.requests.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    () = inner.closed.cancelled() => break None,
                    sent = requests.send(InboundRequest { id, payload }) => {
                        if sent.is_err() {
                            debug!(request_id = id, "Request dispatcher is gone, dropping request");
                        }
                    }
                }
            }
        }
    };

    if let Some(cause) = cause {
        inner.close(cause);
    }
    debug!("Channel receiver stopped");
}

fn classify_receive_error(err: &anyhow::Error) -> CloseCause {
    let eof = err
        .downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::UnexpectedEof);
    if eof {
        CloseCause::Eof
    } else {
        CloseCause::Receive(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::transport::protocol::QanCollect;

    struct FakeServer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> AgentMessage {
            read_frame(&mut self.reader).await.unwrap()
        }

        async fn send(&mut self, msg: &ServerMessage) {
            write_frame(&mut self.writer, msg).await.unwrap();
        }
    }

    fn pair() -> (Channel, mpsc::Receiver<InboundRequest>, FakeServer) {
        let (agent_io, server_io) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(agent_io);
        let (sr, sw) = tokio::io::split(server_io);
        let (channel, requests) = Channel::new(Stream::new(ar, aw));
        (channel, requests, FakeServer { reader: sr, writer: sw })
    }

    fn qan(agent_id: &str) -> AgentRequest {
        AgentRequest::QanCollect(QanCollect {
            agent_id: agent_id.to_string(),
            metrics: serde_json::Value::Null,
        })
    }

    fn pong_at(secs: i64) -> ServerResponse {
        ServerResponse::Pong {
            current_time: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn responses_reach_their_own_requesters() {
        const N: i64 = 16;
        let (channel, _requests, mut server) = pair();

        let mut callers = Vec::new();
        for i in 0..N {
            let channel = channel.clone();
            callers.push(tokio::spawn(async move {
                let resp = channel.send_request(qan(&i.to_string())).await.unwrap();
                (i, resp)
            }));
        }

        // Collect every request, then answer in reverse arrival order.
        let mut received = Vec::new();
        for _ in 0..N {
            let AgentMessage::Request { id, payload: AgentRequest::QanCollect(q) } =
                server.recv().await
            else {
                panic!("unexpected frame");
            };
            received.push((id, q.agent_id.parse::<i64>().unwrap()));
        }
        for (id, marker) in received.into_iter().rev() {
            server
                .send(&ServerMessage::Response {
                    id,
                    payload: Some(pong_at(marker)),
                    error: None,
                })
                .await;
        }

        for caller in callers {
            let (i, resp) = caller.await.unwrap();
            assert_eq!(resp, pong_at(i));
        }
        assert_eq!(channel.metrics().responses, N as u64);
    }

    #[tokio::test]
    async fn peer_disconnect_releases_pending_requests() {
        let (channel, _requests, mut server) = pair();

        let mut callers = Vec::new();
        for i in 0..5 {
            let channel = channel.clone();
            callers.push(tokio::spawn(
                async move { channel.send_request(qan(&i.to_string())).await },
            ));
        }
        for _ in 0..5 {
            server.recv().await;
        }
        drop(server);

        for caller in callers {
            let result = tokio::time::timeout(Duration::from_secs(5), caller)
                .await
                .expect("request hung after close")
                .unwrap();
            assert!(matches!(result, Err(ChannelError::Closed(_))));
        }
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn explicit_close_releases_waiters_and_is_idempotent() {
        let (channel, mut requests, mut server) = pair();

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_request(AgentRequest::Ping).await })
        };
        server.recv().await;

        channel.close();
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ChannelError::Closed(CloseCause::Shutdown)));
        assert_eq!(channel.wait().await, CloseCause::Shutdown);
        assert!(requests.recv().await.is_none());

        let after = channel.send_request(AgentRequest::Ping).await;
        assert_eq!(after, Err(ChannelError::Closed(CloseCause::Shutdown)));
    }

    #[tokio::test]
    async fn inbound_requests_arrive_in_order_and_get_answers() {
        let (channel, mut requests, mut server) = pair();

        for id in 1..=3 {
            server
                .send(&ServerMessage::Request {
                    id,
                    payload: ServerRequest::Ping,
                })
                .await;
        }

        for expected in 1..=3 {
            let req = requests.recv().await.unwrap();
            assert_eq!(req.id, expected);
            channel
                .send_response(
                    req.id,
                    AgentResponse::Pong {
                        current_time: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        for expected in 1..=3 {
            let AgentMessage::Response { id, payload } = server.recv().await else {
                panic!("expected response");
            };
            assert_eq!(id, expected);
            assert!(matches!(payload, AgentResponse::Pong { .. }));
        }

        drop(server);
        assert!(requests.recv().await.is_none());
        assert_eq!(channel.wait().await, CloseCause::Eof);
    }

    #[tokio::test]
    async fn remote_error_is_reported() {
        let (channel, _requests, mut server) = pair();

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_request(AgentRequest::Ping).await })
        };
        let AgentMessage::Request { id, .. } = server.recv().await else {
            panic!("expected request");
        };
        server
            .send(&ServerMessage::Response {
                id,
                payload: None,
                error: Some("not allowed".to_string()),
            })
            .await;

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(ChannelError::Remote("not allowed".to_string())));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn unknown_response_id_is_counted() {
        let (channel, _requests, mut server) = pair();
        server
            .send(&ServerMessage::Response {
                id: 999,
                payload: Some(ServerResponse::StateChanged),
                error: None,
            })
            .await;
        server
            .send(&ServerMessage::Request {
                id: 1,
                payload: ServerRequest::Ping,
            })
            .await;

        // Wait for the second frame so the first is surely processed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.metrics().received < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let metrics = channel.metrics();
        assert_eq!(metrics.unexpected_responses, 1);
        assert_eq!(metrics.requests, 1);
    }

    #[tokio::test]
    async fn garbage_frame_closes_channel() {
        let (channel, _requests, mut server) = pair();
        crate::transport::send_message(&mut server.writer, b"not json")
            .await
            .unwrap();

        let cause = tokio::time::timeout(Duration::from_secs(5), channel.wait())
            .await
            .unwrap();
        assert!(matches!(cause, CloseCause::Receive(_)));
    }
}
