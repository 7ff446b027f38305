//! RPC caller side.
//!
//! An [`RpcClient`] owns one exclusive auto-delete reply queue and a
//! demultiplexer task that routes every reply on it to the waiting call by
//! correlation id. Calls never raise transport errors: every failure mode
//! collapses to a synthetic 503 (unavailable or rejected) or 504 (timed
//! out) [`Reply`], so callers handle exactly one shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use qrpc_common::{
    Body, BrokerChannel, BrokerConnection, ConnectionState, Envelope, PublishOutcome,
    QrpcError, QueueDescriptor, Reply, Result,
};

use crate::pending::PendingCallMap;

/// Delay before re-publishing after a transient send failure.
const RESEND_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-call reply deadline; expiry yields a 504.
    pub timeout: Duration,
    /// How often a waiting call checks for its reply.
    pub poll_interval: Duration,
    /// Resends after a mid-call connection loss, then gives up with a 503.
    pub max_call_retries: u32,
    /// How long a send waits for the reply queue to come up.
    pub ready_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_call_retries: 3,
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// The publish channel plus the reply queue declared on it. Rebuilt as a
/// unit whenever the session is replaced.
#[derive(Clone)]
struct ClientChannel {
    channel: Arc<dyn BrokerChannel>,
    reply_queue: String,
}

pub struct RpcClient {
    connection: Arc<BrokerConnection>,
    config: ClientConfig,
    pending: Arc<PendingCallMap>,
    channel_tx: watch::Sender<Option<ClientChannel>>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Starts the reply demultiplexer on the given connection. The client
    /// is usable immediately; sends block until the reply queue is live.
    pub fn start(connection: Arc<BrokerConnection>, config: ClientConfig) -> Arc<Self> {
        let (channel_tx, _) = watch::channel(None);
        let client = Arc::new(Self {
            connection,
            config,
            pending: Arc::new(PendingCallMap::new()),
            channel_tx,
            demux: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::demux_loop(client.clone()));
        *client.demux.try_lock().expect("fresh client") = Some(handle);
        client
    }

    /// Publishes one request and returns its correlation id. The caller
    /// polls [`take_reply`](Self::take_reply) for the outcome.
    pub async fn send_request(&self, queue: &str, body: &Body) -> Result<String> {
        let ctx = self.ready_channel().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(body.encode()?)
            .with_correlation_id(&correlation_id)
            .with_reply_to(&ctx.reply_queue);

        self.pending.register(&correlation_id).await;
        match ctx.channel.publish(queue, envelope).await {
            Ok(PublishOutcome::Accepted) => Ok(correlation_id),
            Ok(PublishOutcome::Rejected) => {
                self.pending.discard(&correlation_id).await;
                Err(QrpcError::PublishRejected)
            }
            Err(e) => {
                self.pending.discard(&correlation_id).await;
                Err(e)
            }
        }
    }

    /// Removes and returns the reply for an in-flight request, if it has
    /// arrived.
    pub async fn take_reply(&self, correlation_id: &str) -> Option<Reply> {
        self.pending.try_take(correlation_id).await
    }

    /// Calls with the configured timeout.
    pub async fn call(&self, queue: &str, body: &Body) -> Reply {
        self.call_with_timeout(queue, body, self.config.timeout).await
    }

    /// Sends a request and waits for its reply.
    ///
    /// Always resolves to a `Reply`: a nacked publish or a dead connection
    /// yields a 503, and a missed deadline yields a 504. A connection loss
    /// while waiting resends the request on the fresh session, up to
    /// `max_call_retries` times.
    pub async fn call_with_timeout(&self, queue: &str, body: &Body, timeout: Duration) -> Reply {
        for attempt in 0..=self.config.max_call_retries {
            let correlation_id = match self.send_request(queue, body).await {
                Ok(id) => id,
                Err(QrpcError::PublishRejected) => {
                    debug!(queue, "publish rejected by admission control");
                    return Reply::service_unavailable();
                }
                Err(QrpcError::ConnectionClosed) => return Reply::service_unavailable(),
                Err(e) if e.is_fatal() => return Reply::service_unavailable(),
                Err(e) => {
                    debug!(attempt, error = %e, "send failed, will retry");
                    tokio::time::sleep(RESEND_DELAY).await;
                    continue;
                }
            };

            let started = Instant::now();
            loop {
                if let Some(reply) = self.pending.try_take(&correlation_id).await {
                    return reply;
                }
                if started.elapsed() >= timeout {
                    self.pending.discard(&correlation_id).await;
                    return Reply::gateway_timeout();
                }
                match self.connection.state() {
                    ConnectionState::Connected => {}
                    ConnectionState::Closing => {
                        self.pending.discard(&correlation_id).await;
                        return Reply::service_unavailable();
                    }
                    _ => {
                        // The request may have died with the session;
                        // abandon it and resend once reconnected.
                        self.pending.discard(&correlation_id).await;
                        break;
                    }
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        Reply::service_unavailable()
    }

    /// Number of calls still waiting for a reply.
    pub async fn in_flight(&self) -> usize {
        self.pending.len().await
    }

    /// Stops the demultiplexer. Outstanding calls resolve to 503/504.
    pub async fn shutdown(&self) {
        let handle = self.demux.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.channel_tx.send_replace(None);
    }

    async fn ready_channel(&self) -> Result<ClientChannel> {
        let mut rx = self.channel_tx.subscribe();
        let wait = async {
            loop {
                if let Some(ctx) = rx.borrow_and_update().clone() {
                    return Ok(ctx);
                }
                rx.changed()
                    .await
                    .map_err(|_| QrpcError::ConnectionClosed)?;
            }
        };
        tokio::time::timeout(self.config.ready_timeout, wait)
            .await
            .map_err(|_| QrpcError::Connection("reply queue not ready".to_string()))?
    }

    /// Rebuilds the reply queue on every fresh session and routes its
    /// deliveries to the pending-call table until the connection closes.
    async fn demux_loop(self: Arc<Self>) {
        loop {
            let session = match self.connection.wait_connected().await {
                Ok(session) => session,
                Err(_) => break,
            };
            let mut deliveries = match self.build_reply_queue(session.as_ref()).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "failed to build reply queue");
                    tokio::time::sleep(RESEND_DELAY).await;
                    continue;
                }
            };

            while let Some(delivery) = deliveries.recv().await {
                let Some(correlation_id) = delivery.envelope.correlation_id else {
                    warn!("reply without correlation id, dropping");
                    continue;
                };
                let reply = match Reply::decode(&delivery.envelope.payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(correlation_id, error = %e, "undecodable reply, dropping");
                        continue;
                    }
                };
                if !self.pending.resolve(&correlation_id, reply).await {
                    debug!(correlation_id, "late reply discarded");
                }
            }

            // Stream ended: the session died. Tear down and rebuild.
            self.channel_tx.send_replace(None);
            tokio::time::sleep(RESEND_DELAY).await;
        }
        self.channel_tx.send_replace(None);
        debug!("reply demultiplexer stopped");
    }

    async fn build_reply_queue(
        &self,
        session: &dyn qrpc_common::BrokerSession,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<qrpc_common::Delivery>> {
        let channel = session.open_channel().await?;
        let reply_queue = channel.declare_queue(&QueueDescriptor::reply()).await?;
        // Replies are fire-and-forget; a lost reply is indistinguishable
        // from a slow one and the call times out either way.
        let rx = channel.consume(&reply_queue, true).await?;
        self.channel_tx.send_replace(Some(ClientChannel {
            channel,
            reply_queue,
        }));
        Ok(rx)
    }
}
