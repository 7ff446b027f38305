//! A single task-queue consumer.
//!
//! Each consumer owns one channel, declared with prefetch 1 so the broker
//! never hands it a second task while one is in flight; pool concurrency is
//! therefore exactly the number of live consumers. The reply is published
//! before the task is acknowledged, so a consumer that dies mid-task leaves
//! the task unacked and the broker redelivers it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use qrpc_common::{
    Body, BrokerChannel, BrokerConnection, Delivery, Envelope, QrpcError, QueueDescriptor, Reply,
    Result,
};

use crate::executor::{ExecError, WorkExecutor};

/// Pause before the single retry granted to a rebuildable backend fault.
const REBUILD_DELAY: Duration = Duration::from_millis(100);

/// Pool-side view of a running consumer.
pub struct ConsumerHandle {
    active: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Whether the consumer is still serving its queue. A consumer whose
    /// channel died reports inactive until the pool replaces it.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the consumer to stop after the task currently in flight.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    /// Stops the consumer and waits for it to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// Consumes one task queue: declare, prefetch 1, then
/// decode/execute/reply/ack per delivery until stopped or the channel dies.
pub struct Consumer {
    connection: Weak<BrokerConnection>,
    executor: Arc<dyn WorkExecutor>,
    queue: QueueDescriptor,
}

impl Consumer {
    pub fn spawn(
        connection: Weak<BrokerConnection>,
        executor: Arc<dyn WorkExecutor>,
        queue: QueueDescriptor,
        fatal_tx: mpsc::UnboundedSender<QrpcError>,
    ) -> ConsumerHandle {
        let active = Arc::new(AtomicBool::new(true));
        let stopping = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        let consumer = Consumer {
            connection,
            executor,
            queue,
        };
        let task = {
            let active = active.clone();
            let stopping = stopping.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                match consumer.serve(&stop, &stopping).await {
                    Ok(()) => debug!(queue = %consumer.queue.name, "consumer stopped"),
                    Err(e) if e.is_fatal() => {
                        error!(queue = %consumer.queue.name, error = %e, "fatal consumer error");
                        let _ = fatal_tx.send(e);
                    }
                    Err(e) => {
                        warn!(queue = %consumer.queue.name, error = %e, "consumer lost its channel");
                    }
                }
                active.store(false, Ordering::SeqCst);
            })
        };

        ConsumerHandle {
            active,
            stopping,
            stop,
            task,
        }
    }

    async fn serve(&self, stop: &Notify, stopping: &AtomicBool) -> Result<()> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(QrpcError::ConnectionClosed)?;
        let session = connection.session().await?;
        drop(connection);

        let channel = session.open_channel().await?;
        channel.declare_queue(&self.queue).await?;
        channel.set_prefetch(1).await?;
        let mut deliveries = channel.consume(&self.queue.name, false).await?;

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    channel.close().await;
                    return Ok(());
                }
                delivery = deliveries.recv() => match delivery {
                    None => return Err(QrpcError::Connection("delivery stream ended".to_string())),
                    Some(delivery) => self.handle(channel.as_ref(), delivery).await?,
                }
            }
            if stopping.load(Ordering::SeqCst) {
                channel.close().await;
                return Ok(());
            }
        }
    }

    async fn handle(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Result<()> {
        let body = match Body::decode(&delivery.envelope.payload) {
            Ok(body) => body,
            Err(e) => {
                // Redelivering a payload that cannot parse would loop
                // forever, so it is acknowledged and dropped.
                warn!(error = %e, "undecodable task payload, discarding");
                channel.ack(delivery.delivery_tag).await?;
                return Ok(());
            }
        };
        let task = match body {
            Body::Bytes(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Body::Json(value) => match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            },
        };

        let reply = self.execute_with_retry(&task).await;

        if let Some(reply_to) = delivery.envelope.reply_to.as_deref() {
            let mut envelope = Envelope::new(reply.encode()?);
            if let Some(id) = delivery.envelope.correlation_id.clone() {
                envelope = envelope.with_correlation_id(id);
            }
            // If the caller is gone its exclusive reply queue is too; the
            // publish lands nowhere and that is fine.
            channel.publish(reply_to, envelope).await?;
        }
        // Ack strictly after the reply is on the wire, so a consumer that
        // dies in between leaves the task to be redelivered.
        channel.ack(delivery.delivery_tag).await?;
        Ok(())
    }

    async fn execute_with_retry(&self, task: &str) -> Reply {
        match self.executor.execute(task).await {
            Ok(reply) => reply,
            Err(ExecError::Timeout) => Reply::gateway_timeout(),
            Err(ExecError::Reset(e)) => {
                warn!(task, error = %e, "backend reset");
                Reply::service_unavailable()
            }
            Err(ExecError::Rebuild(e)) => {
                warn!(task, error = %e, "backend fault, retrying once");
                tokio::time::sleep(REBUILD_DELAY).await;
                match self.executor.execute(task).await {
                    Ok(reply) => reply,
                    Err(ExecError::Timeout) => Reply::gateway_timeout(),
                    Err(e) => {
                        warn!(task, error = %e, "retry failed");
                        Reply::service_unavailable()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qrpc_common::{Broker, MemoryBroker, PublishOutcome, ReconnectConfig};
    use std::sync::atomic::AtomicUsize;

    struct EchoExecutor;

    #[async_trait]
    impl WorkExecutor for EchoExecutor {
        async fn execute(&self, task: &str) -> std::result::Result<Reply, ExecError> {
            Ok(Reply::ok(task.as_bytes().to_vec()))
        }
    }

    /// Fails with `Rebuild` a fixed number of times, then echoes.
    struct FlakyExecutor {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl WorkExecutor for FlakyExecutor {
        async fn execute(&self, task: &str) -> std::result::Result<Reply, ExecError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ExecError::Rebuild("connection refused".to_string()));
            }
            Ok(Reply::ok(task.as_bytes().to_vec()))
        }
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            health_interval: Duration::from_millis(20),
            ..ReconnectConfig::default()
        }
    }

    async fn publish_task(
        broker: &MemoryBroker,
        queue: &str,
        payload: Vec<u8>,
        reply_to: &str,
    ) -> Arc<dyn BrokerChannel> {
        let session = broker.connect().await.unwrap();
        let channel = session.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueDescriptor::task(queue))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDescriptor {
                name: reply_to.to_string(),
                max_length: None,
                message_ttl_ms: None,
                exclusive: false,
                auto_delete: false,
            })
            .await
            .unwrap();
        let outcome = channel
            .publish(
                queue,
                Envelope::new(payload)
                    .with_correlation_id("call-1")
                    .with_reply_to(reply_to),
            )
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted);
        channel
    }

    #[tokio::test]
    async fn executes_task_and_publishes_correlated_reply() {
        let broker = MemoryBroker::new();
        let payload = Body::text("/wiki/Main_Page").encode().unwrap();
        let channel = publish_task(&broker, "/test1", payload, "replies").await;
        let mut replies = channel.consume("replies", true).await.unwrap();

        let connection = BrokerConnection::start(Arc::new(broker.clone()), fast_reconnect());
        connection.wait_connected().await.unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let handle = Consumer::spawn(
            Arc::downgrade(&connection),
            Arc::new(EchoExecutor),
            QueueDescriptor::task("/test1"),
            fatal_tx,
        );

        let delivery = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.correlation_id.as_deref(), Some("call-1"));
        let reply = Reply::decode(&delivery.envelope.payload).unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"/wiki/Main_Page");
        // Acked after the reply: nothing left to redeliver.
        assert_eq!(broker.queue_depth("/test1"), 0);

        handle.shutdown().await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_payload_is_acked_and_dropped() {
        let broker = MemoryBroker::new();
        let channel = publish_task(&broker, "/test1", b"{not json".to_vec(), "replies").await;
        let mut replies = channel.consume("replies", true).await.unwrap();

        let connection = BrokerConnection::start(Arc::new(broker.clone()), fast_reconnect());
        connection.wait_connected().await.unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let handle = Consumer::spawn(
            Arc::downgrade(&connection),
            Arc::new(EchoExecutor),
            QueueDescriptor::task("/test1"),
            fatal_tx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.queue_depth("/test1"), 0);
        assert!(replies.try_recv().is_err(), "no reply for a dropped task");

        handle.shutdown().await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn rebuild_fault_gets_one_retry() {
        let broker = MemoryBroker::new();
        let payload = Body::text("x").encode().unwrap();
        let channel = publish_task(&broker, "/test1", payload, "replies").await;
        let mut replies = channel.consume("replies", true).await.unwrap();

        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        connection.wait_connected().await.unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let handle = Consumer::spawn(
            Arc::downgrade(&connection),
            Arc::new(FlakyExecutor {
                failures_left: AtomicUsize::new(1),
            }),
            QueueDescriptor::task("/test1"),
            fatal_tx,
        );

        let delivery = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        let reply = Reply::decode(&delivery.envelope.payload).unwrap();
        assert_eq!(reply.status, 200);

        handle.shutdown().await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn two_rebuild_faults_become_a_503() {
        let broker = MemoryBroker::new();
        let payload = Body::text("x").encode().unwrap();
        let channel = publish_task(&broker, "/test1", payload, "replies").await;
        let mut replies = channel.consume("replies", true).await.unwrap();

        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        connection.wait_connected().await.unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let handle = Consumer::spawn(
            Arc::downgrade(&connection),
            Arc::new(FlakyExecutor {
                failures_left: AtomicUsize::new(2),
            }),
            QueueDescriptor::task("/test1"),
            fatal_tx,
        );

        let delivery = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        let reply = Reply::decode(&delivery.envelope.payload).unwrap();
        assert_eq!(reply.status, 503);

        handle.shutdown().await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn consumer_goes_inactive_when_its_session_dies() {
        let broker = MemoryBroker::new();
        {
            let session = broker.connect().await.unwrap();
            let channel = session.open_channel().await.unwrap();
            channel
                .declare_queue(&QueueDescriptor::task("/test1"))
                .await
                .unwrap();
        }

        let connection = BrokerConnection::start(Arc::new(broker.clone()), fast_reconnect());
        connection.wait_connected().await.unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let handle = Consumer::spawn(
            Arc::downgrade(&connection),
            Arc::new(EchoExecutor),
            QueueDescriptor::task("/test1"),
            fatal_tx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_active());

        broker.kill_sessions();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.is_active() {
            assert!(std::time::Instant::now() < deadline, "consumer never noticed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
        connection.shutdown().await;
    }
}
