//! Scalable consumer pool.
//!
//! The pool reconciles the set of running consumers against the desired
//! concurrency once per tick: it prunes finished handles, starts at most
//! two consumers per tick toward the target, replaces at most one consumer
//! that has gone inactive, and stops surplus consumers after their in-flight
//! task. Ramping gradually keeps a reconnect from stampeding the broker
//! with twenty simultaneous channel setups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use qrpc_common::{BrokerConnection, ConnectionState, QrpcError, QueueDescriptor, Result};

use crate::consumer::{Consumer, ConsumerHandle};
use crate::executor::WorkExecutor;

/// Hard ceiling on concurrent consumers per pool.
pub const MAX_CONSUMERS: usize = 20;
/// Consumers started toward the target per reconcile tick.
const MAX_STARTS_PER_TICK: usize = 2;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue: QueueDescriptor,
    pub initial_consumers: usize,
    pub reconcile_interval: Duration,
}

impl PoolConfig {
    pub fn new(queue: QueueDescriptor) -> Self {
        Self {
            queue,
            initial_consumers: 1,
            reconcile_interval: Duration::from_secs(1),
        }
    }

    pub fn with_consumers(mut self, n: usize) -> Self {
        self.initial_consumers = n;
        self
    }
}

pub struct ConsumerPool {
    connection: Arc<BrokerConnection>,
    executor: Arc<dyn WorkExecutor>,
    config: PoolConfig,
    desired: AtomicUsize,
    active: AtomicUsize,
    stop: Notify,
}

impl ConsumerPool {
    pub fn new(
        connection: Arc<BrokerConnection>,
        executor: Arc<dyn WorkExecutor>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let desired = config.initial_consumers.min(MAX_CONSUMERS);
        if desired != config.initial_consumers {
            warn!(
                requested = config.initial_consumers,
                clamped = desired,
                "initial consumer count exceeds the pool ceiling"
            );
        }
        Arc::new(Self {
            connection,
            executor,
            config,
            desired: AtomicUsize::new(desired),
            active: AtomicUsize::new(0),
            stop: Notify::new(),
        })
    }

    /// Target concurrency, clamped to [`MAX_CONSUMERS`]. Takes effect over
    /// the following reconcile ticks.
    pub fn set_desired_concurrency(&self, n: usize) {
        let clamped = n.min(MAX_CONSUMERS);
        if clamped != n {
            warn!(requested = n, clamped, "desired concurrency clamped");
        }
        self.desired.store(clamped, Ordering::SeqCst);
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub fn increase_consumers(&self) {
        let _ = self
            .desired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < MAX_CONSUMERS).then_some(n + 1)
            });
    }

    pub fn decrease_consumers(&self) {
        let _ = self
            .desired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            });
    }

    /// Consumers serving the queue as of the last reconcile tick.
    pub fn active_consumers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Asks the pool to stop; the spawned run loop drains its consumers
    /// and returns.
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }

    /// Runs the pool until shutdown, a fatal consumer error, or the
    /// connection closing for good.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let pool = self.clone();
        tokio::spawn(pool.run_loop())
    }

    async fn run_loop(self: Arc<Self>) -> Result<()> {
        info!(
            queue = %self.config.queue.name,
            consumers = self.desired_concurrency(),
            "consumer pool starting"
        );
        let mut handles: Vec<ConsumerHandle> = Vec::new();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<QrpcError>();
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => break Ok(()),
                Some(e) = fatal_rx.recv() => {
                    error!(error = %e, "fatal consumer error, stopping pool");
                    break Err(e);
                }
            }
            if self.connection.state() == ConnectionState::Closing {
                break Err(QrpcError::ConnectionClosed);
            }
            self.reconcile(&mut handles, &fatal_tx);
        };

        for handle in handles.drain(..) {
            handle.shutdown().await;
        }
        self.active.store(0, Ordering::SeqCst);
        info!(queue = %self.config.queue.name, "consumer pool stopped");
        result
    }

    fn reconcile(
        &self,
        handles: &mut Vec<ConsumerHandle>,
        fatal_tx: &mpsc::UnboundedSender<QrpcError>,
    ) {
        handles.retain(|handle| !handle.is_finished());

        let desired = self.desired_concurrency();
        while handles.len() > desired {
            if let Some(handle) = handles.pop() {
                // Finishes its in-flight task, then exits.
                handle.stop();
            }
        }

        if self.connection.state() == ConnectionState::Connected {
            let deficit = desired.saturating_sub(handles.len());
            let starting = deficit.min(MAX_STARTS_PER_TICK);
            if starting > 0 {
                debug!(
                    queue = %self.config.queue.name,
                    starting,
                    running = handles.len(),
                    desired,
                    "starting consumers"
                );
            }
            for _ in 0..starting {
                handles.push(self.start_consumer(fatal_tx));
            }

            // One replacement per tick keeps a flapping channel from
            // churning the whole pool at once.
            if let Some(pos) = handles.iter().position(|handle| !handle.is_active()) {
                debug!(queue = %self.config.queue.name, "replacing inactive consumer");
                let old = handles.remove(pos);
                old.stop();
                handles.push(self.start_consumer(fatal_tx));
            }
        }

        let active = handles.iter().filter(|handle| handle.is_active()).count();
        self.active.store(active, Ordering::SeqCst);
    }

    fn start_consumer(&self, fatal_tx: &mpsc::UnboundedSender<QrpcError>) -> ConsumerHandle {
        Consumer::spawn(
            Arc::downgrade(&self.connection),
            self.executor.clone(),
            self.config.queue.clone(),
            fatal_tx.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecError;
    use async_trait::async_trait;
    use qrpc_common::{MemoryBroker, ReconnectConfig, Reply};
    use std::time::Instant;

    struct EchoExecutor;

    #[async_trait]
    impl WorkExecutor for EchoExecutor {
        async fn execute(&self, task: &str) -> std::result::Result<Reply, ExecError> {
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

    fn fast_pool(consumers: usize) -> PoolConfig {
        PoolConfig {
            queue: QueueDescriptor::task("/test1"),
            initial_consumers: consumers,
            reconcile_interval: Duration::from_millis(20),
        }
    }

    async fn wait_for_active(pool: &ConsumerPool, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.active_consumers() != n {
            assert!(
                Instant::now() < deadline,
                "pool never reached {n} active consumers (at {})",
                pool.active_consumers()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn ramps_to_desired_concurrency() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        let pool = ConsumerPool::new(connection.clone(), Arc::new(EchoExecutor), fast_pool(5));
        let handle = pool.spawn();

        wait_for_active(&pool, 5).await;

        pool.shutdown();
        assert!(handle.await.unwrap().is_ok());
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn desired_concurrency_is_clamped_to_ceiling() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        let pool = ConsumerPool::new(connection.clone(), Arc::new(EchoExecutor), fast_pool(50));
        assert_eq!(pool.desired_concurrency(), MAX_CONSUMERS);

        pool.set_desired_concurrency(30);
        assert_eq!(pool.desired_concurrency(), MAX_CONSUMERS);
        pool.increase_consumers();
        assert_eq!(pool.desired_concurrency(), MAX_CONSUMERS);
        pool.set_desired_concurrency(3);
        pool.decrease_consumers();
        assert_eq!(pool.desired_concurrency(), 2);

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn scales_down_to_new_target() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        let pool = ConsumerPool::new(connection.clone(), Arc::new(EchoExecutor), fast_pool(4));
        let handle = pool.spawn();

        wait_for_active(&pool, 4).await;
        pool.set_desired_concurrency(1);
        wait_for_active(&pool, 1).await;

        pool.shutdown();
        let _ = handle.await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn replaces_consumers_after_broker_restart() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::start(Arc::new(broker.clone()), fast_reconnect());
        let pool = ConsumerPool::new(connection.clone(), Arc::new(EchoExecutor), fast_pool(3));
        let handle = pool.spawn();

        wait_for_active(&pool, 3).await;
        broker.kill_sessions();
        // All three die; the reconnected pool replaces them.
        wait_for_active(&pool, 3).await;

        pool.shutdown();
        let _ = handle.await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn pool_stops_when_connection_closes() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::start(Arc::new(broker), fast_reconnect());
        let pool = ConsumerPool::new(connection.clone(), Arc::new(EchoExecutor), fast_pool(2));
        let handle = pool.spawn();

        wait_for_active(&pool, 2).await;
        connection.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(QrpcError::ConnectionClosed)));
    }
}
