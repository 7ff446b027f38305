//! Reconnecting broker connection.
//!
//! `BrokerConnection` owns the live session and a supervisor task that
//! checks it every tick, redialing with capped backoff when it dies. The
//! session is replaced, never mutated; holders observe replacement through
//! the epoch counter and the state watch.

use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerSession};
use crate::error::{QrpcError, Result};

/// Connection lifecycle. `Closing` is terminal: entered on explicit stop,
/// on a fatal broker error, or when the retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// `None` retries forever; `Some(n)` fails fatally after `n` attempts.
    pub max_retries: Option<u32>,
    /// Backoff is `attempt * base_delay`, capped at `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How often the supervisor checks session health.
    pub health_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            health_interval: Duration::from_secs(1),
        }
    }
}

pub struct BrokerConnection {
    broker: Arc<dyn Broker>,
    config: ReconnectConfig,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped each time the session is replaced.
    epoch: AtomicU64,
    stopped: AtomicBool,
    stop: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    /// Starts the connection supervisor. The first dial happens in the
    /// background; use [`wait_connected`](Self::wait_connected) to block
    /// until a session is live.
    pub fn start(broker: Arc<dyn Broker>, config: ReconnectConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Arc::new(Self {
            broker,
            config,
            session: RwLock::new(None),
            state_tx,
            epoch: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::supervise(connection.clone()));
        // The lock is uncontended here; the supervisor never takes it.
        *connection.supervisor.try_lock().expect("fresh connection") = Some(handle);
        connection
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Session generation; changes whenever the session is replaced.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The current live session, if any.
    pub async fn session(&self) -> Result<Arc<dyn BrokerSession>> {
        if self.is_stopped() {
            return Err(QrpcError::ConnectionClosed);
        }
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) if session.is_open() => Ok(session.clone()),
            _ => Err(QrpcError::Connection("not connected".to_string())),
        }
    }

    /// Waits until the connection is live and returns its session. Fails
    /// once the connection is closing.
    pub async fn wait_connected(&self) -> Result<Arc<dyn BrokerSession>> {
        let mut rx = self.watch_state();
        loop {
            // Copy the state out so the watch guard is not held across the
            // session await; the future must stay Send.
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Ok(session) = self.session().await {
                        return Ok(session);
                    }
                }
                ConnectionState::Closing => return Err(QrpcError::ConnectionClosed),
                _ => {}
            }
            rx.changed()
                .await
                .map_err(|_| QrpcError::ConnectionClosed)?;
        }
    }

    /// Stops the supervisor, aborting any in-progress backoff wait, and
    /// closes the session.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the signal survives even when the
        // supervisor is mid-dial rather than parked on the Notify.
        self.stop.notify_one();
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            if self.is_stopped() {
                break;
            }
            let healthy = {
                let guard = self.session.read().await;
                matches!(guard.as_ref(), Some(session) if session.is_open())
            };
            if !healthy && !self.reconnect().await {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_interval) => {}
                _ = self.stop.notified() => {}
            }
        }

        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Closing);
        debug!("broker connection supervisor stopped");
    }

    /// Dials until a session is live. Returns false when the connection
    /// must terminate (stopped, fatal error, or retry budget exhausted).
    async fn reconnect(&self) -> bool {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let mut attempt: u32 = 0;
        loop {
            if self.is_stopped() {
                return false;
            }
            attempt += 1;
            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.broker.connect().await {
                Ok(session) => {
                    *self.session.write().await = Some(session);
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(attempt, "broker connection established");
                    return true;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal broker error, giving up");
                    return false;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "broker connect failed");
                    if let Some(max) = self.config.max_retries {
                        if attempt >= max {
                            error!("max number of connect retries reached");
                            return false;
                        }
                    }
                    let delay = min(self.config.base_delay * attempt, self.config.max_delay);
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.notified() => return false,
                    }
                }
            }
        }
    }
}
