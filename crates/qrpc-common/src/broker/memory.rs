//! In-process broker with the real admission semantics.
//!
//! Implements bounded queue length with reject-publish overflow, lazy
//! message TTL, prefetch-limited round-robin dispatch, redelivery of
//! unacknowledged messages when a channel dies, and exclusive auto-delete
//! queues. Fault hooks (`fail_next_connects`, `kill_sessions`) let tests
//! exercise the reconnect paths without a live broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerChannel, BrokerSession, Delivery, PublishOutcome};
use crate::envelope::Envelope;
use crate::error::{QrpcError, Result};
use crate::queue::QueueDescriptor;

#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<Core>,
}

struct Core {
    state: Mutex<BrokerState>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
    connect_failures: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_queue_id: u64,
    next_tag: u64,
}

struct QueueState {
    desc: QueueDescriptor,
    /// Channel that declared an exclusive queue; the queue dies with it.
    owner_channel: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    rr: usize,
}

struct StoredMessage {
    envelope: Envelope,
    enqueued_at: Instant,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    no_ack: bool,
    prefetch: u16,
    /// Unacked deliveries, requeued if the channel dies first.
    unacked: Vec<(u64, Envelope)>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

impl QueueState {
    fn drop_expired(&mut self) {
        let ttl = match self.desc.message_ttl_ms {
            Some(ms) => Duration::from_millis(u64::from(ms)),
            None => return,
        };
        // Ready messages are in arrival order, so expiry only ever trims
        // the front.
        while let Some(front) = self.ready.front() {
            if front.enqueued_at.elapsed() >= ttl {
                self.ready.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(BrokerState::default()),
                sessions: Mutex::new(Vec::new()),
                connect_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `n` calls to `connect` fail with a transient error.
    pub fn fail_next_connects(&self, n: usize) {
        self.core.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Drops every live session, as a broker restart would.
    pub fn kill_sessions(&self) {
        let sessions: Vec<Arc<MemorySession>> = {
            let mut guard = self.core.sessions.lock().unwrap();
            let live = guard.iter().filter_map(Weak::upgrade).collect();
            guard.clear();
            live
        };
        for session in sessions {
            session.shutdown();
        }
    }

    /// Number of ready (undelivered, unexpired) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        let mut state = self.core.state.lock().unwrap();
        match state.queues.get_mut(name) {
            Some(queue) => {
                queue.drop_expired();
                queue.ready.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>> {
        let remaining = self.core.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.core
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(QrpcError::Connection(
                "simulated broker connect failure".to_string(),
            ));
        }

        let session = Arc::new(MemorySession {
            core: self.core.clone(),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        });
        self.core
            .sessions
            .lock()
            .unwrap()
            .push(Arc::downgrade(&session));
        Ok(session)
    }
}

impl Core {
    /// Hands ready messages to consumers with capacity, round-robin.
    /// Called with the state lock held by the caller.
    fn pump(state: &mut BrokerState, queue_name: &str) {
        let BrokerState {
            queues, next_tag, ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        queue.drop_expired();

        'dispatch: while !queue.ready.is_empty() {
            let n = queue.consumers.len();
            if n == 0 {
                break;
            }
            let mut picked = None;
            for offset in 0..n {
                let idx = (queue.rr + offset) % n;
                if queue.consumers[idx].has_capacity() {
                    picked = Some(idx);
                    break;
                }
            }
            let Some(idx) = picked else { break };

            let message = queue.ready.pop_front().expect("checked non-empty");
            *next_tag += 1;
            let tag = *next_tag;
            let slot = &mut queue.consumers[idx];
            let delivery = Delivery {
                envelope: message.envelope.clone(),
                delivery_tag: tag,
                redelivered: message.redelivered,
            };
            if slot.tx.send(delivery).is_err() {
                // Receiver is gone; drop the slot, putting the message and
                // anything it held unacked back at the front.
                let dead = queue.consumers.remove(idx);
                queue.ready.push_front(message);
                for (_, envelope) in dead.unacked.into_iter().rev() {
                    queue.ready.push_front(StoredMessage {
                        envelope,
                        enqueued_at: Instant::now(),
                        redelivered: true,
                    });
                }
                continue 'dispatch;
            }
            if !slot.no_ack {
                slot.unacked.push((tag, message.envelope));
            }
            queue.rr = (idx + 1) % n.max(1);
        }
    }

    /// Tears down everything a dying channel held: its consumer slots
    /// (requeueing unacked messages) and any exclusive queues it owned.
    fn release_channel(&self, channel_id: u64) {
        let mut state = self.state.lock().unwrap();
        let mut touched = Vec::new();
        let mut owned = Vec::new();

        for (name, queue) in state.queues.iter_mut() {
            if queue.owner_channel == Some(channel_id) {
                owned.push(name.clone());
                continue;
            }
            let QueueState {
                ready, consumers, ..
            } = queue;
            let mut requeued = false;
            consumers.retain_mut(|slot| {
                if slot.channel_id != channel_id {
                    return true;
                }
                for (_, envelope) in slot.unacked.drain(..).rev() {
                    ready.push_front(StoredMessage {
                        envelope,
                        enqueued_at: Instant::now(),
                        redelivered: true,
                    });
                    requeued = true;
                }
                false
            });
            if requeued || !ready.is_empty() {
                touched.push(name.clone());
            }
        }
        for name in owned {
            state.queues.remove(&name);
        }
        for name in touched {
            Self::pump(&mut state, &name);
        }
    }
}

pub struct MemorySession {
    core: Arc<Core>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemorySession {
    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Arc<MemoryChannel>> =
            std::mem::take(&mut *self.channels.lock().unwrap());
        for channel in channels {
            channel.shutdown();
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(QrpcError::ConnectionClosed);
        }
        static NEXT_CHANNEL_ID: AtomicUsize = AtomicUsize::new(1);
        let channel = Arc::new(MemoryChannel {
            core: self.core.clone(),
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst) as u64,
            prefetch: AtomicU16::new(0),
            open: AtomicBool::new(true),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown();
    }
}

pub struct MemoryChannel {
    core: Arc<Core>,
    id: u64,
    prefetch: AtomicU16,
    open: AtomicBool,
}

impl MemoryChannel {
    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.release_channel(self.id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QrpcError::Connection("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, desc: &QueueDescriptor) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.core.state.lock().unwrap();

        let name = if desc.name.is_empty() {
            state.next_queue_id += 1;
            format!("amq.gen-{}", state.next_queue_id)
        } else {
            desc.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if !existing.desc.args_match(desc) {
                return Err(QrpcError::QueueMismatch(name));
            }
            return Ok(name);
        }

        let mut stored = desc.clone();
        stored.name = name.clone();
        state.queues.insert(
            name.clone(),
            QueueState {
                owner_channel: desc.exclusive.then_some(self.id),
                desc: stored,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                rr: 0,
            },
        );
        Ok(name)
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<PublishOutcome> {
        self.ensure_open()?;
        let mut state = self.core.state.lock().unwrap();
        let Some(target) = state.queues.get_mut(queue) else {
            // Default-exchange semantics: a publish to a missing queue is
            // confirmed and the message dropped.
            return Ok(PublishOutcome::Accepted);
        };

        target.drop_expired();
        if let Some(max) = target.desc.max_length {
            if target.ready.len() as u32 >= max {
                return Ok(PublishOutcome::Rejected);
            }
        }
        target.ready.push_back(StoredMessage {
            envelope,
            enqueued_at: Instant::now(),
            redelivered: false,
        });
        Core::pump(&mut state, queue);
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.core.state.lock().unwrap();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(QrpcError::Broker(format!("no such queue '{queue}'")));
        };
        target.consumers.push(ConsumerSlot {
            channel_id: self.id,
            tx,
            no_ack,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            unacked: Vec::new(),
        });
        Core::pump(&mut state, queue);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.core.state.lock().unwrap();
        let mut acked_on = None;
        for (name, queue) in state.queues.iter_mut() {
            for slot in queue.consumers.iter_mut() {
                if slot.channel_id != self.id {
                    continue;
                }
                if let Some(pos) = slot.unacked.iter().position(|(tag, _)| *tag == delivery_tag) {
                    slot.unacked.remove(pos);
                    acked_on = Some(name.clone());
                    break;
                }
            }
            if acked_on.is_some() {
                break;
            }
        }
        match acked_on {
            Some(name) => {
                Core::pump(&mut state, &name);
                Ok(())
            }
            None => Err(QrpcError::Broker(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn close(&self) {
        self.shutdown();
    }
}
