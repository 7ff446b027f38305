//! Queue declaration arguments: the admission-control policy.
//!
//! Task queues are declared with a bounded length, a message TTL, and
//! reject-on-overflow. Once the queue is full the broker nacks further
//! publishes instead of buffering unboundedly; that nack is the system's
//! only backpressure signal and surfaces to callers as a 503.

/// Maximum jobs that can be queued before publishes are rejected.
pub const DEFAULT_MAX_LENGTH: u32 = 1000;
/// Queued message time-to-live in milliseconds.
pub const DEFAULT_MESSAGE_TTL_MS: u32 = 5000;
/// Overflow behavior for bounded queues: reject the new publish with a nack.
pub const OVERFLOW_REJECT_PUBLISH: &str = "reject-publish";

/// Declaration parameters for one queue.
///
/// Producer and consumer must declare identical arguments; the broker
/// refuses a redeclaration with different ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    /// Queue name. Empty means the broker generates one (reply queues).
    pub name: String,
    pub max_length: Option<u32>,
    pub message_ttl_ms: Option<u32>,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueDescriptor {
    /// A bounded task queue with the default admission arguments.
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_length: Some(DEFAULT_MAX_LENGTH),
            message_ttl_ms: Some(DEFAULT_MESSAGE_TTL_MS),
            exclusive: false,
            auto_delete: false,
        }
    }

    /// An exclusive auto-delete reply queue with a broker-generated name.
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            max_length: None,
            message_ttl_ms: None,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn with_limits(mut self, max_length: u32, message_ttl_ms: u32) -> Self {
        self.max_length = Some(max_length);
        self.message_ttl_ms = Some(message_ttl_ms);
        self
    }

    /// Whether two declarations carry compatible admission arguments.
    pub fn args_match(&self, other: &QueueDescriptor) -> bool {
        self.max_length == other.max_length && self.message_ttl_ms == other.message_ttl_ms
    }
}
