//! In-flight call table, keyed by correlation id.
//!
//! A call registers its correlation id before publishing, then polls
//! [`PendingCallMap::try_take`] until the demultiplexer resolves the entry
//! or the call times out. A reply whose correlation id is absent (the call
//! already timed out and discarded its entry) is dropped.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use qrpc_common::Reply;

struct PendingCall {
    created_at: Instant,
    reply: Option<Reply>,
}

#[derive(Default)]
pub struct PendingCallMap {
    inner: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCallMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot for a call about to be published.
    pub async fn register(&self, correlation_id: &str) {
        self.inner.lock().await.insert(
            correlation_id.to_string(),
            PendingCall {
                created_at: Instant::now(),
                reply: None,
            },
        );
    }

    /// Stores a reply for a waiting call. Returns false when no call is
    /// waiting under that id, in which case the reply is dropped.
    pub async fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(correlation_id) {
            Some(pending) => {
                pending.reply = Some(reply);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the reply if it has arrived. The entry stays in
    /// place while unresolved so a late reply can still land.
    pub async fn try_take(&self, correlation_id: &str) -> Option<Reply> {
        let mut inner = self.inner.lock().await;
        let resolved = inner
            .get(correlation_id)
            .is_some_and(|p| p.reply.is_some());
        if resolved {
            inner.remove(correlation_id).and_then(|p| p.reply)
        } else {
            None
        }
    }

    /// Abandons a call; any reply that arrives later is dropped.
    pub async fn discard(&self, correlation_id: &str) {
        self.inner.lock().await.remove(correlation_id);
    }

    /// Age of an unresolved entry, if present.
    pub async fn age(&self, correlation_id: &str) -> Option<std::time::Duration> {
        self.inner
            .lock()
            .await
            .get(correlation_id)
            .map(|p| p.created_at.elapsed())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
