//! # Pending-Response Registry
//!
//! Every outbound request that wants a reply registers here before the
//! first transport send. Each entry owns a deadline task and a handler,
//! with the contract:
//!
//! - the handler fires at most `expected` times with real payloads;
//! - if the deadline passes first, it fires exactly once more with
//!   [`ResponseEvent::Timeout`];
//! - payloads arriving after the deadline are dropped silently;
//! - cancellation stops all further invocation;
//! - shutdown resolves every outstanding entry with
//!   [`ResponseEvent::Cancelled`].
//!
//! Task ids come from a process-wide monotonic counter starting at 1, so
//! an absent correlation id can be encoded as zero/`None` on the wire.
//!
//! Handlers run under the registry lock; they must not call back into the
//! registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::error::RoutingError;
use crate::message::Message;

pub type TaskId = u64;

/// What a registered handler is invoked with.
pub enum ResponseEvent {
    /// A response arrived in time.
    Payload(Message),
    /// The deadline fired with responses still outstanding.
    Timeout,
    /// The node shut down.
    Cancelled,
    /// The forwarder gave up before any hop accepted the request.
    Failed(RoutingError),
}

pub type ResponseHandler = Box<dyn FnMut(ResponseEvent) + Send>;

struct PendingResponse {
    expected: usize,
    received: usize,
    handler: ResponseHandler,
}

#[derive(Clone)]
pub struct ResponseRegistry {
    entries: Arc<Mutex<HashMap<TaskId, PendingResponse>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Register a handler expecting up to `expected` responses before
    /// `timeout`. Returns the correlation id to stamp on the request.
    ///
    /// Must be called from within a tokio runtime: the deadline is a
    /// spawned sleep task.
    pub fn add_task(
        &self,
        timeout: Duration,
        expected: usize,
        handler: ResponseHandler,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            id,
            PendingResponse {
                expected,
                received: 0,
                handler,
            },
        );
        trace!(task = id, expected, ?timeout, "pending response registered");

        let entries = self.entries.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(mut entry) = entries.lock().remove(&id) {
                debug!(
                    task = id,
                    received = entry.received,
                    expected = entry.expected,
                    "response deadline expired"
                );
                (entry.handler)(ResponseEvent::Timeout);
            }
        });

        id
    }

    /// Deliver a response to its entry. Unknown or expired ids are
    /// dropped silently.
    pub fn execute_task(&self, id: TaskId, response: Message) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.received += 1;
                (entry.handler)(ResponseEvent::Payload(response));
                if entry.received >= entry.expected {
                    trace!(task = id, "pending response complete");
                    entries.remove(&id);
                }
            }
            None => {
                trace!(task = id, "late response dropped");
            }
        }
    }

    /// Resolve an entry with a failure marker (e.g. no route was found).
    pub fn fail_task(&self, id: TaskId, error: RoutingError) {
        if let Some(mut entry) = self.entries.lock().remove(&id) {
            debug!(task = id, %error, "pending response failed");
            (entry.handler)(ResponseEvent::Failed(error));
        }
    }

    /// Remove an entry without invoking its handler again.
    pub fn cancel_task(&self, id: TaskId) {
        if self.entries.lock().remove(&id).is_some() {
            trace!(task = id, "pending response cancelled");
        }
    }

    /// Shutdown path: fire every outstanding handler once with the
    /// cancellation marker and clear the registry.
    pub fn resolve_all_cancelled(&self) {
        let drained: Vec<PendingResponse> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling outstanding responses");
        }
        for mut entry in drained {
            (entry.handler)(ResponseEvent::Cancelled);
        }
    }
}
