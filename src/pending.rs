//! Pending-call table: correlates responses with the calls that produced
//! them and bounds how long each caller waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{JsonRpcResponse, RequestId};
use crate::error::LinkError;

/// Outcome delivered to exactly one caller.
pub type CallOutcome = Result<Value, LinkError>;

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One outstanding call. Owned by the table until resolved.
struct PendingCall {
    method: String,
    #[allow(dead_code)] // Held until the call resolves; not read back
    params: Value,
    deadline: Instant,
    reply: oneshot::Sender<CallOutcome>,
    timer: AbortHandle,
}

impl PendingCall {
    /// Cancel the timer and deliver the outcome. Consumes the entry, so a
    /// call can only ever be resolved once.
    fn resolve(self, outcome: CallOutcome) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(outcome);
    }
}

struct TableInner {
    calls: Mutex<HashMap<RequestId, PendingCall>>,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Table of in-flight calls keyed by request id.
///
/// Cheap to clone; all clones share the same table.
#[derive(Clone)]
pub struct PendingCallTable {
    inner: Arc<TableInner>,
}

impl PendingCallTable {
    /// Create a table whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TableInner {
                calls: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Allocate a fresh identifier. Identifiers are never reused for the
    /// lifetime of the table.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
        self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and start its timer.
    ///
    /// Must be called from within a tokio runtime. Returns the receiving half
    /// of the completion channel.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<CallOutcome>, LinkError> {
        let mut calls = self.calls();
        if calls.contains_key(&id) {
            return Err(LinkError::Protocol(format!("Request id {} already in flight", id)));
        }

        let (reply, receiver) = oneshot::channel();

        // Spawned under the lock so the timer cannot observe the table
        // before the entry exists.
        let weak = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        let timeout = self.inner.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, &timer_id);
        })
        .abort_handle();

        calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                params,
                deadline: Instant::now() + timeout,
                reply,
                timer,
            },
        );

        Ok(receiver)
    }

    /// Remove an entry without resolving it (used when the send fails).
    pub fn cancel(&self, id: &RequestId) -> bool {
        let removed = self.calls().remove(id);
        match removed {
            Some(call) => {
                call.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Route a decoded response to its caller.
    ///
    /// Returns `false` when the id is unknown (never issued, already
    /// completed, or already timed out); the response is then dropped.
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let JsonRpcResponse { id, outcome } = response;
        self.settle(&id, outcome.map_err(LinkError::from))
    }

    /// Fail the call `id` with `err`. Same unknown-id rules as `complete`.
    pub fn fail(&self, id: &RequestId, err: LinkError) -> bool {
        self.settle(id, Err(err))
    }

    fn settle(&self, id: &RequestId, outcome: CallOutcome) -> bool {
        let removed = self.calls().remove(id);
        match removed {
            Some(call) => {
                debug!(%id, method = %call.method, "Response received");
                call.resolve(outcome);
                true
            }
            None => {
                warn!(%id, "No pending request found for response, dropping");
                false
            }
        }
    }

    /// Fail every pending call with `reason` and empty the table.
    pub fn drain_all(&self, reason: &LinkError) -> usize {
        let drained: Vec<PendingCall> = self.calls().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.resolve(Err(reason.clone()));
        }
        if count > 0 {
            debug!(count, %reason, "Failed pending calls");
        }
        count
    }

    /// Number of calls currently in flight.
    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.calls().contains_key(id)
    }

    /// Deadline of a pending call, if it is still in the table.
    pub fn deadline(&self, id: &RequestId) -> Option<Instant> {
        self.calls().get(id).map(|call| call.deadline)
    }
}

/// Timer callback: remove the entry and fail it with a timeout.
fn expire(table: &Weak<TableInner>, id: &RequestId) {
    let Some(inner) = table.upgrade() else {
        return;
    };
    let removed = inner
        .calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id);
    if let Some(call) = removed {
        warn!(%id, method = %call.method, timeout = ?inner.timeout, "Request timed out");
        let _ = call.reply.send(Err(LinkError::Timeout(inner.timeout)));
    }
}
