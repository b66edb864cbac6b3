//! Pending-request table: correlation id → single-resolution reply slot.
//!
//! Whoever removes the entry from the table owns the outcome. A response
//! resolving after the timer fired finds nothing and becomes a no-op; a
//! timer firing after a response was delivered finds nothing and reads the
//! reply that is already in the channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gx_protocol::Reply;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct PendingEntry {
    tx: oneshot::Sender<Reply>,
    deadline: Instant,
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Reply(Reply),
    TimedOut,
    /// The slot was dropped without a reply.
    Dropped,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` until a reply arrives or `timeout` elapses. Dropping the
    /// returned waiter removes the entry.
    pub fn register(self: &Arc<Self>, id: impl Into<String>, timeout: Duration) -> PendingWaiter {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let prev = self.inner.lock().insert(
            id.clone(),
            PendingEntry {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        debug_assert!(prev.is_none(), "correlation id collision: {id}");

        PendingWaiter {
            table: Arc::clone(self),
            id,
            rx,
            timeout,
        }
    }

    /// Deliver `reply` to the request `id`. Returns `false` when no entry
    /// exists (already resolved, timed out, or never tracked).
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let Some(entry) = self.inner.lock().remove(id) else {
            tracing::debug!(correlation_id = %id, "no pending request for response, dropping");
            return false;
        };
        let now = Instant::now();
        if now > entry.deadline {
            tracing::debug!(
                correlation_id = %id,
                late_ms = (now - entry.deadline).as_millis() as u64,
                "response arrived after deadline, before the timer fired"
            );
        }
        // The receiver may have been dropped by a cancelled caller.
        entry.tx.send(reply).is_ok()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Resolve every outstanding request with a failure reply.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.inner.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(correlation_id = %id, reason, "failing pending request");
            let _ = entry.tx.send(Reply::err(reason));
        }
        count
    }
}

/// Caller side of a pending request.
pub struct PendingWaiter {
    table: Arc<PendingRequests>,
    id: String,
    rx: oneshot::Receiver<Reply>,
    timeout: Duration,
}

impl PendingWaiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the reply or the deadline, whichever removes the entry
    /// first.
    pub async fn wait(mut self) -> WaitOutcome {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(reply)) => WaitOutcome::Reply(reply),
            Ok(Err(_)) => WaitOutcome::Dropped,
            Err(_) => {
                if self.table.remove(&self.id) {
                    tracing::debug!(correlation_id = %self.id, "pending request timed out");
                    return WaitOutcome::TimedOut;
                }
                // Lost the race: a resolver took the entry, so the reply is
                // already in the channel.
                match self.rx.try_recv() {
                    Ok(reply) => WaitOutcome::Reply(reply),
                    Err(_) => WaitOutcome::Dropped,
                }
            }
        }
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn response_resolves_waiter() {
        let table = Arc::new(PendingRequests::new());
        let waiter = table.register("req-1", Duration::from_secs(5));
        assert!(table.contains("req-1"));

        assert!(table.resolve("req-1", Reply::ok(json!({"pong": true}))));
        assert_eq!(waiter.wait().await, WaitOutcome::Reply(Reply::ok(json!({"pong": true}))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn second_resolve_is_noop() {
        let table = Arc::new(PendingRequests::new());
        let _waiter = table.register("req-1", Duration::from_secs(5));
        assert!(table.resolve("req-1", Reply::ok(json!(1))));
        assert!(!table.resolve("req-1", Reply::ok(json!(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_no_entry() {
        let table = Arc::new(PendingRequests::new());
        let waiter = table.register("req-1", Duration::from_millis(2000));

        let started = Instant::now();
        assert_eq!(waiter.wait().await, WaitOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed < Duration::from_millis(2100));
        assert!(table.is_empty());

        // A response after the timeout finds nothing.
        assert!(!table.resolve("req-1", Reply::ok(json!(null))));
    }

    #[tokio::test]
    async fn dropping_waiter_removes_entry() {
        let table = Arc::new(PendingRequests::new());
        let waiter = table.register("req-1", Duration::from_secs(5));
        assert_eq!(table.len(), 1);
        drop(waiter);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_resolves_with_error() {
        let table = Arc::new(PendingRequests::new());
        let a = table.register("a", Duration::from_secs(5));
        let b = table.register("b", Duration::from_secs(5));

        assert_eq!(table.fail_all("shutdown"), 2);
        assert!(table.is_empty());
        assert_eq!(a.wait().await, WaitOutcome::Reply(Reply::err("shutdown")));
        assert_eq!(b.wait().await, WaitOutcome::Reply(Reply::err("shutdown")));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolvers_deliver_once() {
        let table = Arc::new(PendingRequests::new());
        let waiter = table.register("req-1", Duration::from_secs(1));

        let mut handles = Vec::new();
        for i in 0..8 {
            let t = table.clone();
            handles.push(tokio::spawn(async move { t.resolve("req-1", Reply::ok(json!(i))) }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(matches!(waiter.wait().await, WaitOutcome::Reply(r) if r.success));
    }
}
