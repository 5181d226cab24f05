//! Ordered dispatch queue.
//!
//! A single-consumer job channel. Inbound transport traffic, call
//! registration, timeouts, close requests, wait-operation results and
//! read-only queries all travel through it, so the [`Dispatcher`] sees them
//! in one total order and is the only code that mutates session, call and
//! realm state.
//!
//! Registration is enqueued before the request is written to the
//! transport, so a response can never be processed ahead of its call.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::identifiers::{CallId, SessionId, WaitId};
use crate::protocol::TargetInfo;
use crate::realm::RealmShared;
use crate::realm::tasks::NewWait;
use crate::session::SessionShared;
use crate::transport::TransportEvent;

use super::dispatcher::Dispatcher;
use super::pending::PendingCall;

// ============================================================================
// Job
// ============================================================================

/// Query run against dispatcher state.
pub(crate) type Exec = Box<dyn FnOnce(&mut Dispatcher) + Send>;

/// One unit of work for the dispatcher.
pub(crate) enum Job {
    /// Message or close notification from the transport.
    Inbound(TransportEvent),

    /// A call is about to be written.
    Register { id: CallId, call: PendingCall },

    /// The write for a call failed.
    Fail { id: CallId, error: Error },

    /// The caller's timeout elapsed.
    Expire { id: CallId, timeout_ms: u64 },

    /// Close the connection.
    Close {
        reason: String,
        done: Option<oneshot::Sender<()>>,
    },

    /// Close one session and its subtree.
    CloseSession {
        session: SessionId,
        reason: String,
        done: oneshot::Sender<bool>,
    },

    /// Attach a session without a peer event.
    Attach {
        parent: Option<SessionId>,
        session: SessionId,
        target: TargetInfo,
        done: oneshot::Sender<Option<Arc<SessionShared>>>,
    },

    /// Register a wait-operation on a realm.
    RegisterWait {
        realm: Arc<RealmShared>,
        wait: NewWait,
        timer: Option<JoinHandle<()>>,
    },

    /// Settle a wait-operation (`generation` = `None` settles any generation).
    SettleWait {
        id: WaitId,
        generation: Option<u64>,
        outcome: Result<Value>,
    },

    /// Read or adjust state in queue order.
    Exec(Exec),
}

// ============================================================================
// DispatchQueue
// ============================================================================

/// Producer side of the dispatch queue.
#[derive(Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DispatchQueue {
    /// Creates the queue and its single consumer end.
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues a job. Returns `false` once the dispatcher stopped.
    #[inline]
    pub(crate) fn push(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Job {
        Job::Inbound(TransportEvent::Message(text.to_string()))
    }

    #[test]
    fn test_jobs_arrive_in_push_order() {
        let (queue, mut rx) = DispatchQueue::new();
        let other = queue.clone();

        assert!(queue.push(message("a")));
        assert!(other.push(message("b")));
        assert!(queue.push(message("c")));

        let mut seen = Vec::new();
        while let Ok(Job::Inbound(TransportEvent::Message(text))) = rx.try_recv() {
            seen.push(text);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_push_fails_once_consumer_is_gone() {
        let (queue, rx) = DispatchQueue::new();
        drop(rx);
        assert!(!queue.push(message("late")));
    }
}
