//! Pending call table.
//!
//! Maps each outstanding [`CallId`] to the caller awaiting it. Every entry
//! is resolved exactly once: by its response, its timeout, a session close
//! or the connection close, whichever the dispatch queue processes first.
//! Resolving consumes the entry, so a second resolution for the same id
//! finds nothing and is counted as unmatched instead.

// ============================================================================
// Imports
// ============================================================================

use std::time::Instant;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CallId, SessionId};
use crate::protocol::Response;

// ============================================================================
// PendingCall
// ============================================================================

/// Single-resolution slot for one outstanding call.
pub(crate) struct PendingCall {
    /// Method, used to label errors.
    method: String,
    /// Session the call was issued on.
    session_id: Option<SessionId>,
    /// When the call was registered.
    started: Instant,
    /// Caller waiting for the outcome (`None` for fire-and-forget sends).
    slot: Option<oneshot::Sender<Result<Value>>>,
}

impl PendingCall {
    /// Creates a pending call.
    pub(crate) fn new(
        method: impl Into<String>,
        session_id: Option<SessionId>,
        slot: Option<oneshot::Sender<Result<Value>>>,
    ) -> Self {
        Self {
            method: method.into(),
            session_id,
            started: Instant::now(),
            slot,
        }
    }

    /// Returns the method name.
    #[inline]
    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// Returns the session the call belongs to.
    #[inline]
    pub(crate) fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Delivers the outcome, consuming the call.
    pub(crate) fn resolve(self, outcome: Result<Value>) {
        match self.slot {
            Some(slot) => {
                // Receiver may have been dropped by a cancelled caller.
                let _ = slot.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    debug!(method = %self.method, error = %e, "Fire-and-forget call failed");
                }
            }
        }
    }
}

// ============================================================================
// PendingCallTable
// ============================================================================

/// Outstanding calls keyed by id, owned by the dispatch queue.
#[derive(Default)]
pub(crate) struct PendingCallTable {
    calls: FxHashMap<CallId, PendingCall>,
    resolved: u64,
    unmatched: u64,
}

impl PendingCallTable {
    /// Registers a call.
    ///
    /// Ids are never reused, so a duplicate means a caller bug; the newer
    /// call is failed rather than replacing the older one.
    pub(crate) fn insert(&mut self, id: CallId, call: PendingCall) {
        if self.calls.contains_key(&id) {
            warn!(call_id = %id, "Duplicate call id");
            call.resolve(Err(Error::invalid_argument(format!("call id {id} already pending"))));
            return;
        }
        trace!(call_id = %id, method = %call.method, "Call registered");
        self.calls.insert(id, call);
    }

    /// Resolves a call with its response.
    ///
    /// Returns `false` (and counts it) if no call with that id is pending.
    pub(crate) fn complete(&mut self, response: Response) -> bool {
        let id = response.id;
        let Some(call) = self.calls.remove(&id) else {
            self.unmatched += 1;
            warn!(call_id = %id, "Response for unknown call");
            return false;
        };

        trace!(
            call_id = %id,
            method = %call.method,
            elapsed_ms = call.started.elapsed().as_millis() as u64,
            success = response.is_success(),
            "Call resolved"
        );

        let outcome = response.into_result(&call.method);
        self.resolved += 1;
        call.resolve(outcome);
        true
    }

    /// Fails one call with `error`.
    pub(crate) fn fail(&mut self, id: CallId, error: Error) -> bool {
        let Some(call) = self.calls.remove(&id) else {
            return false;
        };
        debug!(call_id = %id, method = %call.method, error = %error, "Call failed");
        self.resolved += 1;
        call.resolve(Err(error));
        true
    }

    /// Fails one call with a timeout error naming its method.
    pub(crate) fn expire(&mut self, id: CallId, timeout_ms: u64) -> bool {
        let Some(call) = self.calls.remove(&id) else {
            return false;
        };
        debug!(call_id = %id, method = %call.method, timeout_ms, "Call timed out");
        let error = Error::call_timeout(call.method.as_str(), id, timeout_ms);
        self.resolved += 1;
        call.resolve(Err(error));
        true
    }

    /// Fails every call issued on `session`.
    pub(crate) fn fail_session(&mut self, session: &SessionId, error: impl Fn() -> Error) -> usize {
        let ids: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.session_id() == Some(session))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(call) = self.calls.remove(id) {
                self.resolved += 1;
                call.resolve(Err(error()));
            }
        }

        if !ids.is_empty() {
            debug!(session = %session, count = ids.len(), "Failed session calls");
        }
        ids.len()
    }

    /// Fails every remaining call, in id order.
    pub(crate) fn drain(&mut self, error: impl Fn() -> Error) -> usize {
        let mut calls: Vec<(CallId, PendingCall)> = self.calls.drain().collect();
        calls.sort_unstable_by_key(|(id, _)| *id);
        let count = calls.len();

        for (_, call) in calls {
            self.resolved += 1;
            call.resolve(Err(error()));
        }

        if count > 0 {
            debug!(count, "Failed pending calls on close");
        }
        count
    }

    /// Number of outstanding calls.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Total calls resolved so far.
    #[inline]
    pub(crate) fn resolved(&self) -> u64 {
        self.resolved
    }

    /// Responses (or resolutions) that found no pending call.
    #[inline]
    pub(crate) fn unmatched(&self) -> u64 {
        self.unmatched
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteError;
    use serde_json::json;

    fn call(method: &str, session: Option<&str>) -> (PendingCall, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (PendingCall::new(method, session.map(SessionId::from), Some(tx)), rx)
    }

    fn ok_response(id: u64) -> Response {
        Response {
            id: CallId::new(id),
            session_id: None,
            outcome: Ok(json!({"ok": true})),
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let mut table = PendingCallTable::default();
        let (pending, rx) = call("Foo.bar", None);
        table.insert(CallId::new(1), pending);

        assert!(table.complete(ok_response(1)));
        assert!(!table.complete(ok_response(1)));
        assert!(!table.expire(CallId::new(1), 10));

        assert_eq!(rx.await.expect("slot").expect("ok"), json!({"ok": true}));
        assert_eq!(table.resolved(), 1);
        assert_eq!(table.unmatched(), 1);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_is_labelled_with_method() {
        let mut table = PendingCallTable::default();
        let (pending, rx) = call("Page.navigate", None);
        table.insert(CallId::new(4), pending);

        table.complete(Response {
            id: CallId::new(4),
            session_id: None,
            outcome: Err(RemoteError::from_wire(
                Some(json!({"code": -32000, "message": "Cannot navigate"})),
                None,
            )),
        });

        let err = rx.await.expect("slot").expect_err("protocol error");
        assert!(matches!(err, Error::Protocol { ref method, code: Some(-32000), .. } if method == "Page.navigate"));
    }

    #[tokio::test]
    async fn test_expire_wins_over_late_response() {
        let mut table = PendingCallTable::default();
        let (pending, rx) = call("Slow.call", None);
        table.insert(CallId::new(2), pending);

        assert!(table.expire(CallId::new(2), 50));
        assert!(!table.complete(ok_response(2)));

        let err = rx.await.expect("slot").expect_err("timeout");
        assert!(err.is_timeout());
        assert_eq!(err.reason(), "Slow.call");
    }

    #[tokio::test]
    async fn test_fail_session_leaves_other_calls() {
        let mut table = PendingCallTable::default();
        let (a, rx_a) = call("A.a", Some("S1"));
        let (b, rx_b) = call("B.b", Some("S2"));
        let (c, _rx_c) = call("C.c", None);
        table.insert(CallId::new(1), a);
        table.insert(CallId::new(2), b);
        table.insert(CallId::new(3), c);

        let session = SessionId::from("S1");
        let failed = table.fail_session(&session, || Error::session_closed(session.clone(), "detached"));

        assert_eq!(failed, 1);
        assert_eq!(table.len(), 2);
        assert!(rx_a.await.expect("slot").expect_err("closed").is_closed());
        drop(rx_b);
    }

    #[tokio::test]
    async fn test_drain_fails_everything_with_reason() {
        let mut table = PendingCallTable::default();
        let (a, rx_a) = call("A.a", None);
        let (b, rx_b) = call("B.b", Some("S"));
        table.insert(CallId::new(1), a);
        table.insert(CallId::new(2), b);

        assert_eq!(table.drain(|| Error::transport_closed("bye")), 2);

        for rx in [rx_a, rx_b] {
            let err = rx.await.expect("slot").expect_err("closed");
            assert_eq!(err.reason(), "bye");
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_fails_newer_call() {
        let mut table = PendingCallTable::default();
        let (first, _rx_first) = call("A.a", None);
        let (second, rx_second) = call("B.b", None);
        table.insert(CallId::new(1), first);
        table.insert(CallId::new(1), second);

        assert_eq!(table.len(), 1);
        assert!(rx_second.await.expect("slot").is_err());
    }

    #[test]
    fn test_fire_and_forget_resolution() {
        let mut table = PendingCallTable::default();
        table.insert(CallId::new(9), PendingCall::new("Log.enable", None, None));

        assert!(table.complete(ok_response(9)));
        assert_eq!(table.resolved(), 1);
    }
}
