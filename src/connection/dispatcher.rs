//! Dispatcher task.
//!
//! The single consumer of the dispatch queue. It owns the pending call
//! table, the session tree and the realm registry; no other code mutates
//! them. Jobs are handled one at a time, to completion, in queue order.
//!
//! # Routing
//!
//! | Inbound | Handling |
//! |---------|----------|
//! | Response, known or untagged session | resolve pending call |
//! | Response, unknown session | drop (counted) |
//! | Event, unknown scope | drop (counted) |
//! | Event, lifecycle | apply, then broadcast |
//! | Event, other | broadcast |
//! | Undecodable | drop (counted, logged) |

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::identifiers::{CallId, SessionId};
use crate::protocol::{Event, Incoming, Lifecycle, Protocol, Response, TargetInfo};
use crate::realm::tasks::NewWait;
use crate::realm::{RealmChange, RealmRegistry, RealmShared};
use crate::session::{SessionShared, SessionTree};
use crate::transport::{Transport, TransportEvent};

use super::core::{CloseState, Connection, ConnectionInner};
use super::events::ConnectionEvent;
use super::pending::{PendingCall, PendingCallTable};
use super::queue::Job;

// ============================================================================
// Close Reasons
// ============================================================================

const CONTEXT_DESTROYED: &str = "execution context destroyed";
const CONTEXTS_CLEARED: &str = "execution contexts cleared";

// ============================================================================
// DispatchStats
// ============================================================================

/// Dispatcher counters, read in queue order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Calls awaiting a response.
    pub pending: usize,
    /// Calls resolved so far (response, timeout or close).
    pub resolved: u64,
    /// Responses that matched no pending call.
    pub unmatched: u64,
    /// Messages dropped because their session is not attached.
    pub dropped: u64,
    /// Messages that could not be decoded.
    pub malformed: u64,
    /// Attached sessions.
    pub sessions: usize,
    /// Live realms.
    pub realms: usize,
    /// Registered wait-operations.
    pub waits: usize,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub(crate) struct Dispatcher {
    pub(crate) pending: PendingCallTable,
    pub(crate) sessions: SessionTree,
    pub(crate) realms: RealmRegistry,
    protocol: Protocol,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: Arc<CloseState>,
    connection: Weak<ConnectionInner>,
    dropped: u64,
    malformed: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<ConnectionEvent>,
        closed: Arc<CloseState>,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            pending: PendingCallTable::default(),
            sessions: SessionTree::default(),
            realms: RealmRegistry::default(),
            protocol,
            transport,
            events,
            closed,
            connection,
            dropped: 0,
            malformed: 0,
        }
    }

    /// Consumes jobs until every queue producer is gone.
    pub(crate) async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            self.handle(job);
        }
        self.close("dispatcher stopped");
        debug!("Dispatcher terminated");
    }

    pub(crate) fn handle(&mut self, job: Job) {
        match job {
            Job::Inbound(TransportEvent::Message(text)) => self.on_message(&text),
            Job::Inbound(TransportEvent::Closed(reason)) => self.close(&reason),
            Job::Register { id, call } => self.on_register(id, call),
            Job::Fail { id, error } => {
                self.pending.fail(id, error);
            }
            Job::Expire { id, timeout_ms } => {
                self.pending.expire(id, timeout_ms);
            }
            Job::Close { reason, done } => {
                self.close(&reason);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Job::CloseSession { session, reason, done } => {
                let closed = self.close_session(&session, &reason);
                let _ = done.send(closed);
            }
            Job::Attach {
                parent,
                session,
                target,
                done,
            } => {
                let _ = done.send(self.attach(parent, session, target));
            }
            Job::RegisterWait { realm, wait, timer } => self.on_register_wait(&realm, wait, timer),
            Job::SettleWait {
                id,
                generation,
                outcome,
            } => {
                self.realms.settle_wait(id, generation, outcome);
            }
            Job::Exec(exec) => exec(self),
        }
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        DispatchStats {
            pending: self.pending.len(),
            resolved: self.pending.resolved(),
            unmatched: self.pending.unmatched(),
            dropped: self.dropped,
            malformed: self.malformed,
            sessions: self.sessions.len(),
            realms: self.realms.len(),
            waits: self.realms.wait_count(),
        }
    }

    fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(Connection::from_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Dispatcher - Calls
// ============================================================================

impl Dispatcher {
    fn on_register(&mut self, id: CallId, call: PendingCall) {
        if let Some(reason) = self.closed.reason() {
            call.resolve(Err(Error::transport_closed(reason)));
            return;
        }
        if let Some(session) = call.session_id()
            && !self.sessions.contains(session)
        {
            let error = Error::session_closed(session.clone(), "session not attached");
            call.resolve(Err(error));
            return;
        }
        self.pending.insert(id, call);
    }
}

// ============================================================================
// Dispatcher - Inbound
// ============================================================================

impl Dispatcher {
    fn on_message(&mut self, text: &str) {
        if self.closed.is_closed() {
            trace!("Ignoring message after close");
            return;
        }

        match self.protocol.decode(text) {
            Ok(Incoming::Response(response)) => self.on_response(response),
            Ok(Incoming::Event(event)) => self.on_event(event),
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, len = text.len(), "Dropping malformed message");
            }
        }
    }

    fn on_response(&mut self, response: Response) {
        if self.protocol.tags_sessions()
            && let Some(session) = &response.session_id
            && !self.sessions.contains(session)
        {
            self.dropped += 1;
            trace!(call_id = %response.id, session = %session, "Dropping response for unknown session");
            return;
        }
        self.pending.complete(response);
    }

    fn on_event(&mut self, event: Event) {
        let scope = self.protocol.event_scope(&event);
        if let Some(session) = &scope
            && !self.sessions.contains(session)
        {
            self.dropped += 1;
            trace!(method = %event.method, session = %session, "Dropping event for unknown session");
            return;
        }

        if let Some(lifecycle) = self.protocol.lifecycle(&event) {
            self.apply(lifecycle);
        }
        self.emit(ConnectionEvent::Protocol { scope, event });
    }

    fn apply(&mut self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Attached {
                parent,
                session,
                target,
            } => {
                self.attach(parent, session, target);
            }

            Lifecycle::Detached { session, reason } => {
                self.close_session(&session, &reason);
            }

            Lifecycle::ContextCreated { session, context } => {
                if let Some(id) = &session
                    && !self.sessions.contains(id)
                {
                    self.dropped += 1;
                    trace!(session = %id, remote = %context.remote, "Context for unknown session");
                    return;
                }

                let connection = self.connection();
                match self.realms.context_created(session, context, connection.as_ref()) {
                    RealmChange::Created(info) => {
                        debug!(realm = %info.id, owner = %info.owner, "Realm created");
                        self.emit(ConnectionEvent::RealmCreated(info));
                    }
                    RealmChange::Updated { previous, current } => {
                        debug!(previous = %previous, realm = %current.id, owner = %current.owner, "Realm replaced");
                        self.emit(ConnectionEvent::RealmUpdated { previous, current });
                    }
                }
            }

            Lifecycle::ContextDestroyed { session, remote } => {
                if let Some(info) = self.realms.context_destroyed(session.as_ref(), &remote, CONTEXT_DESTROYED) {
                    self.emit_destroyed(vec![info], CONTEXT_DESTROYED);
                }
            }

            Lifecycle::ContextsCleared { session } => {
                let destroyed = self.realms.contexts_cleared(session.as_ref(), CONTEXTS_CLEARED);
                self.emit_destroyed(destroyed, CONTEXTS_CLEARED);
            }

            Lifecycle::OwnerGone {
                session,
                owner,
                reason,
            } => {
                let destroyed = self.realms.owner_gone(session.as_ref(), &owner, &reason);
                self.emit_destroyed(destroyed, &reason);
            }
        }
    }

    fn emit_destroyed(&self, realms: Vec<crate::realm::RealmInfo>, reason: &str) {
        for realm in realms {
            self.emit(ConnectionEvent::RealmDestroyed {
                realm,
                reason: reason.to_string(),
            });
        }
    }
}

// ============================================================================
// Dispatcher - Sessions
// ============================================================================

impl Dispatcher {
    fn attach(
        &mut self,
        parent: Option<SessionId>,
        session: SessionId,
        target: TargetInfo,
    ) -> Option<Arc<SessionShared>> {
        if self.closed.is_closed() {
            return None;
        }

        let Some(shared) = self.sessions.attach(parent.clone(), session.clone(), target.clone()) else {
            debug!(session = %session, "Ignoring duplicate or orphaned attach");
            return None;
        };

        debug!(session = %session, parent = ?parent, kind = %target.kind, "Session attached");
        self.emit(ConnectionEvent::SessionAttached {
            parent,
            session,
            target,
        });
        Some(shared)
    }

    /// Closes `id` and its subtree, children first.
    ///
    /// Returns `false` if the session was not attached.
    fn close_session(&mut self, id: &SessionId, reason: &str) -> bool {
        let removed = self.sessions.detach(id);
        if removed.is_empty() {
            return false;
        }

        for shared in removed {
            let session = shared.id().clone();
            shared.mark_closed(reason);
            self.pending
                .fail_session(&session, || Error::session_closed(session.clone(), reason));
            let destroyed = self.realms.destroy_session(&session, reason, |info| {
                Error::realm_destroyed(info.id, info.owner.to_string(), reason)
            });
            self.emit_destroyed(destroyed, reason);

            debug!(session = %session, reason, "Session closed");
            self.emit(ConnectionEvent::SessionDetached {
                parent: shared.parent().cloned(),
                session,
                reason: reason.to_string(),
            });
        }
        true
    }

    /// Closes the connection. Only the first call has any effect.
    fn close(&mut self, reason: &str) {
        if !self.closed.mark(reason) {
            return;
        }
        info!(
            reason,
            pending = self.pending.len(),
            sessions = self.sessions.len(),
            "Connection closed"
        );

        for shared in self.sessions.drain_all() {
            let session = shared.id().clone();
            shared.mark_closed(reason);
            self.pending
                .fail_session(&session, || Error::transport_closed(reason));
            let destroyed = self
                .realms
                .destroy_session(&session, reason, |_| Error::transport_closed(reason));
            self.emit_destroyed(destroyed, reason);
            self.emit(ConnectionEvent::SessionDetached {
                parent: shared.parent().cloned(),
                session,
                reason: reason.to_string(),
            });
        }

        self.pending.drain(|| Error::transport_closed(reason));
        let destroyed = self.realms.destroy_all(reason, |_| Error::transport_closed(reason));
        self.emit_destroyed(destroyed, reason);

        self.transport.close();
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

// ============================================================================
// Dispatcher - Wait Operations
// ============================================================================

impl Dispatcher {
    fn on_register_wait(&mut self, realm: &Arc<RealmShared>, wait: NewWait, timer: Option<JoinHandle<()>>) {
        if let Some(reason) = self.closed.reason() {
            wait.reject(timer, Error::transport_closed(reason));
            return;
        }
        let connection = self.connection();
        self.realms.register_wait(realm, wait, timer, connection.as_ref());
    }
}

// ============================================================================
// Tests
// ============================================================================
