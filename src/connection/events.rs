//! Connection events and the event-to-signal adapter.
//!
//! Every protocol event and every lifecycle transition the dispatcher
//! performs is broadcast as a [`ConnectionEvent`]. Subscribers either
//! consume the stream directly ([`EventStream`]) or wait for one matching
//! occurrence ([`EventSignal`]).
//!
//! # Example
//!
//! ```ignore
//! // Subscribe before triggering the action that produces the event.
//! let loaded = session.wait_for_event("Page.loadEventFired");
//! session.send_and_wait("Page.navigate", json!({"url": url})).await?;
//! let event = loaded.wait(Duration::from_secs(10)).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{Error, Result};
use crate::identifiers::{RealmId, SessionId};
use crate::protocol::{Event, TargetInfo};
use crate::realm::RealmInfo;

use super::core::CloseState;

// ============================================================================
// ConnectionEvent
// ============================================================================

/// Notification broadcast by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A protocol event, after any lifecycle change it caused was applied.
    Protocol {
        /// Session the event belongs to (`None` = connection root).
        scope: Option<SessionId>,
        /// The event.
        event: Event,
    },

    /// A session attached.
    SessionAttached {
        /// Parent session (`None` = connection root).
        parent: Option<SessionId>,
        /// New session.
        session: SessionId,
        /// Target metadata.
        target: TargetInfo,
    },

    /// A session closed. Emitted children first.
    SessionDetached {
        /// Parent session (`None` = connection root).
        parent: Option<SessionId>,
        /// Closed session.
        session: SessionId,
        /// Close reason.
        reason: String,
    },

    /// A realm appeared for a new (frame/worker, sandbox) pair.
    RealmCreated(RealmInfo),

    /// A realm replaced an earlier generation of the same pair.
    RealmUpdated {
        /// Replaced realm.
        previous: RealmId,
        /// New realm.
        current: RealmInfo,
    },

    /// A realm was destroyed.
    RealmDestroyed {
        /// Destroyed realm.
        realm: RealmInfo,
        /// Why it went away.
        reason: String,
    },

    /// The connection closed. Emitted once, last.
    Disconnected {
        /// Close reason.
        reason: String,
    },
}

impl ConnectionEvent {
    /// Returns the protocol event if this is one.
    #[must_use]
    pub fn as_protocol(&self) -> Option<(&Option<SessionId>, &Event)> {
        match self {
            Self::Protocol { scope, event } => Some((scope, event)),
            _ => None,
        }
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// Receiver of [`ConnectionEvent`]s.
///
/// A slow subscriber that falls more than the channel capacity behind
/// skips the missed events (logged) rather than blocking the dispatcher.
pub struct EventStream {
    rx: broadcast::Receiver<ConnectionEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<ConnectionEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event. Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// EventSignal
// ============================================================================

/// One-shot completion signal fed by a matching event.
///
/// The subscription is taken when the signal is created, so events that
/// happen between creation and [`wait`](Self::wait) are not missed. A
/// [`ConnectionEvent::Disconnected`] fails the signal with
/// [`Error::TransportClosed`]; the selector may fail it earlier by
/// returning `Some(Err(_))`.
pub struct EventSignal<T> {
    rx: oneshot::Receiver<Result<T>>,
    adapter: JoinHandle<()>,
    description: String,
}

impl<T: Send + 'static> EventSignal<T> {
    /// Starts the adapter task.
    pub(crate) fn new<F>(
        mut stream: EventStream,
        closed: Arc<CloseState>,
        description: impl Into<String>,
        mut select: F,
    ) -> Self
    where
        F: FnMut(&ConnectionEvent) -> Option<Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let adapter = tokio::spawn(async move {
            // The close flag is set before Disconnected is broadcast, so a
            // subscriber either sees the flag here or receives the event.
            let outcome = match closed.reason() {
                Some(reason) => Err(Error::transport_closed(reason)),
                None => loop {
                    match stream.recv().await {
                        Some(event) => {
                            if let Some(outcome) = select(&event) {
                                break outcome;
                            }
                            if let ConnectionEvent::Disconnected { reason } = event {
                                break Err(Error::transport_closed(reason));
                            }
                        }
                        None => break Err(closed.error()),
                    }
                },
            };
            let _ = tx.send(outcome);
        });

        Self {
            rx,
            adapter,
            description: description.into(),
        }
    }

    /// Waits for the signal.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing matched within `limit`
    /// - [`Error::TransportClosed`] if the connection closed first
    pub async fn wait(mut self, limit: Duration) -> Result<T> {
        match timeout(limit, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::transport_closed("event adapter stopped")),
            Err(_) => Err(Error::timeout(
                self.description.clone(),
                limit.as_millis() as u64,
            )),
        }
    }
}

impl<T> Drop for EventSignal<T> {
    fn drop(&mut self) {
        self.adapter.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn protocol_event(method: &str) -> ConnectionEvent {
        ConnectionEvent::Protocol {
            scope: None,
            event: Event {
                method: method.to_string(),
                params: json!({}),
                session_id: None,
            },
        }
    }

    fn select_method(name: &'static str) -> impl FnMut(&ConnectionEvent) -> Option<Result<Event>> + Send {
        move |event| match event.as_protocol() {
            Some((_, e)) if e.method == name => Some(Ok(e.clone())),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_signal_resolves_on_match() {
        let (tx, rx) = broadcast::channel(16);
        let signal = EventSignal::new(
            EventStream::new(rx),
            Arc::new(CloseState::default()),
            "Page.loadEventFired",
            select_method("Page.loadEventFired"),
        );

        tx.send(protocol_event("Page.frameNavigated")).expect("send");
        tx.send(protocol_event("Page.loadEventFired")).expect("send");

        let event = signal.wait(Duration::from_secs(1)).await.expect("matched");
        assert_eq!(event.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn test_signal_fails_on_disconnect() {
        let (tx, rx) = broadcast::channel(16);
        let signal = EventSignal::new(
            EventStream::new(rx),
            Arc::new(CloseState::default()),
            "never",
            select_method("Never.happens"),
        );

        tx.send(ConnectionEvent::Disconnected {
            reason: "bye".to_string(),
        })
        .expect("send");

        let err = signal.wait(Duration::from_secs(1)).await.expect_err("closed");
        assert_eq!(err.kind(), crate::ErrorKind::TransportClosed);
        assert_eq!(err.reason(), "bye");
    }

    #[tokio::test]
    async fn test_signal_on_closed_connection_fails_immediately() {
        let (_tx, rx) = broadcast::channel::<ConnectionEvent>(16);
        let closed = Arc::new(CloseState::default());
        closed.mark("gone");

        let signal = EventSignal::new(EventStream::new(rx), closed, "x", select_method("X.y"));
        let err = signal.wait(Duration::from_secs(1)).await.expect_err("closed");
        assert_eq!(err.reason(), "gone");
    }

    #[tokio::test]
    async fn test_signal_times_out() {
        let (_tx, rx) = broadcast::channel::<ConnectionEvent>(16);
        let signal = EventSignal::new(
            EventStream::new(rx),
            Arc::new(CloseState::default()),
            "Page.loadEventFired",
            select_method("Page.loadEventFired"),
        );

        let err = signal.wait(Duration::from_millis(20)).await.expect_err("timeout");
        assert!(err.is_timeout());
        assert_eq!(err.reason(), "Page.loadEventFired");
    }

    #[tokio::test]
    async fn test_stream_skips_lagged_events() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);

        for method in ["A.a", "B.b", "C.c", "D.d"] {
            tx.send(protocol_event(method)).expect("send");
        }

        let next = stream.recv().await.expect("event");
        assert_eq!(next.as_protocol().map(|(_, e)| e.method.as_str()), Some("C.c"));
    }
}
