//! Connection handle and close state.
//!
//! A [`Connection`] owns one transport and the dispatcher task that routes
//! everything arriving on it. The handle is cheap to clone; the dispatcher
//! and the inbound forwarder stop once the connection closes and every
//! handle is gone.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::{CallId, RealmId, SessionId, WaitId};
use crate::protocol::{Event, Protocol, Request, TargetInfo};
use crate::realm::Realm;
use crate::session::Session;
use crate::transport::{Transport, TransportEvent, TransportReceiver, WebSocketTransport};

use super::dispatcher::{DispatchStats, Dispatcher};
use super::events::{ConnectionEvent, EventSignal, EventStream};
use super::options::ConnectionOptions;
use super::pending::PendingCall;
use super::queue::{DispatchQueue, Job};

// ============================================================================
// CloseState
// ============================================================================

/// Close flag and reason shared by handles and the dispatcher.
///
/// Set once, before any close cascade work runs.
#[derive(Debug, Default)]
pub(crate) struct CloseState {
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CloseState {
    /// Records the close. Returns `false` if already closed.
    pub(crate) fn mark(&self, reason: &str) -> bool {
        let mut guard = self.reason.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        self.closed.store(true, Ordering::Release);
        true
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Error returned to callers once closed.
    pub(crate) fn error(&self) -> Error {
        Error::transport_closed(
            self.reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }
}

// ============================================================================
// ConnectionInner
// ============================================================================

pub(crate) struct ConnectionInner {
    url: String,
    protocol: Protocol,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    queue: DispatchQueue,
    events: broadcast::Sender<ConnectionEvent>,
    closed: Arc<CloseState>,
    next_call: AtomicU64,
    next_wait: AtomicU64,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Last handle gone: run the cascade so the transport is released.
        self.queue.push(Job::Close {
            reason: "connection dropped".to_string(),
            done: None,
        });
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One transport to a browser, multiplexing root and session traffic.
///
/// # Thread Safety
///
/// `Connection` is `Clone + Send + Sync`. Clones share the transport, the
/// call id space and the dispatcher.
///
/// # Example
///
/// ```no_run
/// use browser_session::{Connection, ConnectionOptions, Protocol, Result};
/// use serde_json::json;
///
/// # async fn example() -> Result<()> {
/// let connection = Connection::connect(
///     "ws://127.0.0.1:9222/devtools/browser/abc",
///     Protocol::Cdp,
///     ConnectionOptions::new(),
/// )
/// .await?;
///
/// let version = connection.send_and_wait("Browser.getVersion", json!({}), None).await?;
/// println!("{version}");
/// connection.close("done").await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.url)
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Opens a WebSocket to `url` and starts dispatching.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid or `url` is not a WebSocket URL
    /// - [`Error::ConnectionTimeout`] if the handshake exceeds `connect_timeout`
    /// - [`Error::WebSocket`] if the handshake fails
    pub async fn connect(url: &str, protocol: Protocol, options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        let (transport, inbound) = WebSocketTransport::connect(url, options.connect_timeout).await?;
        Self::new(url, transport, inbound, protocol, options)
    }

    /// Wraps an established transport and starts dispatching.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn new(
        url: impl Into<String>,
        transport: impl Transport,
        inbound: TransportReceiver,
        protocol: Protocol,
        options: ConnectionOptions,
    ) -> Result<Self> {
        options.validate()?;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (queue, jobs) = DispatchQueue::new();
        let (events, _) = broadcast::channel(options.event_capacity);
        let closed = Arc::new(CloseState::default());
        let inbound_delay = options.inbound_delay;

        let inner = Arc::new(ConnectionInner {
            url: url.into(),
            protocol,
            options,
            transport: Arc::clone(&transport),
            queue: queue.clone(),
            events: events.clone(),
            closed: Arc::clone(&closed),
            next_call: AtomicU64::new(0),
            next_wait: AtomicU64::new(0),
        });

        let dispatcher = Dispatcher::new(protocol, transport, events, closed, Arc::downgrade(&inner));
        tokio::spawn(dispatcher.run(jobs));
        tokio::spawn(forward_inbound(inbound, queue, inbound_delay));

        debug!(url = %inner.url, %protocol, "Connection started");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Returns a reference that does not keep the connection open.
    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }
}

/// Non-owning [`Connection`] reference for background tasks.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    /// Returns the connection while some handle still holds it.
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(Connection::from_inner)
    }
}

/// Moves transport traffic onto the dispatch queue, in arrival order.
async fn forward_inbound(mut inbound: TransportReceiver, queue: DispatchQueue, delay: Duration) {
    loop {
        let Some(event) = inbound.recv().await else {
            queue.push(Job::Inbound(TransportEvent::Closed("transport dropped".to_string())));
            break;
        };

        let last = matches!(event, TransportEvent::Closed(_));
        if !last && !delay.is_zero() {
            sleep(delay).await;
        }
        if !queue.push(Job::Inbound(event)) || last {
            break;
        }
    }
    debug!("Inbound forwarder terminated");
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the URL this connection was opened with.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Returns the wire dialect.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Returns the connection options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Returns `true` once the connection is closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    /// Returns the close reason, if closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.inner.closed.reason()
    }

    #[inline]
    pub(crate) fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    pub(crate) fn next_wait_id(&self) -> WaitId {
        WaitId::new(self.inner.next_wait.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn next_call_id(&self) -> CallId {
        CallId::new(self.inner.next_call.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ============================================================================
// Connection - Calls
// ============================================================================

impl Connection {
    /// Sends a call without waiting for its response.
    ///
    /// The call still occupies the pending table until answered, so a
    /// late response is not reported as unmatched.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportClosed`] if the connection is closed
    /// - [`Error::Json`] / [`Error::WebSocket`] if the write fails
    pub fn send(&self, method: &str, params: Value, session: Option<&SessionId>) -> Result<CallId> {
        self.ensure_open()?;
        let id = self.next_call_id();
        self.inner.queue.push(Job::Register {
            id,
            call: PendingCall::new(method, session.cloned(), None),
        });
        self.write(id, method, params, session)?;
        Ok(id)
    }

    /// Sends a call and waits for its response with the default timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportClosed`] if the connection closes first
    /// - [`Error::SessionClosed`] if `session` closes first
    /// - [`Error::Protocol`] if the peer answered with an error
    /// - [`Error::Timeout`] if no response arrived in time
    pub async fn send_and_wait(
        &self,
        method: &str,
        params: Value,
        session: Option<&SessionId>,
    ) -> Result<Value> {
        self.send_and_wait_with_timeout(method, params, session, self.inner.options.call_timeout)
            .await
    }

    /// Sends a call and waits up to `limit` for its response.
    ///
    /// A timeout only fails this call; the connection and other calls are
    /// unaffected.
    ///
    /// # Errors
    ///
    /// Same as [`send_and_wait`](Self::send_and_wait).
    pub async fn send_and_wait_with_timeout(
        &self,
        method: &str,
        params: Value,
        session: Option<&SessionId>,
        limit: Duration,
    ) -> Result<Value> {
        self.ensure_open()?;

        let id = self.next_call_id();
        let (tx, mut rx) = oneshot::channel();
        self.inner.queue.push(Job::Register {
            id,
            call: PendingCall::new(method, session.cloned(), Some(tx)),
        });
        self.write(id, method, params, session)?;

        match timeout(limit, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(self.inner.closed.error())),
            Err(_) => {
                // The dispatcher decides: a response queued ahead of the
                // expiry still wins.
                self.inner.queue.push(Job::Expire {
                    id,
                    timeout_ms: limit.as_millis() as u64,
                });
                rx.await.unwrap_or_else(|_| Err(self.inner.closed.error()))
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.is_closed() {
            return Err(self.inner.closed.error());
        }
        Ok(())
    }

    fn write(&self, id: CallId, method: &str, params: Value, session: Option<&SessionId>) -> Result<()> {
        let request = Request::new(id, method, params).with_session(session.cloned());
        let written = self
            .inner
            .protocol
            .encode(request)
            .and_then(|text| self.inner.transport.send(text));

        if let Err(e) = written {
            debug!(call_id = %id, method, error = %e, "Write failed");
            self.inner.queue.push(Job::Fail {
                id,
                error: Error::connection(format!("write failed: {e}")),
            });
            return Err(e);
        }
        Ok(())
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Closes the connection. Idempotent.
    ///
    /// Every pending call fails with [`Error::TransportClosed`] carrying
    /// `reason`, sessions are closed children first, realms are destroyed,
    /// and [`ConnectionEvent::Disconnected`] is emitted last.
    pub async fn close(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        debug!(url = %self.inner.url, reason, "Close requested");

        let (done, rx) = oneshot::channel();
        let pushed = self.inner.queue.push(Job::Close {
            reason: reason.to_string(),
            done: Some(done),
        });
        if pushed {
            let _ = rx.await;
        }
    }

    /// Returns dispatcher counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportClosed`] if the dispatcher has stopped.
    pub async fn stats(&self) -> Result<DispatchStats> {
        self.query(|state| state.stats()).await
    }

    /// Runs `f` against dispatcher state, in queue order.
    pub(crate) async fn query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Dispatcher) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pushed = self.inner.queue.push(Job::Exec(Box::new(move |state| {
            let _ = tx.send(f(state));
        })));
        if !pushed {
            return Err(self.inner.closed.error());
        }
        rx.await.map_err(|_| self.inner.closed.error())
    }
}

// ============================================================================
// Connection - Events
// ============================================================================

impl Connection {
    /// Subscribes to every event of this connection.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    /// Waits for the next protocol event named `method`, in any scope.
    ///
    /// The subscription starts now.
    #[must_use]
    pub fn wait_for_event(&self, method: &str) -> EventSignal<Event> {
        let method = method.to_string();
        self.signal(method.clone(), move |event| match event.as_protocol() {
            Some((_, e)) if e.method == method => Some(Ok(e.clone())),
            _ => None,
        })
    }

    pub(crate) fn signal<T, F>(&self, description: impl Into<String>, select: F) -> EventSignal<T>
    where
        T: Send + 'static,
        F: FnMut(&ConnectionEvent) -> Option<Result<T>> + Send + 'static,
    {
        EventSignal::new(
            self.subscribe(),
            Arc::clone(&self.inner.closed),
            description,
            select,
        )
    }
}

// ============================================================================
// Connection - Sessions
// ============================================================================

impl Connection {
    /// Returns every attached session, parents before children.
    pub async fn sessions(&self) -> Vec<Session> {
        let connection = self.clone();
        self.query(|state| state.sessions.all())
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|shared| Session::from_shared(shared, connection.clone()))
            .collect()
    }

    /// Looks up an attached session.
    pub async fn session(&self, id: &SessionId) -> Option<Session> {
        let id = id.clone();
        let shared = self
            .query(move |state| state.sessions.get(&id).cloned())
            .await
            .ok()
            .flatten()?;
        Some(Session::from_shared(shared, self.clone()))
    }

    /// Registers a session the peer will not announce by event.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` is already attached or `parent` is unknown
    /// - [`Error::TransportClosed`] if the connection is closed
    pub async fn attach_session(
        &self,
        parent: Option<&SessionId>,
        id: SessionId,
        target: TargetInfo,
    ) -> Result<Session> {
        self.ensure_open()?;

        let (done, rx) = oneshot::channel();
        let pushed = self.inner.queue.push(Job::Attach {
            parent: parent.cloned(),
            session: id.clone(),
            target,
            done,
        });
        if !pushed {
            return Err(self.inner.closed.error());
        }

        match rx.await.map_err(|_| self.inner.closed.error())? {
            Some(shared) => Ok(Session::from_shared(shared, self.clone())),
            None if self.is_closed() => Err(self.inner.closed.error()),
            None => Err(Error::invalid_argument(format!(
                "cannot attach session {id}: already attached or parent unknown"
            ))),
        }
    }

    /// Returns the session `id`, waiting for it to attach if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if it did not attach in time
    /// - [`Error::TransportClosed`] if the connection closed first
    pub async fn wait_for_session(&self, id: &SessionId, limit: Duration) -> Result<Session> {
        self.ensure_open()?;

        // Subscribe before looking so an attach in between is seen.
        let wanted = id.clone();
        let signal = self.signal(format!("session {id}"), move |event| match event {
            ConnectionEvent::SessionAttached { session, .. } if session == &wanted => Some(Ok(())),
            _ => None,
        });

        if let Some(session) = self.session(id).await {
            return Ok(session);
        }

        signal.wait(limit).await?;
        self.session(id).await.ok_or_else(|| {
            Error::session_closed(id.clone(), "detached before use")
        })
    }
}

// ============================================================================
// Connection - Realms
// ============================================================================

impl Connection {
    /// Returns every live realm.
    pub async fn realms(&self) -> Vec<Realm> {
        let connection = self.clone();
        self.query(|state| state.realms.all())
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|shared| Realm::from_shared(shared, connection.clone()))
            .collect()
    }

    /// Looks up a live realm.
    pub async fn realm(&self, id: RealmId) -> Option<Realm> {
        let shared = self
            .query(move |state| state.realms.get(id))
            .await
            .ok()
            .flatten()?;
        Some(Realm::from_shared(shared, self.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use serde_json::json;

    fn open(protocol: Protocol) -> (Connection, MemoryPeer) {
        let (transport, inbound, peer) = MemoryTransport::pair();
        let connection = Connection::new("memory://test", transport, inbound, protocol, ConnectionOptions::new())
            .expect("connection");
        (connection, peer)
    }

    #[test]
    fn test_close_state_marks_once() {
        let state = CloseState::default();
        assert!(!state.is_closed());
        assert!(state.mark("first"));
        assert!(!state.mark("second"));
        assert_eq!(state.reason().as_deref(), Some("first"));
        assert_eq!(state.error().reason(), "first");
    }

    #[tokio::test]
    async fn test_call_ids_are_sequential() {
        let (connection, peer) = open(Protocol::Cdp);

        let first = connection.send("A.a", json!({}), None).expect("send");
        let second = connection.send("B.b", json!({}), None).expect("send");
        assert_eq!(first, CallId::new(1));
        assert_eq!(second, CallId::new(2));

        let wire = peer.recv_json().await.expect("first frame");
        assert_eq!(wire["id"], 1);
        assert_eq!(wire["method"], "A.a");
    }

    #[tokio::test]
    async fn test_send_and_wait_resolves_with_result() {
        let (connection, peer) = open(Protocol::Cdp);

        let call = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_and_wait("Browser.getVersion", json!({}), None).await }
        });

        let request = peer.recv_json().await.expect("request");
        peer.deliver_json(&json!({"id": request["id"], "result": {"product": "Chrome"}}));

        let value = call.await.expect("join").expect("result");
        assert_eq!(value["product"], "Chrome");
    }

    #[tokio::test]
    async fn test_timeout_does_not_close_connection() {
        let (connection, peer) = open(Protocol::Cdp);

        let err = connection
            .send_and_wait_with_timeout("Slow.call", json!({}), None, Duration::from_millis(20))
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!connection.is_closed());

        // The late response is counted, not delivered.
        let request = peer.recv_json().await.expect("request");
        peer.deliver_json(&json!({"id": request["id"], "result": {}}));
        let stats = loop {
            let stats = connection.stats().await.expect("stats");
            if stats.unmatched > 0 {
                break stats;
            }
            sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (connection, _peer) = open(Protocol::Cdp);
        connection.close("done").await;

        let err = connection
            .send_and_wait("A.b", json!({}), None)
            .await
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::TransportClosed);
        assert_eq!(err.reason(), "done");
        assert!(connection.send("A.b", json!({}), None).is_err());
    }

    #[tokio::test]
    async fn test_attach_session_rejects_duplicates() {
        let (connection, _peer) = open(Protocol::Cdp);
        let id = SessionId::from("S1");

        connection
            .attach_session(None, id.clone(), TargetInfo::new("T1", "page"))
            .await
            .expect("attach");
        let err = connection
            .attach_session(None, id, TargetInfo::new("T1", "page"))
            .await
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
