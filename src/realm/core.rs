//! Realm handle and shared state.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::debug;

use crate::connection::queue::Job;
use crate::connection::{Connection, WaitOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::identifiers::{RealmId, RemoteContextId, SessionId};
use crate::protocol::dialect::{Call, ResultMode, WireArgument};
use crate::protocol::{Protocol, RealmOwner, RemoteObject};

use super::handle::Handle;
use super::tasks::{NewWait, WaitHandle, WaitSpec, WaitStatus};

// ============================================================================
// RealmInfo
// ============================================================================

/// Identity of one realm generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmInfo {
    /// Local realm id, never reused.
    pub id: RealmId,
    /// Session the realm lives in (`None` = connection root).
    pub session: Option<SessionId>,
    /// Owning frame or worker.
    pub owner: RealmOwner,
    /// Sandbox name (`None` = main world).
    pub sandbox: Option<String>,
    /// Security origin.
    pub origin: String,
}

// ============================================================================
// RealmShared
// ============================================================================

/// State shared between the registry and every [`Realm`] handle.
pub(crate) struct RealmShared {
    info: RealmInfo,
    remote: RemoteContextId,
    destroyed: AtomicBool,
    destroy_reason: Mutex<Option<String>>,
    /// Remote ids of handles created here and not yet disposed.
    handles: Mutex<FxHashSet<String>>,
    /// Cached utility object. Kept as a plain remote object: a `Handle`
    /// here would own the connection through its realm.
    utility: Mutex<Option<RemoteObject>>,
}

impl RealmShared {
    pub(crate) fn new(info: RealmInfo, remote: RemoteContextId) -> Self {
        Self {
            info,
            remote,
            destroyed: AtomicBool::new(false),
            destroy_reason: Mutex::new(None),
            handles: Mutex::new(FxHashSet::default()),
            utility: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn info(&self) -> &RealmInfo {
        &self.info
    }

    #[inline]
    pub(crate) fn id(&self) -> RealmId {
        self.info.id
    }

    #[inline]
    pub(crate) fn remote(&self) -> &RemoteContextId {
        &self.remote
    }

    #[inline]
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Marks the realm destroyed. Returns `false` if it already was.
    ///
    /// Forgets every tracked handle and the cached utility object.
    pub(crate) fn destroy(&self, reason: &str) -> bool {
        {
            let mut guard = self.destroy_reason.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason.to_string());
            self.destroyed.store(true, Ordering::Release);
        }

        self.handles.lock().clear();
        self.utility.lock().take();
        true
    }

    pub(crate) fn destroyed_error(&self) -> Error {
        let reason = self
            .destroy_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "execution context destroyed".to_string());
        Error::realm_destroyed(self.info.id, self.info.owner.to_string(), reason)
    }

    /// Fails locally once destroyed.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        Ok(())
    }

    pub(crate) fn track_handle(&self, object_id: &str) {
        if !self.is_destroyed() {
            self.handles.lock().insert(object_id.to_string());
        }
    }

    /// `true` while the realm lives and `object` was not disposed.
    fn is_live(&self, object: &RemoteObject) -> bool {
        match &object.remote {
            Some(remote) => self.handles.lock().contains(&remote.object_id),
            None => !self.is_destroyed(),
        }
    }

    /// Returns the cached utility object if it is still usable.
    pub(crate) fn cached_utility(&self) -> Option<RemoteObject> {
        self.utility
            .lock()
            .as_ref()
            .filter(|object| self.is_live(object))
            .cloned()
    }

    /// Caches `object` unless a usable one is cached already.
    ///
    /// Returns the cached object, `None` once the realm is destroyed.
    pub(crate) fn cache_utility(&self, object: &RemoteObject) -> Option<RemoteObject> {
        let mut slot = self.utility.lock();
        if self.is_destroyed() {
            return None;
        }
        if let Some(existing) = slot.as_ref().filter(|existing| self.is_live(existing)) {
            return Some(existing.clone());
        }
        *slot = Some(object.clone());
        Some(object.clone())
    }

    pub(crate) fn forget_handle(&self, object_id: &str) {
        self.handles.lock().remove(object_id);
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles.lock().len()
    }
}

// ============================================================================
// Argument
// ============================================================================

/// Argument passed to a function evaluated in a realm.
#[derive(Debug, Clone)]
pub enum Argument {
    /// Plain JSON value.
    Value(Value),
    /// Remote object; must belong to the target realm.
    Handle(Handle),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Handle> for Argument {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl From<&Handle> for Argument {
    fn from(handle: &Handle) -> Self {
        Self::Handle(handle.clone())
    }
}

static NULL: Value = Value::Null;

// ============================================================================
// Realm
// ============================================================================

/// One generation of a JavaScript execution context.
///
/// Once destroyed, every operation fails locally with
/// [`Error::RealmDestroyed`]; a navigation yields a new realm with a new id.
///
/// # Example
///
/// ```ignore
/// let realm = session.wait_for_realm(&session.main_frame(), None, timeout).await?;
/// let title = realm.evaluate("document.title").await?;
/// ```
#[derive(Clone)]
pub struct Realm {
    shared: Arc<RealmShared>,
    connection: Connection,
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("info", &self.shared.info)
            .field("remote", &self.shared.remote)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Realm {
    pub(crate) fn from_shared(shared: Arc<RealmShared>, connection: Connection) -> Self {
        Self { shared, connection }
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<RealmShared> {
        &self.shared
    }
}

// ============================================================================
// Realm - Accessors
// ============================================================================

impl Realm {
    /// Returns the local realm id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RealmId {
        self.shared.id()
    }

    /// Returns the realm identity.
    #[inline]
    #[must_use]
    pub fn info(&self) -> &RealmInfo {
        &self.shared.info
    }

    /// Returns the session the realm lives in.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.shared.info.session.as_ref()
    }

    /// Returns the owning connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns `true` once the realm is destroyed.
    #[inline]
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Number of handles created in this realm and not yet disposed.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles()
    }
}

// ============================================================================
// Realm - Evaluation
// ============================================================================

impl Realm {
    /// Evaluates an expression and returns its JSON value.
    ///
    /// # Errors
    ///
    /// - [`Error::RealmDestroyed`] if the realm is (or becomes) destroyed
    /// - [`Error::Evaluation`] if the script threw
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let call = self
            .protocol()
            .evaluate_call(&self.shared.remote, expression, ResultMode::Value);
        Ok(self.invoke(call).await?.into_value())
    }

    /// Evaluates an expression and returns a handle to the result.
    ///
    /// # Errors
    ///
    /// Same as [`evaluate`](Self::evaluate).
    pub async fn evaluate_handle(&self, expression: &str) -> Result<Handle> {
        let call = self
            .protocol()
            .evaluate_call(&self.shared.remote, expression, ResultMode::Handle);
        let object = self.invoke(call).await?;
        Ok(Handle::new(self.clone(), object))
    }

    /// Calls a function declaration with arguments and returns its JSON value.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a handle argument belongs to another realm
    /// - [`Error::HandleDisposed`] if a handle argument was disposed
    /// - [`Error::RealmDestroyed`] / [`Error::Evaluation`] as for [`evaluate`](Self::evaluate)
    pub async fn call_function(&self, declaration: &str, args: &[Argument]) -> Result<Value> {
        let call = self.function_call(declaration, args, ResultMode::Value)?;
        Ok(self.invoke(call).await?.into_value())
    }

    /// Calls a function declaration and returns a handle to the result.
    ///
    /// # Errors
    ///
    /// Same as [`call_function`](Self::call_function).
    pub async fn call_function_handle(&self, declaration: &str, args: &[Argument]) -> Result<Handle> {
        let call = self.function_call(declaration, args, ResultMode::Handle)?;
        let object = self.invoke(call).await?;
        Ok(Handle::new(self.clone(), object))
    }

    fn function_call(&self, declaration: &str, args: &[Argument], mode: ResultMode) -> Result<Call> {
        self.shared.check()?;
        let wire = args
            .iter()
            .map(|arg| self.wire_argument(arg))
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .protocol()
            .call_function_call(&self.shared.remote, declaration, &wire, mode))
    }

    fn wire_argument<'a>(&self, arg: &'a Argument) -> Result<WireArgument<'a>> {
        match arg {
            Argument::Value(value) => Ok(WireArgument::Value(value)),
            Argument::Handle(handle) => {
                handle.ensure_usable()?;
                match handle.remote() {
                    // Primitives carry their value and belong to no realm.
                    None => Ok(WireArgument::Value(handle.object().value.as_ref().unwrap_or(&NULL))),
                    Some(_) if handle.realm_id() != self.id() => Err(Error::invalid_argument(format!(
                        "handle from realm {} passed to realm {}; adopt it first",
                        handle.realm_id(),
                        self.id()
                    ))),
                    Some(remote) => Ok(WireArgument::Remote(remote)),
                }
            }
        }
    }

    /// Sends a realm-scoped call and decodes the evaluation result.
    pub(crate) async fn invoke(&self, call: Call) -> Result<RemoteObject> {
        let value = self.send(call).await?;
        self.protocol().parse_evaluation(&value)
    }

    /// Sends a call scoped to this realm's session.
    pub(crate) async fn send(&self, call: Call) -> Result<Value> {
        self.shared.check()?;
        self.connection
            .send_and_wait(call.method, call.params, self.session_id())
            .await
            .map_err(|e| self.translate(e))
    }

    /// Reports peer failures caused by the realm going away as such.
    fn translate(&self, error: Error) -> Error {
        let lost = matches!(error.kind(), ErrorKind::Protocol | ErrorKind::SessionClosed);
        if lost && self.shared.is_destroyed() {
            return self.shared.destroyed_error();
        }
        error
    }

    #[inline]
    fn protocol(&self) -> Protocol {
        self.connection.protocol()
    }
}

// ============================================================================
// Realm - Handle Transfer
// ============================================================================

impl Realm {
    /// Creates a handle in this realm referring to the same object as
    /// `handle`, which may live in another realm of the same page.
    ///
    /// Primitive handles are copied; handles already in this realm are
    /// returned as is.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the object cannot cross realms (not a DOM node)
    /// - [`Error::RealmDestroyed`] if either realm is destroyed
    /// - [`Error::HandleDisposed`] if `handle` was disposed
    pub async fn adopt(&self, handle: &Handle) -> Result<Handle> {
        handle.ensure_usable()?;
        self.shared.check()?;

        if handle.realm_id() == self.id() {
            return Ok(handle.clone());
        }
        let Some(remote) = handle.remote() else {
            return Ok(Handle::new(self.clone(), handle.object().clone()));
        };

        let object = match self.protocol() {
            Protocol::Cdp => {
                let describe = self.protocol().describe_node_call(remote);
                let described = handle.realm().send(describe).await?;
                let backend_node_id = described
                    .get("node")
                    .and_then(|node| node.get("backendNodeId"))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::invalid_argument("only DOM nodes can be adopted"))?;

                let resolve = self
                    .protocol()
                    .resolve_node_call(backend_node_id, &self.shared.remote);
                let resolved = self.send(resolve).await?;
                RemoteObject::from_cdp(resolved.get("object").unwrap_or(&NULL))
            }
            Protocol::Bidi => {
                if remote.shared_id.is_none() {
                    return Err(Error::invalid_argument("only DOM nodes can be adopted"));
                }
                let call = self.protocol().call_function_call(
                    &self.shared.remote,
                    "(node) => node",
                    &[WireArgument::Remote(remote)],
                    ResultMode::Handle,
                );
                self.invoke(call).await?
            }
        };

        debug!(from = %handle.realm_id(), to = %self.id(), "Handle adopted");
        Ok(Handle::new(self.clone(), object))
    }

    /// Adopts `handle` into this realm and disposes the original.
    ///
    /// # Errors
    ///
    /// Same as [`adopt`](Self::adopt).
    pub async fn transfer(&self, handle: Handle) -> Result<Handle> {
        let adopted = self.adopt(&handle).await?;
        if adopted.realm_id() != handle.realm_id() {
            handle.dispose().await;
        }
        Ok(adopted)
    }
}

// ============================================================================
// Realm - Utility
// ============================================================================

impl Realm {
    /// Returns the realm's utility object, creating it on first use.
    ///
    /// The object is produced by
    /// [`ConnectionOptions::utility_script`](crate::ConnectionOptions::utility_script)
    /// and cached until the realm is destroyed or a returned handle is
    /// disposed. Every call returns a fresh [`Handle`] to the same object.
    ///
    /// # Errors
    ///
    /// - [`Error::RealmDestroyed`] if the realm is destroyed
    /// - [`Error::Evaluation`] if the utility script threw
    pub async fn utility(&self) -> Result<Handle> {
        self.shared.check()?;

        if let Some(object) = self.shared.cached_utility() {
            return Ok(Handle::new(self.clone(), object));
        }

        let script = self.connection.options().utility_script.clone();
        let created = self.evaluate_handle(&script).await?;

        match self.shared.cache_utility(created.object()) {
            Some(cached) if cached == *created.object() => Ok(created),
            cached => {
                // Lost a race with another caller, or the realm died meanwhile.
                created.dispose().await;
                match cached {
                    Some(object) => Ok(Handle::new(self.clone(), object)),
                    None => Err(self.shared.destroyed_error()),
                }
            }
        }
    }
}

// ============================================================================
// Realm - Wait Operations
// ============================================================================

impl Realm {
    /// Polls `declaration(...args)` until it returns a truthy value.
    ///
    /// The wait survives navigations: when this frame's realm is replaced
    /// the predicate is re-run in the new realm. It fails when the owning
    /// frame, worker or session goes away, when the connection closes,
    /// when `options.timeout` elapses, or when cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RealmDestroyed`] if the realm is already destroyed.
    pub fn wait_for_function(
        &self,
        declaration: &str,
        args: Vec<Value>,
        options: WaitOptions,
    ) -> Result<WaitHandle> {
        self.shared.check()?;

        let id = self.connection.next_wait_id();
        let interval = options
            .interval
            .unwrap_or(self.connection.options().poll_interval);
        let description = format!("{id} for function in {}", self.shared.info.owner);
        let spec = Arc::new(WaitSpec {
            declaration: declaration.to_string(),
            args,
            interval,
            description: description.clone(),
        });

        let (slot, rx) = oneshot::channel();
        let status = Arc::new(WaitStatus::default());
        let queue = self.connection.queue().clone();

        let timer = options.timeout.map(|limit| {
            let queue = queue.clone();
            let description = description.clone();
            tokio::spawn(async move {
                sleep(limit).await;
                queue.push(Job::SettleWait {
                    id,
                    generation: None,
                    outcome: Err(Error::timeout(description, limit.as_millis() as u64)),
                });
            })
        });

        queue.push(Job::RegisterWait {
            realm: Arc::clone(&self.shared),
            wait: NewWait {
                id,
                spec,
                slot,
                status: Arc::clone(&status),
            },
            timer,
        });

        Ok(WaitHandle::new(id, rx, status, queue, description))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> RealmShared {
        RealmShared::new(
            RealmInfo {
                id: RealmId::new(4),
                session: Some(SessionId::from("S")),
                owner: RealmOwner::frame("F"),
                sandbox: None,
                origin: "https://example.com".to_string(),
            },
            RemoteContextId::Numeric(9),
        )
    }

    #[test]
    fn test_destroy_once_and_report_reason() {
        let realm = shared();
        realm.track_handle("obj-1");
        assert_eq!(realm.live_handles(), 1);
        assert!(realm.check().is_ok());

        assert!(realm.destroy("navigated"));
        assert!(!realm.destroy("again"));
        assert_eq!(realm.live_handles(), 0);

        let err = realm.check().expect_err("destroyed");
        assert_eq!(err.kind(), ErrorKind::RealmDestroyed);
        assert_eq!(err.reason(), "navigated");
    }

    fn remote(id: &str) -> RemoteObject {
        RemoteObject {
            kind: "object".to_string(),
            subtype: None,
            description: None,
            value: None,
            remote: Some(crate::protocol::RemoteRef {
                object_id: id.to_string(),
                shared_id: None,
            }),
        }
    }

    #[test]
    fn test_utility_cache_keeps_first_live_object() {
        let realm = shared();
        realm.track_handle("util-1");
        realm.track_handle("util-2");

        assert_eq!(realm.cache_utility(&remote("util-1")), Some(remote("util-1")));
        // A second caller loses and gets the cached object back.
        assert_eq!(realm.cache_utility(&remote("util-2")), Some(remote("util-1")));
        assert_eq!(realm.cached_utility(), Some(remote("util-1")));
    }

    #[test]
    fn test_utility_cache_forgets_disposed_and_destroyed() {
        let realm = shared();
        realm.track_handle("util-1");
        realm.cache_utility(&remote("util-1"));

        realm.forget_handle("util-1");
        assert_eq!(realm.cached_utility(), None);

        realm.track_handle("util-2");
        assert_eq!(realm.cache_utility(&remote("util-2")), Some(remote("util-2")));

        realm.destroy("navigated");
        assert_eq!(realm.cached_utility(), None);
        assert_eq!(realm.cache_utility(&remote("util-3")), None);
    }

    #[test]
    fn test_destroyed_realm_tracks_nothing() {
        let realm = shared();
        realm.destroy("gone");
        realm.track_handle("obj-2");
        assert_eq!(realm.live_handles(), 0);
    }
}
