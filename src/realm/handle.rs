//! Remote object handles.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::RealmId;
use crate::protocol::{RemoteObject, RemoteRef};

use super::core::{Argument, Realm};

// ============================================================================
// Handle
// ============================================================================

struct HandleInner {
    realm: Realm,
    object: RemoteObject,
    disposed: AtomicBool,
}

/// Reference to a value living in a realm.
///
/// Unusable once disposed or once its realm is destroyed; both are checked
/// locally before any round trip.
///
/// # Example
///
/// ```ignore
/// let body = realm.evaluate_handle("document.body").await?;
/// let tag = body.evaluate("(el) => el.tagName", &[]).await?;
/// body.dispose().await;
/// ```
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("realm", &self.realm_id())
            .field("kind", &self.inner.object.kind)
            .field("remote", &self.inner.object.remote)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(realm: Realm, object: RemoteObject) -> Self {
        if let Some(remote) = &object.remote {
            realm.shared().track_handle(&remote.object_id);
        }
        Self {
            inner: Arc::new(HandleInner {
                realm,
                object,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn label(&self) -> String {
        match &self.inner.object.remote {
            Some(remote) => remote.object_id.clone(),
            None => format!("<{}>", self.inner.object.kind),
        }
    }
}

// ============================================================================
// Handle - Accessors
// ============================================================================

impl Handle {
    /// Returns the realm the handle belongs to.
    #[inline]
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    /// Returns the id of the owning realm.
    #[inline]
    #[must_use]
    pub fn realm_id(&self) -> RealmId {
        self.inner.realm.id()
    }

    /// Returns the decoded remote object.
    #[inline]
    #[must_use]
    pub fn object(&self) -> &RemoteObject {
        &self.inner.object
    }

    /// Returns the peer reference, `None` for primitives.
    #[inline]
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteRef> {
        self.inner.object.remote.as_ref()
    }

    /// Returns the JavaScript type.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.object.kind
    }

    /// Returns `true` once [`dispose`](Self::dispose) was called.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Returns `true` if neither the handle nor its realm is gone.
    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_disposed() && !self.inner.realm.is_destroyed()
    }

    /// Fails locally if the handle cannot be used.
    ///
    /// # Errors
    ///
    /// - [`Error::HandleDisposed`] if disposed
    /// - [`Error::RealmDestroyed`] if the realm is destroyed
    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::handle_disposed(self.label()));
        }
        self.inner.realm.shared().check()
    }
}

// ============================================================================
// Handle - Evaluation
// ============================================================================

impl Handle {
    /// Calls `declaration` with this handle as its first argument.
    ///
    /// # Errors
    ///
    /// Same as [`Realm::call_function`].
    pub async fn evaluate(&self, declaration: &str, args: &[Argument]) -> Result<Value> {
        self.ensure_usable()?;
        let args = self.with_self(args);
        self.inner.realm.call_function(declaration, &args).await
    }

    /// Like [`evaluate`](Self::evaluate), returning a handle.
    ///
    /// # Errors
    ///
    /// Same as [`Realm::call_function_handle`].
    pub async fn evaluate_handle(&self, declaration: &str, args: &[Argument]) -> Result<Handle> {
        self.ensure_usable()?;
        let args = self.with_self(args);
        self.inner.realm.call_function_handle(declaration, &args).await
    }

    /// Returns a handle to property `name` of this object.
    ///
    /// # Errors
    ///
    /// Same as [`Realm::call_function_handle`].
    pub async fn get_property(&self, name: &str) -> Result<Handle> {
        self.evaluate_handle(
            "(object, name) => object[name]",
            &[Argument::Value(Value::String(name.to_string()))],
        )
        .await
    }

    /// Returns the JSON serialization of the object.
    ///
    /// Primitives answer locally.
    ///
    /// # Errors
    ///
    /// Same as [`Realm::call_function`].
    pub async fn json_value(&self) -> Result<Value> {
        self.ensure_usable()?;
        if self.remote().is_none() {
            return Ok(self.inner.object.value.clone().unwrap_or(Value::Null));
        }
        self.evaluate("(object) => object", &[]).await
    }

    fn with_self(&self, args: &[Argument]) -> Vec<Argument> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Argument::Handle(self.clone()));
        all.extend_from_slice(args);
        all
    }
}

// ============================================================================
// Handle - Disposal
// ============================================================================

impl Handle {
    /// Releases the remote object. Idempotent.
    ///
    /// The release call is best effort: it is skipped when the realm is
    /// already destroyed, and its failure is only logged.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let realm = &self.inner.realm;
        let Some(remote) = self.remote() else {
            return;
        };
        realm.shared().forget_handle(&remote.object_id);

        if realm.is_destroyed() {
            trace!(handle = %remote.object_id, "Skipping release in destroyed realm");
            return;
        }

        let call = realm
            .connection()
            .protocol()
            .release_call(realm.shared().remote(), remote);
        if let Err(e) = realm.send(call).await {
            debug!(handle = %remote.object_id, error = %e, "Release failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
