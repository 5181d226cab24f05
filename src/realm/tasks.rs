//! Wait-operations.
//!
//! A wait-operation polls a predicate in a realm until it returns a truthy
//! value. Tasks are grouped per (owner, sandbox) slot so they outlive one
//! realm generation:
//!
//! | Event | Effect on the slot's tasks |
//! |-------|----------------------------|
//! | realm replaced | re-run in the new realm |
//! | frame realm destroyed | suspended until a replacement appears |
//! | worker realm destroyed | failed |
//! | owner gone / session closed / connection closed | failed |
//!
//! Every poll result travels through the dispatch queue tagged with the
//! generation that produced it, so a result from a replaced realm can
//! never settle a task that was re-run.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::connection::queue::{DispatchQueue, Job};
use crate::error::{Error, Result};
use crate::identifiers::WaitId;

use super::core::{Argument, Realm};

// ============================================================================
// WaitState
// ============================================================================

/// Observable state of a wait-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Still polling (or suspended between realms).
    Pending,
    /// Predicate returned a truthy value.
    Resolved,
    /// Failed: timeout, predicate error, or its realm's owner went away.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

/// State cell shared by a task and its [`WaitHandle`].
#[derive(Debug)]
pub(crate) struct WaitStatus(Mutex<WaitState>);

impl Default for WaitStatus {
    fn default() -> Self {
        Self(Mutex::new(WaitState::Pending))
    }
}

impl WaitStatus {
    pub(crate) fn get(&self) -> WaitState {
        *self.0.lock()
    }

    fn settle(&self, outcome: &Result<Value>) {
        *self.0.lock() = match outcome {
            Ok(_) => WaitState::Resolved,
            Err(Error::Cancelled { .. }) => WaitState::Cancelled,
            Err(_) => WaitState::Failed,
        };
    }
}

// ============================================================================
// NewWait
// ============================================================================

/// What a wait-operation polls.
#[derive(Debug)]
pub(crate) struct WaitSpec {
    pub declaration: String,
    pub args: Vec<Value>,
    pub interval: Duration,
    pub description: String,
}

/// A wait-operation on its way to the registry.
pub(crate) struct NewWait {
    pub id: WaitId,
    pub spec: Arc<WaitSpec>,
    pub slot: oneshot::Sender<Result<Value>>,
    pub status: Arc<WaitStatus>,
}

impl NewWait {
    /// Fails the wait without registering it.
    pub(crate) fn reject(self, timer: Option<JoinHandle<()>>, error: Error) {
        if let Some(timer) = timer {
            timer.abort();
        }
        let outcome = Err(error);
        self.status.settle(&outcome);
        let _ = self.slot.send(outcome);
    }
}

// ============================================================================
// WaitTask
// ============================================================================

struct WaitTask {
    spec: Arc<WaitSpec>,
    generation: u64,
    poller: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    slot: oneshot::Sender<Result<Value>>,
    status: Arc<WaitStatus>,
}

impl WaitTask {
    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }

    fn finish(mut self, outcome: Result<Value>) {
        self.stop_polling();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.status.settle(&outcome);
        let _ = self.slot.send(outcome);
    }
}

// ============================================================================
// TaskManager
// ============================================================================

/// Wait-operations of one realm slot.
#[derive(Default)]
pub(crate) struct TaskManager {
    tasks: FxHashMap<WaitId, WaitTask>,
}

impl TaskManager {
    /// Adds a task; starts polling at once if a live realm is given.
    pub(crate) fn register(&mut self, wait: NewWait, timer: Option<JoinHandle<()>>, realm: Option<&Realm>) {
        let mut task = WaitTask {
            spec: wait.spec,
            generation: 0,
            poller: None,
            timer,
            slot: wait.slot,
            status: wait.status,
        };
        if let Some(realm) = realm {
            task.poller = Some(spawn_poller(realm, Arc::clone(&task.spec), wait.id, 0));
        }
        trace!(wait = %wait.id, polling = task.poller.is_some(), "Wait registered");
        self.tasks.insert(wait.id, task);
    }

    /// Restarts every task against `realm` under a new generation.
    pub(crate) fn rerun_all(&mut self, realm: &Realm) -> usize {
        for (id, task) in &mut self.tasks {
            task.stop_polling();
            task.generation += 1;
            task.poller = Some(spawn_poller(realm, Arc::clone(&task.spec), *id, task.generation));
        }
        if !self.tasks.is_empty() {
            debug!(realm = %realm.id(), count = self.tasks.len(), "Re-running waits in new realm");
        }
        self.tasks.len()
    }

    /// Stops polling until the next [`rerun_all`](Self::rerun_all).
    pub(crate) fn suspend_all(&mut self) -> usize {
        for task in self.tasks.values_mut() {
            task.stop_polling();
        }
        self.tasks.len()
    }

    /// Settles one task.
    ///
    /// `generation` = `None` settles regardless of generation (timeouts,
    /// cancellation). Returns `false` for unknown ids and stale results.
    pub(crate) fn settle(&mut self, id: WaitId, generation: Option<u64>, outcome: Result<Value>) -> bool {
        let current = match self.tasks.get(&id) {
            Some(task) => task.generation,
            None => return false,
        };
        if let Some(generation) = generation
            && generation != current
        {
            trace!(wait = %id, generation, current, "Ignoring stale poll result");
            return false;
        }

        let Some(task) = self.tasks.remove(&id) else {
            return false;
        };
        debug!(wait = %id, description = %task.spec.description, success = outcome.is_ok(), "Wait settled");
        task.finish(outcome);
        true
    }

    /// Fails every task. Returns the ids that were failed.
    pub(crate) fn terminate_all(&mut self, error: impl Fn() -> Error) -> Vec<WaitId> {
        let ids: Vec<WaitId> = self.tasks.keys().copied().collect();
        for id in &ids {
            if let Some(task) = self.tasks.remove(id) {
                task.finish(Err(error()));
            }
        }
        ids
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Polls until settled. Holds the connection only for the duration of
/// each poll, so a forgotten wait does not keep a dropped connection open.
fn spawn_poller(realm: &Realm, spec: Arc<WaitSpec>, id: WaitId, generation: u64) -> JoinHandle<()> {
    let shared = Arc::clone(realm.shared());
    let connection = realm.connection().downgrade();

    tokio::spawn(async move {
        let args: Vec<Argument> = spec.args.iter().cloned().map(Argument::Value).collect();
        loop {
            let Some(current) = connection.upgrade() else {
                trace!(wait = %id, "Connection dropped, poller exiting");
                return;
            };
            let realm = Realm::from_shared(Arc::clone(&shared), current);

            let settled = match realm.call_function(&spec.declaration, &args).await {
                Ok(value) if is_truthy(&value) => Some(Ok(value)),
                Ok(_) => None,
                Err(e) if e.is_context_lost() => {
                    if realm.is_destroyed() {
                        // The next realm generation restarts the task.
                        return;
                    }
                    trace!(wait = %id, error = %e, "Poll lost its context, retrying");
                    None
                }
                Err(e) => Some(Err(e)),
            };

            if let Some(outcome) = settled {
                realm.connection().queue().push(Job::SettleWait {
                    id,
                    generation: Some(generation),
                    outcome,
                });
                return;
            }

            drop(realm);
            sleep(spec.interval).await;
        }
    })
}

/// JavaScript truthiness of a by-value result.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ============================================================================
// WaitHandle
// ============================================================================

/// Caller side of a wait-operation.
///
/// Dropping a pending handle cancels the wait.
pub struct WaitHandle {
    id: WaitId,
    rx: Option<oneshot::Receiver<Result<Value>>>,
    status: Arc<WaitStatus>,
    queue: DispatchQueue,
    description: String,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WaitHandle {
    pub(crate) fn new(
        id: WaitId,
        rx: oneshot::Receiver<Result<Value>>,
        status: Arc<WaitStatus>,
        queue: DispatchQueue,
        description: String,
    ) -> Self {
        Self {
            id,
            rx: Some(rx),
            status,
            queue,
            description,
        }
    }

    /// Returns the wait id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WaitId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> WaitState {
        self.status.get()
    }

    /// Cancels the wait. No effect once settled.
    pub fn cancel(&self) {
        if self.state() != WaitState::Pending {
            return;
        }
        self.queue.push(Job::SettleWait {
            id: self.id,
            generation: None,
            outcome: Err(Error::cancelled(self.description.clone())),
        });
    }

    /// Waits for the outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the wait's deadline elapsed
    /// - [`Error::Cancelled`] if cancelled
    /// - [`Error::RealmDestroyed`] if the owning frame or worker went away
    /// - [`Error::TransportClosed`] if the connection closed
    /// - the predicate's own failure (e.g. [`Error::Evaluation`])
    pub async fn wait(mut self) -> Result<Value> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::cancelled(self.description.clone()));
        };
        rx.await
            .unwrap_or_else(|_| Err(Error::transport_closed("connection dropped")))
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
