//! Realm registry.
//!
//! Tracks every live realm and groups realm generations into slots keyed
//! by (session, owner, sandbox). A slot outlives its realms: when the peer
//! reports a new context for an occupied slot, the previous generation is
//! destroyed and the slot's wait-operations move to the new one.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identifiers::{RealmId, RemoteContextId, SessionId, WaitId};
use crate::protocol::{ContextDescriptor, RealmOwner};

use super::core::{Realm, RealmInfo, RealmShared};
use super::tasks::{NewWait, TaskManager};

const REPLACED: &str = "replaced by a new execution context";
const WORKER_GONE: &str = "worker terminated";

// ============================================================================
// Keys
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    session: Option<SessionId>,
    owner: RealmOwner,
    sandbox: Option<String>,
}

impl SlotKey {
    fn of(info: &RealmInfo) -> Self {
        Self {
            session: info.session.clone(),
            owner: info.owner.clone(),
            sandbox: info.sandbox.clone(),
        }
    }
}

/// CDP context ids are per session; BiDi realm ids are global.
type RemoteKey = (Option<SessionId>, RemoteContextId);

fn remote_key(session: Option<&SessionId>, remote: &RemoteContextId) -> RemoteKey {
    match remote {
        RemoteContextId::Numeric(_) => (session.cloned(), remote.clone()),
        RemoteContextId::Named(_) => (None, remote.clone()),
    }
}

// ============================================================================
// RealmChange
// ============================================================================

/// Outcome of a context creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RealmChange {
    /// First realm of its slot.
    Created(RealmInfo),
    /// Replaced an earlier generation of the same slot.
    Updated { previous: RealmId, current: RealmInfo },
}

// ============================================================================
// RealmRegistry
// ============================================================================

struct RealmSlot {
    latest: Arc<RealmShared>,
    tasks: TaskManager,
}

/// Live realms of one connection, owned by the dispatcher.
#[derive(Default)]
pub(crate) struct RealmRegistry {
    next_id: u64,
    slots: FxHashMap<SlotKey, RealmSlot>,
    live: FxHashMap<RealmId, Arc<RealmShared>>,
    by_remote: FxHashMap<RemoteKey, RealmId>,
    waits: FxHashMap<WaitId, SlotKey>,
}

impl RealmRegistry {
    /// Records a new execution context.
    pub(crate) fn context_created(
        &mut self,
        session: Option<SessionId>,
        context: ContextDescriptor,
        connection: Option<&Connection>,
    ) -> RealmChange {
        self.next_id += 1;
        let info = RealmInfo {
            id: RealmId::new(self.next_id),
            session,
            owner: context.owner,
            sandbox: context.sandbox,
            origin: context.origin,
        };
        let key = SlotKey::of(&info);
        let rkey = remote_key(info.session.as_ref(), &context.remote);
        let shared = Arc::new(RealmShared::new(info.clone(), context.remote));

        // A reused remote id means the peer forgot to report the old one.
        if let Some(stale) = self.by_remote.get(&rkey).and_then(|id| self.live.get(id)).cloned() {
            self.retire(&stale, REPLACED);
        }

        let previous = self.slots.get(&key).map(|slot| Arc::clone(&slot.latest));
        if let Some(previous) = &previous {
            self.retire(previous, REPLACED);
        }

        self.live.insert(info.id, Arc::clone(&shared));
        self.by_remote.insert(rkey, info.id);

        match previous {
            Some(previous) => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.latest = Arc::clone(&shared);
                    if let Some(connection) = connection {
                        slot.tasks.rerun_all(&Realm::from_shared(shared, connection.clone()));
                    }
                }
                RealmChange::Updated {
                    previous: previous.id(),
                    current: info,
                }
            }
            None => {
                self.slots.insert(
                    key,
                    RealmSlot {
                        latest: shared,
                        tasks: TaskManager::default(),
                    },
                );
                RealmChange::Created(info)
            }
        }
    }

    /// Records the destruction of one execution context.
    ///
    /// Frame slots keep their waits suspended for the next generation;
    /// worker slots are removed and their waits fail.
    pub(crate) fn context_destroyed(
        &mut self,
        session: Option<&SessionId>,
        remote: &RemoteContextId,
        reason: &str,
    ) -> Option<RealmInfo> {
        let id = *self.by_remote.get(&remote_key(session, remote))?;
        let shared = self.live.get(&id).cloned()?;
        if !self.retire(&shared, reason) {
            return None;
        }

        let info = shared.info().clone();
        let key = SlotKey::of(&info);
        if matches!(info.owner, RealmOwner::Worker(_)) {
            if let Some(mut slot) = self.slots.remove(&key) {
                let failed = slot.tasks.terminate_all(|| {
                    Error::realm_destroyed(info.id, info.owner.to_string(), WORKER_GONE)
                });
                self.forget_waits(&failed);
            }
        } else if let Some(slot) = self.slots.get_mut(&key) {
            slot.tasks.suspend_all();
        }
        Some(info)
    }

    /// Destroys every live realm of `session`, keeping their slots.
    pub(crate) fn contexts_cleared(&mut self, session: Option<&SessionId>, reason: &str) -> Vec<RealmInfo> {
        let remotes: Vec<RemoteContextId> = self
            .live
            .values()
            .filter(|shared| shared.info().session.as_ref() == session)
            .map(|shared| shared.remote().clone())
            .collect();

        remotes
            .iter()
            .filter_map(|remote| self.context_destroyed(session, remote, reason))
            .collect()
    }

    /// Removes every slot of `owner` in `session`; waits fail.
    pub(crate) fn owner_gone(
        &mut self,
        session: Option<&SessionId>,
        owner: &RealmOwner,
        reason: &str,
    ) -> Vec<RealmInfo> {
        self.remove_slots(
            |key| key.session.as_ref() == session && &key.owner == owner,
            reason,
            |info| Error::realm_destroyed(info.id, info.owner.to_string(), reason),
        )
    }

    /// Removes every slot of `session`; waits fail with `error`.
    pub(crate) fn destroy_session(
        &mut self,
        session: &SessionId,
        reason: &str,
        error: impl Fn(&RealmInfo) -> Error,
    ) -> Vec<RealmInfo> {
        self.remove_slots(|key| key.session.as_ref() == Some(session), reason, error)
    }

    /// Removes every slot; waits fail with `error`.
    pub(crate) fn destroy_all(&mut self, reason: &str, error: impl Fn(&RealmInfo) -> Error) -> Vec<RealmInfo> {
        let destroyed = self.remove_slots(|_| true, reason, error);
        for shared in self.live.drain().map(|(_, shared)| shared) {
            shared.destroy(reason);
        }
        self.by_remote.clear();
        destroyed
    }

    /// Returns the live realms destroyed by the removal.
    fn remove_slots(
        &mut self,
        matches: impl Fn(&SlotKey) -> bool,
        reason: &str,
        error: impl Fn(&RealmInfo) -> Error,
    ) -> Vec<RealmInfo> {
        let keys: Vec<SlotKey> = self.slots.keys().filter(|key| matches(key)).cloned().collect();
        let mut destroyed = Vec::new();

        for key in keys {
            let Some(mut slot) = self.slots.remove(&key) else {
                continue;
            };
            let info = slot.latest.info().clone();
            if self.retire(&slot.latest, reason) {
                destroyed.push(info.clone());
            }
            let failed = slot.tasks.terminate_all(|| error(&info));
            self.forget_waits(&failed);
        }
        destroyed
    }

    /// Destroys one realm and unindexes it. Returns `false` if it was
    /// already destroyed.
    fn retire(&mut self, shared: &Arc<RealmShared>, reason: &str) -> bool {
        if !shared.destroy(reason) {
            return false;
        }
        self.live.remove(&shared.id());
        let rkey = remote_key(shared.info().session.as_ref(), shared.remote());
        if self.by_remote.get(&rkey) == Some(&shared.id()) {
            self.by_remote.remove(&rkey);
        }
        trace!(realm = %shared.id(), reason, "Realm destroyed");
        true
    }

    fn forget_waits(&mut self, ids: &[WaitId]) {
        for id in ids {
            self.waits.remove(id);
        }
    }
}

// ============================================================================
// RealmRegistry - Wait Operations
// ============================================================================

impl RealmRegistry {
    /// Attaches a wait to the slot of `realm`.
    ///
    /// Polling starts in the slot's latest realm if it is live; otherwise
    /// the wait stays suspended until the next generation. A wait whose
    /// slot is already gone fails at once.
    pub(crate) fn register_wait(
        &mut self,
        realm: &Arc<RealmShared>,
        wait: NewWait,
        timer: Option<JoinHandle<()>>,
        connection: Option<&Connection>,
    ) {
        let key = SlotKey::of(realm.info());
        let Some(slot) = self.slots.get_mut(&key) else {
            wait.reject(timer, realm.destroyed_error());
            return;
        };

        let runner = match connection {
            Some(connection) if !slot.latest.is_destroyed() => {
                Some(Realm::from_shared(Arc::clone(&slot.latest), connection.clone()))
            }
            _ => None,
        };
        let id = wait.id;
        slot.tasks.register(wait, timer, runner.as_ref());
        self.waits.insert(id, key);
    }

    /// Settles a wait. Returns `false` for unknown ids and stale results.
    pub(crate) fn settle_wait(&mut self, id: WaitId, generation: Option<u64>, outcome: Result<Value>) -> bool {
        let Some(key) = self.waits.get(&id) else {
            return false;
        };
        let settled = self
            .slots
            .get_mut(key)
            .is_some_and(|slot| slot.tasks.settle(id, generation, outcome));
        if settled {
            self.waits.remove(&id);
        }
        settled
    }

    /// Number of registered waits.
    pub(crate) fn wait_count(&self) -> usize {
        self.slots.values().map(|slot| slot.tasks.len()).sum()
    }
}

// ============================================================================
// RealmRegistry - Lookup
// ============================================================================

impl RealmRegistry {
    pub(crate) fn get(&self, id: RealmId) -> Option<Arc<RealmShared>> {
        self.live.get(&id).cloned()
    }

    /// Live realms of a session, oldest first.
    pub(crate) fn in_session(&self, session: &SessionId) -> Vec<Arc<RealmShared>> {
        let mut realms: Vec<Arc<RealmShared>> = self
            .live
            .values()
            .filter(|shared| shared.info().session.as_ref() == Some(session))
            .cloned()
            .collect();
        realms.sort_unstable_by_key(|shared| shared.id());
        realms
    }

    /// Every live realm, oldest first.
    pub(crate) fn all(&self) -> Vec<Arc<RealmShared>> {
        let mut realms: Vec<Arc<RealmShared>> = self.live.values().cloned().collect();
        realms.sort_unstable_by_key(|shared| shared.id());
        realms
    }

    /// The live realm of a slot, if any.
    pub(crate) fn current(
        &self,
        session: Option<&SessionId>,
        owner: &RealmOwner,
        sandbox: Option<&str>,
    ) -> Option<Arc<RealmShared>> {
        let key = SlotKey {
            session: session.cloned(),
            owner: owner.clone(),
            sandbox: sandbox.map(str::to_string),
        };
        self.slots
            .get(&key)
            .map(|slot| Arc::clone(&slot.latest))
            .filter(|shared| !shared.is_destroyed())
    }

    /// Number of live realms.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
