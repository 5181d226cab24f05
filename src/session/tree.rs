//! Session arena.
//!
//! Sessions are stored flat, keyed by id. Each node names its parent by id
//! and lists its children by id, so teardown walks ids instead of live
//! references.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::identifiers::SessionId;
use crate::protocol::TargetInfo;

use super::core::SessionShared;

// ============================================================================
// SessionNode
// ============================================================================

struct SessionNode {
    parent: Option<SessionId>,
    children: Vec<SessionId>,
    shared: Arc<SessionShared>,
}

// ============================================================================
// SessionTree
// ============================================================================

/// Attached sessions of one connection.
#[derive(Default)]
pub(crate) struct SessionTree {
    nodes: FxHashMap<SessionId, SessionNode>,
    roots: Vec<SessionId>,
}

impl SessionTree {
    /// Inserts a session under `parent` (`None` = root).
    ///
    /// Returns `None` if the id is already attached or the parent is
    /// unknown.
    pub(crate) fn attach(
        &mut self,
        parent: Option<SessionId>,
        id: SessionId,
        target: TargetInfo,
    ) -> Option<Arc<SessionShared>> {
        if self.nodes.contains_key(&id) {
            return None;
        }

        match &parent {
            Some(parent_id) => self.nodes.get_mut(parent_id)?.children.push(id.clone()),
            None => self.roots.push(id.clone()),
        }

        let shared = Arc::new(SessionShared::new(id.clone(), parent.clone(), target));
        self.nodes.insert(
            id,
            SessionNode {
                parent,
                children: Vec::new(),
                shared: Arc::clone(&shared),
            },
        );
        Some(shared)
    }

    /// Removes a session and its descendants.
    ///
    /// Returns the removed sessions children first, the detached session
    /// last. Empty if the id is unknown.
    pub(crate) fn detach(&mut self, id: &SessionId) -> Vec<Arc<SessionShared>> {
        let Some(parent) = self.nodes.get(id).map(|node| node.parent.clone()) else {
            return Vec::new();
        };

        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => parent_node.children.retain(|child| child != id),
            None => self.roots.retain(|root| root != id),
        }

        self.remove_subtree(id)
    }

    /// Removes every session, children before parents.
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<SessionShared>> {
        let roots = std::mem::take(&mut self.roots);
        roots
            .iter()
            .flat_map(|root| self.remove_subtree(root))
            .collect()
    }

    /// Looks up a session.
    #[inline]
    pub(crate) fn get(&self, id: &SessionId) -> Option<&Arc<SessionShared>> {
        self.nodes.get(id).map(|node| &node.shared)
    }

    /// Returns `true` if the session is attached.
    #[inline]
    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Direct children of a session (`None` = root sessions).
    pub(crate) fn children(&self, id: Option<&SessionId>) -> Vec<Arc<SessionShared>> {
        let ids = match id {
            Some(id) => self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or_default(),
            None => self.roots.as_slice(),
        };
        ids.iter().filter_map(|child| self.get(child).cloned()).collect()
    }

    /// Every attached session, parents before children.
    pub(crate) fn all(&self) -> Vec<Arc<SessionShared>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&SessionId> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                out.push(Arc::clone(&node.shared));
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Number of attached sessions.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Post-order removal of `root` and everything below it.
    fn remove_subtree(&mut self, root: &SessionId) -> Vec<Arc<SessionShared>> {
        let mut order = Vec::new();
        let mut stack = vec![(root.clone(), false)];

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                let children: Vec<SessionId> = node.children.iter().rev().cloned().collect();
                stack.push((id, true));
                stack.extend(children.into_iter().map(|child| (child, false)));
            }
        }

        order
            .into_iter()
            .filter_map(|id| self.nodes.remove(&id))
            .map(|node| node.shared)
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
