//! Realms, handles and wait-operations.
//!
//! A realm is one generation of a JavaScript execution context: a frame's
//! main world, one of its sandboxes, or a worker. Navigations replace
//! realms; every replacement gets a fresh [`RealmId`](crate::RealmId).
//!
//! # Lifecycle
//!
//! ```text
//! context created ──► Live ──(context destroyed | replaced | owner gone
//!                              | session closed | connection closed)──► Destroyed
//! ```
//!
//! A destroyed realm fails every operation locally. Its [`Handle`]s become
//! unusable, and its wait-operations are re-run in the replacement realm
//! or failed, depending on why it went away.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Realm`], [`RealmInfo`], [`Argument`] |
//! | `handle` | [`Handle`] |
//! | `registry` | Live realms and realm slots |
//! | `tasks` | [`WaitHandle`] and the per-slot task manager |

// ============================================================================
// Submodules
// ============================================================================

/// Realm handle and shared state.
pub mod core;

/// Remote object handles.
pub mod handle;

/// Realm registry.
pub(crate) mod registry;

/// Wait-operations.
pub mod tasks;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{Argument, Realm, RealmInfo};
pub use handle::Handle;
pub use tasks::{WaitHandle, WaitState};

pub(crate) use self::core::RealmShared;
pub(crate) use registry::{RealmChange, RealmRegistry};
