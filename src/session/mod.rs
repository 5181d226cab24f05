//! Session tree.
//!
//! Sessions are logical sub-channels multiplexed over one connection. They
//! form a tree mirroring target attachment: a CDP page session may own
//! iframe and worker sessions; a BiDi top-level browsing context owns its
//! nested contexts.
//!
//! # State Machine
//!
//! ```text
//! attach event ──► Attached ──(detach event | close(reason) | parent closed)──► Closed
//! ```
//!
//! Closing a session closes its descendants first. Calls pending on a
//! closed session fail with [`Error::SessionClosed`](crate::Error::SessionClosed),
//! and messages still arriving for it are dropped.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Session`] handle |
//! | `tree` | Arena of attached sessions |

// ============================================================================
// Submodules
// ============================================================================

/// Session handle and shared state.
pub mod core;

/// Session arena.
pub(crate) mod tree;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{Session, SessionEvents};

pub(crate) use self::core::SessionShared;
pub(crate) use tree::SessionTree;
