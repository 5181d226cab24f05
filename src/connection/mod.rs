//! Connection layer.
//!
//! A [`Connection`] multiplexes the root channel and every attached session
//! over one transport. All routing state lives in a single dispatcher task
//! fed by one ordered queue.
//!
//! # Data Flow
//!
//! ```text
//! caller ──Register──► ┌──────────────┐ ◄──Inbound── forwarder ◄── transport
//!        ──write──────►│  dispatcher  │──► pending calls resolved
//!   transport          │ (one queue)  │──► session tree / realm registry
//!                      └──────────────┘──► ConnectionEvent broadcast
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Connection`] handle |
//! | `dispatcher` | Queue consumer, routing and close cascade |
//! | `events` | [`ConnectionEvent`], [`EventStream`], [`EventSignal`] |
//! | `options` | [`ConnectionOptions`], [`WaitOptions`] |
//! | `pending` | Pending call table |
//! | `queue` | Dispatch queue jobs |

// ============================================================================
// Submodules
// ============================================================================

/// Connection handle.
pub mod core;

/// Dispatcher task.
pub(crate) mod dispatcher;

/// Connection events.
pub mod events;

/// Connection configuration.
pub mod options;

/// Pending call table.
pub(crate) mod pending;

/// Dispatch queue.
pub(crate) mod queue;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::Connection;
pub use dispatcher::DispatchStats;
pub use events::{ConnectionEvent, EventSignal, EventStream};
pub use options::{ConnectionOptions, WaitOptions};
