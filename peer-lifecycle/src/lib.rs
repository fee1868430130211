//! TRv1 Peer Lifecycle
//!
//! Orders peer teardown against the validation callback queue.  Validation
//! results (block connected, transaction evicted, block checked, ...) are
//! delivered to listeners on a dedicated thread, and those notifications may
//! still reference a peer that the networking layer has just dropped.  The
//! rule this crate enforces is simple:
//!
//! > after a peer is unlinked, drain the validation queue before the peer is
//! > destroyed.
//!
//! ## Architecture
//!
//! ```text
//!  validation engine ──post──▶ ┌──────────────────────────┐
//!  (many producer threads)     │ ValidationCallbackQueue  │──▶ listeners
//!                              │ FIFO + consumer thread   │    (one thread)
//!                              └────────────▲─────────────┘
//!                                           │ sync_with_queue()
//!  disconnect ──▶ ┌─────────────────────────┴──┐
//!                 │ PeerLifecycleCoordinator   │
//!                 │ unlink → drain → destroy   │
//!                 └─────────────┬──────────────┘
//!                               │ remove_peer / close_connection
//!                        ┌──────▼───────┐
//!                        │ PeerRegistry │
//!                        └──────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]      | `PeerLifecycleConfig` defaults and dev overrides |
//! | [`callback`]    | Validation events, listeners, queued callbacks |
//! | [`queue`]       | The ordered callback queue and its drain barrier |
//! | [`peer`]        | Peer handle and teardown state machine |
//! | [`registry`]    | `ConnectionManager` seam and the peer routing table |
//! | [`coordinator`] | Single and batched disconnect |
//! | [`reporter`]    | Peer-scoped validation verdicts posted to the queue |
//! | [`error`]       | Crate-wide error enum |

pub mod callback;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod queue;
pub mod registry;
pub mod reporter;


pub use {
    callback::{ValidationCallback, ValidationEvent, ValidationListener},
    config::PeerLifecycleConfig,
    coordinator::PeerLifecycleCoordinator,
    error::{PeerLifecycleError, Result},
    peer::{Peer, PeerId, PeerState},
    queue::ValidationCallbackQueue,
    registry::{ConnectionManager, PeerRegistry},
    reporter::PeerValidationReporter,
};

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
