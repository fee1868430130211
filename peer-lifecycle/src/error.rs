//! Error types for peer teardown and the validation callback queue.

use {crate::peer::PeerId, thiserror::Error};

/// Errors that can occur while queueing validation callbacks or tearing
/// down peers.
#[derive(Error, Debug)]
pub enum PeerLifecycleError {
    /// The queue has been shut down; the callback was not accepted and will
    /// never run.
    #[error("validation callback queue is closed")]
    QueueClosed,

    /// A bounded drain expired before the consumer reached the barrier.
    /// This means the callback thread is stalled.
    #[error("validation queue drain timed out after {waited_ms}ms")]
    DrainTimedOut {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The consumer thread could not be started.
    #[error("failed to spawn validation callback thread: {0}")]
    ConsumerSpawn(#[from] std::io::Error),

    /// A peer with this id is already in the routing table.
    #[error("peer already registered: {0}")]
    PeerAlreadyRegistered(PeerId),

    /// Only a live, never-unlinked peer can be routed.
    #[error("{0} is not active and cannot be registered")]
    PeerNotActive(PeerId),

    /// Maximum peer count has been reached.
    #[error("maximum peers reached: {0}")]
    MaxPeersReached(usize),
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, PeerLifecycleError>;
