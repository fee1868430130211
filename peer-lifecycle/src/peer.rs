//! Peer handle and its teardown state machine.
//!
//! A [`Peer`] lives in the routing table as an `Arc<Peer>`.  Validation code
//! that needs to refer back to the peer from a queued callback should capture
//! a [`Weak<Peer>`](std::sync::Weak) via [`Peer::downgrade`] so the callback
//! never keeps a torn-down peer alive on its own.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

/// Node-local peer identifier, allocated by the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

/// Teardown progress of a peer.
///
/// `Active → Unlinked → Draining → Destroyed`, one step at a time.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Reachable through the routing table.
    Active = 0,
    /// Removed from the routing table; no new callback can find it.
    Unlinked = 1,
    /// Waiting for the validation queue to drain.
    Draining = 2,
    /// Connection closed and handle released.
    Destroyed = 3,
}

impl PeerState {
    /// The only state this one may advance to.
    pub fn next(self) -> Option<PeerState> {
        match self {
            PeerState::Active => Some(PeerState::Unlinked),
            PeerState::Unlinked => Some(PeerState::Draining),
            PeerState::Draining => Some(PeerState::Destroyed),
            PeerState::Destroyed => None,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PeerState::Active,
            1 => PeerState::Unlinked,
            2 => PeerState::Draining,
            _ => PeerState::Destroyed,
        }
    }
}

/// A remote connection endpoint tracked by the node.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    /// Remote socket address; stands in for the connection handle.
    addr: SocketAddr,
    inbound: bool,
    connected_at: Instant,
    disconnect_requested: AtomicBool,
    /// Accumulated misbehaviour score.
    misbehavior: AtomicU32,
    state: AtomicU8,
}

impl Peer {
    /// Create a handle for a freshly accepted or dialled connection.
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool) -> Self {
        Self {
            id,
            addr,
            inbound,
            connected_at: Instant::now(),
            disconnect_requested: AtomicBool::new(false),
            misbehavior: AtomicU32::new(0),
            state: AtomicU8::new(PeerState::Active as u8),
        }
    }

    /// Routing id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the remote side dialled us.
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Seconds since the connection was established.
    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }

    /// Flag the peer for disconnection.
    ///
    /// Returns `true` only for the call that set the flag.
    pub fn request_disconnect(&self) -> bool {
        !self.disconnect_requested.swap(true, Ordering::AcqRel)
    }

    /// Whether the peer has been flagged for disconnection.
    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    /// Add `score` to the misbehaviour total and return the new total.
    pub fn misbehave(&self, score: u32) -> u32 {
        let previous = self
            .misbehavior
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_add(score))
            })
            .unwrap_or_else(|total| total);
        previous.saturating_add(score)
    }

    /// Current misbehaviour total.
    pub fn misbehavior(&self) -> u32 {
        self.misbehavior.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether teardown has completed.
    pub fn is_destroyed(&self) -> bool {
        self.state() == PeerState::Destroyed
    }

    /// Non-owning handle for use inside queued callbacks.
    pub fn downgrade(this: &Arc<Peer>) -> Weak<Peer> {
        Arc::downgrade(this)
    }

    /// Advance `from → to`.  Fails if `to` is not the successor of `from` or
    /// if another thread moved the peer first.
    pub(crate) fn transition(&self, from: PeerState, to: PeerState) -> bool {
        if from.next() != Some(to) {
            return false;
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(n: u8) -> Peer {
        Peer::new(
            PeerId::new(u64::from(n)),
            SocketAddr::from(([127, 0, 0, n], 8900)),
            false,
        )
    }

    #[test]
    fn test_transitions_are_sequential() {
        let peer = test_peer(1);
        assert_eq!(peer.state(), PeerState::Active);
        assert!(peer.transition(PeerState::Active, PeerState::Unlinked));
        assert!(peer.transition(PeerState::Unlinked, PeerState::Draining));
        assert!(peer.transition(PeerState::Draining, PeerState::Destroyed));
        assert!(peer.is_destroyed());
    }

    #[test]
    fn test_transition_cannot_skip_draining() {
        let peer = test_peer(1);
        assert!(peer.transition(PeerState::Active, PeerState::Unlinked));
        assert!(!peer.transition(PeerState::Unlinked, PeerState::Destroyed));
        assert_eq!(peer.state(), PeerState::Unlinked);
    }

    #[test]
    fn test_transition_is_not_reentrant() {
        let peer = test_peer(1);
        assert!(peer.transition(PeerState::Active, PeerState::Unlinked));
        // A second teardown attempt from the same starting point loses.
        assert!(!peer.transition(PeerState::Active, PeerState::Unlinked));
    }

    #[test]
    fn test_request_disconnect_reports_first_caller() {
        let peer = test_peer(1);
        assert!(!peer.is_disconnect_requested());
        assert!(peer.request_disconnect());
        assert!(!peer.request_disconnect());
        assert!(peer.is_disconnect_requested());
    }

    #[test]
    fn test_misbehave_accumulates_and_saturates() {
        let peer = test_peer(1);
        assert_eq!(peer.misbehave(10), 10);
        assert_eq!(peer.misbehave(90), 100);
        assert_eq!(peer.misbehave(u32::MAX), u32::MAX);
        assert_eq!(peer.misbehavior(), u32::MAX);
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId::new(7).to_string(), "peer=7");
    }
}
