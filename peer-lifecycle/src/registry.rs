//! Peer routing table and the connection-manager seam.
//!
//! The [`PeerRegistry`] is the lookup structure that validation logic
//! consults to find "the peer that sent this block".  Once a peer has been
//! removed from it, no newly posted callback can resolve that peer.

use {
    crate::{
        config::PeerLifecycleConfig,
        error::{PeerLifecycleError, Result},
        peer::{Peer, PeerId, PeerState},
    },
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info},
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
    },
};

/// What the lifecycle coordinator needs from the connection layer.
pub trait ConnectionManager: Send + Sync {
    /// Unlink a peer from every routing structure and hand its handle to
    /// the caller.  `None` if the peer is unknown or already removed.
    fn remove_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>>;

    /// Socket-level teardown, called once the peer is safe to destroy.
    fn close_connection(&self, peer: &Peer);
}

/// Concurrent routing table keyed by [`PeerId`].
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, Arc<Peer>>,
    /// Reserved slots; bumped before insert so the cap holds under races.
    slots: AtomicUsize,
    max_peers: usize,
    next_peer_id: AtomicU64,
    closed_connections: AtomicU64,
}

impl PeerRegistry {
    /// Create a new, empty routing table.
    pub fn new(config: &PeerLifecycleConfig) -> Self {
        Self {
            peers: DashMap::new(),
            slots: AtomicUsize::new(0),
            max_peers: config.max_peers,
            next_peer_id: AtomicU64::new(1),
            closed_connections: AtomicU64::new(0),
        }
    }

    /// Allocate a new peer ID.
    pub fn next_peer_id(&self) -> PeerId {
        PeerId::new(self.next_peer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a freshly established connection under a new id.
    pub fn connect(&self, addr: SocketAddr, inbound: bool) -> Result<Arc<Peer>> {
        let peer = Arc::new(Peer::new(self.next_peer_id(), addr, inbound));
        self.add_peer(peer.clone())?;
        Ok(peer)
    }

    /// Insert a peer into the routing table.
    ///
    /// The peer must still be `Active`: a handle that has already entered
    /// teardown is rejected rather than routed again.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<()> {
        if peer.state() != PeerState::Active {
            return Err(PeerLifecycleError::PeerNotActive(peer.id()));
        }
        let max_peers = self.max_peers;
        if self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_peers).then(|| n.saturating_add(1))
            })
            .is_err()
        {
            return Err(PeerLifecycleError::MaxPeersReached(max_peers));
        }

        let peer_id = peer.id();
        match self.peers.entry(peer_id) {
            Entry::Occupied(_) => {
                self.slots.fetch_sub(1, Ordering::AcqRel);
                Err(PeerLifecycleError::PeerAlreadyRegistered(peer_id))
            }
            Entry::Vacant(vacant) => {
                info!(
                    "adding {} at {} (inbound={})",
                    peer_id,
                    peer.addr(),
                    peer.is_inbound()
                );
                vacant.insert(peer);
                Ok(())
            }
        }
    }

    /// Look up a routable peer.
    pub fn get_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&peer_id).map(|entry| entry.value().clone())
    }

    /// Whether the peer is still in the routing table.
    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    /// Number of routable peers, flagged or not.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers still routable that have not been asked to disconnect.
    pub fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|entry| !entry.value().is_disconnect_requested())
            .count()
    }

    /// Ids of routable peers that have been flagged for disconnection.
    ///
    /// The network thread sweeps these into
    /// [`disconnect_batch`](crate::coordinator::PeerLifecycleCoordinator::disconnect_batch).
    pub fn disconnect_requested(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_disconnect_requested())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// How many connections have been closed through this registry.
    pub fn closed_connections(&self) -> u64 {
        self.closed_connections.load(Ordering::Relaxed)
    }
}

impl ConnectionManager for PeerRegistry {
    fn remove_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(&peer_id)?;
        self.slots.fetch_sub(1, Ordering::AcqRel);
        info!("removed {} from routing table", peer_id);
        Some(peer)
    }

    fn close_connection(&self, peer: &Peer) {
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
        debug!("closed connection to {} ({})", peer.id(), peer.addr());
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, n], 8900))
    }

    #[test]
    fn test_connect_and_query_peer() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let peer = registry.connect(addr(1), true).unwrap();
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.contains(peer.id()));
        let found = registry.get_peer(peer.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &peer));
        assert!(found.is_inbound());
    }

    #[test]
    fn test_peer_ids_are_unique() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let a = registry.connect(addr(1), false).unwrap();
        let b = registry.connect(addr(2), false).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_max_peers_enforced() {
        let mut cfg = PeerLifecycleConfig::dev_default();
        cfg.max_peers = 2;
        let registry = PeerRegistry::new(&cfg);
        registry.connect(addr(1), false).unwrap();
        registry.connect(addr(2), false).unwrap();
        assert_matches!(
            registry.connect(addr(3), false),
            Err(PeerLifecycleError::MaxPeersReached(2))
        );
    }

    #[test]
    fn test_removal_frees_a_slot() {
        let mut cfg = PeerLifecycleConfig::dev_default();
        cfg.max_peers = 1;
        let registry = PeerRegistry::new(&cfg);
        let peer = registry.connect(addr(1), false).unwrap();
        assert!(registry.connect(addr(2), false).is_err());
        registry.remove_peer(peer.id()).unwrap();
        registry.connect(addr(2), false).unwrap();
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let peer = registry.connect(addr(1), false).unwrap();
        assert_matches!(
            registry.add_peer(peer.clone()),
            Err(PeerLifecycleError::PeerAlreadyRegistered(id)) if id == peer.id()
        );
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_peer_in_teardown_is_not_routed_again() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let peer = registry.connect(addr(1), false).unwrap();
        let removed = registry.remove_peer(peer.id()).unwrap();
        assert!(removed.transition(PeerState::Active, PeerState::Unlinked));

        assert_matches!(
            registry.add_peer(removed),
            Err(PeerLifecycleError::PeerNotActive(id)) if id == peer.id()
        );
        assert!(!registry.contains(peer.id()));
        // The rejected insert must not hold on to a slot.
        let mut cfg = PeerLifecycleConfig::dev_default();
        cfg.max_peers = 1;
        let capped = PeerRegistry::new(&cfg);
        assert_matches!(
            capped.add_peer(peer.clone()),
            Err(PeerLifecycleError::PeerNotActive(_))
        );
        capped.connect(addr(2), false).unwrap();
    }

    #[test]
    fn test_remove_peer_twice() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let peer = registry.connect(addr(1), false).unwrap();
        assert!(registry.remove_peer(peer.id()).is_some());
        assert!(registry.remove_peer(peer.id()).is_none());
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_disconnect_requested_filter() {
        let registry = PeerRegistry::new(&PeerLifecycleConfig::dev_default());
        let p1 = registry.connect(addr(1), false).unwrap();
        let p2 = registry.connect(addr(2), false).unwrap();
        p2.request_disconnect();
        assert_eq!(registry.disconnect_requested(), vec![p2.id()]);
        assert_eq!(registry.connected_count(), 1);
        let _ = p1;
    }
}
