//! Peer disconnection ordered against the validation queue.
//!
//! Every disconnect runs the same three steps:
//!
//! 1. **Unlink**: remove the peer from the routing table so no new
//!    validation callback can resolve it (`Active → Unlinked`).
//! 2. **Drain**: `sync_with_queue()`, so every callback posted while the
//!    peer was still reachable has finished (`Unlinked → Draining`).
//! 3. **Destroy**: close the connection and drop the handle
//!    (`Draining → Destroyed`).
//!
//! A batch pays for one drain no matter how many peers it carries.  If the
//! drain fails, the peers are parked in `Draining` and destroyed by the next
//! barrier this coordinator completes.

use {
    crate::{
        error::Result,
        peer::{Peer, PeerId, PeerState},
        queue::ValidationCallbackQueue,
        registry::ConnectionManager,
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{
        mem,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Owns peer teardown.
pub struct PeerLifecycleCoordinator {
    connections: Arc<dyn ConnectionManager>,
    queue: Arc<ValidationCallbackQueue>,
    /// Unlinked peers whose drain failed; never destroyed before a barrier.
    pending: Mutex<Vec<Arc<Peer>>>,
    destroyed: AtomicU64,
}

impl PeerLifecycleCoordinator {
    /// Create a coordinator tearing down peers from `connections`.
    pub fn new(
        connections: Arc<dyn ConnectionManager>,
        queue: Arc<ValidationCallbackQueue>,
    ) -> Self {
        Self {
            connections,
            queue,
            pending: Mutex::new(Vec::new()),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Disconnect a single peer.
    ///
    /// Unknown or already-removed peers are a successful no-op.
    ///
    /// # Panics
    ///
    /// Panics when called from the validation callback thread, before any
    /// peer is touched.
    pub fn disconnect(&self, peer_id: PeerId) -> Result<()> {
        self.assert_off_callback_thread();
        let Some(peer) = self.unlink(peer_id) else {
            debug!("disconnect: {peer_id} already gone");
            return Ok(());
        };
        self.drain_and_destroy(vec![peer]).map(|_| ())
    }

    /// Disconnect every peer in `peer_ids` behind a single drain.
    ///
    /// The drain is issued even when no id resolves to a live peer, so
    /// callers that unlinked peers elsewhere can still rely on it.  Returns
    /// how many peers were destroyed, including any left over from an
    /// earlier failed drain.
    ///
    /// # Panics
    ///
    /// Panics when called from the validation callback thread.
    pub fn disconnect_batch<I>(&self, peer_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = PeerId>,
    {
        self.assert_off_callback_thread();
        let unlinked: Vec<Arc<Peer>> = peer_ids
            .into_iter()
            .filter_map(|peer_id| self.unlink(peer_id))
            .collect();
        info!("disconnecting {} peers behind one drain", unlinked.len());
        self.drain_and_destroy(unlinked)
    }

    /// Retry teardown of peers parked by an earlier failed drain.
    pub fn finish_pending_teardown(&self) -> Result<usize> {
        self.assert_off_callback_thread();
        if self.pending_teardown_count() == 0 {
            return Ok(0);
        }
        self.drain_and_destroy(Vec::new())
    }

    /// Peers unlinked but not yet destroyed because a drain failed.
    pub fn pending_teardown_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Total peers this coordinator has destroyed.
    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// The queue this coordinator drains.
    pub fn queue(&self) -> &Arc<ValidationCallbackQueue> {
        &self.queue
    }

    /// Teardown from the consumer thread could never drain; refuse it
    /// before unlinking anything or taking parked peers.
    fn assert_off_callback_thread(&self) {
        assert!(
            !self.queue.is_consumer_thread(),
            "peer teardown requested from the validation callback thread"
        );
    }

    fn unlink(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        let peer = self.connections.remove_peer(peer_id)?;
        peer.request_disconnect();
        if !peer.transition(PeerState::Active, PeerState::Unlinked) {
            warn!(
                "{peer_id} left the routing table in state {:?}; not tearing it down again",
                peer.state()
            );
            return None;
        }
        debug!("{peer_id} unlinked");
        Some(peer)
    }

    fn drain_and_destroy(&self, mut batch: Vec<Arc<Peer>>) -> Result<usize> {
        for peer in &batch {
            peer.transition(PeerState::Unlinked, PeerState::Draining);
        }
        // Parked peers were unlinked before this barrier is issued, so it
        // covers their callbacks too.  Take them first, never after.
        batch.append(&mut self.pending.lock());

        if let Err(err) = self.queue.sync_with_queue() {
            warn!(
                "validation queue drain failed, parking {} peers: {err}",
                batch.len()
            );
            self.pending.lock().append(&mut batch);
            return Err(err);
        }

        let count = batch.len();
        for peer in mem::take(&mut batch) {
            self.destroy(peer);
        }
        Ok(count)
    }

    fn destroy(&self, peer: Arc<Peer>) {
        if !peer.transition(PeerState::Draining, PeerState::Destroyed) {
            warn!(
                "{} not draining ({:?}); skipping destroy",
                peer.id(),
                peer.state()
            );
            return;
        }
        self.connections.close_connection(&peer);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        info!("{} destroyed", peer.id());
    }
}
