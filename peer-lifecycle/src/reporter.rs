//! Peer-scoped validation verdicts.
//!
//! When the validation engine finishes checking a block relayed by a peer,
//! the verdict is posted to the callback queue and applied to the peer on
//! the consumer thread: invalid blocks add to the peer's misbehaviour score,
//! and crossing [`DISCONNECT_THRESHOLD`] flags the peer for disconnection.
//! The network thread later sweeps flagged peers into a batched disconnect.
//!
//! The posted task holds only a [`Weak<Peer>`]; it relies on the coordinator
//! draining the queue before the peer is destroyed.

use {
    crate::{
        callback::{BlockNotification, ValidationCallback, ValidationEvent},
        error::Result,
        peer::{Peer, PeerId},
        queue::ValidationCallbackQueue,
        registry::PeerRegistry,
    },
    log::{debug, error, warn},
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Misbehaviour charged for relaying an invalid block.
pub const INVALID_BLOCK_PENALTY: u32 = 100;

/// Score at which a peer is flagged for disconnection.
pub const DISCONNECT_THRESHOLD: u32 = 100;

/// Counters describing how posted verdicts were resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportStats {
    /// Verdicts applied to a live peer.
    pub delivered: u64,
    /// Verdicts dropped because the peer was already disconnecting.
    pub skipped_disconnecting: u64,
    /// Verdicts whose peer had been released before they ran.
    pub dangling: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    skipped_disconnecting: AtomicU64,
    dangling: AtomicU64,
}

/// Posts block verdicts that refer back to the relaying peer.
pub struct PeerValidationReporter {
    queue: Arc<ValidationCallbackQueue>,
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
}

impl PeerValidationReporter {
    /// Create a reporter posting to `queue` and resolving peers in `registry`.
    pub fn new(queue: Arc<ValidationCallbackQueue>, registry: Arc<PeerRegistry>) -> Self {
        Self {
            queue,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue the verdict for `block`, relayed by `peer_id`.
    ///
    /// Also posts a `BlockChecked` event for registered listeners.  Both are
    /// queued together, or neither is if the queue has been shut down.
    /// Returns `Ok(false)` without posting anything if the peer is not
    /// routable.
    pub fn report_block(
        &self,
        peer_id: PeerId,
        block: BlockNotification,
        valid: bool,
    ) -> Result<bool> {
        let Some(peer) = self.registry.get_peer(peer_id) else {
            debug!(
                "not reporting block {} from {peer_id}: peer not routable",
                block.height
            );
            return Ok(false);
        };
        let weak = Peer::downgrade(&peer);
        drop(peer);

        let counters = self.counters.clone();
        let verdict = ValidationCallback::task(move || {
            let Some(peer) = weak.upgrade() else {
                counters.dangling.fetch_add(1, Ordering::Relaxed);
                error!("{peer_id} was released before its block verdict ran");
                return;
            };
            if peer.is_disconnect_requested() {
                counters.skipped_disconnecting.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{peer_id} is disconnecting; dropping verdict for block {}",
                    block.height
                );
                return;
            }
            if !valid {
                let score = peer.misbehave(INVALID_BLOCK_PENALTY);
                if score >= DISCONNECT_THRESHOLD && peer.request_disconnect() {
                    warn!(
                        "{peer_id} relayed invalid block {} (score {score}); disconnecting",
                        block.height
                    );
                }
            }
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        });
        let checked = ValidationEvent::BlockChecked {
            block: BlockNotification {
                origin: Some(peer_id),
                ..block
            },
            valid,
        };

        self.queue.post_all([verdict, checked.into()])?;
        Ok(true)
    }

    /// Snapshot of how verdicts were resolved so far.
    pub fn stats(&self) -> ReportStats {
        ReportStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            skipped_disconnecting: self
                .counters
                .skipped_disconnecting
                .load(Ordering::Relaxed),
            dangling: self.counters.dangling.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::PeerLifecycleConfig, error::PeerLifecycleError, init_test_logger},
        assert_matches::assert_matches,
        solana_hash::Hash,
        std::net::SocketAddr,
    };

    fn setup() -> (Arc<ValidationCallbackQueue>, Arc<PeerRegistry>, PeerValidationReporter) {
        init_test_logger();
        let config = PeerLifecycleConfig::dev_default();
        let queue = Arc::new(ValidationCallbackQueue::new(&config).unwrap());
        let registry = Arc::new(PeerRegistry::new(&config));
        let reporter = PeerValidationReporter::new(queue.clone(), registry.clone());
        (queue, registry, reporter)
    }

    fn block(height: u64) -> BlockNotification {
        BlockNotification {
            hash: Hash::new_from_array([3; 32]),
            height,
            origin: None,
        }
    }

    #[test]
    fn test_invalid_block_flags_peer() {
        let (queue, registry, reporter) = setup();
        let peer = registry
            .connect(SocketAddr::from(([127, 0, 0, 1], 8900)), true)
            .unwrap();

        assert!(reporter.report_block(peer.id(), block(1), true).unwrap());
        queue.sync_with_queue().unwrap();
        assert!(!peer.is_disconnect_requested());

        assert!(reporter.report_block(peer.id(), block(2), false).unwrap());
        queue.sync_with_queue().unwrap();
        assert!(peer.is_disconnect_requested());
        assert_eq!(peer.misbehavior(), INVALID_BLOCK_PENALTY);
        assert_eq!(registry.disconnect_requested(), vec![peer.id()]);
        assert_eq!(
            reporter.stats(),
            ReportStats {
                delivered: 2,
                skipped_disconnecting: 0,
                dangling: 0,
            }
        );
    }

    #[test]
    fn test_unknown_peer_is_not_reported() {
        let (queue, _registry, reporter) = setup();
        assert!(!reporter.report_block(PeerId::new(42), block(1), false).unwrap());
        assert_eq!(queue.stats().posted, 0);
    }

    #[test]
    fn test_closed_queue_rejects_verdict_and_event_together() {
        let (queue, registry, reporter) = setup();
        let peer = registry
            .connect(SocketAddr::from(([127, 0, 0, 1], 8900)), false)
            .unwrap();
        assert!(reporter.report_block(peer.id(), block(1), true).unwrap());
        queue.sync_with_queue().unwrap();
        assert_eq!(queue.stats().posted, 2);

        queue.shutdown();
        assert_matches!(
            reporter.report_block(peer.id(), block(2), false),
            Err(PeerLifecycleError::QueueClosed)
        );
        assert_eq!(queue.stats().posted, 2);
        assert_eq!(reporter.stats().delivered, 1);
        assert_eq!(peer.misbehavior(), 0);
    }

    #[test]
    fn test_verdict_for_disconnecting_peer_is_skipped() {
        let (queue, registry, reporter) = setup();
        let peer = registry
            .connect(SocketAddr::from(([127, 0, 0, 1], 8900)), false)
            .unwrap();
        peer.request_disconnect();
        reporter.report_block(peer.id(), block(1), false).unwrap();
        queue.sync_with_queue().unwrap();
        assert_eq!(reporter.stats().skipped_disconnecting, 1);
        assert_eq!(peer.misbehavior(), 0);
    }
}
