//! Configuration for the validation queue and peer teardown.

use std::time::Duration;

/// Configuration shared by [`ValidationCallbackQueue`](crate::queue::ValidationCallbackQueue),
/// [`PeerRegistry`](crate::registry::PeerRegistry) and the coordinator.
#[derive(Debug, Clone)]
pub struct PeerLifecycleConfig {
    /// Name given to the callback consumer thread.
    /// Kept under 16 bytes so Linux does not truncate it.
    pub callback_thread_name: String,

    /// Upper bound on how long `sync_with_queue` waits for the consumer.
    /// `None` waits indefinitely.  When set, an expired drain surfaces as
    /// `DrainTimedOut` and is logged at error level.
    pub drain_timeout: Option<Duration>,

    /// Maximum number of peers in the routing table.
    pub max_peers: usize,
}

impl Default for PeerLifecycleConfig {
    fn default() -> Self {
        Self {
            callback_thread_name: "trv1ValCallback".to_string(),
            drain_timeout: None,
            max_peers: 200,
        }
    }
}

impl PeerLifecycleConfig {
    /// Create a config suitable for local testing: a bounded drain so a
    /// stalled consumer fails the test instead of hanging it.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            callback_thread_name: "trv1ValCbTest".to_string(),
            drain_timeout: Some(Duration::from_secs(10)),
            max_peers: 16,
        }
    }
}
