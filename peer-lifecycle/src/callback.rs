//! Validation notifications and the units of work carried by the queue.
//!
//! A [`ValidationCallback`] is either a [`ValidationEvent`], fanned out to
//! every registered [`ValidationListener`] when the consumer reaches it, or
//! a one-shot task closure.

use {
    crate::peer::PeerId,
    solana_hash::Hash,
    std::{fmt, sync::Arc},
};

/// A block as seen by validation listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNotification {
    pub hash: Hash,
    pub height: u64,
    /// Peer that relayed the block, if it came from the network.
    pub origin: Option<PeerId>,
}

/// A transaction as seen by validation listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionNotification {
    pub txid: Hash,
    pub origin: Option<PeerId>,
}

/// Why a transaction left the mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced,
}

/// Result of the validation engine, delivered asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationEvent {
    BlockConnected(BlockNotification),
    BlockDisconnected(BlockNotification),
    UpdatedBlockTip {
        tip: BlockNotification,
        initial_download: bool,
    },
    TransactionAddedToMempool(TransactionNotification),
    TransactionRemovedFromMempool {
        tx: TransactionNotification,
        reason: RemovalReason,
    },
    BlockChecked {
        block: BlockNotification,
        valid: bool,
    },
}

impl ValidationEvent {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationEvent::BlockConnected(_) => "BlockConnected",
            ValidationEvent::BlockDisconnected(_) => "BlockDisconnected",
            ValidationEvent::UpdatedBlockTip { .. } => "UpdatedBlockTip",
            ValidationEvent::TransactionAddedToMempool(_) => "TransactionAddedToMempool",
            ValidationEvent::TransactionRemovedFromMempool { .. } => {
                "TransactionRemovedFromMempool"
            }
            ValidationEvent::BlockChecked { .. } => "BlockChecked",
        }
    }

    /// The peer this event refers to, if any.
    pub fn origin(&self) -> Option<PeerId> {
        match self {
            ValidationEvent::BlockConnected(block)
            | ValidationEvent::BlockDisconnected(block)
            | ValidationEvent::UpdatedBlockTip { tip: block, .. }
            | ValidationEvent::BlockChecked { block, .. } => block.origin,
            ValidationEvent::TransactionAddedToMempool(tx)
            | ValidationEvent::TransactionRemovedFromMempool { tx, .. } => tx.origin,
        }
    }

    /// Invoke the matching listener method.
    pub(crate) fn dispatch(&self, listener: &dyn ValidationListener) {
        match self {
            ValidationEvent::BlockConnected(block) => listener.block_connected(block),
            ValidationEvent::BlockDisconnected(block) => listener.block_disconnected(block),
            ValidationEvent::UpdatedBlockTip {
                tip,
                initial_download,
            } => listener.updated_block_tip(tip, *initial_download),
            ValidationEvent::TransactionAddedToMempool(tx) => {
                listener.transaction_added_to_mempool(tx)
            }
            ValidationEvent::TransactionRemovedFromMempool { tx, reason } => {
                listener.transaction_removed_from_mempool(tx, *reason)
            }
            ValidationEvent::BlockChecked { block, valid } => listener.block_checked(block, *valid),
        }
    }
}

/// Receiver of validation notifications.
///
/// Every method runs on the queue's consumer thread and defaults to a
/// no-op.  Implementations must not call
/// [`sync_with_queue`](crate::queue::ValidationCallbackQueue::sync_with_queue).
pub trait ValidationListener: Send + Sync {
    fn block_connected(&self, _block: &BlockNotification) {}

    fn block_disconnected(&self, _block: &BlockNotification) {}

    fn updated_block_tip(&self, _tip: &BlockNotification, _initial_download: bool) {}

    fn transaction_added_to_mempool(&self, _tx: &TransactionNotification) {}

    fn transaction_removed_from_mempool(
        &self,
        _tx: &TransactionNotification,
        _reason: RemovalReason,
    ) {
    }

    fn block_checked(&self, _block: &BlockNotification, _valid: bool) {}
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) type SharedListener = Arc<dyn ValidationListener>;

/// A boxed one-shot task.
pub type ValidationTask = Box<dyn FnOnce() + Send + 'static>;

/// One entry in the validation queue.  Immutable once posted.
pub enum ValidationCallback {
    /// Fanned out to the listeners registered when the consumer reaches it.
    Event(ValidationEvent),
    /// Runs once on the consumer thread.
    Task(ValidationTask),
}

impl ValidationCallback {
    /// Wrap a closure as a task callback.
    pub fn task<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        ValidationCallback::Task(Box::new(f))
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationCallback::Event(event) => event.kind(),
            ValidationCallback::Task(_) => "Task",
        }
    }
}

impl From<ValidationEvent> for ValidationCallback {
    fn from(event: ValidationEvent) -> Self {
        ValidationCallback::Event(event)
    }
}

impl fmt::Debug for ValidationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationCallback::Event(event) => f.debug_tuple("Event").field(event).finish(),
            ValidationCallback::Task(_) => f.write_str("Task(..)"),
        }
    }
}
