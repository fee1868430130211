//! Ordered validation callback queue with a synchronous drain barrier.
//!
//! Producers on any thread [`post`](ValidationCallbackQueue::post) callbacks;
//! a single dedicated consumer thread executes them in insertion order.
//! [`sync_with_queue`](ValidationCallbackQueue::sync_with_queue) enqueues a
//! barrier marker behind everything already posted and blocks until the
//! consumer reaches it.  Because the channel is FIFO, every callback posted
//! before the barrier has run by the time the call returns, and the channel
//! hand-off gives the caller visibility of their side effects.
//!
//! A callback posted concurrently with a barrier lands either in front of
//! the marker (runs before the barrier returns) or behind it (runs later).
//! It is never dropped and never run twice.

use {
    crate::{
        callback::{
            ListenerId, SharedListener, ValidationCallback, ValidationEvent, ValidationListener,
        },
        config::PeerLifecycleConfig,
        error::{PeerLifecycleError, Result},
    },
    crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    parking_lot::{Mutex, RwLock},
    std::{
        any::Any,
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle, ThreadId},
        time::{Duration, Instant},
    },
};

enum QueueItem {
    Callback(ValidationCallback),
    Barrier(Sender<()>),
}

/// Point-in-time counters for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Callbacks accepted by `post`.
    pub posted: u64,
    /// Callbacks the consumer has finished with, including failed ones.
    pub executed: u64,
    /// Task or listener invocations that panicked.
    pub failed: u64,
    /// Drain barriers the consumer has reached.
    pub barriers: u64,
    /// Items (callbacks and barriers) waiting in the channel.
    pub backlog: usize,
}

#[derive(Default)]
struct Counters {
    posted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    barriers: AtomicU64,
}

/// State shared with the consumer thread.
#[derive(Default)]
struct Shared {
    listeners: RwLock<Vec<(ListenerId, SharedListener)>>,
    counters: Counters,
}

impl Shared {
    fn execute(&self, callback: ValidationCallback) {
        trace!("executing {} callback", callback.kind());
        match callback {
            ValidationCallback::Task(task) => self.guarded("Task", task),
            ValidationCallback::Event(event) => self.notify(&event),
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn notify(&self, event: &ValidationEvent) {
        // Snapshot so listeners may (un)register from inside a notification.
        let listeners: Vec<SharedListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            self.guarded(event.kind(), || event.dispatch(listener.as_ref()));
        }
    }

    /// Run one unit of work; a panic is logged and counted, never propagated.
    fn guarded(&self, kind: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                "validation callback ({kind}) panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Process-wide queue of validation callbacks, consumed by one thread.
///
/// Constructed once at startup and shared as `Arc<ValidationCallbackQueue>`
/// between validation producers and the
/// [`PeerLifecycleCoordinator`](crate::coordinator::PeerLifecycleCoordinator).
pub struct ValidationCallbackQueue {
    /// `None` once shut down.
    sender: RwLock<Option<Sender<QueueItem>>>,
    shared: Arc<Shared>,
    next_listener_id: AtomicU64,
    consumer: Mutex<Option<JoinHandle<()>>>,
    consumer_id: ThreadId,
    drain_timeout: Option<Duration>,
}

impl ValidationCallbackQueue {
    /// Create the queue and start its consumer thread.
    pub fn new(config: &PeerLifecycleConfig) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared::default());

        let consumer = Builder::new()
            .name(config.callback_thread_name.clone())
            .spawn({
                let shared = shared.clone();
                move || Self::run(&receiver, &shared)
            })?;
        let consumer_id = consumer.thread().id();

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            shared,
            next_listener_id: AtomicU64::new(0),
            consumer: Mutex::new(Some(consumer)),
            consumer_id,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Consumer loop.  Exits once every sender is gone and the backlog is
    /// empty, so shutdown never abandons queued callbacks.
    fn run(receiver: &Receiver<QueueItem>, shared: &Shared) {
        info!("validation callback thread started");
        for item in receiver.iter() {
            match item {
                QueueItem::Callback(callback) => shared.execute(callback),
                QueueItem::Barrier(done) => {
                    shared.counters.barriers.fetch_add(1, Ordering::Relaxed);
                    // The waiter may have timed out and gone away.
                    let _ = done.send(());
                }
            }
        }
        info!(
            "validation callback thread exiting after {} callbacks",
            shared.counters.executed.load(Ordering::Relaxed)
        );
    }

    /// Append a callback to the tail of the queue.  Never blocks.
    pub fn post(&self, callback: ValidationCallback) -> Result<()> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            debug!("rejecting {} callback: queue closed", callback.kind());
            return Err(PeerLifecycleError::QueueClosed);
        };
        sender
            .send(QueueItem::Callback(callback))
            .map_err(|_| PeerLifecycleError::QueueClosed)?;
        self.shared.counters.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append callbacks back to back under one check of the closed flag.
    ///
    /// Either every callback is queued, in order, or the queue is closed and
    /// none is.  Other producers may still interleave with them.
    pub fn post_all<I>(&self, callbacks: I) -> Result<u64>
    where
        I: IntoIterator<Item = ValidationCallback>,
    {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            debug!("rejecting callbacks: queue closed");
            return Err(PeerLifecycleError::QueueClosed);
        };
        let mut posted = 0u64;
        for callback in callbacks {
            sender
                .send(QueueItem::Callback(callback))
                .map_err(|_| PeerLifecycleError::QueueClosed)?;
            posted = posted.saturating_add(1);
        }
        self.shared
            .counters
            .posted
            .fetch_add(posted, Ordering::Relaxed);
        Ok(posted)
    }

    /// Post an event for the registered listeners.
    pub fn post_event(&self, event: ValidationEvent) -> Result<()> {
        self.post(ValidationCallback::Event(event))
    }

    /// Post a one-shot closure to run on the consumer thread.
    pub fn post_task<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(ValidationCallback::task(f))
    }

    /// Block until every callback posted before this call has executed.
    ///
    /// Honours the configured `drain_timeout`.  Must not be called from
    /// the consumer thread, nor while holding a lock a callback needs.
    ///
    /// # Panics
    ///
    /// Panics when called from the consumer thread, where it could only
    /// deadlock.
    pub fn sync_with_queue(&self) -> Result<()> {
        self.barrier(self.drain_timeout)
    }

    /// Like [`sync_with_queue`](Self::sync_with_queue) with an explicit
    /// bound.  An expired wait returns `DrainTimedOut`; callbacks keep
    /// running and the abandoned barrier is skipped when reached.
    pub fn sync_with_queue_timeout(&self, timeout: Duration) -> Result<()> {
        self.barrier(Some(timeout))
    }

    fn barrier(&self, timeout: Option<Duration>) -> Result<()> {
        assert!(
            !self.is_consumer_thread(),
            "sync_with_queue called from the validation callback thread"
        );

        let (done_sender, done_receiver) = bounded(1);
        {
            let sender = self.sender.read();
            let Some(sender) = sender.as_ref() else {
                return Err(PeerLifecycleError::QueueClosed);
            };
            sender
                .send(QueueItem::Barrier(done_sender))
                .map_err(|_| PeerLifecycleError::QueueClosed)?;
        }

        let started = Instant::now();
        let Some(timeout) = timeout else {
            return done_receiver
                .recv()
                .map_err(|_| PeerLifecycleError::QueueClosed);
        };
        match done_receiver.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                error!(
                    "validation queue drain timed out after {waited_ms}ms \
                     ({} items still queued); callback thread is stalled",
                    self.backlog()
                );
                Err(PeerLifecycleError::DrainTimedOut { waited_ms })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PeerLifecycleError::QueueClosed),
        }
    }

    /// Subscribe a listener to every subsequently executed event.
    pub fn register_listener(&self, listener: Arc<dyn ValidationListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push((id, listener));
        debug!("registered validation listener {id:?}");
        id
    }

    /// Remove a listener.  A notification already being delivered may still
    /// reach it; follow with `sync_with_queue` before dropping state the
    /// listener uses.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().len()
    }

    /// Whether the calling thread is the consumer thread.
    pub fn is_consumer_thread(&self) -> bool {
        thread::current().id() == self.consumer_id
    }

    /// Whether `shutdown` has run.
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    fn backlog(&self) -> usize {
        self.sender.read().as_ref().map_or(0, |sender| sender.len())
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let counters = &self.shared.counters;
        QueueStats {
            posted: counters.posted.load(Ordering::Relaxed),
            executed: counters.executed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            barriers: counters.barriers.load(Ordering::Relaxed),
            backlog: self.backlog(),
        }
    }

    /// Stop accepting callbacks, let the consumer drain what is queued, and
    /// join it.  Idempotent.  From the consumer thread itself this only
    /// closes the queue; the join happens on a later call or on drop.
    pub fn shutdown(&self) {
        if let Some(sender) = self.sender.write().take() {
            info!(
                "closing validation callback queue ({} items pending)",
                sender.len()
            );
        }
        if self.is_consumer_thread() {
            return;
        }
        if let Some(consumer) = self.consumer.lock().take() {
            if consumer.join().is_err() {
                error!("validation callback thread panicked");
            }
        }
    }
}

impl Drop for ValidationCallbackQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
