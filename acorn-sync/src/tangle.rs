//! A Tangle replicates one Tree's writes to a sink.
//!
//! Local writes arrive through the source Tree's change feed and are pushed
//! from a dedicated worker thread with exponential backoff; records that
//! exhaust their retries land in a bounded to-replicate queue that the next
//! `shake` drains. `pull` fetches the sink's delta since the last sync and
//! merges it through LWW import.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use acorn_core::{ImportOutcome, Nut, Payload, Subscription, Tree};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::sink::TangleSink;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TangleConfig {
    pub retry: RetryPolicy,
    /// Change-feed queue between the source Tree and the push worker.
    pub queue_capacity: usize,
    /// Bound on the to-replicate queue; beyond it the oldest entry is
    /// dropped and counted.
    pub pending_cap: usize,
}

impl Default for TangleConfig {
    fn default() -> Self {
        TangleConfig {
            retry: RetryPolicy::default(),
            queue_capacity: 1024,
            pending_cap: 4096,
        }
    }
}

/// Point-in-time counters for one replication session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TangleStats {
    pub id: Uuid,
    pub target: String,
    pub pushes: u64,
    pub pulls: u64,
    pub push_failures: u64,
    pub dropped: u64,
    pub pending: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShakeOutcome {
    pub pushed: usize,
    pub pulled: usize,
}

enum WorkMsg<T> {
    Push(Nut<T>),
    Shutdown,
}

pub struct Tangle<T: Payload> {
    inner: Arc<TangleInner<T>>,
    subscription: Mutex<Option<Subscription>>,
    tx: Mutex<Option<Sender<WorkMsg<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TangleInner<T: Payload> {
    id: Uuid,
    source: Tree<T>,
    sink: Arc<dyn TangleSink<T>>,
    config: TangleConfig,
    last_sync: Mutex<Option<OffsetDateTime>>,
    pending: Mutex<VecDeque<Nut<T>>>,
    stopping: AtomicBool,
    pushes: AtomicU64,
    pulls: AtomicU64,
    push_failures: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Payload> Tangle<T> {
    pub fn new(source: &Tree<T>, sink: impl TangleSink<T>) -> Self {
        Self::with_config(source, sink, TangleConfig::default())
    }

    pub fn with_config(
        source: &Tree<T>,
        sink: impl TangleSink<T>,
        config: TangleConfig,
    ) -> Self {
        let inner = Arc::new(TangleInner {
            id: Uuid::new_v4(),
            source: source.clone(),
            sink: Arc::new(sink),
            config,
            last_sync: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
            pushes: AtomicU64::new(0),
            pulls: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let (tx, rx) = bounded::<WorkMsg<T>>(config.queue_capacity.max(1));

        // The change-feed callback runs on the Tree's dispatcher thread and
        // must never block: full queue means drop-and-count.
        let feed: Weak<TangleInner<T>> = Arc::downgrade(&inner);
        let feed_tx = tx.clone();
        let subscription = source.subscribe(move |event| {
            let Some(inner) = feed.upgrade() else {
                return;
            };
            if inner.stopping.load(Ordering::Acquire) {
                return;
            }
            match feed_tx.try_send(WorkMsg::Push(event.nut.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("acorn-tangle".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        WorkMsg::Push(nut) => worker_inner.push_with_retry(nut),
                        WorkMsg::Shutdown => {
                            // park whatever is still queued; a later shake
                            // replays it
                            while let Ok(WorkMsg::Push(nut)) = rx.try_recv() {
                                worker_inner.enqueue_pending(nut);
                            }
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn tangle worker thread");

        Tangle {
            inner,
            subscription: Mutex::new(Some(subscription)),
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Fetch the sink's changes since the last sync and merge them locally.
    /// Advances the sync cursor to the newest timestamp seen.
    pub fn pull(&self) -> SyncResult<usize> {
        let since = *self.inner.last_sync.lock();
        let nuts = self.inner.sink.pull_since(since)?;
        let mut newest = since;
        let mut accepted = 0;
        for nut in nuts {
            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }
            let ts = nut.timestamp;
            if self.inner.source.import(nut)? == ImportOutcome::Accepted {
                accepted += 1;
            }
            self.inner.pulls.fetch_add(1, Ordering::Relaxed);
            if newest.is_none_or(|current| ts > current) {
                newest = Some(ts);
            }
        }
        *self.inner.last_sync.lock() = newest;
        Ok(accepted)
    }

    /// One-shot bidirectional sync: drain the to-replicate queue, push every
    /// local change since the last sync, then pull.
    pub fn shake(&self) -> SyncResult<ShakeOutcome> {
        let mut pushed = self.inner.flush_pending()?;
        let since = *self.inner.last_sync.lock();
        for nut in self.inner.source.export_changes_since(since)? {
            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }
            self.inner.sink.push(&nut)?;
            self.inner.pushes.fetch_add(1, Ordering::Relaxed);
            pushed += 1;
        }
        let pulled = self.pull()?;
        self.inner.source.mark_sync_completed();
        Ok(ShakeOutcome { pushed, pulled })
    }

    pub fn stats(&self) -> TangleStats {
        TangleStats {
            id: self.inner.id,
            target: self.inner.sink.describe(),
            pushes: self.inner.pushes.load(Ordering::Relaxed),
            pulls: self.inner.pulls.load(Ordering::Relaxed),
            push_failures: self.inner.push_failures.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            pending: self.inner.pending.lock().len(),
            last_sync: *self.inner.last_sync.lock(),
        }
    }

    /// Stop replication: unhook from the change feed, let the worker finish
    /// its in-flight record (retries bail once stopping is set), park the
    /// rest in the pending queue, and join.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(WorkMsg::Shutdown);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl<T: Payload> Drop for Tangle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Payload> TangleInner<T> {
    fn push_with_retry(&self, nut: Nut<T>) {
        let mut delay = self.config.retry.base_delay;
        for attempt in 1..=self.config.retry.max_attempts.max(1) {
            match self.sink.push(&nut) {
                Ok(_) => {
                    self.pushes.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    self.push_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tangle = %self.id,
                        id = %nut.id,
                        attempt,
                        %err,
                        "push to sink failed"
                    );
                    if self.stopping.load(Ordering::Acquire)
                        || attempt == self.config.retry.max_attempts.max(1)
                    {
                        break;
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.config.retry.max_delay);
                }
            }
        }
        self.enqueue_pending(nut);
    }

    fn enqueue_pending(&self, nut: Nut<T>) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.pending_cap {
            pending.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(tangle = %self.id, "to-replicate queue full, dropping oldest");
        }
        pending.push_back(nut);
    }

    /// Re-deliver parked records in arrival order. Stops (and keeps the
    /// remainder) at the first failure.
    fn flush_pending(&self) -> SyncResult<usize> {
        let mut flushed = 0;
        loop {
            let Some(nut) = self.pending.lock().pop_front() else {
                return Ok(flushed);
            };
            match self.sink.push(&nut) {
                Ok(_) => {
                    self.pushes.fetch_add(1, Ordering::Relaxed);
                    flushed += 1;
                }
                Err(err) => {
                    self.pending.lock().push_front(nut);
                    return Err(err);
                }
            }
        }
    }
}
