//! Change notifications.
//!
//! Writers enqueue events onto a bounded MPMC channel while still holding the
//! writer mutex, so subscribers observe commit order. A dedicated dispatcher
//! thread invokes callbacks; the writer path never runs user code. When the
//! queue is full the writer blocks briefly, then sheds the oldest queued
//! event and counts it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::nut::Nut;

/// A committed write, tombstones included.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    pub nut: Nut<T>,
}

type Callback<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&Nut<T>) -> bool + Send + Sync>;

struct SubEntry<T> {
    id: u64,
    predicate: Option<Predicate<T>>,
    callback: Callback<T>,
}

impl<T> Clone for SubEntry<T> {
    fn clone(&self) -> Self {
        SubEntry {
            id: self.id,
            predicate: self.predicate.clone(),
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Handle returned by `Tree::subscribe`; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

pub(crate) struct Dispatcher<T> {
    tx: Mutex<Option<Sender<ChangeEvent<T>>>>,
    overflow_rx: Receiver<ChangeEvent<T>>,
    subscribers: Arc<RwLock<Vec<SubEntry<T>>>>,
    next_id: AtomicU64,
    send_timeout: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> Dispatcher<T> {
    pub fn start(queue_capacity: usize, send_timeout: Duration) -> Self {
        let (tx, rx) = bounded::<ChangeEvent<T>>(queue_capacity.max(1));
        let subscribers: Arc<RwLock<Vec<SubEntry<T>>>> = Arc::new(RwLock::new(Vec::new()));
        let overflow_rx = rx.clone();

        let subs = Arc::clone(&subscribers);
        let handle = std::thread::Builder::new()
            .name("acorn-dispatch".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    // Snapshot the subscriber list so callbacks never run
                    // under the registry lock.
                    let entries: Vec<SubEntry<T>> = subs.read().clone();
                    for entry in &entries {
                        let interested = entry
                            .predicate
                            .as_ref()
                            .is_none_or(|predicate| predicate(&event.nut));
                        if !interested {
                            continue;
                        }
                        let callback = &entry.callback;
                        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err()
                        {
                            tracing::warn!(subscriber = entry.id, "subscriber callback panicked");
                        }
                    }
                }
            })
            .expect("failed to spawn dispatcher thread");

        Dispatcher {
            tx: Mutex::new(Some(tx)),
            overflow_rx,
            subscribers,
            next_id: AtomicU64::new(1),
            send_timeout,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an event. Returns the number of events shed to make room.
    pub fn publish(&self, event: ChangeEvent<T>) -> u64 {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return 0;
        };
        match tx.send_timeout(event, self.send_timeout) {
            Ok(()) => 0,
            Err(SendTimeoutError::Timeout(event)) => {
                // Queue stayed full past the backpressure window: shed the
                // oldest queued event so the newest write is not lost.
                let shed = u64::from(self.overflow_rx.try_recv().is_ok());
                match tx.try_send(event) {
                    Ok(()) => shed,
                    Err(_) => shed + 1,
                }
            }
            Err(SendTimeoutError::Disconnected(_)) => 0,
        }
    }

    pub fn subscribe(
        &self,
        predicate: Option<Predicate<T>>,
        callback: Callback<T>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(SubEntry {
            id,
            predicate,
            callback,
        });
        let subs = Arc::downgrade(&self.subscribers);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(subs) = subs.upgrade() {
                    subs.write().retain(|entry| entry.id != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drop the sender so the dispatcher drains its queue and exits, then
    /// join it (unless called from the dispatcher thread itself).
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
