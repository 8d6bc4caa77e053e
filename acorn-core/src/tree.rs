//! The per-collection store engine.
//!
//! A `Tree` composes a trunk, the storage pipeline, a cache strategy, and a
//! serializer, and owns the TTL reaper, subscription dispatcher, and stats
//! counters. All writes for one Tree funnel through a single writer mutex;
//! reads go through the cache and may hit the trunk concurrently.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::cache::{self, CachePolicy, CacheStrategy};
use crate::codec::{JsonCodec, NutCodec};
use crate::error::{AcornError, AcornResult};
use crate::nut::{unix_ms, HasId, Nut};
use crate::pipeline::{Pipeline, Root};
use crate::shell::NutShell;
use crate::stats::{TreeCounters, TreeStats};
use crate::subscribe::{ChangeEvent, Dispatcher, Subscription};
use crate::trunk::Trunk;

/// Blanket bound for everything a Tree stores.
pub trait Payload:
    serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<T> Payload for T where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static
{
}

/// Outcome of the last-writer-wins merge performed by [`Tree::import`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ImportOutcome {
    Accepted,
    RejectedOlder,
    RejectedEqual,
}

/// Verdict of a squabble between the local record and an incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquabbleVerdict {
    IncomingWins,
    LocalWins,
    Identical,
}

/// TTL enforcement policy for one Tree.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub enabled: bool,
    /// Applied to every stash that doesn't specify its own expiry.
    pub default_ttl: Option<Duration>,
    /// Fallback scan cadence; the reaper usually wakes on expiry hints.
    pub reap_interval: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        TtlPolicy {
            enabled: true,
            default_ttl: None,
            reap_interval: Duration::from_millis(250),
        }
    }
}

pub struct TreeBuilder<T: Payload> {
    trunk: Arc<dyn Trunk>,
    roots: Vec<Arc<dyn Root>>,
    codec: Arc<dyn NutCodec<T>>,
    cache: CachePolicy,
    ttl: TtlPolicy,
    queue_capacity: usize,
    backpressure: Duration,
}

impl<T: Payload> TreeBuilder<T> {
    pub fn root(mut self, root: impl Root + 'static) -> Self {
        self.roots.push(Arc::new(root));
        self
    }

    pub fn roots(mut self, roots: Vec<Arc<dyn Root>>) -> Self {
        self.roots = roots;
        self
    }

    pub fn codec(mut self, codec: impl NutCodec<T> + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    pub fn ttl(mut self, policy: TtlPolicy) -> Self {
        self.ttl = policy;
        self
    }

    /// Subscription queue depth and how long a writer blocks on a full queue
    /// before the oldest event is shed.
    pub fn event_queue(mut self, capacity: usize, backpressure: Duration) -> Self {
        self.queue_capacity = capacity;
        self.backpressure = backpressure;
        self
    }

    pub fn open(self) -> AcornResult<Tree<T>> {
        let pipeline = Pipeline::new(self.roots)?;
        // One startup scan seeds the live count and the expiry heap.
        let live = self.trunk.load_all()?;

        let counters = TreeCounters::default();
        counters
            .nut_count
            .store(live.len() as u64, Ordering::Relaxed);

        let ttl = self.ttl.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<TreeInner<T>>| {
            let reaper = ttl
                .enabled
                .then(|| Reaper::spawn(weak.clone(), ttl.reap_interval));
            TreeInner {
                token: next_tree_token(),
                trunk: self.trunk,
                pipeline,
                codec: self.codec,
                cache: Mutex::new(cache::build(self.cache)),
                writer: Mutex::new(()),
                counters,
                dispatcher: Dispatcher::start(self.queue_capacity, self.backpressure),
                reaper,
                ttl,
                last_sync: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        });

        for shell in &live {
            if let Some(at) = shell.expires_at_ms {
                inner.schedule_expiry_at(&shell.id, at);
            }
        }

        Ok(Tree { inner })
    }
}

/// Typed handle to one store. Cheap to clone; all clones share state.
pub struct Tree<T: Payload> {
    inner: Arc<TreeInner<T>>,
}

impl<T: Payload> Clone for Tree<T> {
    fn clone(&self) -> Self {
        Tree {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> std::fmt::Debug for Tree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("stats", &self.inner.counters.snapshot())
            .finish()
    }
}

impl<T: Payload> Tree<T> {
    pub fn builder(trunk: impl Trunk) -> TreeBuilder<T> {
        TreeBuilder {
            trunk: Arc::new(trunk),
            roots: Vec::new(),
            codec: Arc::new(JsonCodec),
            cache: CachePolicy::default(),
            ttl: TtlPolicy::default(),
            queue_capacity: 1024,
            backpressure: Duration::from_millis(25),
        }
    }

    /// Open with defaults: JSON codec, empty pipeline, LRU cache, TTL on.
    pub fn open(trunk: impl Trunk) -> AcornResult<Self> {
        Self::builder(trunk).open()
    }

    /// Store a value whose payload type carries its own id.
    pub fn stash(&self, value: T) -> AcornResult<()>
    where
        T: HasId,
    {
        let id = value.id().to_owned();
        self.inner.stash_with(&id, value, None)
    }

    /// Store a value under an explicit id.
    pub fn stash_with(&self, id: &str, value: T) -> AcornResult<()> {
        self.inner.stash_with(id, value, None)
    }

    /// Store a value that expires `ttl` from now, overriding the Tree default.
    pub fn stash_with_ttl(&self, id: &str, value: T, ttl: Duration) -> AcornResult<()> {
        self.inner.stash_with(id, value, Some(ttl))
    }

    /// Fetch the current payload for `id`; absent ids and tombstones are
    /// `Ok(None)`, never an error.
    pub fn crack(&self, id: &str) -> AcornResult<Option<T>> {
        self.inner.crack(id)
    }

    /// Write a tombstone for `id`. Tossing an absent id still writes a
    /// `version = 1` tombstone so replicas converge.
    pub fn toss(&self, id: &str) -> AcornResult<()> {
        self.inner.toss(id)
    }

    /// Full retained history for `id`, oldest first. Requires a
    /// history-capable trunk.
    pub fn get_history(&self, id: &str) -> AcornResult<Vec<Nut<T>>> {
        if !self.inner.trunk.capabilities().history {
            return Err(AcornError::Unsupported("history"));
        }
        self.inner
            .trunk
            .get_history(id)?
            .iter()
            .map(|shell| self.inner.decode_shell(shell))
            .collect()
    }

    /// Change feed: the current record per id (tombstones included) with
    /// `timestamp >= since`. Order is unspecified but duplicate-free.
    pub fn export_changes_since(
        &self,
        since: Option<OffsetDateTime>,
    ) -> AcornResult<Vec<Nut<T>>> {
        let mut latest: HashMap<String, NutShell> = HashMap::new();
        for shell in self.inner.trunk.export_changes()? {
            match latest.get(&shell.id) {
                Some(existing) if existing.recency() >= shell.recency() => {}
                _ => {
                    latest.insert(shell.id.clone(), shell);
                }
            }
        }
        let since_ms = since.map(unix_ms);
        latest
            .into_values()
            .filter(|shell| since_ms.is_none_or(|cutoff| shell.timestamp_ms >= cutoff))
            .map(|shell| self.inner.decode_shell(&shell))
            .collect()
    }

    /// Merge a replicated record via last-writer-wins.
    pub fn import(&self, incoming: Nut<T>) -> AcornResult<ImportOutcome> {
        self.inner.import(incoming)
    }

    pub fn import_batch(
        &self,
        incoming: impl IntoIterator<Item = Nut<T>>,
    ) -> AcornResult<Vec<ImportOutcome>> {
        incoming.into_iter().map(|nut| self.import(nut)).collect()
    }

    /// Dry-run of the conflict merge `import` would perform for `incoming`.
    pub fn squabble(&self, id: &str, incoming: &Nut<T>) -> AcornResult<SquabbleVerdict> {
        match self.inner.current_record(id)? {
            None => Ok(SquabbleVerdict::IncomingWins),
            Some(local) => self.inner.resolve(&local, incoming),
        }
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.dispatcher.subscribe(None, Arc::new(callback))
    }

    pub fn subscribe_filtered(
        &self,
        predicate: impl Fn(&Nut<T>) -> bool + Send + Sync + 'static,
        callback: impl Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .dispatcher
            .subscribe(Some(Arc::new(predicate)), Arc::new(callback))
    }

    pub fn nut_count(&self) -> u64 {
        TreeCounters::read(&self.inner.counters.nut_count)
    }

    pub fn total_stashed(&self) -> u64 {
        TreeCounters::read(&self.inner.counters.total_stashed)
    }

    pub fn total_tossed(&self) -> u64 {
        TreeCounters::read(&self.inner.counters.total_tossed)
    }

    pub fn squabbles_resolved(&self) -> u64 {
        TreeCounters::read(&self.inner.counters.squabbles_resolved)
    }

    pub fn stats(&self) -> TreeStats {
        self.inner.counters.snapshot()
    }

    pub fn last_sync_timestamp(&self) -> Option<OffsetDateTime> {
        *self.inner.last_sync.lock()
    }

    pub fn mark_sync_completed(&self) {
        *self.inner.last_sync.lock() = Some(OffsetDateTime::now_utc());
    }

    pub fn trunk_capabilities(&self) -> crate::trunk::TrunkCaps {
        self.inner.trunk.capabilities()
    }

    /// Stop the reaper and dispatcher and flush the trunk. Idempotent; also
    /// run best-effort when the last handle drops.
    pub fn close(&self) -> AcornResult<()> {
        self.inner.close()
    }
}

struct TreeInner<T: Payload> {
    token: usize,
    trunk: Arc<dyn Trunk>,
    pipeline: Pipeline,
    codec: Arc<dyn NutCodec<T>>,
    cache: Mutex<Box<dyn CacheStrategy<T>>>,
    writer: Mutex<()>,
    counters: TreeCounters,
    dispatcher: Dispatcher<T>,
    reaper: Option<Reaper>,
    ttl: TtlPolicy,
    last_sync: Mutex<Option<OffsetDateTime>>,
    closed: AtomicBool,
}

impl<T: Payload> TreeInner<T> {
    fn stash_with(&self, id: &str, value: T, ttl: Option<Duration>) -> AcornResult<()> {
        if id.is_empty() {
            return Err(AcornError::InvalidInput("record id must not be empty".into()));
        }
        let _reentry = WriterEntry::enter(self.token)?;
        let _writer = self.writer.lock();

        let prev = self.current_record(id)?;
        let version = prev.as_ref().map_or(1, |p| p.version + 1);
        let now = OffsetDateTime::now_utc();
        let expires_at = ttl.or(self.ttl.default_ttl).map(|d| now + d);
        let nut = Nut {
            id: id.to_owned(),
            payload: Some(value),
            timestamp: now,
            version,
            expires_at,
            deleted: false,
        };

        // Encode before touching the trunk so serializer and pipeline
        // failures leave everything unchanged.
        let shell = self.encode_shell(&nut)?;
        self.trunk.save(shell)?;

        let prev_live = prev.as_ref().is_some_and(|p| !p.deleted);
        self.commit(nut, prev_live);
        TreeCounters::bump(&self.counters.total_stashed);
        Ok(())
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        if id.is_empty() {
            return Err(AcornError::InvalidInput("record id must not be empty".into()));
        }
        let _reentry = WriterEntry::enter(self.token)?;
        let _writer = self.writer.lock();
        self.toss_locked(id)
    }

    /// Tombstone write; caller holds the writer mutex.
    fn toss_locked(&self, id: &str) -> AcornResult<()> {
        let prev = self.current_record(id)?;
        let version = prev.as_ref().map_or(1, |p| p.version + 1);
        let nut: Nut<T> = Nut::tombstone(id, version, OffsetDateTime::now_utc());
        let shell = self.encode_shell(&nut)?;
        self.trunk.save(shell)?;

        let prev_live = prev.as_ref().is_some_and(|p| !p.deleted);
        self.commit(nut, prev_live);
        TreeCounters::bump(&self.counters.total_tossed);
        Ok(())
    }

    fn crack(&self, id: &str) -> AcornResult<Option<T>> {
        let now = OffsetDateTime::now_utc();
        if let Some(nut) = self.cache.lock().get(id) {
            TreeCounters::bump(&self.counters.cache_hits);
            if nut.is_expired_at(now) {
                // The reaper runs at coarse intervals; reads double-check.
                self.schedule_expiry_at(id, unix_ms(now));
                return Ok(None);
            }
            return Ok(nut.payload);
        }
        TreeCounters::bump(&self.counters.cache_misses);

        let Some(shell) = self.trunk.load(id)? else {
            return Ok(None);
        };
        if shell.deleted {
            return Ok(None);
        }
        let nut = self.decode_shell(&shell)?;
        if nut.is_expired_at(now) {
            self.schedule_expiry_at(id, unix_ms(now));
            return Ok(None);
        }
        self.cache.lock().put(nut.clone());
        Ok(nut.payload)
    }

    fn import(&self, incoming: Nut<T>) -> AcornResult<ImportOutcome> {
        if incoming.id.is_empty() {
            return Err(AcornError::InvalidInput("record id must not be empty".into()));
        }
        let _reentry = WriterEntry::enter(self.token)?;
        let _writer = self.writer.lock();

        let local = self.current_record(&incoming.id)?;
        let verdict = match &local {
            None => SquabbleVerdict::IncomingWins,
            Some(local) => {
                TreeCounters::bump(&self.counters.squabbles_resolved);
                self.resolve(local, &incoming)?
            }
        };

        match verdict {
            SquabbleVerdict::IncomingWins => {
                // The one write path that preserves a foreign timestamp and
                // version instead of minting new ones.
                let shell = self.encode_shell(&incoming)?;
                self.trunk.save(shell)?;
                let prev_live = local.as_ref().is_some_and(|p| !p.deleted);
                self.commit(incoming, prev_live);
                Ok(ImportOutcome::Accepted)
            }
            SquabbleVerdict::LocalWins => Ok(ImportOutcome::RejectedOlder),
            SquabbleVerdict::Identical => Ok(ImportOutcome::RejectedEqual),
        }
    }

    /// Last-writer-wins with a deterministic tiebreaker: timestamp, then
    /// version, then the lexicographically higher payload digest.
    fn resolve(&self, local: &Nut<T>, incoming: &Nut<T>) -> AcornResult<SquabbleVerdict> {
        use std::cmp::Ordering::*;
        let verdict = match incoming.timestamp.cmp(&local.timestamp) {
            Greater => SquabbleVerdict::IncomingWins,
            Less => SquabbleVerdict::LocalWins,
            Equal => match incoming.version.cmp(&local.version) {
                Greater => SquabbleVerdict::IncomingWins,
                Less => SquabbleVerdict::LocalWins,
                Equal => {
                    match self
                        .payload_digest(incoming)?
                        .cmp(&self.payload_digest(local)?)
                    {
                        Greater => SquabbleVerdict::IncomingWins,
                        Less => SquabbleVerdict::LocalWins,
                        Equal => SquabbleVerdict::Identical,
                    }
                }
            },
        };
        Ok(verdict)
    }

    fn payload_digest(&self, nut: &Nut<T>) -> AcornResult<[u8; 32]> {
        let bytes = match &nut.payload {
            Some(value) => self.codec.encode(value)?,
            None => Vec::new(),
        };
        Ok(Sha256::digest(&bytes).into())
    }

    /// Latest record for `id`, tombstones included. The cache only ever holds
    /// live records, so a hit can be returned as-is.
    fn current_record(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        if let Some(nut) = self.cache.lock().get(id) {
            return Ok(Some(nut));
        }
        match self.trunk.load(id)? {
            Some(shell) => Ok(Some(self.decode_shell(&shell)?)),
            None => Ok(None),
        }
    }

    fn encode_shell(&self, nut: &Nut<T>) -> AcornResult<NutShell> {
        let (sequences, original_len, payload) = match &nut.payload {
            Some(value) => {
                let raw = self.codec.encode(value)?;
                let original_len = raw.len() as u64;
                let (sequences, encoded) = self.pipeline.encode(&raw)?;
                (sequences, original_len, encoded)
            }
            // Tombstones skip the pipeline; there is nothing to transform.
            None => (Vec::new(), 0, Vec::new()),
        };
        Ok(NutShell {
            id: nut.id.clone(),
            version: nut.version,
            timestamp_ms: unix_ms(nut.timestamp),
            expires_at_ms: nut.expires_at.map(unix_ms),
            deleted: nut.deleted,
            sequences,
            original_len,
            payload,
        })
    }

    fn decode_shell(&self, shell: &NutShell) -> AcornResult<Nut<T>> {
        let payload = if shell.deleted {
            None
        } else {
            let raw = self.pipeline.decode(&shell.sequences, &shell.payload)?;
            Some(self.codec.decode(&raw)?)
        };
        Ok(Nut {
            id: shell.id.clone(),
            payload,
            timestamp: shell.timestamp(),
            version: shell.version,
            expires_at: shell.expires_at(),
            deleted: shell.deleted,
        })
    }

    /// Post-save bookkeeping: cache write-through, live count, expiry hint,
    /// subscriber notification. Runs under the writer mutex so events keep
    /// commit order.
    fn commit(&self, nut: Nut<T>, prev_live: bool) {
        {
            let mut cache = self.cache.lock();
            if nut.deleted {
                cache.invalidate(&nut.id);
            } else {
                cache.put(nut.clone());
            }
        }
        match (prev_live, !nut.deleted) {
            (false, true) => {
                self.counters.nut_count.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.counters.nut_count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if let Some(at) = nut.expires_at {
            self.schedule_expiry_at(&nut.id, unix_ms(at));
        }
        let shed = self.dispatcher.publish(ChangeEvent { nut });
        self.counters
            .events_dropped
            .fetch_add(shed, Ordering::Relaxed);
    }

    fn schedule_expiry_at(&self, id: &str, at_ms: i64) {
        if let Some(reaper) = &self.reaper {
            let _ = reaper.tx.send(ReapMsg::Hint {
                id: id.to_owned(),
                at_ms,
            });
        }
    }

    /// Called from the reaper thread: convert an expired record into a
    /// tombstone through the normal write path so replicas learn of it.
    fn reap(&self, id: &str) {
        let Ok(_reentry) = WriterEntry::enter(self.token) else {
            return;
        };
        let _writer = self.writer.lock();
        let current = match self.current_record(id) {
            Ok(Some(nut)) => nut,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(id, %err, "reaper failed to load record");
                return;
            }
        };
        if current.deleted || !current.is_expired_at(OffsetDateTime::now_utc()) {
            return;
        }
        tracing::debug!(id, version = current.version, "reaping expired record");
        if let Err(err) = self.toss_locked(id) {
            tracing::warn!(id, %err, "failed to tombstone expired record");
        }
    }

    fn close(&self) -> AcornResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reaper) = &self.reaper {
            reaper.shutdown();
        }
        self.dispatcher.shutdown();
        self.trunk.flush()
    }
}

impl<T: Payload> Drop for TreeInner<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

enum ReapMsg {
    Hint { id: String, at_ms: i64 },
    Shutdown,
}

struct Reaper {
    tx: Sender<ReapMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    fn spawn<T: Payload>(tree: Weak<TreeInner<T>>, interval: Duration) -> Self {
        let (tx, rx) = unbounded::<ReapMsg>();
        let handle = std::thread::Builder::new()
            .name("acorn-reaper".into())
            .spawn(move || {
                // Min-heap keyed by expiry keeps wake-ups O(log n) instead of
                // one timer per record.
                let mut heap: BinaryHeap<Reverse<(i64, String)>> = BinaryHeap::new();
                loop {
                    let wait = heap
                        .peek()
                        .map(|Reverse((at_ms, _))| {
                            let now_ms = unix_ms(OffsetDateTime::now_utc());
                            Duration::from_millis((*at_ms - now_ms).max(0) as u64)
                        })
                        .map_or(interval, |until| until.min(interval));
                    match rx.recv_timeout(wait) {
                        Ok(ReapMsg::Hint { id, at_ms }) => heap.push(Reverse((at_ms, id))),
                        Ok(ReapMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let now_ms = unix_ms(OffsetDateTime::now_utc());
                    while heap
                        .peek()
                        .is_some_and(|Reverse((at_ms, _))| *at_ms <= now_ms)
                    {
                        let Reverse((_, id)) = heap.pop().expect("peeked entry");
                        if let Some(tree) = tree.upgrade() {
                            tree.reap(&id);
                        }
                    }
                }
            })
            .expect("failed to spawn reaper thread");
        Reaper {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn shutdown(&self) {
        let _ = self.tx.send(ReapMsg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

static NEXT_TREE_TOKEN: AtomicUsize = AtomicUsize::new(1);

fn next_tree_token() -> usize {
    NEXT_TREE_TOKEN.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static ACTIVE_WRITERS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Thread-local guard that catches a subscriber or tangle calling back into
/// the same Tree's writer path on the writer's own thread.
struct WriterEntry {
    token: usize,
}

impl WriterEntry {
    fn enter(token: usize) -> AcornResult<Self> {
        ACTIVE_WRITERS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&token) {
                return Err(AcornError::Reentrant);
            }
            stack.push(token);
            Ok(WriterEntry { token })
        })
    }
}

impl Drop for WriterEntry {
    fn drop(&mut self) {
        ACTIVE_WRITERS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|t| *t == self.token) {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trunk::{import_wins, TrunkCaps};
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use time::macros::datetime;

    /// Minimal in-process trunk for engine tests; keeps full history.
    #[derive(Default)]
    struct TestTrunk {
        records: RwLock<HashMap<String, Vec<NutShell>>>,
    }

    impl Trunk for TestTrunk {
        fn save(&self, shell: NutShell) -> AcornResult<()> {
            self.records
                .write()
                .entry(shell.id.clone())
                .or_default()
                .push(shell);
            Ok(())
        }

        fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
            Ok(self
                .records
                .read()
                .get(id)
                .and_then(|versions| versions.last().cloned()))
        }

        fn delete(&self, id: &str) -> AcornResult<()> {
            self.records.write().remove(id);
            Ok(())
        }

        fn load_all(&self) -> AcornResult<Vec<NutShell>> {
            Ok(self
                .records
                .read()
                .values()
                .filter_map(|versions| versions.last())
                .filter(|shell| !shell.deleted)
                .cloned()
                .collect())
        }

        fn get_history(&self, id: &str) -> AcornResult<Vec<NutShell>> {
            Ok(self.records.read().get(id).cloned().unwrap_or_default())
        }

        fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
            Ok(self
                .records
                .read()
                .values()
                .filter_map(|versions| versions.last())
                .cloned()
                .collect())
        }

        fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
            for shell in shells {
                let current = self.load(&shell.id)?;
                if import_wins(current.as_ref(), &shell) {
                    self.save(shell)?;
                }
            }
            Ok(())
        }

        fn capabilities(&self) -> TrunkCaps {
            TrunkCaps {
                history: true,
                durable: false,
                async_io: false,
                sync_export: true,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        name: String,
    }

    impl HasId for Doc {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn doc(id: &str, name: &str) -> Doc {
        Doc {
            id: id.into(),
            name: name.into(),
        }
    }

    fn open_tree() -> Tree<Doc> {
        Tree::open(TestTrunk::default()).unwrap()
    }

    #[test]
    fn basic_crud_round_trip() {
        let tree = open_tree();
        tree.stash(doc("alice", "Alice")).unwrap();
        assert_eq!(tree.crack("alice").unwrap().unwrap().name, "Alice");

        tree.stash(doc("alice", "Alicia")).unwrap();
        assert_eq!(tree.crack("alice").unwrap().unwrap().name, "Alicia");

        tree.toss("alice").unwrap();
        assert!(tree.crack("alice").unwrap().is_none());
        assert_eq!(tree.nut_count(), 0);
        assert_eq!(tree.total_stashed(), 2);
        assert_eq!(tree.total_tossed(), 1);
    }

    #[test]
    fn empty_id_is_invalid_input() {
        let tree = open_tree();
        let err = tree.stash_with("", doc("", "nobody")).unwrap_err();
        assert!(matches!(err, AcornError::InvalidInput(_)));
    }

    #[test]
    fn versions_increase_and_survive_tombstones() {
        let tree = open_tree();
        tree.stash(doc("k", "a")).unwrap();
        tree.stash(doc("k", "b")).unwrap();
        tree.toss("k").unwrap();
        tree.stash(doc("k", "c")).unwrap();

        let history = tree.get_history("k").unwrap();
        let versions: Vec<u64> = history.iter().map(|n| n.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert!(history[2].deleted);
    }

    #[test]
    fn tossing_absent_id_writes_first_version_tombstone() {
        let tree = open_tree();
        tree.toss("ghost").unwrap();
        let history = tree.get_history("ghost").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].deleted);
        assert_eq!(history[0].version, 1);
        // still absent from reads and counters
        assert!(tree.crack("ghost").unwrap().is_none());
        assert_eq!(tree.nut_count(), 0);
    }

    #[test]
    fn import_applies_last_writer_wins() {
        let tree = open_tree();
        tree.stash(doc("x", "local")).unwrap();

        let newer = Nut {
            id: "x".into(),
            payload: Some(doc("x", "remote")),
            timestamp: OffsetDateTime::now_utc() + Duration::from_secs(60),
            version: 3,
            expires_at: None,
            deleted: false,
        };
        assert_eq!(tree.import(newer.clone()).unwrap(), ImportOutcome::Accepted);
        assert_eq!(tree.crack("x").unwrap().unwrap().name, "remote");
        assert_eq!(tree.squabbles_resolved(), 1);

        // imported record keeps its foreign version
        let history = tree.get_history("x").unwrap();
        assert_eq!(history.last().unwrap().version, 3);

        let older = Nut {
            timestamp: datetime!(2000-01-01 00:00 UTC),
            ..newer.clone()
        };
        assert_eq!(
            tree.import(older).unwrap(),
            ImportOutcome::RejectedOlder
        );
        assert_eq!(tree.crack("x").unwrap().unwrap().name, "remote");

        // byte-identical replay is a no-op
        assert_eq!(tree.import(newer).unwrap(), ImportOutcome::RejectedEqual);
        assert_eq!(tree.squabbles_resolved(), 3);
    }

    #[test]
    fn equal_timestamp_squabble_is_deterministic() {
        let ts = datetime!(2024-05-05 05:05 UTC);
        let make = |name: &str| Nut {
            id: "tie".into(),
            payload: Some(doc("tie", name)),
            timestamp: ts,
            version: 2,
            expires_at: None,
            deleted: false,
        };
        let a = make("aaaa");
        let b = make("bbbb");

        let t1 = open_tree();
        t1.import(a.clone()).unwrap();
        t1.import(b.clone()).unwrap();
        let winner1 = t1.crack("tie").unwrap().unwrap().name;

        let t2 = open_tree();
        t2.import(b).unwrap();
        t2.import(a).unwrap();
        let winner2 = t2.crack("tie").unwrap().unwrap().name;

        // both orders converge on the same winner
        assert_eq!(winner1, winner2);
    }

    #[test]
    fn export_since_filters_and_includes_tombstones() {
        let tree = open_tree();
        tree.stash(doc("a", "1")).unwrap();
        tree.stash(doc("b", "2")).unwrap();
        tree.toss("a").unwrap();

        let all = tree.export_changes_since(None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|n| n.id == "a" && n.deleted));

        let future = OffsetDateTime::now_utc() + Duration::from_secs(3600);
        assert!(tree.export_changes_since(Some(future)).unwrap().is_empty());
    }

    #[test]
    fn two_trees_converge_after_mutual_sync() {
        let t1 = open_tree();
        let t2 = open_tree();
        t1.stash(doc("a", "from-t1")).unwrap();
        t2.stash(doc("b", "from-t2")).unwrap();
        t1.toss("c").unwrap();

        for nut in t1.export_changes_since(None).unwrap() {
            t2.import(nut).unwrap();
        }
        for nut in t2.export_changes_since(None).unwrap() {
            t1.import(nut).unwrap();
        }

        for id in ["a", "b", "c"] {
            let left = t1.crack(id).unwrap();
            let right = t2.crack(id).unwrap();
            assert_eq!(left, right, "divergence on {id}");
        }
        assert_eq!(t1.nut_count(), t2.nut_count());
    }

    #[test]
    fn subscriptions_see_commit_order() {
        let tree = open_tree();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = tree.subscribe(move |event| {
            sink.lock()
                .push((event.nut.id.clone(), event.nut.deleted));
        });

        tree.stash(doc("a", "1")).unwrap();
        tree.stash(doc("b", "2")).unwrap();
        tree.toss("a").unwrap();
        tree.close().unwrap();

        let events = seen.lock().clone();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("a".to_string(), true),
            ]
        );
    }

    #[test]
    fn ttl_expiry_hides_and_tombstones() {
        let tree = open_tree();
        tree.stash_with_ttl("ephemeral", doc("ephemeral", "soon"), Duration::from_millis(40))
            .unwrap();
        assert!(tree.crack("ephemeral").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(200));
        assert!(tree.crack("ephemeral").unwrap().is_none());

        // reaper converted the expiry into a tombstone on the change feed
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let exported = tree.export_changes_since(None).unwrap();
            let tombstoned = exported
                .iter()
                .any(|n| n.id == "ephemeral" && n.deleted && n.version == 2);
            if tombstoned {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "reaper never tombstoned the expired record"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let tree = open_tree();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("k{}-{}", t, i);
                        tree.stash_with(&id, doc(&id, "v")).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tree.nut_count(), 8 * 50);
        assert_eq!(tree.total_stashed(), 8 * 50);
    }

    #[test]
    fn cache_never_serves_stale_values() {
        let tree = open_tree();
        tree.stash(doc("k", "v1")).unwrap();
        assert_eq!(tree.crack("k").unwrap().unwrap().name, "v1");
        tree.stash(doc("k", "v2")).unwrap();
        assert_eq!(tree.crack("k").unwrap().unwrap().name, "v2");
        tree.toss("k").unwrap();
        assert!(tree.crack("k").unwrap().is_none());
    }

    #[test]
    fn history_requires_capability() {
        #[derive(Default)]
        struct NoHistory(TestTrunk);
        impl Trunk for NoHistory {
            fn save(&self, shell: NutShell) -> AcornResult<()> {
                self.0.save(shell)
            }
            fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
                self.0.load(id)
            }
            fn delete(&self, id: &str) -> AcornResult<()> {
                self.0.delete(id)
            }
            fn load_all(&self) -> AcornResult<Vec<NutShell>> {
                self.0.load_all()
            }
            fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
                self.0.export_changes()
            }
            fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
                self.0.import(shells)
            }
            fn capabilities(&self) -> TrunkCaps {
                TrunkCaps {
                    history: false,
                    ..self.0.capabilities()
                }
            }
        }

        let tree: Tree<Doc> = Tree::open(NoHistory::default()).unwrap();
        tree.stash(doc("k", "v")).unwrap();
        assert!(matches!(
            tree.get_history("k").unwrap_err(),
            AcornError::Unsupported(_)
        ));
    }

    #[test]
    fn reentering_the_writer_path_is_refused() {
        use std::sync::atomic::AtomicBool;

        // A codec that calls back into its own Tree mid-write, the way a
        // misbehaving subscriber or pipeline stage would on the writer thread.
        struct ReentrantCodec {
            slot: Arc<Mutex<Option<Tree<Doc>>>>,
            observed: Arc<AtomicBool>,
        }

        impl NutCodec<Doc> for ReentrantCodec {
            fn encode(&self, value: &Doc) -> AcornResult<Vec<u8>> {
                if let Some(tree) = self.slot.lock().as_ref() {
                    let err = tree.toss("other").unwrap_err();
                    assert!(matches!(err, AcornError::Reentrant));
                    self.observed.store(true, Ordering::SeqCst);
                }
                JsonCodec.encode(value)
            }

            fn decode(&self, bytes: &[u8]) -> AcornResult<Doc> {
                JsonCodec.decode(bytes)
            }
        }

        let slot: Arc<Mutex<Option<Tree<Doc>>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(AtomicBool::new(false));
        let tree: Tree<Doc> = Tree::builder(TestTrunk::default())
            .codec(ReentrantCodec {
                slot: Arc::clone(&slot),
                observed: Arc::clone(&observed),
            })
            .open()
            .unwrap();
        *slot.lock() = Some(tree.clone());

        tree.stash(doc("k", "v")).unwrap();
        assert!(observed.load(Ordering::SeqCst));
        // a separate thread is not reentrancy and proceeds normally
        let other = tree.clone();
        *slot.lock() = None;
        std::thread::spawn(move || other.stash(doc("k2", "v2")).unwrap())
            .join()
            .unwrap();
        assert_eq!(tree.nut_count(), 2);
    }

    #[test]
    fn reopened_tree_restores_count_and_state() {
        let trunk = Arc::new(TestTrunk::default());
        struct SharedTrunk(Arc<TestTrunk>);
        impl Trunk for SharedTrunk {
            fn save(&self, shell: NutShell) -> AcornResult<()> {
                self.0.save(shell)
            }
            fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
                self.0.load(id)
            }
            fn delete(&self, id: &str) -> AcornResult<()> {
                self.0.delete(id)
            }
            fn load_all(&self) -> AcornResult<Vec<NutShell>> {
                self.0.load_all()
            }
            fn get_history(&self, id: &str) -> AcornResult<Vec<NutShell>> {
                self.0.get_history(id)
            }
            fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
                self.0.export_changes()
            }
            fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
                self.0.import(shells)
            }
            fn capabilities(&self) -> TrunkCaps {
                self.0.capabilities()
            }
        }

        {
            let tree: Tree<Doc> = Tree::open(SharedTrunk(Arc::clone(&trunk))).unwrap();
            tree.stash(doc("k1", "v1")).unwrap();
            tree.stash(doc("k2", "v2")).unwrap();
            tree.close().unwrap();
        }

        let tree: Tree<Doc> = Tree::open(SharedTrunk(trunk)).unwrap();
        assert_eq!(tree.nut_count(), 2);
        assert_eq!(tree.crack("k1").unwrap().unwrap().name, "v1");
        assert_eq!(tree.crack("k2").unwrap().unwrap().name, "v2");
    }
}
