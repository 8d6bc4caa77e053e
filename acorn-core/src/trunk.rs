use crate::error::{AcornError, AcornResult};
use crate::shell::NutShell;

/// What a storage backend can do. Operations gated on a capability return
/// [`AcornError::Unsupported`] when the flag is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunkCaps {
    /// `get_history` returns every retained write for an id.
    pub history: bool,
    /// Committed writes survive process crash.
    pub durable: bool,
    /// Backend I/O is serviced off-thread; callers may see lower latency.
    pub async_io: bool,
    /// `export_changes` yields tombstones as well as live records.
    pub sync_export: bool,
}

/// Storage backend contract. A trunk persists [`NutShell`]s keyed by id and
/// never interprets payload bytes; metadata stays plaintext so backends can
/// index, merge, and replicate without running the pipeline.
pub trait Trunk: Send + Sync + 'static {
    /// Persist `shell` as the current record for its id. Tombstones are saved
    /// like any other write.
    fn save(&self, shell: NutShell) -> AcornResult<()>;

    /// Latest record for `id`, tombstone included. `Ok(None)` only when the
    /// trunk has never seen the id (or physically dropped it).
    fn load(&self, id: &str) -> AcornResult<Option<NutShell>>;

    /// Physically remove `id`. Most callers want a tombstone `save` instead;
    /// this exists for maintenance paths and backends that cannot retain
    /// per-id garbage forever.
    fn delete(&self, id: &str) -> AcornResult<()>;

    /// Current live records (no tombstones).
    fn load_all(&self) -> AcornResult<Vec<NutShell>>;

    /// Every retained write for `id`, oldest first. Requires `caps.history`.
    fn get_history(&self, id: &str) -> AcornResult<Vec<NutShell>> {
        let _ = id;
        Err(AcornError::Unsupported("history"))
    }

    /// Current record per id including tombstones, for change-feed export.
    fn export_changes(&self) -> AcornResult<Vec<NutShell>>;

    /// Merge a batch of records, keeping whichever side is more recent per id
    /// (timestamp, then version).
    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()>;

    fn capabilities(&self) -> TrunkCaps;

    /// Make previously accepted writes durable (fsync or equivalent).
    fn flush(&self) -> AcornResult<()> {
        Ok(())
    }
}

/// Shared merge rule for `Trunk::import` implementations.
pub fn import_wins(existing: Option<&NutShell>, incoming: &NutShell) -> bool {
    existing.is_none_or(|current| incoming.recency() > current.recency())
}

impl<S: Trunk> Trunk for std::sync::Arc<S> {
    fn save(&self, shell: NutShell) -> AcornResult<()> {
        (**self).save(shell)
    }

    fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
        (**self).load(id)
    }

    fn delete(&self, id: &str) -> AcornResult<()> {
        (**self).delete(id)
    }

    fn load_all(&self) -> AcornResult<Vec<NutShell>> {
        (**self).load_all()
    }

    fn get_history(&self, id: &str) -> AcornResult<Vec<NutShell>> {
        (**self).get_history(id)
    }

    fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
        (**self).export_changes()
    }

    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
        (**self).import(shells)
    }

    fn capabilities(&self) -> TrunkCaps {
        (**self).capabilities()
    }

    fn flush(&self) -> AcornResult<()> {
        (**self).flush()
    }
}
