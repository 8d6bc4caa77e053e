//! In-process trunk: a map of current records, tombstones retained so change
//! export and version resumption behave like the durable backends. Baseline
//! for benchmarks and the default trunk in tests.

use std::collections::HashMap;

use acorn_core::{import_wins, AcornResult, NutShell, Trunk, TrunkCaps};
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct MemoryTrunk {
    records: RwLock<HashMap<String, NutShell>>,
}

impl MemoryTrunk {
    pub fn new() -> Self {
        MemoryTrunk::default()
    }

    /// Records currently held, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Trunk for MemoryTrunk {
    fn save(&self, shell: NutShell) -> AcornResult<()> {
        self.records.write().insert(shell.id.clone(), shell);
        Ok(())
    }

    fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
        Ok(self.records.read().get(id).cloned())
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
            .filter(|shell| !shell.deleted)
            .cloned()
            .collect())
    }

    fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
        let mut records = self.records.write();
        for shell in shells {
            if import_wins(records.get(&shell.id), &shell) {
                records.insert(shell.id.clone(), shell);
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> TrunkCaps {
        TrunkCaps {
            history: false,
            durable: false,
            async_io: false,
            sync_export: true,
        }
    }
}
