//! Shared contract checks for trunk implementations. Every `acorn-trunk-*`
//! crate runs these from its own tests so the backends stay interchangeable.

use acorn_core::{AcornError, AcornResult, NutShell, Trunk};

#[derive(Debug, Clone)]
pub struct TrunkContract;

impl TrunkContract {
    pub fn live_shell(id: &str, version: u64, timestamp_ms: i64) -> NutShell {
        NutShell {
            id: id.into(),
            version,
            timestamp_ms,
            expires_at_ms: None,
            deleted: false,
            sequences: Vec::new(),
            original_len: 16,
            payload: format!("payload-{id}-v{version}").into_bytes(),
        }
    }

    pub fn tombstone_shell(id: &str, version: u64, timestamp_ms: i64) -> NutShell {
        NutShell {
            id: id.into(),
            version,
            timestamp_ms,
            expires_at_ms: None,
            deleted: true,
            sequences: Vec::new(),
            original_len: 0,
            payload: Vec::new(),
        }
    }

    /// The core save/load/export behavior every trunk must satisfy.
    pub fn run<S: Trunk>(trunk: &S) -> AcornResult<()> {
        Self::round_trip(trunk)?;
        Self::tombstone_semantics(trunk)?;
        Self::import_merge(trunk)?;
        Self::capability_honesty(trunk)?;
        Ok(())
    }

    pub fn round_trip<S: Trunk>(trunk: &S) -> AcornResult<()> {
        let shell = Self::live_shell("contract-rt", 1, 100);
        trunk.save(shell.clone())?;
        let fetched = trunk
            .load("contract-rt")?
            .ok_or_else(|| harness_err("saved record is missing"))?;
        if fetched != shell {
            return Err(harness_err("loaded record differs from saved record"));
        }
        if !trunk.load_all()?.iter().any(|s| s.id == "contract-rt") {
            return Err(harness_err("load_all does not include saved record"));
        }
        Ok(())
    }

    /// Tombstones replace live records, disappear from `load_all`, stay in
    /// `export_changes`, and keep the version chain intact.
    pub fn tombstone_semantics<S: Trunk>(trunk: &S) -> AcornResult<()> {
        trunk.save(Self::live_shell("contract-del", 1, 100))?;
        trunk.save(Self::tombstone_shell("contract-del", 2, 200))?;

        let current = trunk
            .load("contract-del")?
            .ok_or_else(|| harness_err("tombstone should still load"))?;
        if !current.deleted || current.version != 2 {
            return Err(harness_err("tombstone did not replace live record"));
        }
        if trunk.load_all()?.iter().any(|s| s.id == "contract-del") {
            return Err(harness_err("load_all leaked a tombstoned record"));
        }
        if trunk.capabilities().sync_export
            && !trunk
                .export_changes()?
                .iter()
                .any(|s| s.id == "contract-del" && s.deleted)
        {
            return Err(harness_err("export_changes dropped a tombstone"));
        }
        Ok(())
    }

    /// `import` must keep the most recent side per id (timestamp, version).
    pub fn import_merge<S: Trunk>(trunk: &S) -> AcornResult<()> {
        trunk.save(Self::live_shell("contract-imp", 3, 300))?;
        trunk.import(vec![
            Self::live_shell("contract-imp", 2, 250),
            Self::live_shell("contract-imp-new", 1, 50),
        ])?;

        let kept = trunk
            .load("contract-imp")?
            .ok_or_else(|| harness_err("imported-over record vanished"))?;
        if kept.version != 3 {
            return Err(harness_err("import replaced a newer local record"));
        }
        if trunk.load("contract-imp-new")?.is_none() {
            return Err(harness_err("import dropped a new id"));
        }
        Ok(())
    }

    /// A trunk that advertises no history must refuse it with `Unsupported`.
    pub fn capability_honesty<S: Trunk>(trunk: &S) -> AcornResult<()> {
        if !trunk.capabilities().history {
            match trunk.get_history("contract-rt") {
                Err(AcornError::Unsupported(_)) => {}
                Ok(_) => return Err(harness_err("history returned despite capability = false")),
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// For history-capable trunks: writes come back oldest-first with
    /// non-decreasing timestamps.
    pub fn history_chronology<S: Trunk>(trunk: &S) -> AcornResult<()> {
        for (version, ts) in [(1u64, 10i64), (2, 20), (3, 30)] {
            trunk.save(Self::live_shell("contract-hist", version, ts))?;
        }
        let history = trunk.get_history("contract-hist")?;
        if history.len() != 3 {
            return Err(harness_err("history is missing writes"));
        }
        let ordered = history.windows(2).all(|pair| {
            pair[0].timestamp_ms <= pair[1].timestamp_ms && pair[0].version < pair[1].version
        });
        if !ordered {
            return Err(harness_err("history is not chronological"));
        }
        Ok(())
    }
}

fn harness_err(msg: &str) -> AcornError {
    AcornError::Storage(msg.to_string())
}
