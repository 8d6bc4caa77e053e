//! Append-only log trunk ("document store"): a write-ahead log as the source
//! of truth, an in-memory id → offset index, an atomic snapshot of that
//! index, and log compaction ("smush").
//!
//! On-disk layout, one directory per trunk:
//! - `log.aol`: framed records `[len: u32 LE][crc32: u32 LE][shell bytes]`
//! - `snapshot.idx` / `snapshot.seq`: latest index snapshot (see
//!   [`snapshot`])
//! - `smush.lock`: compaction advisory lock
//! - `trunk.lock`: process-exclusive directory lock
//!
//! Startup loads the newest valid snapshot, replays the log tail, and
//! truncates at the first corrupt frame. That truncation is the only
//! automatic repair path and is visible through [`AppendLogTrunk::tail_repairs`].

mod snapshot;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use acorn_core::{AcornError, AcornResult, NutShell, Trunk, TrunkCaps};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use snapshot::IndexEntry;

const LOG_FILE: &str = "log.aol";
const LOG_OLD_FILE: &str = "log.aol.old";
const LOG_NEW_FILE: &str = "log.aol.new";
const SMUSH_LOCK_FILE: &str = "smush.lock";
const DIR_LOCK_FILE: &str = "trunk.lock";

const FRAME_HEADER_LEN: u64 = 8;

/// When appended records hit the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record.
    Always,
    /// Mark dirty and let a background flusher sync within `max_staleness`.
    Batch { max_staleness: Duration },
    /// Never fsync explicitly; durability is up to the OS.
    Never,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Batch {
            max_staleness: Duration::from_millis(10),
        }
    }
}

/// Compact once the log exceeds both an absolute floor and a multiple of the
/// live working set.
#[derive(Debug, Clone, Copy)]
pub struct SmushHeuristic {
    pub min_log_bytes: u64,
    pub ratio: f64,
}

impl Default for SmushHeuristic {
    fn default() -> Self {
        SmushHeuristic {
            min_log_bytes: 8 * 1024 * 1024,
            ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AppendLogConfig {
    pub fsync: FsyncPolicy,
    pub auto_smush: Option<SmushHeuristic>,
}

impl Default for AppendLogConfig {
    fn default() -> Self {
        AppendLogConfig {
            fsync: FsyncPolicy::default(),
            auto_smush: Some(SmushHeuristic::default()),
        }
    }
}

#[derive(Debug)]
struct LogWriter {
    file: File,
    len: u64,
    /// Approximate bytes of current live records; entries restored from a
    /// snapshot contribute once their frame length is known again.
    live_bytes: u64,
}

#[derive(Debug)]
pub struct AppendLogTrunk {
    dir: PathBuf,
    config: AppendLogConfig,
    // Lock order: writer, then index, then reader. Never the other way.
    writer: Arc<Mutex<LogWriter>>,
    index: RwLock<HashMap<String, IndexEntry>>,
    reader: Mutex<File>,
    snapshot_seq: AtomicU64,
    tail_repairs: AtomicU64,
    dirty: Arc<AtomicBool>,
    flusher: Option<Flusher>,
    _dir_lock: File,
}

impl AppendLogTrunk {
    pub fn open(dir: impl Into<PathBuf>) -> AcornResult<Self> {
        Self::open_with(dir, AppendLogConfig::default())
    }

    pub fn open_with(dir: impl Into<PathBuf>, config: AppendLogConfig) -> AcornResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let dir_lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(DIR_LOCK_FILE))?;
        dir_lock.try_lock_exclusive().map_err(|_| {
            AcornError::Storage(format!(
                "trunk directory {} is locked by another process",
                dir.display()
            ))
        })?;

        // Recover from a compaction interrupted mid-swap. The `.new` log is
        // complete and synced by the time any rename happens, so it wins when
        // `log.aol` itself is missing; leftovers are stale either way.
        let log_path = dir.join(LOG_FILE);
        let new_path = dir.join(LOG_NEW_FILE);
        let old_path = dir.join(LOG_OLD_FILE);
        if !log_path.exists() {
            if new_path.exists() {
                fs::rename(&new_path, &log_path)?;
            } else if old_path.exists() {
                fs::rename(&old_path, &log_path)?;
            }
        }
        let _ = fs::remove_file(&new_path);
        let _ = fs::remove_file(&old_path);
        let _ = fs::remove_file(dir.join(SMUSH_LOCK_FILE));

        let mut index = snapshot::load_snapshot(&dir)?.unwrap_or_default();
        let snapshot_seq = snapshot::load_sequence(&dir);

        let mut repairs = 0u64;
        let log_len = replay_log(&log_path, &mut index, &mut repairs)?;

        let live_bytes = index
            .values()
            .filter(|e| !e.deleted)
            .map(|e| e.len as u64)
            .sum();

        let writer_file = OpenOptions::new().append(true).open(&log_path)?;
        let reader_file = File::open(&log_path)?;

        let writer = Arc::new(Mutex::new(LogWriter {
            file: writer_file,
            len: log_len,
            live_bytes,
        }));
        let dirty = Arc::new(AtomicBool::new(false));
        let flusher = match config.fsync {
            FsyncPolicy::Batch { max_staleness } => Some(Flusher::spawn(
                Arc::clone(&writer),
                Arc::clone(&dirty),
                max_staleness,
            )),
            _ => None,
        };

        tracing::debug!(
            dir = %dir.display(),
            records = index.len(),
            log_len,
            repairs,
            "opened append-log trunk"
        );

        Ok(AppendLogTrunk {
            dir,
            config,
            writer,
            index: RwLock::new(index),
            reader: Mutex::new(reader_file),
            snapshot_seq: AtomicU64::new(snapshot_seq),
            tail_repairs: AtomicU64::new(repairs),
            dirty,
            flusher,
            _dir_lock: dir_lock,
        })
    }

    /// How many times startup had to truncate a corrupt log tail.
    pub fn tail_repairs(&self) -> u64 {
        self.tail_repairs.load(Ordering::Relaxed)
    }

    pub fn snapshot_sequence(&self) -> u64 {
        self.snapshot_seq.load(Ordering::Relaxed)
    }

    pub fn log_len(&self) -> u64 {
        self.writer.lock().len
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn save_locked(&self, writer: &mut LogWriter, shell: &NutShell) -> AcornResult<()> {
        let bytes = shell.to_bytes();
        let offset = append_frame(writer, &bytes)?;
        match self.config.fsync {
            FsyncPolicy::Always => writer.file.sync_data()?,
            FsyncPolicy::Batch { .. } => self.dirty.store(true, Ordering::Release),
            FsyncPolicy::Never => {}
        }

        let frame_len = (bytes.len() as u64 + FRAME_HEADER_LEN) as u32;
        let mut index = self.index.write();
        let old = index.insert(
            shell.id.clone(),
            IndexEntry {
                offset,
                len: frame_len,
                version: shell.version,
                timestamp_ms: shell.timestamp_ms,
                deleted: shell.deleted,
            },
        );
        if let Some(old) = old {
            if !old.deleted {
                writer.live_bytes = writer.live_bytes.saturating_sub(old.len as u64);
            }
        }
        if !shell.deleted {
            writer.live_bytes += frame_len as u64;
        }
        Ok(())
    }

    fn should_auto_smush(&self, writer: &LogWriter) -> bool {
        self.config.auto_smush.is_some_and(|h| {
            writer.len > h.min_log_bytes
                && writer.len as f64 > h.ratio * writer.live_bytes.max(1) as f64
        })
    }

    fn read_shell_at(&self, offset: u64) -> AcornResult<NutShell> {
        let mut reader = self.reader.lock();
        let bytes = read_frame(&mut reader, offset)?;
        NutShell::from_bytes(&bytes)
    }

    fn collect(&self, include_tombstones: bool) -> AcornResult<Vec<NutShell>> {
        let entries: Vec<IndexEntry> = {
            let index = self.index.read();
            index
                .values()
                .filter(|e| include_tombstones || !e.deleted)
                .copied()
                .collect()
        };
        entries
            .into_iter()
            .map(|entry| self.read_shell_at(entry.offset))
            .collect()
    }

    /// Compaction: rewrite the log with only the current record per id
    /// (tombstones kept so replicas can still learn of deletions), then cut a
    /// fresh snapshot. Writers are held out for the duration.
    pub fn smush(&self) -> AcornResult<()> {
        let mut writer = self.writer.lock();
        let _smush_guard = SmushLock::acquire(&self.dir)?;

        let mut entries: Vec<(String, IndexEntry)> = self
            .index
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), *entry))
            .collect();
        // Preserve write order so offset order stays chronological.
        entries.sort_by_key(|(_, entry)| entry.offset);

        let log_path = self.log_path();
        let mut old_log = File::open(&log_path)?;
        let new_path = self.dir.join(LOG_NEW_FILE);
        let mut new_log = File::create(&new_path)?;

        let mut new_index = HashMap::with_capacity(entries.len());
        let mut new_len = 0u64;
        let mut live_bytes = 0u64;
        for (id, entry) in entries {
            let bytes = read_frame(&mut old_log, entry.offset)?;
            let frame_len = bytes.len() as u64 + FRAME_HEADER_LEN;
            write_frame(&mut new_log, &bytes)?;
            new_index.insert(
                id,
                IndexEntry {
                    offset: new_len,
                    len: frame_len as u32,
                    ..entry
                },
            );
            new_len += frame_len;
            if !entry.deleted {
                live_bytes += frame_len;
            }
        }
        new_log.sync_all()?;
        drop(new_log);
        drop(old_log);

        // Drop the snapshot before swapping logs: its offsets are only valid
        // for one log generation, and a crash anywhere in the swap must fall
        // back to a full replay of whichever log file survives.
        match fs::remove_file(self.dir.join(snapshot::SNAPSHOT_FILE)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(AcornError::from(err)),
        }

        let old_path = self.dir.join(LOG_OLD_FILE);
        fs::rename(&log_path, &old_path)?;
        fs::rename(&new_path, &log_path)?;

        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot::write_snapshot(&self.dir, &new_index, seq)?;
        if let Err(err) = fs::remove_file(&old_path) {
            tracing::warn!(%err, "failed to unlink compacted log");
        }

        let record_count = new_index.len();
        {
            let mut index = self.index.write();
            *index = new_index;
            writer.file = OpenOptions::new().append(true).open(&log_path)?;
            writer.len = new_len;
            writer.live_bytes = live_bytes;
            *self.reader.lock() = File::open(&log_path)?;
        }
        tracing::info!(
            dir = %self.dir.display(),
            records = record_count,
            log_len = new_len,
            snapshot = seq,
            "smushed append log"
        );
        Ok(())
    }
}

impl Trunk for AppendLogTrunk {
    fn save(&self, shell: NutShell) -> AcornResult<()> {
        let wants_smush = {
            let mut writer = self.writer.lock();
            self.save_locked(&mut writer, &shell)?;
            self.should_auto_smush(&writer)
        };
        if wants_smush {
            if let Err(err) = self.smush() {
                tracing::warn!(%err, "auto-compaction failed, continuing on the old log");
            }
        }
        Ok(())
    }

    fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
        let entry = { self.index.read().get(id).copied() };
        match entry {
            Some(entry) => self.read_shell_at(entry.offset).map(Some),
            None => Ok(None),
        }
    }

    /// Logs a tombstone rather than removing anything; the log is append-only.
    fn delete(&self, id: &str) -> AcornResult<()> {
        let prev = { self.index.read().get(id).copied() };
        let Some(prev) = prev else {
            return Ok(());
        };
        if prev.deleted {
            return Ok(());
        }
        self.save(NutShell {
            id: id.to_owned(),
            version: prev.version + 1,
            timestamp_ms: wall_clock_ms(),
            expires_at_ms: None,
            deleted: true,
            sequences: Vec::new(),
            original_len: 0,
            payload: Vec::new(),
        })
    }

    fn load_all(&self) -> AcornResult<Vec<NutShell>> {
        self.collect(false)
    }

    /// Linear scan of the log; offset order is write order, so the result is
    /// chronological oldest-first. History collapses to the current record
    /// after a smush.
    fn get_history(&self, id: &str) -> AcornResult<Vec<NutShell>> {
        let _writer = self.writer.lock();
        let mut file = File::open(self.log_path())?;
        let len = file.metadata()?.len();
        let mut history = Vec::new();
        let mut pos = 0u64;
        while pos < len {
            let bytes = read_frame(&mut file, pos)?;
            let frame_len = bytes.len() as u64 + FRAME_HEADER_LEN;
            let shell = NutShell::from_bytes(&bytes)?;
            if shell.id == id {
                history.push(shell);
            }
            pos += frame_len;
        }
        Ok(history)
    }

    fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
        self.collect(true)
    }

    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
        for shell in shells {
            let wins = {
                let index = self.index.read();
                index
                    .get(&shell.id)
                    .is_none_or(|entry| shell.recency() > entry.recency())
            };
            if wins {
                self.save(shell)?;
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> TrunkCaps {
        TrunkCaps {
            history: true,
            durable: true,
            async_io: false,
            sync_export: true,
        }
    }

    fn flush(&self) -> AcornResult<()> {
        let writer = self.writer.lock();
        writer.file.sync_data()?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for AppendLogTrunk {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.stop();
        }
        let writer = self.writer.lock();
        let _ = writer.file.sync_data();
    }
}

#[derive(Debug)]
struct Flusher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    fn spawn(writer: Arc<Mutex<LogWriter>>, dirty: Arc<AtomicBool>, staleness: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("acorn-log-flush".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(staleness);
                    if dirty.swap(false, Ordering::AcqRel) {
                        let writer = writer.lock();
                        if let Err(err) = writer.file.sync_data() {
                            tracing::warn!(%err, "batched fsync failed");
                        }
                    }
                }
            })
            .expect("failed to spawn log flusher thread");
        Flusher {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// `smush.lock` guard; created with `create_new` so a second compactor backs
/// off, removed on drop.
struct SmushLock {
    path: PathBuf,
}

impl SmushLock {
    fn acquire(dir: &Path) -> AcornResult<Self> {
        let path = dir.join(SMUSH_LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(SmushLock { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
                AcornError::Storage("compaction already in progress".into()),
            ),
            Err(err) => Err(AcornError::from(err)),
        }
    }
}

impl Drop for SmushLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn append_frame(writer: &mut LogWriter, bytes: &[u8]) -> AcornResult<u64> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
    frame.extend_from_slice(bytes);
    writer.file.write_all(&frame)?;
    let offset = writer.len;
    writer.len += frame.len() as u64;
    Ok(offset)
}

fn write_frame(file: &mut File, bytes: &[u8]) -> AcornResult<()> {
    file.write_all(&(bytes.len() as u32).to_le_bytes())?;
    file.write_all(&crc32fast::hash(bytes).to_le_bytes())?;
    file.write_all(bytes)?;
    Ok(())
}

/// Read one frame at `offset`, verifying length and checksum.
fn read_frame(file: &mut File, offset: u64) -> AcornResult<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;
    if crc32fast::hash(&bytes) != crc {
        return Err(AcornError::Storage(format!(
            "crc mismatch in log frame at offset {offset}"
        )));
    }
    Ok(bytes)
}

/// Replay the log from the newest snapshotted offset (re-applying that frame
/// is idempotent). On a short or corrupt tail the file is truncated to the
/// last valid boundary and `repairs` is incremented. Returns the valid log
/// length.
fn replay_log(
    path: &Path,
    index: &mut HashMap<String, IndexEntry>,
    repairs: &mut u64,
) -> AcornResult<u64> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let file_len = file.metadata()?.len();

    let mut pos = index.values().map(|e| e.offset).max().unwrap_or(0);
    if pos > file_len {
        tracing::warn!(
            snapshot_offset = pos,
            log_len = file_len,
            "snapshot points past the log, replaying from the start"
        );
        index.clear();
        pos = 0;
    }

    file.seek(SeekFrom::Start(pos))?;
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        let got = read_fully(&mut file, &mut header)?;
        if got == 0 {
            break; // clean end of log
        }
        if got < header.len() {
            truncate_tail(&mut file, path, pos, "partial frame header", repairs)?;
            break;
        }
        let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        let mut bytes = vec![0u8; len];
        let got = read_fully(&mut file, &mut bytes)?;
        if got < len {
            truncate_tail(&mut file, path, pos, "partial frame body", repairs)?;
            break;
        }
        if crc32fast::hash(&bytes) != crc {
            truncate_tail(&mut file, path, pos, "crc mismatch", repairs)?;
            break;
        }
        let shell = match NutShell::from_bytes(&bytes) {
            Ok(shell) => shell,
            Err(_) => {
                truncate_tail(&mut file, path, pos, "undecodable record", repairs)?;
                break;
            }
        };
        let frame_len = FRAME_HEADER_LEN + len as u64;
        index.insert(
            shell.id.clone(),
            IndexEntry {
                offset: pos,
                len: frame_len as u32,
                version: shell.version,
                timestamp_ms: shell.timestamp_ms,
                deleted: shell.deleted,
            },
        );
        pos += frame_len;
    }
    Ok(pos)
}

fn truncate_tail(
    file: &mut File,
    path: &Path,
    at: u64,
    reason: &str,
    repairs: &mut u64,
) -> AcornResult<()> {
    tracing::warn!(path = %path.display(), offset = at, reason, "truncating corrupt log tail");
    file.set_len(at)?;
    file.sync_all()?;
    *repairs += 1;
    Ok(())
}

/// `read` until the buffer is full or EOF; returns bytes read.
fn read_fully(file: &mut File, buf: &mut [u8]) -> AcornResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorn_test_harness::TrunkContract;

    fn open(dir: &Path) -> AppendLogTrunk {
        // per-record fsync keeps the tests deterministic
        AppendLogTrunk::open_with(
            dir,
            AppendLogConfig {
                fsync: FsyncPolicy::Always,
                auto_smush: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn satisfies_trunk_contract() {
        let dir = tempfile::tempdir().unwrap();
        let trunk = open(dir.path());
        TrunkContract::run(&trunk).unwrap();
        TrunkContract::history_chronology(&trunk).unwrap();
    }

    #[test]
    fn reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let trunk = open(dir.path());
            trunk.save(TrunkContract::live_shell("k1", 1, 10)).unwrap();
            trunk.save(TrunkContract::live_shell("k2", 1, 20)).unwrap();
            trunk.save(TrunkContract::live_shell("k1", 2, 30)).unwrap();
            trunk
                .save(TrunkContract::tombstone_shell("k2", 2, 40))
                .unwrap();
        }
        let trunk = open(dir.path());
        assert_eq!(trunk.load("k1").unwrap().unwrap().version, 2);
        assert!(trunk.load("k2").unwrap().unwrap().deleted);
        assert_eq!(trunk.load_all().unwrap().len(), 1);
        assert_eq!(trunk.export_changes().unwrap().len(), 2);
        assert_eq!(trunk.tail_repairs(), 0);
    }

    #[test]
    fn truncated_tail_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let trunk = open(dir.path());
            trunk.save(TrunkContract::live_shell("a", 1, 10)).unwrap();
            trunk.save(TrunkContract::live_shell("b", 1, 20)).unwrap();
        }
        // chop the last record in half
        let log = dir.path().join(LOG_FILE);
        let len = fs::metadata(&log).unwrap().len();
        let file = OpenOptions::new().write(true).open(&log).unwrap();
        file.set_len(len - 7).unwrap();
        drop(file);

        let trunk = open(dir.path());
        assert_eq!(trunk.tail_repairs(), 1);
        assert_eq!(trunk.load("a").unwrap().unwrap().version, 1);
        assert!(trunk.load("b").unwrap().is_none());

        // the trunk keeps working after the repair
        trunk.save(TrunkContract::live_shell("c", 1, 30)).unwrap();
        assert!(trunk.load("c").unwrap().is_some());
    }

    #[test]
    fn corrupted_record_truncates_from_there() {
        let dir = tempfile::tempdir().unwrap();
        let second_offset;
        {
            let trunk = open(dir.path());
            trunk.save(TrunkContract::live_shell("a", 1, 10)).unwrap();
            second_offset = trunk.log_len();
            trunk.save(TrunkContract::live_shell("b", 1, 20)).unwrap();
            trunk.save(TrunkContract::live_shell("c", 1, 30)).unwrap();
        }
        // flip a byte inside record "b"
        let log = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&log).unwrap();
        let target = second_offset as usize + FRAME_HEADER_LEN as usize + 2;
        bytes[target] ^= 0xFF;
        fs::write(&log, bytes).unwrap();

        let trunk = open(dir.path());
        assert_eq!(trunk.tail_repairs(), 1);
        assert!(trunk.load("a").unwrap().is_some());
        assert!(trunk.load("b").unwrap().is_none());
        assert!(trunk.load("c").unwrap().is_none());
    }

    #[test]
    fn history_is_chronological_and_smush_collapses_it() {
        let dir = tempfile::tempdir().unwrap();
        let trunk = open(dir.path());
        trunk.save(TrunkContract::live_shell("k", 1, 10)).unwrap();
        trunk.save(TrunkContract::live_shell("k", 2, 20)).unwrap();
        trunk.save(TrunkContract::live_shell("k", 3, 30)).unwrap();
        trunk.save(TrunkContract::live_shell("other", 1, 15)).unwrap();

        let history = trunk.get_history("k").unwrap();
        assert_eq!(
            history.iter().map(|s| s.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let before = trunk.log_len();
        trunk.smush().unwrap();
        assert!(trunk.log_len() < before);
        assert_eq!(trunk.snapshot_sequence(), 1);

        // current state intact, history collapsed to the survivor
        assert_eq!(trunk.load("k").unwrap().unwrap().version, 3);
        assert!(trunk.load("other").unwrap().is_some());
        assert_eq!(trunk.get_history("k").unwrap().len(), 1);
    }

    #[test]
    fn smush_keeps_tombstones_and_reopens_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let trunk = open(dir.path());
            trunk.save(TrunkContract::live_shell("keep", 1, 10)).unwrap();
            trunk.save(TrunkContract::live_shell("gone", 1, 20)).unwrap();
            trunk
                .save(TrunkContract::tombstone_shell("gone", 2, 30))
                .unwrap();
            trunk.smush().unwrap();

            // post-smush writes land in the fresh log
            trunk.save(TrunkContract::live_shell("later", 1, 40)).unwrap();
        }
        let trunk = open(dir.path());
        assert!(trunk.load("keep").unwrap().is_some());
        assert!(trunk.load("gone").unwrap().unwrap().deleted);
        assert!(trunk.load("later").unwrap().is_some());
        assert_eq!(trunk.load_all().unwrap().len(), 2);
        // tombstone still exported for replica convergence
        assert!(trunk
            .export_changes()
            .unwrap()
            .iter()
            .any(|s| s.id == "gone" && s.deleted));
    }

    #[test]
    fn auto_smush_honors_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let trunk = AppendLogTrunk::open_with(
            dir.path(),
            AppendLogConfig {
                fsync: FsyncPolicy::Never,
                auto_smush: Some(SmushHeuristic {
                    min_log_bytes: 512,
                    ratio: 2.0,
                }),
            },
        )
        .unwrap();

        // rewrite the same id until dead bytes dominate
        for version in 1..=100u64 {
            trunk
                .save(TrunkContract::live_shell("hot", version, version as i64))
                .unwrap();
        }
        assert!(
            trunk.snapshot_sequence() >= 1,
            "expected at least one automatic compaction"
        );
        assert_eq!(trunk.load("hot").unwrap().unwrap().version, 100);
    }

    #[test]
    fn directory_is_process_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _first = open(dir.path());
        let second = AppendLogTrunk::open(dir.path());
        assert!(matches!(second.unwrap_err(), AcornError::Storage(_)));
    }

    #[test]
    fn delete_logs_a_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let trunk = open(dir.path());
        trunk.save(TrunkContract::live_shell("d", 4, 10)).unwrap();
        trunk.delete("d").unwrap();

        let tomb = trunk.load("d").unwrap().unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.version, 5);
        // deleting an absent or already-deleted id is a no-op
        trunk.delete("d").unwrap();
        trunk.delete("never-existed").unwrap();
        assert_eq!(trunk.load("d").unwrap().unwrap().version, 5);
    }
}
