//! Snapshot of the id → log-offset index.
//!
//! `snapshot.idx` layout: `"ACRN"` magic, format version u16, entry count
//! u64, then per entry `(id_len: u32, id bytes, offset: u64, version: u64,
//! timestamp: i64 ms, flags: u8)`, closed by a crc32 over everything before
//! it. `snapshot.seq` holds the snapshot sequence as ASCII decimal. Both are
//! written via tmp + rename so a crash leaves the previous snapshot intact.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use acorn_core::{AcornError, AcornResult};

pub(crate) const SNAPSHOT_FILE: &str = "snapshot.idx";
pub(crate) const SNAPSHOT_SEQ_FILE: &str = "snapshot.seq";

const MAGIC: &[u8; 4] = b"ACRN";
const FORMAT_VERSION: u16 = 1;
const FLAG_DELETED: u8 = 0b0000_0001;

/// In-memory index entry; `len` is the framed record length when known (0
/// for entries restored from a snapshot, recovered lazily on read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub offset: u64,
    pub len: u32,
    pub version: u64,
    pub timestamp_ms: i64,
    pub deleted: bool,
}

impl IndexEntry {
    pub fn recency(&self) -> (i64, u64) {
        (self.timestamp_ms, self.version)
    }
}

pub(crate) fn write_snapshot(
    dir: &Path,
    index: &HashMap<String, IndexEntry>,
    sequence: u64,
) -> AcornResult<()> {
    let mut buf = Vec::with_capacity(32 + index.len() * 64);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for (id, entry) in index {
        buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
        buf.extend_from_slice(&entry.version.to_le_bytes());
        buf.extend_from_slice(&entry.timestamp_ms.to_le_bytes());
        buf.push(if entry.deleted { FLAG_DELETED } else { 0 });
    }
    buf.extend_from_slice(&crc32fast::hash(&buf).to_le_bytes());

    atomic_write(&dir.join(SNAPSHOT_FILE), &buf)?;
    atomic_write(&dir.join(SNAPSHOT_SEQ_FILE), sequence.to_string().as_bytes())?;
    Ok(())
}

/// Load the snapshot if present and valid. Invalid snapshots are reported as
/// `None` so the caller falls back to a full log replay.
pub(crate) fn load_snapshot(dir: &Path) -> AcornResult<Option<HashMap<String, IndexEntry>>> {
    let path = dir.join(SNAPSHOT_FILE);
    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(AcornError::from(err)),
    };
    match parse_snapshot(&buf) {
        Some(index) => Ok(Some(index)),
        None => {
            tracing::warn!(?path, "ignoring invalid snapshot, replaying full log");
            Ok(None)
        }
    }
}

pub(crate) fn load_sequence(dir: &Path) -> u64 {
    fs::read_to_string(dir.join(SNAPSHOT_SEQ_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn parse_snapshot(buf: &[u8]) -> Option<HashMap<String, IndexEntry>> {
    if buf.len() < 4 + 2 + 8 + 4 || &buf[..4] != MAGIC {
        return None;
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().ok()?);
    if crc32fast::hash(body) != stored_crc {
        return None;
    }
    let version = u16::from_le_bytes(body[4..6].try_into().ok()?);
    if version != FORMAT_VERSION {
        return None;
    }
    let count = u64::from_le_bytes(body[6..14].try_into().ok()?) as usize;

    let mut index = HashMap::with_capacity(count);
    let mut pos = 14usize;
    for _ in 0..count {
        let id_len = u32::from_le_bytes(body.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let id = std::str::from_utf8(body.get(pos..pos + id_len)?).ok()?.to_owned();
        pos += id_len;
        let offset = u64::from_le_bytes(body.get(pos..pos + 8)?.try_into().ok()?);
        pos += 8;
        let record_version = u64::from_le_bytes(body.get(pos..pos + 8)?.try_into().ok()?);
        pos += 8;
        let timestamp_ms = i64::from_le_bytes(body.get(pos..pos + 8)?.try_into().ok()?);
        pos += 8;
        let flags = *body.get(pos)?;
        pos += 1;
        index.insert(
            id,
            IndexEntry {
                offset,
                len: 0,
                version: record_version,
                timestamp_ms,
                deleted: flags & FLAG_DELETED != 0,
            },
        );
    }
    (pos == body.len()).then_some(index)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> AcornResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
