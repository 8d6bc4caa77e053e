//! Trunk-level wire form of a record.
//!
//! A [`NutShell`] is what trunks persist: plaintext metadata (so backends can
//! index and replicate without running the pipeline), the pipeline header
//! (format version, applied root sequences, original payload length), and the
//! pipeline-encoded payload bytes. The layout below is what gets framed into
//! `log.aol` and written by every backend.

use crate::error::{AcornResult, PipelineError};
use crate::nut::from_unix_ms;
use time::OffsetDateTime;

pub const SHELL_FORMAT_VERSION: u8 = 1;

const FLAG_DELETED: u8 = 0b0000_0001;
const FLAG_HAS_EXPIRY: u8 = 0b0000_0010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NutShell {
    pub id: String,
    pub version: u64,
    pub timestamp_ms: i64,
    pub expires_at_ms: Option<i64>,
    pub deleted: bool,
    /// Root sequence numbers applied to `payload`, in encode order.
    pub sequences: Vec<u32>,
    /// Payload byte length before the pipeline ran.
    pub original_len: u64,
    pub payload: Vec<u8>,
}

impl NutShell {
    pub fn timestamp(&self) -> OffsetDateTime {
        from_unix_ms(self.timestamp_ms)
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at_ms.map(from_unix_ms)
    }

    /// Ordering key for last-writer-wins merges at the trunk level.
    pub fn recency(&self) -> (i64, u64) {
        (self.timestamp_ms, self.version)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.id.len() + self.payload.len());
        buf.push(SHELL_FORMAT_VERSION);
        buf.push(self.sequences.len() as u8);
        for seq in &self.sequences {
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        buf.extend_from_slice(&self.original_len.to_le_bytes());

        let mut flags = 0u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.expires_at_ms.is_some() {
            flags |= FLAG_HAS_EXPIRY;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        if let Some(expires) = self.expires_at_ms {
            buf.extend_from_slice(&expires.to_le_bytes());
        }
        buf.extend_from_slice(&(self.id.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> AcornResult<Self> {
        let mut r = Reader { buf: bytes, pos: 0 };
        let format = r.u8()?;
        if format != SHELL_FORMAT_VERSION {
            return Err(PipelineError::Corrupt(format!("unknown shell format {format}")).into());
        }
        let n_roots = r.u8()? as usize;
        let mut sequences = Vec::with_capacity(n_roots);
        for _ in 0..n_roots {
            sequences.push(r.u32()?);
        }
        let original_len = r.u64()?;
        let flags = r.u8()?;
        let version = r.u64()?;
        let timestamp_ms = r.i64()?;
        let expires_at_ms = if flags & FLAG_HAS_EXPIRY != 0 {
            Some(r.i64()?)
        } else {
            None
        };
        let id_len = r.u32()? as usize;
        let id = std::str::from_utf8(r.take(id_len)?)
            .map_err(|_| PipelineError::Corrupt("record id is not valid UTF-8".into()))?
            .to_owned();
        let payload_len = r.u64()? as usize;
        let payload = r.take(payload_len)?.to_vec();
        Ok(NutShell {
            id,
            version,
            timestamp_ms,
            expires_at_ms,
            deleted: flags & FLAG_DELETED != 0,
            sequences,
            original_len,
            payload,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PipelineError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| PipelineError::Corrupt("truncated record".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PipelineError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PipelineError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, PipelineError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, PipelineError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AcornError;

    fn sample() -> NutShell {
        NutShell {
            id: "user/42".into(),
            version: 9,
            timestamp_ms: 1_714_000_000_123,
            expires_at_ms: Some(1_714_000_600_000),
            deleted: false,
            sequences: vec![100, 200],
            original_len: 11,
            payload: b"hello nutty".to_vec(),
        }
    }

    #[test]
    fn round_trips() {
        let shell = sample();
        let back = NutShell::from_bytes(&shell.to_bytes()).unwrap();
        assert_eq!(back, shell);
    }

    #[test]
    fn tombstone_round_trips_without_expiry() {
        let shell = NutShell {
            id: "gone".into(),
            version: 4,
            timestamp_ms: 1,
            expires_at_ms: None,
            deleted: true,
            sequences: vec![],
            original_len: 0,
            payload: vec![],
        };
        let back = NutShell::from_bytes(&shell.to_bytes()).unwrap();
        assert_eq!(back, shell);
        assert!(back.deleted);
    }

    #[test]
    fn truncation_is_reported_as_corrupt() {
        let bytes = sample().to_bytes();
        for cut in [0, 1, 5, bytes.len() - 1] {
            let err = NutShell::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, AcornError::Pipeline(PipelineError::Corrupt(_))));
        }
    }

    #[test]
    fn recency_orders_by_timestamp_then_version() {
        let mut a = sample();
        let mut b = sample();
        a.timestamp_ms = 10;
        a.version = 5;
        b.timestamp_ms = 10;
        b.version = 6;
        assert!(b.recency() > a.recency());
        b.timestamp_ms = 9;
        assert!(a.recency() > b.recency());
    }
}
