use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;

/// A single versioned record: the unit of storage in a [`Tree`](crate::Tree).
///
/// Tombstones carry `deleted = true` and no payload; they propagate deletions
/// through sync instead of physically removing the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct Nut<T> {
    pub id: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub version: u64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub deleted: bool,
}

impl<T> Nut<T> {
    /// Tombstone for `id`, superseding version `version - 1`.
    pub fn tombstone(id: impl Into<String>, version: u64, timestamp: OffsetDateTime) -> Self {
        Nut {
            id: id.into(),
            payload: None,
            timestamp,
            version,
            expires_at: None,
            deleted: true,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Payload types that carry their own id, enabling [`Tree::stash`](crate::Tree::stash)
/// without an explicit key. Use `stash_with` for types that don't.
pub trait HasId {
    fn id(&self) -> &str;
}

pub(crate) fn unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_unix_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn tombstones_have_no_payload() {
        let nut: Nut<String> = Nut::tombstone("gone", 3, datetime!(2024-01-01 00:00 UTC));
        assert!(nut.deleted);
        assert!(nut.payload.is_none());
        assert_eq!(nut.version, 3);
    }

    #[test]
    fn expiry_is_inclusive() {
        let at = datetime!(2024-06-01 12:00 UTC);
        let nut = Nut {
            id: "x".into(),
            payload: Some(1u32),
            timestamp: at,
            version: 1,
            expires_at: Some(at),
            deleted: false,
        };
        assert!(nut.is_expired_at(at));
        assert!(!nut.is_expired_at(at - time::Duration::seconds(1)));
    }

    #[test]
    fn wire_format_is_rfc3339() {
        let nut = Nut {
            id: "n1".into(),
            payload: Some("v".to_string()),
            timestamp: datetime!(2024-03-05 10:20:30 UTC),
            version: 7,
            expires_at: None,
            deleted: false,
        };
        let json = serde_json::to_string(&nut).unwrap();
        assert!(json.contains("2024-03-05T10:20:30Z"));
        let back: Nut<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 7);
        assert_eq!(back.payload.as_deref(), Some("v"));
    }

    #[test]
    fn ms_round_trip() {
        let ts = datetime!(2031-12-31 23:59:59.123 UTC);
        assert_eq!(from_unix_ms(unix_ms(ts)), ts);
    }
}
