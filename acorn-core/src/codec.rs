use serde::{de::DeserializeOwned, Serialize};

use crate::error::{AcornError, AcornResult};

/// Serialization hooks between typed payloads and the byte stream handed to
/// the pipeline. Pluggable; JSON is the default.
pub trait NutCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> AcornResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> AcornResult<T>;
}

#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl<T> NutCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> AcornResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(AcornError::serialization)
    }

    fn decode(&self, bytes: &[u8]) -> AcornResult<T> {
        serde_json::from_slice(bytes).map_err(AcornError::serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Demo {
        value: String,
    }

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonCodec;
        let original = Demo {
            value: "hello".into(),
        };

        let bytes = codec.encode(&original).unwrap();
        let decoded: Demo = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_failure_is_a_serialization_error() {
        let codec = JsonCodec;
        let err = NutCodec::<Demo>::decode(&codec, b"not json").unwrap_err();
        assert!(matches!(err, AcornError::Serialization(_)));
    }
}
