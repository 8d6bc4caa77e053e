//! The per-record storage pipeline ("roots").
//!
//! Each root is an invertible byte transform with a stable sequence number.
//! Encode runs in ascending sequence order; decode replays the sequence list
//! recorded in the shell header in reverse, so reads survive pipeline
//! reconfiguration as long as the recorded roots are still registered.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AcornError, AcornResult, PipelineError};

/// One stage of the on-write byte pipeline. Implementations must be pure:
/// `decode(encode(x)) == x` with no state carried across records.
pub trait Root: Send + Sync {
    /// Stable identifier recorded with every stored blob.
    fn sequence(&self) -> u32;
    fn name(&self) -> &'static str;
    fn encode(&self, input: &[u8]) -> AcornResult<Vec<u8>>;
    fn decode(&self, input: &[u8]) -> AcornResult<Vec<u8>>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    roots: Vec<Arc<dyn Root>>,
    by_sequence: HashMap<u32, Arc<dyn Root>>,
}

impl Pipeline {
    pub fn new(mut roots: Vec<Arc<dyn Root>>) -> AcornResult<Self> {
        roots.sort_by_key(|r| r.sequence());
        let mut by_sequence = HashMap::with_capacity(roots.len());
        for root in &roots {
            if by_sequence.insert(root.sequence(), Arc::clone(root)).is_some() {
                return Err(AcornError::Config(format!(
                    "duplicate root sequence {}",
                    root.sequence()
                )));
            }
        }
        Ok(Pipeline { roots, by_sequence })
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Run every configured root in ascending sequence order. Returns the
    /// applied sequence list for the shell header alongside the bytes.
    pub fn encode(&self, payload: &[u8]) -> AcornResult<(Vec<u32>, Vec<u8>)> {
        let mut sequences = Vec::with_capacity(self.roots.len());
        let mut bytes = payload.to_vec();
        for root in &self.roots {
            bytes = root.encode(&bytes)?;
            sequences.push(root.sequence());
        }
        Ok((sequences, bytes))
    }

    /// Reverse exactly the recorded sequence list, newest-applied first.
    pub fn decode(&self, sequences: &[u32], payload: &[u8]) -> AcornResult<Vec<u8>> {
        let mut bytes = payload.to_vec();
        for seq in sequences.iter().rev() {
            let root = self
                .by_sequence
                .get(seq)
                .ok_or(PipelineError::MissingRoot { sequence: *seq })?;
            bytes = root.decode(&bytes)?;
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.roots.iter().map(|r| (r.sequence(), r.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// XOR with a constant byte; trivially invertible.
    struct XorRoot {
        sequence: u32,
        mask: u8,
    }

    impl Root for XorRoot {
        fn sequence(&self) -> u32 {
            self.sequence
        }

        fn name(&self) -> &'static str {
            "xor"
        }

        fn encode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
            Ok(input.iter().map(|b| b ^ self.mask).collect())
        }

        fn decode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
            self.encode(input)
        }
    }

    /// Prepends a tag byte so ordering mistakes show up as corruption.
    struct TagRoot {
        sequence: u32,
        tag: u8,
    }

    impl Root for TagRoot {
        fn sequence(&self) -> u32 {
            self.sequence
        }

        fn name(&self) -> &'static str {
            "tag"
        }

        fn encode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
            let mut out = vec![self.tag];
            out.extend_from_slice(input);
            Ok(out)
        }

        fn decode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
            match input.split_first() {
                Some((tag, rest)) if *tag == self.tag => Ok(rest.to_vec()),
                _ => Err(PipelineError::Corrupt("tag mismatch".into()).into()),
            }
        }
    }

    #[test]
    fn encode_ascending_decode_reversed() {
        let pipeline = Pipeline::new(vec![
            Arc::new(TagRoot {
                sequence: 200,
                tag: 0xBB,
            }),
            Arc::new(TagRoot {
                sequence: 100,
                tag: 0xAA,
            }),
        ])
        .unwrap();

        let (sequences, encoded) = pipeline.encode(b"payload").unwrap();
        assert_eq!(sequences, vec![100, 200]);
        // root 200 ran last, so its tag is outermost
        assert_eq!(encoded[0], 0xBB);
        assert_eq!(pipeline.decode(&sequences, &encoded).unwrap(), b"payload");
    }

    #[test]
    fn round_trip_with_mixed_roots() {
        let pipeline = Pipeline::new(vec![
            Arc::new(XorRoot {
                sequence: 1,
                mask: 0x5A,
            }),
            Arc::new(TagRoot {
                sequence: 2,
                tag: 0x01,
            }),
        ])
        .unwrap();
        let (sequences, encoded) = pipeline.encode(b"acorns").unwrap();
        assert_eq!(pipeline.decode(&sequences, &encoded).unwrap(), b"acorns");
    }

    #[test]
    fn missing_root_is_reported_by_sequence() {
        let full = Pipeline::new(vec![Arc::new(XorRoot {
            sequence: 7,
            mask: 0xFF,
        })])
        .unwrap();
        let (sequences, encoded) = full.encode(b"x").unwrap();

        let stripped = Pipeline::new(vec![]).unwrap();
        let err = stripped.decode(&sequences, &encoded).unwrap_err();
        assert!(matches!(
            err,
            AcornError::Pipeline(PipelineError::MissingRoot { sequence: 7 })
        ));
    }

    #[test]
    fn duplicate_sequences_are_a_config_error() {
        let err = Pipeline::new(vec![
            Arc::new(XorRoot {
                sequence: 3,
                mask: 1,
            }),
            Arc::new(TagRoot {
                sequence: 3,
                tag: 9,
            }),
        ])
        .unwrap_err();
        assert!(matches!(err, AcornError::Config(_)));
    }
}
