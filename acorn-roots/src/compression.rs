use std::io::{Read, Write};

use acorn_core::error::{AcornError, AcornResult, PipelineError};
use acorn_core::Root;

/// Codec behind a [`CompressionRoot`]; gzip and brotli ship, anything
/// invertible plugs in.
pub trait CompressionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, input: &[u8]) -> AcornResult<Vec<u8>>;
    fn decompress(&self, input: &[u8]) -> AcornResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct GzipProvider {
    level: u32,
}

impl GzipProvider {
    /// `level` 0-9 as in flate2.
    pub fn new(level: u32) -> Self {
        GzipProvider {
            level: level.min(9),
        }
    }
}

impl Default for GzipProvider {
    fn default() -> Self {
        GzipProvider::new(6)
    }
}

impl CompressionProvider for GzipProvider {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(input)?;
        encoder.finish().map_err(AcornError::storage)
    }

    fn decompress(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(input)
            .read_to_end(&mut out)
            .map_err(|err| PipelineError::Corrupt(format!("gzip: {err}")))?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct BrotliProvider {
    quality: u32,
}

impl BrotliProvider {
    /// `quality` 0-11 as in the brotli crate.
    pub fn new(quality: u32) -> Self {
        BrotliProvider {
            quality: quality.min(11),
        }
    }
}

impl Default for BrotliProvider {
    fn default() -> Self {
        BrotliProvider::new(5)
    }
}

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LG_WINDOW: u32 = 22;

impl CompressionProvider for BrotliProvider {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn compress(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(
                &mut out,
                BROTLI_BUFFER,
                self.quality,
                BROTLI_LG_WINDOW,
            );
            writer.write_all(input)?;
            writer.flush()?;
        }
        Ok(out)
    }

    fn decompress(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        let mut out = Vec::new();
        brotli::Decompressor::new(input, BROTLI_BUFFER)
            .read_to_end(&mut out)
            .map_err(|err| PipelineError::Corrupt(format!("brotli: {err}")))?;
        Ok(out)
    }
}

/// Pipeline stage that shrinks payload bytes on the way to the trunk. The
/// pre-compression length travels in the shell header, so the read side can
/// size its buffers.
pub struct CompressionRoot {
    sequence: u32,
    provider: Box<dyn CompressionProvider>,
}

impl CompressionRoot {
    pub fn new(sequence: u32, provider: impl CompressionProvider + 'static) -> Self {
        CompressionRoot {
            sequence,
            provider: Box::new(provider),
        }
    }

    pub fn gzip(sequence: u32) -> Self {
        Self::new(sequence, GzipProvider::default())
    }

    pub fn brotli(sequence: u32) -> Self {
        Self::new(sequence, BrotliProvider::default())
    }
}

impl Root for CompressionRoot {
    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn name(&self) -> &'static str {
        self.provider.name()
    }

    fn encode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        self.provider.compress(input)
    }

    fn decode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        self.provider.decompress(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn gzip_round_trip() {
        let provider = GzipProvider::default();
        let input = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let packed = provider.compress(&input).unwrap();
        assert_eq!(provider.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn brotli_round_trip() {
        let provider = BrotliProvider::default();
        let input = b"acorns all the way down ".repeat(64);
        let packed = provider.compress(&input).unwrap();
        assert_eq!(provider.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn repetitive_text_compresses_well() {
        let input = "nutty payload with plenty of repetition. ".repeat(250);
        assert!(input.len() >= 10_000);
        for provider in [
            Box::new(GzipProvider::default()) as Box<dyn CompressionProvider>,
            Box::new(BrotliProvider::default()),
        ] {
            let packed = provider.compress(input.as_bytes()).unwrap();
            assert!(
                packed.len() * 10 < input.len() * 3,
                "{} produced {} bytes from {}",
                provider.name(),
                packed.len(),
                input.len()
            );
        }
    }

    #[test]
    fn garbage_input_is_corrupt_not_panic() {
        let provider = GzipProvider::default();
        let err = provider.decompress(b"definitely not gzip").unwrap_err();
        assert!(matches!(
            err,
            AcornError::Pipeline(PipelineError::Corrupt(_))
        ));
    }

    proptest! {
        #[test]
        fn gzip_inverts_arbitrary_bytes(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let provider = GzipProvider::default();
            let packed = provider.compress(&input).unwrap();
            prop_assert_eq!(provider.decompress(&packed).unwrap(), input);
        }

        #[test]
        fn brotli_inverts_arbitrary_bytes(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let provider = BrotliProvider::default();
            let packed = provider.compress(&input).unwrap();
            prop_assert_eq!(provider.decompress(&packed).unwrap(), input);
        }
    }
}
