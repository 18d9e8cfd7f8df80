//! Value compression strategies
//!
//! A version's compression strategy is fixed when the version is pushed, so
//! the read path picks the compressor from the borrowed version record.

use crate::error::{CodecError, CodecResult};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::sync::Arc;
use tidepool_common::{CompressionStrategy, Result};

/// Upper bound on a decompressed value
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Compresses and decompresses stored values
pub trait Compressor: Send + Sync {
    /// Strategy implemented by this compressor
    fn strategy(&self) -> CompressionStrategy;

    /// Compress a value for storage
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a stored value
    ///
    /// Malformed input fails with `Error::CorruptData`.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Values stored as-is
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpCompressor;

impl Compressor for NoOpCompressor {
    fn strategy(&self) -> CompressionStrategy {
        CompressionStrategy::NoOp
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip compressed values
#[derive(Clone, Copy, Debug)]
pub struct GzipCompressor {
    level: Compression,
    max_size: usize,
}

impl GzipCompressor {
    /// Create a compressor writing at `level` (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            max_size: MAX_DECOMPRESSED_SIZE,
        }
    }

    /// Limit the size of decompressed output
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    fn gzip(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn gunzip(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = decoder.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            if decompressed.len() + read > self.max_size {
                return Err(CodecError::TooLarge { max: self.max_size });
            }
            decompressed.extend_from_slice(&buffer[..read]);
        }
        Ok(decompressed)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            max_size: MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl Compressor for GzipCompressor {
    fn strategy(&self) -> CompressionStrategy {
        CompressionStrategy::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.gzip(data)?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.gunzip(data)?)
    }
}

/// Hands out the compressor for a strategy
#[derive(Clone)]
pub struct CompressorFactory {
    noop: Arc<dyn Compressor>,
    gzip: Arc<dyn Compressor>,
}

impl CompressorFactory {
    pub fn new() -> Self {
        Self {
            noop: Arc::new(NoOpCompressor),
            gzip: Arc::new(GzipCompressor::default()),
        }
    }

    /// Compressor implementing `strategy`
    pub fn get(&self, strategy: CompressionStrategy) -> Arc<dyn Compressor> {
        match strategy {
            CompressionStrategy::NoOp => Arc::clone(&self.noop),
            CompressionStrategy::Gzip => Arc::clone(&self.gzip),
        }
    }

    /// Decompress `data` written with `strategy`
    pub fn decompress(&self, strategy: CompressionStrategy, data: &[u8]) -> Result<Vec<u8>> {
        self.get(strategy).decompress(data)
    }
}

impl Default for CompressorFactory {
    fn default() -> Self {
        Self::new()
    }
}
