//! Pluggable compression for journal payloads.
//!
//! The algorithm tag is persisted in the environment header (high nibble
//! of one byte), so files written with compression enabled reject openers
//! built without the matching backend.

use std::io::{Read, Write};

use crate::error::{Error, ErrorCode, Result};

/// No compression.
pub const COMPRESSOR_NONE: u8 = 0;
/// zlib (deflate) compression.
pub const COMPRESSOR_ZLIB: u8 = 1;

/// A block compression transform.
pub trait Compressor: Send {
    /// Compress `input`; the output carries no size framing of its own.
    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `input` into exactly `uncompressed_size` bytes.
    fn decompress(&mut self, input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// zlib-backed compressor.
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(input)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&mut self, input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::ZlibDecoder::new(input);
        let mut out = Vec::with_capacity(uncompressed_size);
        decoder.read_to_end(&mut out)?;
        if out.len() != uncompressed_size {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                "decompressed size mismatch",
            ));
        }
        Ok(out)
    }
}

/// Instantiate the compressor for a persisted algorithm tag.
pub fn compressor_for(tag: u8) -> Result<Option<Box<dyn Compressor>>> {
    match tag {
        COMPRESSOR_NONE => Ok(None),
        COMPRESSOR_ZLIB => Ok(Some(Box::new(ZlibCompressor))),
        _ => Err(Error::with_message(
            ErrorCode::NotImplemented,
            format!("unknown compressor tag {}", tag),
        )),
    }
}
