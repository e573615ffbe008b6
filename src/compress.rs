use std::io::Cursor;
use zstd::stream::{decode_all, encode_all};

use crate::error::FrameError;

/// Compress a frame payload with zstd
pub fn compress_payload(input: &[u8], level: i32) -> Result<Vec<u8>, FrameError> {
    encode_all(Cursor::new(input), level).map_err(|e| FrameError::Compression(e.to_string()))
}

/// Decompress a frame payload produced by [`compress_payload`]
pub fn decompress_payload(input: &[u8]) -> Result<Vec<u8>, FrameError> {
    decode_all(Cursor::new(input)).map_err(|e| FrameError::Compression(e.to_string()))
}
