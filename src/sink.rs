use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};
use xxhash_rust::xxh3::Xxh3;

use crate::buffer::Payload;
use crate::kind::PayloadKind;

/// Bytes a payload occupies once laid out
pub fn encoded_len(payload: &Payload) -> usize {
    match payload {
        Payload::Text(text) => text.len(),
        Payload::Binary { .. } => PayloadKind::ALL
            .into_iter()
            .map(|kind| payload.count(kind) * kind.width())
            .sum(),
    }
}

/// Lay out a payload: text verbatim, binary as ints, floats, then bytes, little-endian
pub fn write_payload<W: Write>(out: &mut W, payload: &Payload) -> io::Result<()> {
    match payload {
        Payload::Text(text) => out.write_all(text),
        Payload::Binary { ints, floats, bytes } => {
            for &v in ints {
                out.write_i64::<LittleEndian>(v)?;
            }
            for &v in floats {
                out.write_f64::<LittleEndian>(v)?;
            }
            out.write_all(bytes)
        }
    }
}

/// Writer wrapper that counts and hashes everything written
pub struct RootSink<W: Write> {
    out: W,
    bytes_written: u64,
    hasher: Xxh3,
}

impl<W: Write> RootSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            bytes_written: 0,
            hasher: Xxh3::new(),
        }
    }

    pub fn write(&mut self, payload: &Payload) -> io::Result<usize> {
        let mut laid_out = Vec::with_capacity(encoded_len(payload));
        write_payload(&mut laid_out, payload)?;
        self.out.write_all(&laid_out)?;
        self.hasher.update(&laid_out);
        self.bytes_written += laid_out.len() as u64;
        Ok(laid_out.len())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// XXH3-64 of the whole stream so far
    pub fn digest(&self) -> u64 {
        self.hasher.digest()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flush and hand back the underlying writer
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
