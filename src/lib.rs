//! Ordered-merge file writing for SPMD process groups.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub mod buffer;
pub mod cache;
pub mod collective;
pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod kind;
pub mod session;
pub mod sink;
pub mod topology;
pub mod transport;

pub use buffer::{BufferSummary, Chunk, Key, KeyMark, Payload};
pub use config::SessionConfig;
pub use engine::{EngineState, MergeEngine, RoundOutcome, Source};
pub use error::{FrameError, MergeError, Result, TransportError};
pub use kind::{PayloadKind, Variant};
pub use session::{SegmentStats, Session};
pub use topology::{Rank, Topology};
pub use transport::{ChannelTransport, Transport};

pub const FRAME_VERSION: u8 = 1;

/// Message types exchanged over the tree
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// Chunk summary followed by its payload, child to parent
    Data = 0,
    /// "Nothing pending below me", child to parent
    Empty = 1,
    /// Segment finished, parent to child
    Finished = 2,
    /// One step of a group-wide reduction
    Reduce = 3,
}

impl MsgType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(MsgType::Data),
            1 => Some(MsgType::Empty),
            2 => Some(MsgType::Finished),
            3 => Some(MsgType::Reduce),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Data => "data",
            MsgType::Empty => "empty",
            MsgType::Finished => "finished",
            MsgType::Reduce => "reduce",
        }
    }
}

bitflags::bitflags! {
    /// Frame flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const KEYED = 1 << 0;
        const BINARY = 1 << 1;
        const ZSTD = 1 << 2;
        const INTS = 1 << 3;
        const FLOATS = 1 << 4;
        const BYTES = 1 << 5;
    }
}

/// Payload compression applied at encode time
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Compression {
    pub threshold: usize,
    pub level: i32,
}

/// Frame header; for `Data` frames this is the chunk summary
#[derive(Clone, Debug, PartialEq)]
pub struct FrameHeader {
    pub version: u8,
    pub mtype: MsgType,
    pub flags: Flags,
    pub origin: u32,
    pub seq: u64,
    pub first_key: Key,
    pub last_key: Key,
    /// One count for text, three (ints, floats, bytes) for binary
    pub counts: Vec<u32>,
    /// Start and key of every tagged item in the payload
    pub marks: Vec<KeyMark>,
}

/// Complete frame with an uncompressed payload
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub hdr: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    fn control(mtype: MsgType, origin: u32, seq: u64) -> Self {
        Frame {
            hdr: FrameHeader {
                version: FRAME_VERSION,
                mtype,
                flags: Flags::empty(),
                origin,
                seq,
                first_key: 0,
                last_key: 0,
                counts: vec![0],
                marks: Vec::new(),
            },
            payload: Vec::new(),
        }
    }

    pub fn empty(origin: u32, seq: u64) -> Self {
        Self::control(MsgType::Empty, origin, seq)
    }

    pub fn finished(origin: u32, seq: u64) -> Self {
        Self::control(MsgType::Finished, origin, seq)
    }

    pub fn reduce(origin: u32, value: u8) -> Self {
        let mut frame = Self::control(MsgType::Reduce, origin, 0);
        frame.hdr.counts = vec![1];
        frame.payload = vec![value];
        frame
    }

    /// Value carried by a `Reduce` frame
    pub fn reduce_value(&self) -> Option<u8> {
        match self.hdr.mtype {
            MsgType::Reduce => self.payload.first().copied(),
            _ => None,
        }
    }

    /// Data frame carrying a whole chunk
    pub fn data(origin: u32, seq: u64, chunk: &Chunk) -> std::result::Result<Self, FrameError> {
        let mut flags = Flags::empty();
        if chunk.keyed() {
            flags |= Flags::KEYED;
        }
        let counts = match &chunk.payload {
            Payload::Text(text) => vec![wire_len(text.len())?],
            Payload::Binary { .. } => {
                flags |= Flags::BINARY;
                let mut counts = Vec::with_capacity(3);
                let kind_flags = [Flags::INTS, Flags::FLOATS, Flags::BYTES];
                for (kind, flag) in PayloadKind::ALL.into_iter().zip(kind_flags) {
                    let count = chunk.payload.count(kind);
                    if count > 0 {
                        flags |= flag;
                    }
                    counts.push(wire_len(count)?);
                }
                counts
            }
        };
        let mut payload = Vec::with_capacity(sink::encoded_len(&chunk.payload));
        sink::write_payload(&mut payload, &chunk.payload)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        let (first_key, last_key) = chunk.key_range().unwrap_or((0, 0));

        Ok(Frame {
            hdr: FrameHeader {
                version: FRAME_VERSION,
                mtype: MsgType::Data,
                flags,
                origin,
                seq,
                first_key,
                last_key,
                counts,
                marks: chunk.marks.clone(),
            },
            payload,
        })
    }

    /// Rebuild the chunk carried by a `Data` or `Empty` frame
    pub fn into_chunk(self) -> std::result::Result<Chunk, FrameError> {
        let mismatch = FrameError::PayloadMismatch { len: self.payload.len() };
        let payload = if self.hdr.flags.contains(Flags::BINARY) {
            let [n_ints, n_floats, n_bytes] = match self.hdr.counts.as_slice() {
                &[a, b, c] => [a as usize, b as usize, c as usize],
                _ => return Err(mismatch),
            };
            let expected = n_ints * PayloadKind::Ints.width()
                + n_floats * PayloadKind::Floats.width()
                + n_bytes * PayloadKind::Bytes.width();
            if expected != self.payload.len() {
                return Err(mismatch);
            }
            let mut cursor = Cursor::new(&self.payload);
            let mut ints = vec![0i64; n_ints];
            cursor
                .read_i64_into::<LittleEndian>(&mut ints)
                .map_err(|_| mismatch.clone())?;
            let mut floats = vec![0f64; n_floats];
            cursor
                .read_f64_into::<LittleEndian>(&mut floats)
                .map_err(|_| mismatch.clone())?;
            let mut bytes = vec![0u8; n_bytes];
            cursor.read_exact(&mut bytes).map_err(|_| mismatch.clone())?;
            Payload::Binary { ints, floats, bytes }
        } else {
            Payload::Text(self.payload)
        };

        let chunk = Chunk {
            payload,
            marks: self.hdr.marks,
        };
        // Marks must rise strictly, in both offset and key, and agree with the summary
        let ordered = chunk
            .marks
            .windows(2)
            .all(|w| w[0].offset < w[1].offset && w[0].key < w[1].key);
        let in_bounds = chunk.marks.last().map_or(true, |m| m.offset < chunk.used_count());
        let summary_agrees = match chunk.key_range() {
            Some(range) => {
                self.hdr.flags.contains(Flags::KEYED) && range == (self.hdr.first_key, self.hdr.last_key)
            }
            None => !self.hdr.flags.contains(Flags::KEYED),
        };
        if !(ordered && in_bounds && summary_agrees) {
            return Err(FrameError::InvalidMarks);
        }
        Ok(chunk)
    }

    /// Encode frame to bytes
    pub fn encode(
        &self,
        compression: Option<Compression>,
    ) -> std::result::Result<Vec<u8>, FrameError> {
        let mut flags = self.hdr.flags - Flags::ZSTD;
        let body = match compression {
            Some(c) if self.payload.len() > c.threshold => {
                flags |= Flags::ZSTD;
                compress::compress_payload(&self.payload, c.level)?
            }
            _ => self.payload.clone(),
        };

        let marks = self
            .hdr
            .marks
            .iter()
            .map(|mark| Ok((wire_len(mark.offset)?, mark.key)))
            .collect::<std::result::Result<Vec<_>, FrameError>>()?;
        let lens = (wire_len(marks.len())?, wire_len(body.len())?);

        let mut buf = Vec::with_capacity(44 + 4 * self.hdr.counts.len() + 12 * marks.len() + body.len());
        write_header(&mut buf, &self.hdr, flags, &marks, lens)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        buf.extend_from_slice(&body);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode frame from bytes
    pub fn decode(data: &[u8]) -> std::result::Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Truncated {
                needed: 4 - data.len(),
            });
        }
        let (body, tail) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = Cursor::new(body);
        let truncated = |_| FrameError::Truncated { needed: 1 };

        let version = cursor.read_u8().map_err(truncated)?;
        if version != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw_type = cursor.read_u8().map_err(truncated)?;
        let mtype = MsgType::from_u8(raw_type).ok_or(FrameError::InvalidType(raw_type))?;
        let raw_flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let flags = Flags::from_bits(raw_flags).ok_or(FrameError::InvalidFlags(raw_flags))?;
        let origin = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let seq = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let first_key = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
        let last_key = cursor.read_i64::<LittleEndian>().map_err(truncated)?;

        let n_counts = if flags.contains(Flags::BINARY) { 3 } else { 1 };
        let mut counts = Vec::with_capacity(n_counts);
        for _ in 0..n_counts {
            counts.push(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
        }
        let n_marks = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut marks = Vec::new();
        for _ in 0..n_marks {
            let offset = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let key = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
            marks.push(KeyMark { offset, key });
        }
        let body_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;

        let start = cursor.position() as usize;
        let rest = &body[start..];
        if rest.len() < body_len {
            return Err(FrameError::Truncated {
                needed: body_len - rest.len(),
            });
        }
        if rest.len() > body_len {
            return Err(FrameError::PayloadMismatch { len: rest.len() });
        }
        let payload = if flags.contains(Flags::ZSTD) {
            compress::decompress_payload(rest)?
        } else {
            rest.to_vec()
        };

        if flags.contains(Flags::BINARY) {
            for (count, flag) in counts.iter().zip([Flags::INTS, Flags::FLOATS, Flags::BYTES]) {
                if (*count > 0) != flags.contains(flag) {
                    return Err(FrameError::PayloadMismatch { len: payload.len() });
                }
            }
        } else if counts[0] as usize != payload.len() {
            return Err(FrameError::PayloadMismatch { len: payload.len() });
        }

        Ok(Frame {
            hdr: FrameHeader {
                version,
                mtype,
                flags: flags - Flags::ZSTD,
                origin,
                seq,
                first_key,
                last_key,
                counts,
                marks,
            },
            payload,
        })
    }
}

fn wire_len(len: usize) -> std::result::Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::TooLarge { len })
}

fn write_header<W: Write>(
    buf: &mut W,
    hdr: &FrameHeader,
    flags: Flags,
    marks: &[(u32, Key)],
    (n_marks, body_len): (u32, u32),
) -> std::io::Result<()> {
    buf.write_u8(hdr.version)?;
    buf.write_u8(hdr.mtype as u8)?;
    buf.write_u16::<LittleEndian>(flags.bits())?;
    buf.write_u32::<LittleEndian>(hdr.origin)?;
    buf.write_u64::<LittleEndian>(hdr.seq)?;
    buf.write_i64::<LittleEndian>(hdr.first_key)?;
    buf.write_i64::<LittleEndian>(hdr.last_key)?;
    for &count in &hdr.counts {
        buf.write_u32::<LittleEndian>(count)?;
    }
    buf.write_u32::<LittleEndian>(n_marks)?;
    for &(offset, key) in marks {
        buf.write_u32::<LittleEndian>(offset)?;
        buf.write_i64::<LittleEndian>(key)?;
    }
    buf.write_u32::<LittleEndian>(body_len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_chunk() -> Chunk {
        Chunk {
            payload: Payload::Binary {
                ints: vec![-1, 2, i64::MAX],
                floats: vec![],
                bytes: b"abc".to_vec(),
            },
            marks: vec![KeyMark { offset: 0, key: 7 }, KeyMark { offset: 3, key: 9 }],
        }
    }

    #[test]
    fn test_data_frame_encode_decode() {
        let chunk = binary_chunk();
        let frame = Frame::data(3, 11, &chunk).unwrap();
        assert!(frame.hdr.flags.contains(Flags::INTS | Flags::BYTES | Flags::KEYED));
        assert_eq!((frame.hdr.first_key, frame.hdr.last_key), (7, 9));
        assert!(!frame.hdr.flags.contains(Flags::FLOATS));

        let encoded = frame.encode(None).unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.hdr.mtype, MsgType::Data);
        assert_eq!(decoded.hdr.origin, 3);
        assert_eq!(decoded.hdr.seq, 11);
        assert_eq!(decoded.into_chunk().unwrap(), chunk);
    }

    #[test]
    fn compressed_payload_is_transparent() {
        let chunk = Chunk {
            payload: Payload::Text(b"row 1.000000 2.000000\n".repeat(100)),
            marks: Vec::new(),
        };
        let frame = Frame::data(1, 0, &chunk).unwrap();
        let compression = Some(Compression {
            threshold: 64,
            level: 3,
        });
        let plain = frame.encode(None).unwrap();
        let packed = frame.encode(compression).unwrap();
        assert!(packed.len() < plain.len());

        let decoded = Frame::decode(&packed).unwrap();
        assert!(!decoded.hdr.flags.contains(Flags::ZSTD));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn control_frames() {
        let frame = Frame::decode(&Frame::finished(0, 4).encode(None).unwrap()).unwrap();
        assert_eq!(frame.hdr.mtype, MsgType::Finished);
        assert_eq!(frame.reduce_value(), None);

        let frame = Frame::decode(&Frame::reduce(2, 1).encode(None).unwrap()).unwrap();
        assert_eq!(frame.reduce_value(), Some(1));

        let chunk = Frame::empty(5, 0).into_chunk().unwrap();
        assert!(chunk.is_empty());
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let mut encoded = Frame::data(1, 1, &binary_chunk()).unwrap().encode(None).unwrap();
        encoded[12] ^= 0xff;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            Frame::decode(&[1, 2]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut frame = Frame::empty(0, 0);
        frame.hdr.version = 9;
        let encoded = frame.encode(None).unwrap();
        assert_eq!(
            Frame::decode(&encoded),
            Err(FrameError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn marks_must_match_the_payload() {
        let mut frame = Frame::data(2, 0, &binary_chunk()).unwrap();
        frame.hdr.marks[1].offset = 6;
        assert_eq!(frame.clone().into_chunk(), Err(FrameError::InvalidMarks));

        frame.hdr.marks[1] = KeyMark { offset: 3, key: 7 };
        assert_eq!(frame.clone().into_chunk(), Err(FrameError::InvalidMarks));

        frame.hdr.marks.clear();
        assert_eq!(frame.into_chunk(), Err(FrameError::InvalidMarks));
    }
}
