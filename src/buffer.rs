use std::cmp::Ordering;
use std::mem;

use crate::config::SessionConfig;
use crate::error::{MergeError, Result};
use crate::kind::{PayloadKind, Variant};

/// Application-supplied ordering tag
pub type Key = i64;

/// Item storage, one layout per variant
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(Vec<u8>),
    Binary {
        ints: Vec<i64>,
        floats: Vec<f64>,
        bytes: Vec<u8>,
    },
}

impl Payload {
    pub fn empty(variant: Variant) -> Self {
        match variant {
            Variant::Text => Payload::Text(Vec::new()),
            Variant::Binary => Payload::Binary {
                ints: Vec::new(),
                floats: Vec::new(),
                bytes: Vec::new(),
            },
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Payload::Text(_) => Variant::Text,
            Payload::Binary { .. } => Variant::Binary,
        }
    }

    /// Elements of one binary kind; zero for text payloads
    pub fn count(&self, kind: PayloadKind) -> usize {
        match self {
            Payload::Text(_) => 0,
            Payload::Binary { ints, floats, bytes } => match kind {
                PayloadKind::Ints => ints.len(),
                PayloadKind::Floats => floats.len(),
                PayloadKind::Bytes => bytes.len(),
            },
        }
    }

    pub fn used_count(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary { ints, floats, bytes } => ints.len() + floats.len() + bytes.len(),
        }
    }

    /// Split at `at` layout units; `self` keeps the front.
    ///
    /// Binary units count ints, then floats, then bytes.
    pub fn split_off(&mut self, at: usize) -> Payload {
        match self {
            Payload::Text(text) => Payload::Text(text.split_off(at)),
            Payload::Binary { ints, floats, bytes } => {
                let at_ints = at.min(ints.len());
                let at_floats = (at - at_ints).min(floats.len());
                let at_bytes = at - at_ints - at_floats;
                Payload::Binary {
                    ints: ints.split_off(at_ints),
                    floats: floats.split_off(at_floats),
                    bytes: bytes.split_off(at_bytes),
                }
            }
        }
    }

    /// Highest binary kind present, used to keep kinds in layout order
    fn last_kind(&self) -> Option<PayloadKind> {
        PayloadKind::ALL
            .into_iter()
            .rev()
            .find(|&kind| self.count(kind) > 0)
    }
}

/// What a process reports about a chunk without shipping it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferSummary {
    Text {
        count: usize,
        first_key: Key,
        last_key: Key,
        keyed: bool,
    },
    Binary {
        int_count: usize,
        float_count: usize,
        byte_count: usize,
        first_key: Key,
        last_key: Key,
        keyed: bool,
    },
}

impl BufferSummary {
    pub fn used_count(&self) -> usize {
        match *self {
            BufferSummary::Text { count, .. } => count,
            BufferSummary::Binary {
                int_count,
                float_count,
                byte_count,
                ..
            } => int_count + float_count + byte_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used_count() == 0
    }

    /// Tagged key range, if the chunk carries any tagged items
    pub fn key_range(&self) -> Option<(Key, Key)> {
        let (first_key, last_key, keyed) = match *self {
            BufferSummary::Text {
                first_key,
                last_key,
                keyed,
                ..
            }
            | BufferSummary::Binary {
                first_key,
                last_key,
                keyed,
                ..
            } => (first_key, last_key, keyed),
        };
        (keyed && !self.is_empty()).then_some((first_key, last_key))
    }

    /// Merge priority, or `None` when there is nothing to send
    pub fn priority(&self) -> Option<Priority> {
        if self.is_empty() {
            return None;
        }
        Some(match self.key_range() {
            Some((first, _)) => Priority::Keyed(first),
            None => Priority::Unkeyed,
        })
    }
}

/// Merge order of a pending chunk. Unordered-only chunks go first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Unkeyed,
    Keyed(Key),
}

/// Where a tagged item starts inside a chunk, in layout units
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyMark {
    pub offset: usize,
    pub key: Key,
}

/// A run of items. Tagged items are marked in ascending key order; untagged
/// items ride along with the tagged item before them.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub payload: Payload,
    pub marks: Vec<KeyMark>,
}

impl Chunk {
    pub fn empty(variant: Variant) -> Self {
        Self {
            payload: Payload::empty(variant),
            marks: Vec::new(),
        }
    }

    pub fn used_count(&self) -> usize {
        self.payload.used_count()
    }

    pub fn is_empty(&self) -> bool {
        self.used_count() == 0
    }

    pub fn keyed(&self) -> bool {
        !self.marks.is_empty()
    }

    pub fn key_range(&self) -> Option<(Key, Key)> {
        Some((self.marks.first()?.key, self.marks.last()?.key))
    }

    pub fn summary(&self) -> BufferSummary {
        let (first_key, last_key) = self.key_range().unwrap_or((0, 0));
        let keyed = self.keyed();
        match &self.payload {
            Payload::Text(text) => BufferSummary::Text {
                count: text.len(),
                first_key,
                last_key,
                keyed,
            },
            Payload::Binary { ints, floats, bytes } => BufferSummary::Binary {
                int_count: ints.len(),
                float_count: floats.len(),
                byte_count: bytes.len(),
                first_key,
                last_key,
                keyed,
            },
        }
    }

    pub fn priority(&self) -> Option<Priority> {
        self.summary().priority()
    }

    /// Remove and return the items that may go out while another source
    /// still holds `limit`: everything before the first tagged item keyed
    /// above it.
    pub fn take_through(&mut self, limit: Key) -> Chunk {
        let split = self.marks.partition_point(|mark| mark.key <= limit);
        if split == self.marks.len() {
            let variant = self.payload.variant();
            return mem::replace(self, Chunk::empty(variant));
        }
        let at = self.marks[split].offset;
        let rest = self.payload.split_off(at);
        let mut rest_marks = self.marks.split_off(split);
        for mark in &mut rest_marks {
            mark.offset -= at;
        }
        Chunk {
            payload: mem::replace(&mut self.payload, rest),
            marks: mem::replace(&mut self.marks, rest_marks),
        }
    }

    fn record_key(&mut self, offset: usize, key: Option<Key>) {
        if let Some(key) = key {
            self.marks.push(KeyMark { offset, key });
        }
    }
}

/// Compare two optional priorities, treating `None` as "nothing pending"
pub fn earlier(a: Option<Priority>, b: Option<Priority>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b) == Ordering::Less,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Result of offering an item to the buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fit {
    Fits,
    /// The buffer must be drained first
    Flush,
}

/// Per-process pending items
#[derive(Debug)]
pub struct LocalBuffer {
    chunk: Chunk,
    text_capacity: usize,
    capacities: [usize; 3],
    /// Last tagged key accepted in the current segment
    high_water: Option<Key>,
}

impl LocalBuffer {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            chunk: Chunk::empty(config.variant),
            text_capacity: config.text_capacity,
            capacities: PayloadKind::ALL.map(|kind| config.capacity(kind)),
            high_water: None,
        }
    }

    pub fn variant(&self) -> Variant {
        self.chunk.payload.variant()
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn summary(&self) -> BufferSummary {
        self.chunk.summary()
    }

    pub fn used_count(&self) -> usize {
        self.chunk.used_count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Effective key for a tagged append and whether it had to be coerced.
    ///
    /// Keys must rise strictly within a segment; a key at or below the last
    /// accepted one becomes `last + 1`.
    pub fn effective_key(&self, key: Key) -> (Key, bool) {
        match self.high_water {
            Some(last) if key <= last => (last.saturating_add(1), true),
            _ => (key, false),
        }
    }

    /// Whether appending `key` would leave a hole in the buffered run
    pub fn breaks_run(&self, key: Key) -> bool {
        match self.chunk.summary().key_range() {
            Some((_, last)) => key != last.saturating_add(1),
            None => false,
        }
    }

    pub fn check_text(&self, len: usize) -> Result<Fit> {
        self.require(Variant::Text)?;
        if len > self.text_capacity {
            return Err(MergeError::ItemTooLarge {
                size: len,
                capacity: self.text_capacity,
            });
        }
        Ok(if self.used_count() + len <= self.text_capacity {
            Fit::Fits
        } else {
            Fit::Flush
        })
    }

    pub fn check_binary(&self, kind: PayloadKind, len: usize) -> Result<Fit> {
        self.require(Variant::Binary)?;
        let capacity = self.capacities[kind as usize];
        if len > capacity {
            return Err(MergeError::ItemTooLarge {
                size: len,
                capacity,
            });
        }
        let out_of_layout = self
            .chunk
            .payload
            .last_kind()
            .is_some_and(|last| last > kind);
        Ok(
            if out_of_layout || self.chunk.payload.count(kind) + len > capacity {
                Fit::Flush
            } else {
                Fit::Fits
            },
        )
    }

    pub fn push_text(&mut self, item: &[u8], key: Option<Key>) {
        let offset = self.used_count();
        if let Payload::Text(text) = &mut self.chunk.payload {
            text.extend_from_slice(item);
        }
        self.accept(offset, key);
    }

    pub fn push_ints(&mut self, values: &[i64], key: Option<Key>) {
        let offset = self.used_count();
        if let Payload::Binary { ints, .. } = &mut self.chunk.payload {
            ints.extend_from_slice(values);
        }
        self.accept(offset, key);
    }

    pub fn push_floats(&mut self, values: &[f64], key: Option<Key>) {
        let offset = self.used_count();
        if let Payload::Binary { floats, .. } = &mut self.chunk.payload {
            floats.extend_from_slice(values);
        }
        self.accept(offset, key);
    }

    pub fn push_bytes(&mut self, values: &[u8], key: Option<Key>) {
        let offset = self.used_count();
        if let Payload::Binary { bytes, .. } = &mut self.chunk.payload {
            bytes.extend_from_slice(values);
        }
        self.accept(offset, key);
    }

    /// Hand the buffered chunk over and start a fresh one
    pub fn take(&mut self) -> Chunk {
        let variant = self.variant();
        mem::replace(&mut self.chunk, Chunk::empty(variant))
    }

    /// Hand over the items allowed out while another source holds `limit`
    pub fn take_through(&mut self, limit: Key) -> Chunk {
        self.chunk.take_through(limit)
    }

    /// Record a tagged item that bypassed the buffer
    pub fn mark_written(&mut self, key: Key) {
        self.high_water = Some(key);
    }

    /// Forget the key history at a segment boundary
    pub fn reset_segment(&mut self) {
        self.high_water = None;
    }

    fn accept(&mut self, offset: usize, key: Option<Key>) {
        self.chunk.record_key(offset, key);
        if key.is_some() {
            self.high_water = key;
        }
    }

    fn require(&self, expected: Variant) -> Result<()> {
        if self.variant() == expected {
            Ok(())
        } else {
            Err(MergeError::VariantMismatch { expected })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_buffer(capacity: usize) -> LocalBuffer {
        LocalBuffer::new(&SessionConfig::text(capacity))
    }

    #[test]
    fn tagged_run_tracks_range() {
        let mut buf = text_buffer(64);
        buf.push_text(b"a\n", Some(4));
        buf.push_text(b"b\n", Some(5));
        assert_eq!(buf.summary().key_range(), Some((4, 5)));
        assert_eq!(buf.summary().priority(), Some(Priority::Keyed(4)));
        assert!(!buf.breaks_run(6));
        assert!(buf.breaks_run(9));
    }

    #[test]
    fn drained_buffer_resets_range_but_keeps_history() {
        let mut buf = text_buffer(64);
        buf.push_text(b"a", Some(3));
        let chunk = buf.take();
        assert_eq!(chunk.summary().key_range(), Some((3, 3)));
        assert!(buf.is_empty());
        assert!(buf.chunk().marks.is_empty());
        assert!(matches!(
            buf.summary(),
            BufferSummary::Text { first_key: 0, last_key: 0, keyed: false, .. }
        ));
        assert_eq!(buf.effective_key(2), (4, true));
        buf.reset_segment();
        assert_eq!(buf.effective_key(2), (2, false));
    }

    #[test]
    fn zero_key_is_a_real_key() {
        let mut buf = text_buffer(8);
        buf.push_text(b"z", Some(0));
        assert_eq!(buf.summary().priority(), Some(Priority::Keyed(0)));
        assert_eq!(buf.effective_key(0), (1, true));
    }

    #[test]
    fn unordered_chunks_sort_first() {
        assert!(Priority::Unkeyed < Priority::Keyed(Key::MIN));
        assert!(earlier(Some(Priority::Keyed(1)), Some(Priority::Keyed(2))));
        assert!(!earlier(Some(Priority::Keyed(2)), Some(Priority::Keyed(2))));
        assert!(earlier(Some(Priority::Unkeyed), None));
        assert!(!earlier(None, Some(Priority::Unkeyed)));
    }

    #[test]
    fn oversized_item_leaves_buffer_intact() {
        let mut buf = text_buffer(64);
        buf.push_text(b"kept", None);
        let err = buf.check_text(70).unwrap_err();
        assert!(matches!(err, MergeError::ItemTooLarge { size: 70, capacity: 64 }));
        assert_eq!(buf.chunk().payload, Payload::Text(b"kept".to_vec()));
        assert_eq!(buf.check_text(61).unwrap(), Fit::Flush);
        assert_eq!(buf.check_text(60).unwrap(), Fit::Fits);
    }

    #[test]
    fn binary_kinds_stay_in_layout_order() {
        let mut buf = LocalBuffer::new(&SessionConfig::binary(4, 4, 4));
        assert_eq!(buf.check_binary(PayloadKind::Floats, 2).unwrap(), Fit::Fits);
        buf.push_floats(&[1.0, 2.0], Some(1));
        assert_eq!(buf.check_binary(PayloadKind::Ints, 1).unwrap(), Fit::Flush);
        assert_eq!(buf.check_binary(PayloadKind::Bytes, 4).unwrap(), Fit::Fits);
        assert_eq!(buf.check_binary(PayloadKind::Floats, 3).unwrap(), Fit::Flush);
        assert!(matches!(
            buf.check_text(1),
            Err(MergeError::VariantMismatch { expected: Variant::Text })
        ));
        match buf.summary() {
            BufferSummary::Binary {
                int_count,
                float_count,
                byte_count,
                ..
            } => assert_eq!((int_count, float_count, byte_count), (0, 2, 0)),
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn take_through_stops_before_higher_keys() {
        let mut buf = text_buffer(64);
        buf.push_text(b"1\n", Some(1));
        buf.push_text(b"note\n", None);
        buf.push_text(b"2\n", Some(2));
        buf.push_text(b"3\n", Some(3));

        let head = buf.take_through(1);
        assert_eq!(head.payload, Payload::Text(b"1\nnote\n".to_vec()));
        assert_eq!(head.key_range(), Some((1, 1)));
        assert_eq!(buf.summary().key_range(), Some((2, 3)));
        assert_eq!(buf.chunk().marks[0], KeyMark { offset: 0, key: 2 });

        // Equal keys may go out; the whole rest fits under a higher limit
        let head = buf.take_through(2);
        assert_eq!(head.payload, Payload::Text(b"2\n".to_vec()));
        let head = buf.take_through(Key::MAX);
        assert_eq!(head.payload, Payload::Text(b"3\n".to_vec()));
        assert!(buf.is_empty());
        // Key history survives partial drains
        assert_eq!(buf.effective_key(3), (4, true));
    }

    #[test]
    fn binary_split_follows_layout_order() {
        let mut buf = LocalBuffer::new(&SessionConfig::binary(8, 8, 8));
        buf.push_ints(&[10, 11], Some(0));
        buf.push_floats(&[0.5], Some(1));
        buf.push_floats(&[1.5, 2.5], Some(2));
        buf.push_bytes(b"xy", Some(3));

        let head = buf.take_through(1);
        assert_eq!(
            head.payload,
            Payload::Binary {
                ints: vec![10, 11],
                floats: vec![0.5],
                bytes: vec![],
            }
        );
        assert_eq!(
            buf.chunk().marks,
            vec![KeyMark { offset: 0, key: 2 }, KeyMark { offset: 2, key: 3 }]
        );
        assert_eq!(buf.chunk().payload.count(PayloadKind::Floats), 2);
        assert_eq!(buf.chunk().payload.count(PayloadKind::Bytes), 2);
    }

    #[test]
    fn unkeyed_chunk_is_taken_whole() {
        let mut buf = text_buffer(64);
        buf.push_text(b"a", None);
        buf.push_text(b"b", None);
        let head = buf.take_through(Key::MIN);
        assert_eq!(head.payload, Payload::Text(b"ab".to_vec()));
        assert!(buf.is_empty());
    }
}
