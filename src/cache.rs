use crate::buffer::{Chunk, Key, Priority};

#[derive(Clone, Debug, PartialEq)]
pub enum CacheEntry {
    /// Must be refreshed from the child before use
    Stale,
    /// Last report from the child; an empty chunk means the child is drained
    Fresh(Chunk),
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheEntry::Fresh(_))
    }

    pub fn priority(&self) -> Option<Priority> {
        match self {
            CacheEntry::Fresh(chunk) => chunk.priority(),
            CacheEntry::Stale => None,
        }
    }
}

/// One entry per child, sized to the actual fan-out
#[derive(Debug)]
pub struct ChildCache {
    entries: Vec<CacheEntry>,
}

impl ChildCache {
    pub fn new(fanout: usize) -> Self {
        Self {
            entries: vec![CacheEntry::Stale; fanout],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CacheEntry> {
        self.entries.get(index)
    }

    /// Indices of children that must be asked for their state
    pub fn stale(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_fresh())
            .map(|(index, _)| index)
    }

    pub fn refresh(&mut self, index: usize, chunk: Chunk) {
        self.entries[index] = CacheEntry::Fresh(chunk);
    }

    /// Take a child's items up to `limit` for forwarding. The entry goes
    /// stale once nothing is left of it.
    pub fn consume(&mut self, index: usize, limit: Key) -> Option<Chunk> {
        let CacheEntry::Fresh(chunk) = &mut self.entries[index] else {
            return None;
        };
        let taken = chunk.take_through(limit);
        if chunk.is_empty() {
            self.entries[index] = CacheEntry::Stale;
        }
        Some(taken)
    }

    /// Whether any fresh entry still holds data
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|entry| entry.priority().is_some())
    }

    /// Segment boundary: every child must report again
    pub fn invalidate_all(&mut self) {
        self.entries.fill(CacheEntry::Stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LocalBuffer;
    use crate::config::SessionConfig;

    fn chunk(keys: &[Key]) -> Chunk {
        let mut buf = LocalBuffer::new(&SessionConfig::text(64));
        for &key in keys {
            buf.push_text(format!("{key}\n").as_bytes(), Some(key));
        }
        buf.take()
    }

    #[test]
    fn consumed_entries_go_stale() {
        let mut cache = ChildCache::new(3);
        assert_eq!(cache.stale().collect::<Vec<_>>(), vec![0, 1, 2]);

        cache.refresh(1, chunk(&[5]));
        cache.refresh(2, Chunk::empty(crate::Variant::Text));
        assert_eq!(cache.stale().collect::<Vec<_>>(), vec![0]);
        assert!(cache.has_pending());
        assert_eq!(cache.get(1).unwrap().priority(), Some(Priority::Keyed(5)));
        assert_eq!(cache.get(2).unwrap().priority(), None);

        assert_eq!(cache.consume(1, Key::MAX), Some(chunk(&[5])));
        assert_eq!(cache.consume(1, Key::MAX), None);
        assert_eq!(cache.stale().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!cache.has_pending());

        cache.invalidate_all();
        assert_eq!(cache.stale().count(), 3);
    }

    #[test]
    fn partial_consume_keeps_entry_fresh() {
        let mut cache = ChildCache::new(1);
        cache.refresh(0, chunk(&[1, 2, 3]));
        assert_eq!(cache.consume(0, 2).unwrap().key_range(), Some((1, 2)));
        assert_eq!(cache.stale().count(), 0);
        assert_eq!(cache.get(0).unwrap().priority(), Some(Priority::Keyed(3)));
        assert_eq!(cache.consume(0, 9).unwrap().key_range(), Some((3, 3)));
        assert_eq!(cache.stale().collect::<Vec<_>>(), vec![0]);
    }
}
