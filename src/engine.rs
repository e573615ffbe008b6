use tracing::{debug, trace};

use crate::buffer::{earlier, Chunk, Key, LocalBuffer, Priority};
use crate::cache::ChildCache;
use crate::config::SessionConfig;
use crate::error::{MergeError, Result};
use crate::topology::{Rank, Topology};
use crate::transport::Transport;
use crate::{Compression, Frame, MsgType};

/// Where a merged chunk came from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Local,
    /// Relayed from the subtree rooted at this child
    Child(Rank),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Some child entries are stale and will be fetched next round
    AwaitingChildren,
    /// Every child entry is fresh
    Draining,
    /// The current segment has terminated everywhere
    Finished,
}

/// What one round achieved
#[derive(Clone, Debug, PartialEq)]
pub enum RoundOutcome {
    /// Root only: this chunk is next in the output stream
    Emit { source: Source, chunk: Chunk },
    /// Non-root: a chunk of `items` units went to the parent
    Forwarded { source: Source, items: usize },
    Finished,
}

/// One process's side of the merge. Each [`round`](MergeEngine::round)
/// refreshes stale children, then moves the earliest pending items one hop
/// toward the root: the root hands them back for writing, everyone else
/// sends them to the parent. Nothing pending anywhere below ends the segment.
pub struct MergeEngine {
    topology: Topology,
    cache: ChildCache,
    /// Tie-break position over `{children..., self}`
    cursor: usize,
    state: EngineState,
    /// Frames sent to the parent so far
    seq: u64,
    compression: Option<Compression>,
}

impl MergeEngine {
    pub fn new(topology: Topology, config: &SessionConfig) -> Self {
        let cache = ChildCache::new(topology.fanout());
        let state = if cache.is_empty() {
            EngineState::Draining
        } else {
            EngineState::AwaitingChildren
        };
        Self {
            topology,
            cache,
            cursor: 0,
            state,
            seq: 0,
            compression: config.compress_threshold.map(|threshold| Compression {
                threshold,
                level: config.zstd_level,
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run one round. Collective with the rest of the tree.
    pub fn round<T: Transport>(
        &mut self,
        transport: &mut T,
        local: &mut LocalBuffer,
    ) -> Result<RoundOutcome> {
        let rank = self.topology.rank();
        if self.state == EngineState::Finished {
            self.state = EngineState::AwaitingChildren;
        }

        let stale: Vec<usize> = self.cache.stale().collect();
        for index in stale {
            let frame = Frame::decode(&transport.recv_from_child(index)?)?;
            match frame.hdr.mtype {
                MsgType::Data | MsgType::Empty => {
                    trace!(rank, child = frame.hdr.origin, seq = frame.hdr.seq, "child reported");
                    self.cache.refresh(index, frame.into_chunk()?);
                }
                MsgType::Finished => {
                    return Err(MergeError::UnexpectedTermination {
                        rank,
                        reason: format!(
                            "child {} sent a finished signal",
                            self.topology.children()[index]
                        ),
                    })
                }
                MsgType::Reduce => {
                    return Err(MergeError::UnexpectedMessage {
                        rank,
                        got: MsgType::Reduce.name(),
                        expected: "refreshing child state",
                    })
                }
            }
        }
        self.state = EngineState::Draining;

        let local_priority = local.summary().priority();
        match self.pick(local_priority) {
            None => self.terminate(transport, local),
            Some(slot) => {
                // Items keyed above another source's head must wait for it
                let limit = self.bound(slot, local_priority);
                let (source, chunk) = if slot == self.cache.len() {
                    (Source::Local, local.take_through(limit))
                } else {
                    let chunk = self.cache.consume(slot, limit).ok_or_else(|| {
                        MergeError::UnexpectedTermination {
                            rank,
                            reason: format!("winning child slot {slot} was stale"),
                        }
                    })?;
                    (Source::Child(self.topology.children()[slot]), chunk)
                };
                if self.cache.stale().next().is_some() {
                    self.state = EngineState::AwaitingChildren;
                }
                trace!(rank, ?source, priority = ?chunk.priority(), "round winner");

                if self.topology.is_root() {
                    Ok(RoundOutcome::Emit { source, chunk })
                } else {
                    let items = chunk.used_count();
                    let frame = Frame::data(rank, self.seq, &chunk)?;
                    self.seq += 1;
                    transport.send_to_parent(frame.encode(self.compression)?)?;
                    Ok(RoundOutcome::Forwarded { source, items })
                }
            }
        }
    }

    /// Slot of the earliest pending chunk, scanning from the cursor
    fn pick(&mut self, local: Option<Priority>) -> Option<usize> {
        let slots = self.cache.len() + 1;
        let mut best: Option<(usize, Priority)> = None;
        for step in 0..slots {
            let slot = (self.cursor + step) % slots;
            if let Some(p) = self.priority_of(slot, local) {
                if earlier(Some(p), best.map(|(_, b)| b)) {
                    best = Some((slot, p));
                }
            }
        }
        self.cursor = (self.cursor + 1) % slots;
        best.map(|(slot, _)| slot)
    }

    /// Smallest key another pending source could still send
    fn bound(&self, winner: usize, local: Option<Priority>) -> Key {
        (0..=self.cache.len())
            .filter(|&slot| slot != winner)
            .filter_map(|slot| match self.priority_of(slot, local) {
                Some(Priority::Keyed(key)) => Some(key),
                _ => None,
            })
            .min()
            .unwrap_or(Key::MAX)
    }

    fn priority_of(&self, slot: usize, local: Option<Priority>) -> Option<Priority> {
        if slot == self.cache.len() {
            local
        } else {
            self.cache.get(slot).and_then(|entry| entry.priority())
        }
    }

    fn terminate<T: Transport>(
        &mut self,
        transport: &mut T,
        local: &mut LocalBuffer,
    ) -> Result<RoundOutcome> {
        let rank = self.topology.rank();
        if !self.topology.is_root() {
            transport.send_to_parent(Frame::empty(rank, self.seq).encode(None)?)?;
            self.seq += 1;
            let frame = Frame::decode(&transport.recv_from_parent()?)?;
            if frame.hdr.mtype != MsgType::Finished {
                return Err(MergeError::UnexpectedMessage {
                    rank,
                    got: frame.hdr.mtype.name(),
                    expected: "awaiting the finished broadcast",
                });
            }
            if !local.is_empty() || self.cache.has_pending() {
                return Err(MergeError::UnexpectedTermination {
                    rank,
                    reason: "finished signal arrived with data still pending".into(),
                });
            }
        }

        for index in 0..self.topology.fanout() {
            transport.send_to_child(index, Frame::finished(rank, 0).encode(None)?)?;
        }
        self.cache.invalidate_all();
        local.reset_segment();
        self.state = EngineState::Finished;
        debug!(rank, "segment finished");
        Ok(RoundOutcome::Finished)
    }
}
