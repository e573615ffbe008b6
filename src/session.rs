use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem;
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::buffer::{Fit, Key, LocalBuffer, Payload};
use crate::collective;
use crate::config::SessionConfig;
use crate::engine::{EngineState, MergeEngine, RoundOutcome};
use crate::error::{MergeError, Result};
use crate::kind::{PayloadKind, Variant};
use crate::sink::RootSink;
use crate::topology::Topology;
use crate::transport::Transport;

/// Per-process counters for one segment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Merge rounds run, including those forced by appends
    pub rounds: u64,
    /// Chunks written to the stream (root only)
    pub chunks_written: u64,
    /// Chunks sent to the parent
    pub chunks_forwarded: u64,
    /// Bytes written to the stream (root only)
    pub bytes_written: u64,
    /// Tagged appends whose key had to be raised
    pub coerced_keys: u64,
}

/// One process's handle on a merged output stream.
///
/// `sync` and `close` are collective: every process must call them the same
/// number of times, in the same order.
pub struct Session<T: Transport, W: Write> {
    topology: Topology,
    transport: T,
    sink: Option<RootSink<W>>,
    buffer: LocalBuffer,
    /// `None` in a single-member group, where items are written directly
    engine: Option<MergeEngine>,
    stats: SegmentStats,
    poisoned: bool,
}

impl<T: Transport> Session<T, BufWriter<File>> {
    /// Open `path` at the root and agree on the outcome group-wide
    pub fn open(
        path: impl AsRef<Path>,
        topology: Topology,
        transport: T,
        config: SessionConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        Self::open_with(topology, transport, config, move || {
            File::create(&path).map(BufWriter::new)
        })
    }
}

impl<T: Transport, W: Write> Session<T, W> {
    /// Open with a caller-supplied writer factory, invoked only at the root.
    ///
    /// Collective. If the factory fails, or any process has an invalid
    /// configuration, every process gets [`MergeError::AllocFailure`].
    pub fn open_with<F>(
        topology: Topology,
        mut transport: T,
        config: SessionConfig,
        make_sink: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> std::io::Result<W>,
    {
        let rank = topology.rank();
        let config_ok = match config.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(rank, error = %e, "rejecting session configuration");
                false
            }
        };

        let sink = if topology.is_root() && config_ok {
            match make_sink() {
                Ok(out) => Some(RootSink::new(out)),
                Err(e) => {
                    warn!(rank, error = %e, "failed to open output stream");
                    None
                }
            }
        } else {
            None
        };
        let local_ok = config_ok && (sink.is_some() || !topology.is_root());

        let agreed = if topology.is_solo() {
            local_ok
        } else {
            collective::all_agree(&topology, &mut transport, local_ok)?
        };
        if !agreed {
            return Err(MergeError::AllocFailure);
        }

        let engine = (!topology.is_solo()).then(|| MergeEngine::new(topology.clone(), &config));
        debug!(
            rank,
            size = topology.size(),
            fanout = topology.fanout(),
            variant = ?config.variant,
            "session opened"
        );
        Ok(Self {
            topology,
            transport,
            sink,
            buffer: LocalBuffer::new(&config),
            engine,
            stats: SegmentStats::default(),
            poisoned: false,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn variant(&self) -> Variant {
        self.buffer.variant()
    }

    pub fn is_root(&self) -> bool {
        self.topology.is_root()
    }

    /// Counters for the segment in progress
    pub fn stats(&self) -> &SegmentStats {
        &self.stats
    }

    /// Merge engine state; `None` in direct-write mode
    pub fn engine_state(&self) -> Option<EngineState> {
        self.engine.as_ref().map(MergeEngine::state)
    }

    /// XXH3-64 of everything written so far (root only)
    pub fn stream_digest(&self) -> Option<u64> {
        self.sink.as_ref().map(RootSink::digest)
    }

    /// Total bytes written so far (root only)
    pub fn bytes_written(&self) -> Option<u64> {
        self.sink.as_ref().map(RootSink::bytes_written)
    }

    pub fn pending(&self) -> usize {
        self.buffer.used_count()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Append an unordered item
    pub fn append(&mut self, item: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        if self.engine.is_none() {
            let payload = || Payload::Text(item.to_vec());
            return self.write_direct(Variant::Text, item.is_empty(), None, payload).map(|_| ());
        }
        self.buffered(
            |buf| buf.check_text(item.len()),
            item.is_empty(),
            None,
            |buf, key| buf.push_text(item, key),
        )
        .map(|_| ())
    }

    /// Append an item that must appear in ascending key order.
    ///
    /// Returns the key the item was recorded under, which differs from `key`
    /// when it did not rise above the last key of this segment.
    pub fn append_tagged(&mut self, item: &[u8], key: Key) -> Result<Key> {
        self.ensure_usable()?;
        let effective = if self.engine.is_none() {
            let payload = || Payload::Text(item.to_vec());
            self.write_direct(Variant::Text, item.is_empty(), Some(key), payload)?
        } else {
            self.buffered(
                |buf| buf.check_text(item.len()),
                item.is_empty(),
                Some(key),
                |buf, key| buf.push_text(item, key),
            )?
        };
        Ok(effective.unwrap_or(key))
    }

    pub fn append_ints(&mut self, values: &[i64], key: Option<Key>) -> Result<Option<Key>> {
        let direct = || Payload::Binary {
            ints: values.to_vec(),
            floats: Vec::new(),
            bytes: Vec::new(),
        };
        self.append_binary(PayloadKind::Ints, values.len(), key, direct, |buf, key| {
            buf.push_ints(values, key)
        })
    }

    pub fn append_floats(&mut self, values: &[f64], key: Option<Key>) -> Result<Option<Key>> {
        let direct = || Payload::Binary {
            ints: Vec::new(),
            floats: values.to_vec(),
            bytes: Vec::new(),
        };
        self.append_binary(PayloadKind::Floats, values.len(), key, direct, |buf, key| {
            buf.push_floats(values, key)
        })
    }

    pub fn append_bytes(&mut self, values: &[u8], key: Option<Key>) -> Result<Option<Key>> {
        let direct = || Payload::Binary {
            ints: Vec::new(),
            floats: Vec::new(),
            bytes: values.to_vec(),
        };
        self.append_binary(PayloadKind::Bytes, values.len(), key, direct, |buf, key| {
            buf.push_bytes(values, key)
        })
    }

    /// Drain the current segment. Collective.
    pub fn sync(&mut self) -> Result<SegmentStats> {
        self.ensure_usable()?;
        if self.engine.is_some() {
            while !self.step()? {}
        } else {
            self.buffer.reset_segment();
        }
        if let Some(sink) = self.sink.as_mut() {
            let flushed = sink.flush();
            self.guard(flushed.map_err(MergeError::from))?;
        }
        let stats = mem::take(&mut self.stats);
        if let Some(sink) = &self.sink {
            info!(
                rank = self.topology.rank(),
                rounds = stats.rounds,
                chunks = stats.chunks_written,
                bytes = stats.bytes_written,
                total_bytes = sink.bytes_written(),
                digest = sink.digest(),
                "segment written"
            );
        }
        Ok(stats)
    }

    /// Drain the final segment and release the stream. Collective.
    ///
    /// The root gets its writer back, flushed; every other process gets `None`.
    pub fn close(mut self) -> Result<Option<W>> {
        self.sync()?;
        let rank = self.topology.rank();
        match self.sink.take() {
            Some(sink) => {
                let out = sink.finish()?;
                debug!(rank, "session closed, stream released");
                Ok(Some(out))
            }
            None => {
                debug!(rank, "session closed");
                Ok(None)
            }
        }
    }

    fn append_binary<P, D>(
        &mut self,
        kind: PayloadKind,
        len: usize,
        key: Option<Key>,
        direct: D,
        push: P,
    ) -> Result<Option<Key>>
    where
        D: FnOnce() -> Payload,
        P: FnOnce(&mut LocalBuffer, Option<Key>),
    {
        self.ensure_usable()?;
        if self.engine.is_none() {
            return self.write_direct(Variant::Binary, len == 0, key, direct);
        }
        self.buffered(|buf| buf.check_binary(kind, len), len == 0, key, push)
    }

    /// Shared append path: size check, key coercion, forced flushes, push
    fn buffered<C, P>(
        &mut self,
        check: C,
        empty_item: bool,
        key: Option<Key>,
        push: P,
    ) -> Result<Option<Key>>
    where
        C: Fn(&LocalBuffer) -> Result<Fit>,
        P: FnOnce(&mut LocalBuffer, Option<Key>),
    {
        // Size and variant errors leave the buffer untouched
        let fit = check(&self.buffer)?;

        let effective = key.map(|key| self.coerce(key));
        if empty_item {
            return Ok(effective);
        }

        if effective.is_some_and(|k| self.buffer.breaks_run(k)) {
            self.drain_local()?;
        }
        if fit == Fit::Flush && check(&self.buffer)? == Fit::Flush {
            self.drain_local()?;
        }
        push(&mut self.buffer, effective);
        Ok(effective)
    }

    /// Run rounds until the local buffer has left this process
    fn drain_local(&mut self) -> Result<()> {
        while !self.buffer.is_empty() {
            self.step()?;
        }
        Ok(())
    }

    /// One merge round; true when the segment finished
    fn step(&mut self) -> Result<bool> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(true);
        };
        let outcome = engine.round(&mut self.transport, &mut self.buffer);
        let outcome = self.guard(outcome)?;
        self.stats.rounds += 1;

        match outcome {
            RoundOutcome::Emit { chunk, .. } => {
                let written = match self.sink.as_mut() {
                    Some(sink) => sink.write(&chunk.payload).map_err(MergeError::from),
                    None => Err(MergeError::UnexpectedTermination {
                        rank: self.topology.rank(),
                        reason: "root has no output stream".into(),
                    }),
                };
                let written = self.guard(written)?;
                self.stats.chunks_written += 1;
                self.stats.bytes_written += written as u64;
                Ok(false)
            }
            RoundOutcome::Forwarded { .. } => {
                self.stats.chunks_forwarded += 1;
                Ok(false)
            }
            RoundOutcome::Finished => Ok(true),
        }
    }

    /// Key an item is recorded under; keys must rise strictly within a segment
    fn coerce(&mut self, key: Key) -> Key {
        let (effective, coerced) = self.buffer.effective_key(key);
        if coerced {
            warn!(
                rank = self.topology.rank(),
                requested = key,
                effective,
                "out-of-order key coerced"
            );
            self.stats.coerced_keys += 1;
        }
        effective
    }

    /// Single-member group: write through, keeping only the key history
    fn write_direct<D>(
        &mut self,
        variant: Variant,
        empty_item: bool,
        key: Option<Key>,
        payload: D,
    ) -> Result<Option<Key>>
    where
        D: FnOnce() -> Payload,
    {
        if self.buffer.variant() != variant {
            return Err(MergeError::VariantMismatch { expected: variant });
        }
        let effective = key.map(|key| self.coerce(key));
        if empty_item {
            return Ok(effective);
        }
        let written = match self.sink.as_mut() {
            Some(sink) => sink.write(&payload()).map_err(MergeError::from),
            None => Ok(0),
        };
        let written = self.guard(written)?;
        if let Some(key) = effective {
            self.buffer.mark_written(key);
        }
        self.stats.chunks_written += 1;
        self.stats.bytes_written += written as u64;
        Ok(effective)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(MergeError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Poison the session on fatal errors
    fn guard<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(rank = self.topology.rank(), error = %e, "session poisoned");
                self.poisoned = true;
            }
        }
        result
    }
}
