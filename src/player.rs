//! Chronological multi-stream merge.
//!
//! The player owns every [`Stream`] of the trace and hands out events in
//! global corrected-clock order. Only streams with a decoded next event sit
//! in the heap; the stream selected last is kept out until its follow-up
//! event is decoded, so at most one decode happens per step.
//!
//! Ties on the corrected clock break on the stream index, which keeps replay
//! order deterministic for identical inputs.

use std::cmp::Ordering;

use thiserror::Error;

use crate::event::Mcv;
use crate::heap::Heap;
use crate::stream::{Step, Stream, StreamError, StreamIdent};

/// Window two unsynchronized hosts may legitimately differ by before the
/// preflight check refuses to merge them.
pub const DEFAULT_SKEW_WINDOW_NS: i64 = 3_600_000_000_000;

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Accept events whose merged clock goes backwards instead of failing.
    pub tolerate_unsorted: bool,
    /// Compare first clocks across streams before merging. Disabled when a
    /// clock offset table was applied, since offsets make the check moot.
    pub check_skew: bool,
    pub skew_window_ns: i64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        PlayerOptions {
            tolerate_unsorted: false,
            check_skew: true,
            skew_window_ns: DEFAULT_SKEW_WINDOW_NS,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("merged clock went backwards: {stream} at {clock} after global {last}")]
    OutOfOrder {
        stream: StreamIdent,
        clock: i64,
        last: i64,
    },
    #[error(
        "first clocks of {earliest} and {latest} span {span}ns, more than the {window}ns \
         synchronization window; supply a clock offset table"
    )]
    SkewExceeded {
        span: i64,
        window: i64,
        earliest: StreamIdent,
        latest: StreamIdent,
    },
}

/// Event under the player cursor, annotated with merge-level clocks.
#[derive(Debug, Clone, Copy)]
pub struct PlayerEv<'a> {
    pub mcv: Mcv,
    /// Stream-local clock as stored on disk.
    pub raw_clock: u64,
    /// Offset-corrected clock, comparable across streams.
    pub clock: i64,
    /// Corrected clock minus the first corrected clock seen by this player.
    pub delta: i64,
    pub payload: &'a [u8],
    /// Index of the originating stream.
    pub stream: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    clock: i64,
    stream: usize,
}

fn min_first(a: &HeapKey, b: &HeapKey) -> Ordering {
    (b.clock, b.stream).cmp(&(a.clock, a.stream))
}

/// Cumulative replay counters, cheap to copy into progress logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub events: u64,
    pub consumed_bytes: usize,
    pub total_bytes: usize,
    pub regressions: u64,
}

#[derive(Debug)]
pub struct Player {
    streams: Vec<Stream>,
    heap: Heap<HeapKey>,
    selected: Option<usize>,
    first_clock: Option<i64>,
    last_clock: Option<i64>,
    tolerate_unsorted: bool,
    events: u64,
    regressions: u64,
    total_bytes: usize,
}

impl Player {
    /// Takes ownership of the streams, primes each cursor and runs the skew
    /// preflight. Streams that are empty from the start simply never enter
    /// the heap.
    pub fn new(mut streams: Vec<Stream>, options: &PlayerOptions) -> Result<Self, PlayerError> {
        let total_bytes = streams.iter().map(Stream::body_len).sum();
        let mut heap = Heap::with_capacity(streams.len());
        let mut first: Option<(i64, usize)> = None;
        let mut last: Option<(i64, usize)> = None;
        for (i, stream) in streams.iter_mut().enumerate() {
            if stream.step()? == Step::Done {
                continue;
            }
            let clock = match stream.current() {
                Some(ev) => ev.clock,
                None => continue,
            };
            heap.insert(HeapKey { clock, stream: i }, &min_first);
            if first.is_none_or(|(c, _)| clock < c) {
                first = Some((clock, i));
            }
            if last.is_none_or(|(c, _)| clock > c) {
                last = Some((clock, i));
            }
        }
        if options.check_skew
            && let (Some((lo, lo_i)), Some((hi, hi_i))) = (first, last)
        {
            let span = hi - lo;
            if span > options.skew_window_ns {
                return Err(PlayerError::SkewExceeded {
                    span,
                    window: options.skew_window_ns,
                    earliest: streams[lo_i].ident().clone(),
                    latest: streams[hi_i].ident().clone(),
                });
            }
        }
        Ok(Player {
            streams,
            heap,
            selected: None,
            first_clock: None,
            last_clock: None,
            tolerate_unsorted: options.tolerate_unsorted,
            events: 0,
            regressions: 0,
            total_bytes,
        })
    }

    /// Advances to the next event in merged order. After [`Step::Done`] the
    /// player stays done.
    pub fn step(&mut self) -> Result<Step, PlayerError> {
        if let Some(i) = self.selected.take()
            && self.streams[i].step()? == Step::Advanced
        {
            let clock = match self.streams[i].current() {
                Some(ev) => ev.clock,
                None => return Ok(Step::Done),
            };
            self.heap.insert(HeapKey { clock, stream: i }, &min_first);
        }
        let Some(key) = self.heap.pop_max(&min_first) else {
            return Ok(Step::Done);
        };
        if let Some(last) = self.last_clock
            && key.clock < last
        {
            if !self.tolerate_unsorted {
                return Err(PlayerError::OutOfOrder {
                    stream: self.streams[key.stream].ident().clone(),
                    clock: key.clock,
                    last,
                });
            }
            self.regressions += 1;
        }
        if self.first_clock.is_none() {
            self.first_clock = Some(key.clock);
        }
        self.last_clock = Some(key.clock);
        self.selected = Some(key.stream);
        self.events += 1;
        Ok(Step::Advanced)
    }

    /// Event selected by the last successful [`Player::step`].
    pub fn current(&self) -> Option<PlayerEv<'_>> {
        let stream = self.selected?;
        let ev = self.streams[stream].current()?;
        let first = self.first_clock.unwrap_or(ev.clock);
        Some(PlayerEv {
            mcv: ev.mcv,
            raw_clock: ev.raw_clock,
            clock: ev.clock,
            delta: ev.clock - first,
            payload: ev.payload,
            stream,
        })
    }

    pub fn nstreams(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, i: usize) -> &Stream {
        &self.streams[i]
    }

    pub fn progress(&self) -> Progress {
        Progress {
            events: self.events,
            consumed_bytes: self.streams.iter().map(Stream::consumed_bytes).sum(),
            total_bytes: self.total_bytes,
            regressions: self.regressions,
        }
    }
}
