//! Single-stream event cursor.
//!
//! A [`Stream`] walks one thread's event buffer in file order, decoding one
//! event at a time and correcting its clock by the per-host offset. The
//! stream enforces that corrected clocks never go backwards unless it was
//! explicitly marked as tolerating unsorted input.

use std::fmt;

use thiserror::Error;

use crate::event::{self, EventError, Mcv, RawEv};

/// Where a stream came from, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdent {
    pub host: String,
    pub tid: u32,
}

impl StreamIdent {
    pub fn new(host: impl Into<String>, tid: u32) -> Self {
        StreamIdent {
            host: host.into(),
            tid,
        }
    }
}

impl fmt::Display for StreamIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/thread.{}", self.host, self.tid)
    }
}

/// Outcome of advancing a cursor one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advanced,
    Done,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream {stream} is corrupt")]
    Decode {
        stream: StreamIdent,
        #[source]
        source: EventError,
    },
    #[error(
        "stream {stream}: clock went backwards at offset {offset}: {prev} -> {next} on {mcv}"
    )]
    ClockRegression {
        stream: StreamIdent,
        offset: usize,
        prev: i64,
        next: i64,
        mcv: Mcv,
    },
    #[error("stream {stream}: clock offset set twice")]
    OffsetAlreadySet { stream: StreamIdent },
    #[error("stream {stream}: clock offset set after replay started")]
    OffsetAfterStart { stream: StreamIdent },
}

/// Borrowed view of the event under the cursor.
#[derive(Debug, Clone, Copy)]
pub struct StreamEv<'a> {
    /// Offset-corrected clock.
    pub clock: i64,
    /// Stream-local clock as stored on disk.
    pub raw_clock: u64,
    pub mcv: Mcv,
    pub payload: &'a [u8],
}

#[derive(Debug)]
pub struct Stream {
    ident: StreamIdent,
    buf: Vec<u8>,
    body_start: usize,
    cur: Option<RawEv>,
    last_clock: Option<i64>,
    clock_offset: i64,
    offset_set: bool,
    started: bool,
    unsorted: bool,
}

impl Stream {
    /// Wraps a whole stream file image whose events begin at `body_start`.
    pub fn from_file_buf(ident: StreamIdent, buf: Vec<u8>, body_start: usize) -> Self {
        debug_assert!(body_start <= buf.len());
        Stream {
            ident,
            buf,
            body_start,
            cur: None,
            last_clock: None,
            clock_offset: 0,
            offset_set: false,
            started: false,
            unsorted: false,
        }
    }

    /// Wraps a bare event region with no file header, used by in-memory
    /// callers.
    pub fn from_events(ident: StreamIdent, events: Vec<u8>) -> Self {
        Self::from_file_buf(ident, events, 0)
    }

    pub fn ident(&self) -> &StreamIdent {
        &self.ident
    }

    /// Tolerate clocks that go backwards within this stream.
    pub fn set_unsorted(&mut self, unsorted: bool) {
        self.unsorted = unsorted;
    }

    /// Applies the per-host clock correction. May be called at most once and
    /// only before the first [`Stream::step`].
    pub fn set_clock_offset(&mut self, offset_ns: i64) -> Result<(), StreamError> {
        if self.started {
            return Err(StreamError::OffsetAfterStart {
                stream: self.ident.clone(),
            });
        }
        if self.offset_set {
            return Err(StreamError::OffsetAlreadySet {
                stream: self.ident.clone(),
            });
        }
        self.clock_offset = offset_ns;
        self.offset_set = true;
        Ok(())
    }

    pub fn clock_offset(&self) -> i64 {
        self.clock_offset
    }

    /// True while an event sits under the cursor.
    pub fn is_active(&self) -> bool {
        self.cur.is_some()
    }

    pub fn current(&self) -> Option<StreamEv<'_>> {
        let cur = self.cur.as_ref()?;
        Some(StreamEv {
            clock: self.correct(cur.clock),
            raw_clock: cur.clock,
            mcv: cur.mcv,
            payload: &self.buf[cur.payload.clone()],
        })
    }

    /// Corrected clock of the last decoded event.
    pub fn last_clock(&self) -> Option<i64> {
        self.last_clock
    }

    /// Bytes of the event region consumed so far.
    pub fn consumed_bytes(&self) -> usize {
        match &self.cur {
            Some(ev) => ev.next - self.body_start,
            None if self.started => self.body_len(),
            None => 0,
        }
    }

    pub fn body_len(&self) -> usize {
        self.buf.len() - self.body_start
    }

    /// Decodes the next event and makes it current. Returns [`Step::Done`]
    /// once the buffer is exhausted; repeated calls after that keep
    /// returning done.
    pub fn step(&mut self) -> Result<Step, StreamError> {
        let at = match self.cur.take() {
            Some(ev) => ev.next,
            None if self.started => return Ok(Step::Done),
            None => self.body_start,
        };
        self.started = true;
        if at == self.buf.len() {
            return Ok(Step::Done);
        }
        let raw = event::decode(&self.buf, at).map_err(|source| StreamError::Decode {
            stream: self.ident.clone(),
            source,
        })?;
        let clock = self.correct(raw.clock);
        if let Some(prev) = self.last_clock
            && clock < prev
            && !self.unsorted
        {
            return Err(StreamError::ClockRegression {
                stream: self.ident.clone(),
                offset: at,
                prev,
                next: clock,
                mcv: raw.mcv,
            });
        }
        self.last_clock = Some(clock);
        self.cur = Some(raw);
        Ok(Step::Advanced)
    }

    fn correct(&self, raw: u64) -> i64 {
        raw as i64 + self.clock_offset
    }
}
