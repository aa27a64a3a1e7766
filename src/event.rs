//! Binary event encoding.
//!
//! Every event starts with a fixed 12-byte header:
//!
//! ```text
//! offset  size  field
//! 0       8     stream-local clock, u64 little-endian nanoseconds
//! 8       3     MCV identifier (model, category, value bytes)
//! 11      1     meta: bit 7 = jumbo flag, bits 0..=4 = inline payload size
//! ```
//!
//! Non-jumbo events carry at most [`MAX_INLINE_PAYLOAD`] bytes directly after
//! the header. Jumbo events instead follow the header with a u32
//! little-endian payload length and then the payload, which lets variable
//! content such as type labels exceed the inline limit.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use thiserror::Error;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 12;
/// Largest payload that fits in the header's inline size field.
pub const MAX_INLINE_PAYLOAD: usize = 16;
/// Jumbo payloads are length-prefixed with this many bytes.
pub const JUMBO_PREFIX_LEN: usize = 4;
/// Cap on a single jumbo payload. Anything larger is a corrupt stream.
pub const MAX_JUMBO_PAYLOAD: usize = 16 << 20;

const META_JUMBO: u8 = 0x80;
const META_SIZE_MASK: u8 = 0x1f;
const META_RESERVED: u8 = 0x60;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("truncated event header at offset {offset}: need {need} bytes, have {have}")]
    TruncatedHeader {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("truncated payload at offset {offset}: need {need} bytes, have {have}")]
    TruncatedPayload {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("non-printable mcv bytes {bytes:?} at offset {offset}")]
    BadMcv { offset: usize, bytes: [u8; 3] },
    #[error("invalid meta byte {meta:#04x} at offset {offset}")]
    BadMeta { offset: usize, meta: u8 },
    #[error("jumbo payload of {len} bytes at offset {offset} exceeds cap of {MAX_JUMBO_PAYLOAD}")]
    JumboOversize { offset: usize, len: usize },
    #[error("payload of {len} bytes does not fit the encoding")]
    PayloadOversize { len: usize },
}

/// Model/category/value identifier, three printable ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mcv([u8; 3]);

impl Mcv {
    pub const fn new(bytes: [u8; 3]) -> Self {
        Mcv(bytes)
    }

    pub const fn model(self) -> u8 {
        self.0[0]
    }

    pub const fn category(self) -> u8 {
        self.0[1]
    }

    pub const fn value(self) -> u8 {
        self.0[2]
    }

    pub const fn as_bytes(self) -> [u8; 3] {
        self.0
    }

    fn printable(bytes: [u8; 3]) -> bool {
        bytes.iter().all(|b| (0x21..=0x7e).contains(b))
    }
}

impl FromStr for Mcv {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 3] = s
            .as_bytes()
            .try_into()
            .map_err(|_| EventError::BadMcv {
                offset: 0,
                bytes: [0; 3],
            })?;
        if !Self::printable(bytes) {
            return Err(EventError::BadMcv { offset: 0, bytes });
        }
        Ok(Mcv(bytes))
    }
}

impl fmt::Display for Mcv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Mcv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mcv({self})")
    }
}

/// One decoded event, with payload kept as a range into the stream buffer so
/// the caller can slice without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEv {
    pub clock: u64,
    pub mcv: Mcv,
    pub payload: Range<usize>,
    /// Offset of the byte right after this event.
    pub next: usize,
}

/// Decodes the event starting at `at`. The returned ranges are validated to
/// lie inside `buf`.
pub fn decode(buf: &[u8], at: usize) -> Result<RawEv, EventError> {
    let have = buf.len().saturating_sub(at);
    if have < HEADER_LEN {
        return Err(EventError::TruncatedHeader {
            offset: at,
            need: HEADER_LEN,
            have,
        });
    }
    let mut clock_bytes = [0u8; 8];
    clock_bytes.copy_from_slice(&buf[at..at + 8]);
    let clock = u64::from_le_bytes(clock_bytes);
    let mcv_bytes = [buf[at + 8], buf[at + 9], buf[at + 10]];
    if !Mcv::printable(mcv_bytes) {
        return Err(EventError::BadMcv {
            offset: at + 8,
            bytes: mcv_bytes,
        });
    }
    let meta = buf[at + 11];
    if meta & META_RESERVED != 0 {
        return Err(EventError::BadMeta { offset: at + 11, meta });
    }

    let (payload_at, len) = if meta & META_JUMBO != 0 {
        if meta & META_SIZE_MASK != 0 {
            return Err(EventError::BadMeta { offset: at + 11, meta });
        }
        let prefix_at = at + HEADER_LEN;
        if buf.len() - prefix_at < JUMBO_PREFIX_LEN {
            return Err(EventError::TruncatedPayload {
                offset: prefix_at,
                need: JUMBO_PREFIX_LEN,
                have: buf.len() - prefix_at,
            });
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[prefix_at..prefix_at + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_JUMBO_PAYLOAD {
            return Err(EventError::JumboOversize {
                offset: prefix_at,
                len,
            });
        }
        (prefix_at + JUMBO_PREFIX_LEN, len)
    } else {
        let size = (meta & META_SIZE_MASK) as usize;
        if size > MAX_INLINE_PAYLOAD {
            return Err(EventError::BadMeta { offset: at + 11, meta });
        }
        (at + HEADER_LEN, size)
    };

    if buf.len() - payload_at < len {
        return Err(EventError::TruncatedPayload {
            offset: payload_at,
            need: len,
            have: buf.len() - payload_at,
        });
    }
    Ok(RawEv {
        clock,
        mcv: Mcv(mcv_bytes),
        payload: payload_at..payload_at + len,
        next: payload_at + len,
    })
}

/// Appends one encoded event to `out`. Jumbo framing is chosen automatically
/// when the payload does not fit inline.
pub fn encode_into(out: &mut Vec<u8>, clock: u64, mcv: Mcv, payload: &[u8]) -> Result<(), EventError> {
    out.extend_from_slice(&clock.to_le_bytes());
    out.extend_from_slice(&mcv.as_bytes());
    if payload.len() <= MAX_INLINE_PAYLOAD {
        out.push(payload.len() as u8);
    } else {
        if payload.len() > MAX_JUMBO_PAYLOAD {
            return Err(EventError::PayloadOversize { len: payload.len() });
        }
        out.push(META_JUMBO);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(payload);
    Ok(())
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload too short for {what}: need {need} bytes, have {have}")]
    Short {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("payload tail is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("{extra} unconsumed payload bytes")]
    Trailing { extra: usize },
}

/// Sequential little-endian reader over an event payload.
pub struct PayloadCursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        PayloadCursor { bytes, at: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }

    fn take(&mut self, what: &'static str, n: usize) -> Result<&'a [u8], PayloadError> {
        if self.remaining() < n {
            return Err(PayloadError::Short {
                what,
                need: n,
                have: self.remaining(),
            });
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, PayloadError> {
        Ok(self.take(what, 1)?[0])
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, PayloadError> {
        let b = self.take(what, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(b);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn i32(&mut self, what: &'static str) -> Result<i32, PayloadError> {
        Ok(self.u32(what)? as i32)
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, PayloadError> {
        let b = self.take(what, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn i64(&mut self, what: &'static str) -> Result<i64, PayloadError> {
        Ok(self.u64(what)? as i64)
    }

    /// Remainder of the payload as UTF-8 text, consuming it.
    pub fn str_rest(&mut self) -> Result<&'a str, PayloadError> {
        let rest = &self.bytes[self.at..];
        self.at = self.bytes.len();
        Ok(std::str::from_utf8(rest)?)
    }

    /// Fails if any bytes are left unread. Models call this so that payload
    /// layout drift shows up as an error instead of silent truncation.
    pub fn expect_end(&self) -> Result<(), PayloadError> {
        if self.remaining() != 0 {
            return Err(PayloadError::Trailing {
                extra: self.remaining(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(clock: u64, mcv: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(&mut out, clock, mcv.parse().unwrap(), payload).unwrap();
        out
    }

    #[test]
    fn inline_roundtrip() {
        let buf = ev(1234, "SHx", &[7, 0, 0, 0]);
        let raw = decode(&buf, 0).unwrap();
        assert_eq!(raw.clock, 1234);
        assert_eq!(raw.mcv.to_string(), "SHx");
        assert_eq!(&buf[raw.payload.clone()], &[7, 0, 0, 0]);
        assert_eq!(raw.next, buf.len());
    }

    #[test]
    fn empty_payload() {
        let buf = ev(0, "SHe", &[]);
        assert_eq!(buf.len(), HEADER_LEN);
        let raw = decode(&buf, 0).unwrap();
        assert!(raw.payload.is_empty());
    }

    #[test]
    fn jumbo_roundtrip() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let buf = ev(99, "TYc", &payload);
        let raw = decode(&buf, 0).unwrap();
        assert_eq!(raw.clock, 99);
        assert_eq!(&buf[raw.payload.clone()], &payload[..]);
        assert_eq!(raw.next, HEADER_LEN + JUMBO_PREFIX_LEN + payload.len());
    }

    #[test]
    fn boundary_payload_stays_inline() {
        let buf = ev(5, "TTc", &[0xab; MAX_INLINE_PAYLOAD]);
        assert_eq!(buf.len(), HEADER_LEN + MAX_INLINE_PAYLOAD);
        let buf = ev(5, "TTc", &[0xab; MAX_INLINE_PAYLOAD + 1]);
        assert_eq!(
            buf.len(),
            HEADER_LEN + JUMBO_PREFIX_LEN + MAX_INLINE_PAYLOAD + 1
        );
    }

    #[test]
    fn truncated_header_reports_offsets() {
        let buf = ev(1, "SHc", &[1, 2, 3, 4]);
        let err = decode(&buf[..HEADER_LEN - 3], 0).unwrap_err();
        match err {
            EventError::TruncatedHeader { offset, need, have } => {
                assert_eq!((offset, need, have), (0, HEADER_LEN, HEADER_LEN - 3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let buf = ev(1, "SHc", &[1, 2, 3, 4]);
        let err = decode(&buf[..buf.len() - 1], 0).unwrap_err();
        assert!(matches!(err, EventError::TruncatedPayload { .. }));
    }

    #[test]
    fn non_printable_mcv_is_rejected() {
        let mut buf = ev(1, "SHc", &[]);
        buf[9] = 0x07;
        let err = decode(&buf, 0).unwrap_err();
        assert!(matches!(err, EventError::BadMcv { offset: 8, .. }));
    }

    #[test]
    fn reserved_meta_bits_are_rejected() {
        let mut buf = ev(1, "SHc", &[]);
        buf[11] |= 0x40;
        let err = decode(&buf, 0).unwrap_err();
        assert!(matches!(err, EventError::BadMeta { offset: 11, .. }));
    }

    #[test]
    fn cursor_reads_fields_in_order() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&(-3i64).to_le_bytes());
        payload.extend_from_slice(b"label");
        let mut cur = PayloadCursor::new(&payload);
        assert_eq!(cur.u32("id").unwrap(), 7);
        assert_eq!(cur.i64("off").unwrap(), -3);
        assert_eq!(cur.str_rest().unwrap(), "label");
        cur.expect_end().unwrap();
    }

    #[test]
    fn cursor_short_read_names_field() {
        let mut cur = PayloadCursor::new(&[1, 2]);
        let err = cur.u32("task id").unwrap_err();
        assert!(err.to_string().contains("task id"));
    }

    #[test]
    fn cursor_flags_trailing_bytes() {
        let mut cur = PayloadCursor::new(&[1, 2, 3, 4, 5]);
        cur.u32("x").unwrap();
        assert!(matches!(
            cur.expect_end(),
            Err(PayloadError::Trailing { extra: 1 })
        ));
    }
}
