//! Reply parsing.
//!
//! The parser is synchronous and works on whatever the connection has
//! buffered so far. A partial reply yields `Ok(None)` and leaves the
//! buffer untouched, so the caller reads more and tries again from the
//! start. Replies are small relative to socket reads, which keeps the
//! restart cheap.
//!
//! RESP2 servers encode nil as `$-1` or `*-1`; RESP3 servers send `_`.
//! All three become [`Frame::Null`]. RESP3 sets (`~`) and pushes (`>`)
//! are read as arrays, since callers only ever iterate them.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Aggregates nested deeper than this are rejected rather than recursed.
const MAX_DEPTH: usize = 64;

/// Upper bound on the declared element count of one aggregate.
const MAX_ELEMENTS: usize = 1 << 20;

/// Largest bulk payload accepted (512 MB, the Redis limit).
const MAX_BULK: usize = 512 << 20;

/// Declared counts are untrusted; preallocation never exceeds this.
const MAX_PREALLOC: usize = 1024;

/// Parses one reply from `buf`, slicing bulk payloads out of it without
/// copying. Large values (DUMP payloads, big hashes) should come through
/// here.
///
/// Returns the frame and the number of bytes it occupied, or `None`
/// when `buf` holds only part of a reply.
pub fn parse_frame_bytes(buf: &Bytes) -> Result<Option<(Frame, usize)>, ProtocolError> {
    Reader::new(buf, Some(buf)).complete()
}

/// Like [`parse_frame_bytes`], but copies bulk payloads out of a plain
/// slice.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    Reader::new(buf, None).complete()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Set when `buf` is backed by `Bytes` that bulk payloads can share.
    shared: Option<&'a Bytes>,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], shared: Option<&'a Bytes>) -> Self {
        Self { buf, pos: 0, shared }
    }

    fn complete(mut self) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match self.frame(0) {
            Ok(frame) => Ok(Some((frame, self.pos))),
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn frame(&mut self, depth: usize) -> Result<Frame, ProtocolError> {
        let kind = *self.buf.get(self.pos).ok_or(ProtocolError::Incomplete)?;
        self.pos += 1;
        match kind {
            b'+' => Ok(Frame::Simple(self.text("simple string")?)),
            b'-' => Ok(Frame::Error(self.text("error string")?)),
            b':' => Ok(Frame::Integer(self.integer()?)),
            b'_' => {
                self.line()?;
                Ok(Frame::Null)
            }
            b'$' => match self.length()? {
                None => Ok(Frame::Null),
                Some(len) if len > MAX_BULK => Err(ProtocolError::BulkStringTooLarge(len)),
                Some(len) => self.bulk(len).map(Frame::Bulk),
            },
            b'*' | b'~' | b'>' => match self.length()? {
                None => Ok(Frame::Null),
                Some(count) => {
                    self.enter(depth, count)?;
                    let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
                    for _ in 0..count {
                        items.push(self.frame(depth + 1)?);
                    }
                    Ok(Frame::Array(items))
                }
            },
            b'%' => {
                let count = self
                    .length()?
                    .ok_or(ProtocolError::InvalidFrameLength(-1))?;
                self.enter(depth, count)?;
                let mut pairs = Vec::with_capacity(count.min(MAX_PREALLOC));
                for _ in 0..count {
                    let field = self.frame(depth + 1)?;
                    let value = self.frame(depth + 1)?;
                    pairs.push((field, value));
                }
                Ok(Frame::Map(pairs))
            }
            other => Err(ProtocolError::InvalidPrefix(other)),
        }
    }

    fn enter(&self, depth: usize, count: usize) -> Result<(), ProtocolError> {
        if depth + 1 > MAX_DEPTH {
            return Err(ProtocolError::NestingTooDeep(MAX_DEPTH));
        }
        if count > MAX_ELEMENTS {
            return Err(ProtocolError::TooManyElements(count));
        }
        Ok(())
    }

    /// Everything up to the next CRLF, which is consumed but not returned.
    fn line(&mut self) -> Result<&'a [u8], ProtocolError> {
        let buf = self.buf;
        let start = self.pos;
        let mut from = start;
        while let Some(i) = memchr::memchr(b'\r', &buf[from..]) {
            let cr = from + i;
            match buf.get(cr + 1) {
                Some(b'\n') => {
                    self.pos = cr + 2;
                    return Ok(&buf[start..cr]);
                }
                Some(_) => from = cr + 1,
                None => break,
            }
        }
        Err(ProtocolError::Incomplete)
    }

    fn text(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let line = self.line()?;
        std::str::from_utf8(line)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }

    fn integer(&mut self) -> Result<i64, ProtocolError> {
        let line = self.line()?;
        if line.first() == Some(&b'+') {
            return Err(ProtocolError::InvalidInteger);
        }
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::InvalidInteger)
    }

    /// A declared length; `-1` is the RESP2 nil marker.
    fn length(&mut self) -> Result<Option<usize>, ProtocolError> {
        match self.integer()? {
            -1 => Ok(None),
            n if n < 0 => Err(ProtocolError::InvalidFrameLength(n)),
            n => Ok(Some(n as usize)),
        }
    }

    fn bulk(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        let start = self.pos;
        let end = start + len;
        if self.buf.len() < end + 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &self.buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::InvalidFrameLength(len as i64));
        }
        self.pos = end + 2;
        Ok(match self.shared {
            Some(bytes) => bytes.slice(start..end),
            None => Bytes::copy_from_slice(&self.buf[start..end]),
        })
    }
}
