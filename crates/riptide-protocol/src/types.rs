//! The reply value type.
//!
//! Payloads are held as `Bytes`, so values read from one store can be
//! handed to the writer for another without copying.

use bytes::Bytes;

/// One decoded reply, or one element of an aggregate reply.
///
/// RESP3 sets and pushes have no variant of their own; the parser reads
/// them as [`Frame::Array`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status reply such as `OK` or `QUEUED`.
    Simple(String),

    /// Error reply, prefix included (`WRONGTYPE ...`).
    Error(String),

    Integer(i64),

    /// Binary-safe string.
    Bulk(Bytes),

    Array(Vec<Frame>),

    /// Nil, whichever encoding the server used.
    Null,

    /// RESP3 map, kept in wire order.
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns the payload of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bulk(b) => Some(b),
            Frame::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Consumes the frame and returns its string payload as `Bytes`.
    ///
    /// Bulk strings are returned without copying.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(b) => Some(b),
            Frame::Simple(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    /// Returns the integer payload. Bulk strings holding a decimal
    /// number are accepted too, since some replies (SCAN cursors)
    /// encode integers that way.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            Frame::Simple(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Consumes the frame and returns its elements. Maps are flattened
    /// into alternating key/value elements, and null becomes empty.
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(items) => Some(items),
            Frame::Map(pairs) => Some(
                pairs
                    .into_iter()
                    .flat_map(|(field, value)| [field, value])
                    .collect(),
            ),
            Frame::Null => Some(Vec::new()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_and_null_predicates() {
        assert!(Frame::Null.is_null());
        assert!(!Frame::Bulk(Bytes::new()).is_null());
        assert!(Frame::Error("ERR x".into()).is_error());
        assert!(!Frame::Simple("OK".into()).is_error());
    }

    #[test]
    fn integer_from_bulk() {
        assert_eq!(Frame::Bulk(Bytes::from_static(b"17")).as_integer(), Some(17));
        assert_eq!(Frame::Bulk(Bytes::from_static(b"x")).as_integer(), None);
        assert_eq!(Frame::Null.as_integer(), None);
    }

    #[test]
    fn map_flattens_into_array() {
        let frame = Frame::Map(vec![(Frame::Integer(1), Frame::Integer(2))]);
        assert_eq!(
            frame.into_array(),
            Some(vec![Frame::Integer(1), Frame::Integer(2)])
        );
        assert_eq!(Frame::Null.into_array(), Some(vec![]));
        assert_eq!(Frame::Integer(3).into_array(), None);
    }

    #[test]
    fn into_bytes_is_zero_copy_for_bulk() {
        let data = Bytes::from_static(b"hello");
        let frame = Frame::Bulk(data.clone());
        let out = frame.into_bytes().unwrap();
        assert_eq!(out.as_ptr(), data.as_ptr());
    }
}
