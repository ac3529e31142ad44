//! Frame encoding.
//!
//! Clients only ever send arrays of bulk strings (see [`Cmd`]); the full
//! encoder exists for the in-process test server and for payloads that
//! carry a frame inside a string. Nil is written in its RESP2 form so
//! any client can read it back.
//!
//! [`Cmd`]: crate::Cmd

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

/// Writes `<prefix><n>\r\n`, the header of a bulk string or aggregate.
pub(crate) fn put_header(dst: &mut BytesMut, prefix: u8, n: usize) {
    let mut digits = itoa::Buffer::new();
    dst.put_u8(prefix);
    dst.put_slice(digits.format(n).as_bytes());
    dst.put_slice(b"\r\n");
}

pub(crate) fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_header(dst, b'$', data.len());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

fn put_line(dst: &mut BytesMut, prefix: u8, line: &[u8]) {
    dst.put_u8(prefix);
    dst.put_slice(line);
    dst.put_slice(b"\r\n");
}

impl Frame {
    /// Appends the wire encoding of this frame to `dst`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => put_line(dst, b'+', s.as_bytes()),
            Frame::Error(msg) => put_line(dst, b'-', msg.as_bytes()),
            Frame::Integer(n) => {
                let mut digits = itoa::Buffer::new();
                put_line(dst, b':', digits.format(*n).as_bytes());
            }
            Frame::Bulk(data) => put_bulk(dst, data),
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                put_header(dst, b'*', items.len());
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Map(pairs) => {
                put_header(dst, b'%', pairs.len());
                for (field, value) in pairs {
                    field.serialize(dst);
                    value.serialize(dst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::parse::parse_frame;

    fn encode(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn scalar_replies() {
        assert_eq!(encode(&Frame::Simple("QUEUED".into())), b"+QUEUED\r\n");
        assert_eq!(encode(&Frame::Error("ERR no such key".into())), b"-ERR no such key\r\n");
        assert_eq!(encode(&Frame::Integer(-2)), b":-2\r\n");
        assert_eq!(encode(&Frame::Bulk(Bytes::new())), b"$0\r\n\r\n");
    }

    #[test]
    fn nil_uses_the_resp2_form() {
        assert_eq!(encode(&Frame::Null), b"$-1\r\n");
    }

    #[test]
    fn nested_reply_reads_back() {
        // shape of an XREADGROUP reply
        let entry = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"1-0")),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"field")),
                Frame::Bulk(Bytes::from_static(b"\x00\xff")),
            ]),
        ]);
        let reply = Frame::Array(vec![Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"events")),
            Frame::Array(vec![entry, Frame::Null]),
        ])]);
        let wire = encode(&reply);
        assert_eq!(parse_frame(&wire).unwrap(), Some((reply, wire.len())));
    }

    #[test]
    fn map_encoding() {
        let frame = Frame::Map(vec![(Frame::Simple("role".into()), Frame::Integer(1))]);
        assert_eq!(encode(&frame), b"%1\r\n+role\r\n:1\r\n");
    }
}
