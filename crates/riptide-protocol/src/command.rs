//! Command construction.
//!
//! A [`Cmd`] is a command name plus binary-safe arguments. It serializes
//! straight into a write buffer as a RESP array of bulk strings, which
//! is the only request shape Redis-compatible servers accept.

use bytes::{Bytes, BytesMut};

use crate::serialize::{put_bulk, put_header};
use crate::types::Frame;

/// Conversion into a single command argument.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for i64 {
    fn into_arg(self) -> Bytes {
        let mut buf = itoa::Buffer::new();
        Bytes::copy_from_slice(buf.format(self).as_bytes())
    }
}

impl IntoArg for u64 {
    fn into_arg(self) -> Bytes {
        let mut buf = itoa::Buffer::new();
        Bytes::copy_from_slice(buf.format(self).as_bytes())
    }
}

impl IntoArg for usize {
    fn into_arg(self) -> Bytes {
        (self as u64).into_arg()
    }
}

impl IntoArg for u32 {
    fn into_arg(self) -> Bytes {
        (self as u64).into_arg()
    }
}

impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        // sorted-set scores: servers accept "inf"/"-inf" spelled this way
        if self == f64::INFINITY {
            Bytes::from_static(b"+inf")
        } else if self == f64::NEG_INFINITY {
            Bytes::from_static(b"-inf")
        } else {
            Bytes::from(self.to_string())
        }
    }
}

/// A command ready to be written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Starts a command with the given name, e.g. `Cmd::new("HGETALL")`.
    pub fn new(name: &'static str) -> Self {
        let mut args = Vec::with_capacity(4);
        args.push(Bytes::from_static(name.as_bytes()));
        Self { args }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Appends every argument from an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// Appends an argument in place. Useful inside loops.
    pub fn push(&mut self, arg: impl IntoArg) {
        self.args.push(arg.into_arg());
    }

    /// The command name as given to [`Cmd::new`].
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.args[0]).unwrap_or("?")
    }

    /// All tokens, name included.
    pub fn tokens(&self) -> &[Bytes] {
        &self.args
    }

    /// Writes the command as a RESP array of bulk strings.
    pub fn serialize(&self, dst: &mut BytesMut) {
        put_header(dst, b'*', self.args.len());
        for arg in &self.args {
            put_bulk(dst, arg);
        }
    }

    /// Converts the command into an equivalent [`Frame`].
    pub fn into_frame(self) -> Frame {
        Frame::Array(self.args.into_iter().map(Frame::Bulk).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_frame;

    fn encode(cmd: &Cmd) -> Vec<u8> {
        let mut buf = BytesMut::new();
        cmd.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn ping() {
        assert_eq!(encode(&Cmd::new("PING")), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn set_with_binary_value() {
        let cmd = Cmd::new("SET").arg("k").arg(&b"\x00\xff"[..]);
        assert_eq!(encode(&cmd), b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\n\x00\xff\r\n");
    }

    #[test]
    fn numeric_args() {
        let cmd = Cmd::new("PEXPIREAT").arg("k").arg(1_700_000_000_000i64);
        assert_eq!(cmd.tokens()[2], Bytes::from_static(b"1700000000000"));

        let cmd = Cmd::new("ZADD").arg("z").arg(1.5f64).arg(f64::INFINITY);
        assert_eq!(cmd.tokens()[2], Bytes::from_static(b"1.5"));
        assert_eq!(cmd.tokens()[3], Bytes::from_static(b"+inf"));
    }

    #[test]
    fn encoding_matches_frame_serialization() {
        let cmd = Cmd::new("SADD").arg("s").args(["a", "b", "c"]);
        let mut via_frame = BytesMut::new();
        cmd.clone().into_frame().serialize(&mut via_frame);
        assert_eq!(encode(&cmd), via_frame.to_vec());

        let (parsed, consumed) = parse_frame(&via_frame).unwrap().unwrap();
        assert_eq!(consumed, via_frame.len());
        assert_eq!(parsed.into_array().map(|a| a.len()), Some(5));
    }

    #[test]
    fn name_reports_command() {
        let mut cmd = Cmd::new("RPUSH").arg("l");
        cmd.push("x");
        assert_eq!(cmd.name(), "RPUSH");
        assert_eq!(cmd.tokens().len(), 3);
    }
}
