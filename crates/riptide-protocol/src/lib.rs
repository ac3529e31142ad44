//! riptide-protocol: RESP wire protocol for talking to Redis-compatible stores.
//!
//! Provides zero-copy reply parsing, direct-to-buffer serialization, and a
//! small command builder. Replies from RESP2 servers (null bulk strings and
//! null arrays) and RESP3 servers parse into the same [`Frame`] type.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use riptide_protocol::{parse_frame, Cmd, Frame};
//!
//! // encode a command
//! let mut buf = BytesMut::new();
//! Cmd::new("GET").arg("user:1").serialize(&mut buf);
//! assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$6\r\nuser:1\r\n");
//!
//! // parse a RESP2 nil reply
//! let (frame, consumed) = parse_frame(b"$-1\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Null);
//! assert_eq!(consumed, 5);
//! ```

pub mod command;
pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use command::{Cmd, IntoArg};
pub use error::ProtocolError;
pub use parse::{parse_frame, parse_frame_bytes};
pub use types::Frame;
