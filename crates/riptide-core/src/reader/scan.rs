//! Full-keyspace enumeration with SCAN.

use std::collections::VecDeque;

use bytes::Bytes;
use riptide_protocol::{Cmd, Frame};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ConnectionConfig, ReaderConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::types::DataType;

struct Cursor {
    conn: Option<Connection>,
    cursor: u64,
    buffered: VecDeque<Bytes>,
    done: bool,
}

/// Walks the keyspace with a SCAN cursor, one page at a time.
///
/// SCAN may return a key more than once across pages; consumers see
/// every key at least once for keys that exist for the whole scan.
pub struct ScanKeyReader {
    connection: ConnectionConfig,
    pattern: Option<String>,
    key_type: Option<DataType>,
    count: Option<usize>,
    state: Mutex<Cursor>,
}

impl ScanKeyReader {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            pattern: None,
            key_type: None,
            count: None,
            state: Mutex::new(Cursor {
                conn: None,
                cursor: 0,
                buffered: VecDeque::new(),
                done: false,
            }),
        }
    }

    pub fn from_reader(connection: ConnectionConfig, reader: &ReaderConfig) -> Self {
        let mut scan = Self::new(connection);
        scan.pattern = reader.key_pattern.clone();
        scan.key_type = reader.key_type;
        scan.count = reader.scan_count;
        scan
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn key_type(mut self, key_type: DataType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    fn scan_command(&self, cursor: u64) -> Cmd {
        let mut cmd = Cmd::new("SCAN").arg(cursor);
        if let Some(pattern) = &self.pattern {
            cmd.push("MATCH");
            cmd.push(pattern.as_str());
        }
        if let Some(count) = self.count {
            cmd.push("COUNT");
            cmd.push(count);
        }
        if let Some(key_type) = self.key_type {
            cmd.push("TYPE");
            cmd.push(key_type.as_str());
        }
        cmd
    }

    /// Returns the next key, or `None` once the cursor has wrapped.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().await;
        loop {
            if let Some(key) = state.buffered.pop_front() {
                return Ok(Some(key));
            }
            if state.done {
                return Ok(None);
            }

            if state.conn.is_none() {
                state.conn = Some(Connection::connect(&self.connection).await?);
            }
            let cmd = self.scan_command(state.cursor);
            let reply = match state.conn.as_mut() {
                Some(conn) => conn.send(&cmd).await,
                None => return Err(Error::Interrupted),
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    // the connection may be mid-reply; start over on a new one
                    state.conn = None;
                    return Err(e);
                }
            };
            let (next, keys) = parse_scan_reply(reply)?;
            debug!(cursor = state.cursor, next, keys = keys.len(), "scan page");
            state.cursor = next;
            state.buffered.extend(keys);
            if next == 0 {
                state.done = true;
                if let Some(conn) = state.conn.take() {
                    conn.shutdown().await;
                }
            }
        }
    }

    /// True once every page has been fetched and handed out.
    pub async fn is_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        state.done && state.buffered.is_empty()
    }

    /// Stops the scan. Later reads return `None`.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.done = true;
        state.buffered.clear();
        if let Some(conn) = state.conn.take() {
            conn.shutdown().await;
        }
    }
}

fn parse_scan_reply(reply: Frame) -> Result<(u64, Vec<Bytes>)> {
    let mut parts = match reply {
        Frame::Array(parts) => parts,
        other => return Err(Error::unexpected("SCAN", &other)),
    };
    if parts.len() != 2 {
        return Err(Error::UnexpectedReply {
            command: "SCAN".into(),
            reply: format!("{} elements", parts.len()),
        });
    }
    let keys_frame = parts.pop().unwrap_or(Frame::Null);
    let cursor_frame = parts.pop().unwrap_or(Frame::Null);
    let cursor = cursor_frame
        .as_integer()
        .and_then(|c| u64::try_from(c).ok())
        .ok_or_else(|| Error::unexpected("SCAN", &cursor_frame))?;
    let keys = keys_frame
        .into_array()
        .unwrap_or_default()
        .into_iter()
        .filter_map(Frame::into_bytes)
        .collect();
    Ok((cursor, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn scan_command_options() {
        let reader = ScanKeyReader::new(ConnectionConfig::default())
            .pattern("user:*")
            .count(500)
            .key_type(DataType::Hash);
        let cmd = reader.scan_command(17);
        let tokens: Vec<String> = cmd
            .tokens()
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect();
        assert_eq!(
            tokens,
            ["SCAN", "17", "MATCH", "user:*", "COUNT", "500", "TYPE", "hash"]
        );
    }

    #[test]
    fn parses_page() {
        let reply = Frame::Array(vec![bulk("42"), Frame::Array(vec![bulk("a"), bulk("b")])]);
        let (cursor, keys) = parse_scan_reply(reply).unwrap();
        assert_eq!(cursor, 42);
        assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn rejects_bad_page() {
        assert!(parse_scan_reply(Frame::Integer(0)).is_err());
        assert!(parse_scan_reply(Frame::Array(vec![bulk("x"), Frame::Array(vec![])])).is_err());
    }
}
