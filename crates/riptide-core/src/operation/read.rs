//! Reading key snapshots.
//!
//! Struct mode takes two round trips per batch: the first learns each
//! key's type and expiry (and size, when a memory limit is set), the
//! second fetches values with the command that fits each type. Dump
//! mode fetches a DUMP payload instead, in the first round trip unless
//! sizes have to be checked before fetching.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use riptide_protocol::{Cmd, Frame};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::{Batch, Operation, Reply};
use crate::time::{absolute_expiry, now_ms};
use crate::types::{DataType, KeyValue, ScoredMember, StreamMessage, Value};

/// How values are fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Typed values decoded from per-type read commands.
    #[default]
    Struct,
    /// Opaque DUMP payloads.
    Dump,
}

/// Reads a [`KeyValue`] for every key.
#[derive(Debug, Clone, Default)]
pub struct KeyValueRead {
    mode: ReadMode,
    mem_usage_limit: Option<u64>,
    mem_usage_samples: u32,
}

impl KeyValueRead {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Keys larger than `limit` bytes are read without their value.
    pub fn mem_usage_limit(mut self, limit: Option<u64>, samples: u32) -> Self {
        self.mem_usage_limit = limit;
        self.mem_usage_samples = samples;
        self
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    fn value_command(&self, key: &Bytes, data_type: DataType) -> Option<Cmd> {
        if self.mode == ReadMode::Dump {
            return (data_type != DataType::None).then(|| Cmd::new("DUMP").arg(key));
        }
        let cmd = match data_type {
            DataType::String => Cmd::new("GET").arg(key),
            DataType::List => Cmd::new("LRANGE").arg(key).arg(0i64).arg(-1i64),
            DataType::Set => Cmd::new("SMEMBERS").arg(key),
            DataType::ZSet => Cmd::new("ZRANGE")
                .arg(key)
                .arg(0i64)
                .arg(-1i64)
                .arg("WITHSCORES"),
            DataType::Hash => Cmd::new("HGETALL").arg(key),
            DataType::Stream => Cmd::new("XRANGE").arg(key).arg("-").arg("+"),
            _ => return None,
        };
        Some(cmd)
    }

    fn decode(&self, data_type: DataType, frame: Frame) -> Result<Option<Value>> {
        if self.mode == ReadMode::Dump {
            return Ok(frame.into_bytes().map(Value::Dump));
        }
        decode_value(data_type, frame)
    }
}

struct Meta {
    key: Bytes,
    data_type: DataType,
    ttl: Option<i64>,
    mem_usage: Option<u64>,
}

impl Operation for KeyValueRead {
    type Input = Bytes;
    type Output = KeyValue;

    async fn execute(&self, batch: &mut Batch, keys: Vec<Bytes>) -> Result<Vec<KeyValue>> {
        let with_mem = self.mem_usage_limit.is_some();
        // dump payloads can ride along with the metadata unless sizes
        // have to be known first
        let dump_inline = self.mode == ReadMode::Dump && !with_mem;

        let mut pending = Vec::with_capacity(keys.len());
        for key in &keys {
            let ty = batch.queue(Cmd::new("TYPE").arg(key));
            let pttl = batch.queue(Cmd::new("PTTL").arg(key));
            let mem = with_mem.then(|| {
                batch.queue(
                    Cmd::new("MEMORY")
                        .arg("USAGE")
                        .arg(key)
                        .arg("SAMPLES")
                        .arg(self.mem_usage_samples),
                )
            });
            let dump = dump_inline.then(|| batch.queue(Cmd::new("DUMP").arg(key)));
            pending.push((ty, pttl, mem, dump));
        }
        batch.flush().await?;
        let now = now_ms();

        let mut metas = Vec::with_capacity(keys.len());
        let mut inline_dumps = Vec::with_capacity(keys.len());
        for (key, (ty, pttl, mem, dump)) in keys.into_iter().zip(pending) {
            let type_reply = batch.resolve(ty).await?;
            let data_type = match type_reply.as_bytes() {
                Some(name) => DataType::from_name(&String::from_utf8_lossy(name)),
                None => return Err(Error::unexpected("TYPE", &type_reply)),
            };
            let pttl_reply = batch.resolve(pttl).await?;
            let ttl = match pttl_reply.as_integer() {
                Some(n) => absolute_expiry(n, now),
                None => return Err(Error::unexpected("PTTL", &pttl_reply)),
            };
            let mem_usage = match mem {
                Some(reply) => batch
                    .resolve(reply)
                    .await?
                    .as_integer()
                    .and_then(|n| u64::try_from(n).ok()),
                None => None,
            };
            inline_dumps.push(match dump {
                Some(reply) => batch.resolve(reply).await?.into_bytes(),
                None => None,
            });
            metas.push(Meta {
                key,
                data_type,
                ttl,
                mem_usage,
            });
        }

        if dump_inline {
            return Ok(metas
                .into_iter()
                .zip(inline_dumps)
                .map(|(meta, dump)| match dump {
                    Some(payload) if meta.data_type != DataType::None => KeyValue {
                        key: meta.key,
                        data_type: meta.data_type,
                        value: Some(Value::Dump(payload)),
                        ttl: meta.ttl,
                        mem_usage: meta.mem_usage,
                    },
                    _ => KeyValue::missing(meta.key),
                })
                .collect());
        }

        // second round trip: values for keys that exist, have a readable
        // type and fit under the memory limit
        let mut value_replies: Vec<Option<Reply>> = Vec::with_capacity(metas.len());
        for meta in &metas {
            let too_large = matches!(
                (self.mem_usage_limit, meta.mem_usage),
                (Some(limit), Some(used)) if used > limit
            );
            let reply = if too_large {
                None
            } else {
                self.value_command(&meta.key, meta.data_type)
                    .map(|cmd| batch.queue(cmd))
            };
            value_replies.push(reply);
        }
        if value_replies.iter().any(Option::is_some) {
            batch.flush().await?;
        }

        let mut out = Vec::with_capacity(metas.len());
        for (meta, reply) in metas.into_iter().zip(value_replies) {
            let kv = match reply {
                Some(reply) => {
                    let frame = batch.resolve(reply).await?;
                    match self.decode(meta.data_type, frame)? {
                        Some(value) => KeyValue {
                            key: meta.key,
                            data_type: meta.data_type,
                            value: Some(value),
                            ttl: meta.ttl,
                            mem_usage: meta.mem_usage,
                        },
                        // deleted between the two round trips
                        None => KeyValue::missing(meta.key),
                    }
                }
                None => KeyValue {
                    key: meta.key,
                    data_type: meta.data_type,
                    value: None,
                    ttl: meta.ttl,
                    mem_usage: meta.mem_usage,
                },
            };
            out.push(kv);
        }
        Ok(out)
    }
}

/// Decodes a per-type read reply. Returns `None` when the key no longer
/// exists (a null string or an empty collection).
pub(crate) fn decode_value(data_type: DataType, frame: Frame) -> Result<Option<Value>> {
    let command = match data_type {
        DataType::String => "GET",
        DataType::List => "LRANGE",
        DataType::Set => "SMEMBERS",
        DataType::ZSet => "ZRANGE",
        DataType::Hash => "HGETALL",
        DataType::Stream => "XRANGE",
        _ => return Ok(None),
    };
    if data_type == DataType::String {
        return match frame {
            Frame::Null => Ok(None),
            frame => match frame.into_bytes() {
                Some(b) => Ok(Some(Value::String(b))),
                None => Err(Error::UnexpectedReply {
                    command: command.into(),
                    reply: "non-string reply".into(),
                }),
            },
        };
    }

    let items = match frame {
        Frame::Array(_) | Frame::Map(_) | Frame::Null => frame.into_array().unwrap_or_default(),
        other => return Err(Error::unexpected(command, &other)),
    };
    if items.is_empty() {
        return Ok(None);
    }

    let value = match data_type {
        DataType::List => Value::List(bulk_items(command, items)?),
        DataType::Set => Value::Set(bulk_items(command, items)?.into_iter().collect::<BTreeSet<_>>()),
        DataType::ZSet => Value::ZSet(decode_scored(items)?),
        DataType::Hash => {
            let flat = bulk_items(command, items)?;
            if flat.len() % 2 != 0 {
                return Err(Error::UnexpectedReply {
                    command: command.into(),
                    reply: format!("odd element count {}", flat.len()),
                });
            }
            let mut map = BTreeMap::new();
            let mut it = flat.into_iter();
            while let (Some(field), Some(value)) = (it.next(), it.next()) {
                map.insert(field, value);
            }
            Value::Hash(map)
        }
        DataType::Stream => Value::Stream(decode_stream_entries(items)?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn bulk_items(command: &str, items: Vec<Frame>) -> Result<Vec<Bytes>> {
    items
        .into_iter()
        .map(|f| match f.into_bytes() {
            Some(b) => Ok(b),
            None => Err(Error::UnexpectedReply {
                command: command.into(),
                reply: "non-string element".into(),
            }),
        })
        .collect()
}

/// ZRANGE WITHSCORES replies come flat (`member, score, ...`) from RESP2
/// servers and as `[member, score]` pairs from RESP3 servers.
fn decode_scored(items: Vec<Frame>) -> Result<Vec<ScoredMember>> {
    let paired = matches!(items.first(), Some(Frame::Array(_)));
    let mut flat = Vec::with_capacity(if paired { items.len() * 2 } else { items.len() });
    if paired {
        for item in items {
            match item {
                Frame::Array(pair) if pair.len() == 2 => flat.extend(pair),
                other => return Err(Error::unexpected("ZRANGE", &other)),
            }
        }
    } else {
        flat = items;
    }
    if flat.len() % 2 != 0 {
        return Err(Error::UnexpectedReply {
            command: "ZRANGE".into(),
            reply: format!("odd element count {}", flat.len()),
        });
    }

    let mut out = Vec::with_capacity(flat.len() / 2);
    let mut it = flat.into_iter();
    while let (Some(member), Some(score)) = (it.next(), it.next()) {
        let score = parse_score(&score).ok_or_else(|| Error::unexpected("ZRANGE", &score))?;
        let member = member
            .into_bytes()
            .ok_or_else(|| Error::UnexpectedReply {
                command: "ZRANGE".into(),
                reply: "non-string member".into(),
            })?;
        out.push(ScoredMember { member, score });
    }
    Ok(out)
}

fn parse_score(frame: &Frame) -> Option<f64> {
    match frame {
        Frame::Integer(n) => Some(*n as f64),
        other => std::str::from_utf8(other.as_bytes()?).ok()?.parse().ok(),
    }
}

/// Decodes stream entries as returned by XRANGE and XREADGROUP:
/// `[[id, [field, value, ...]], ...]`.
pub(crate) fn decode_stream_entries(items: Vec<Frame>) -> Result<Vec<StreamMessage>> {
    let mut out = Vec::with_capacity(items.len());
    for entry in items {
        let parts = match entry {
            Frame::Array(parts) => parts,
            other => return Err(Error::unexpected("XRANGE", &other)),
        };
        let mut parts = parts.into_iter();
        let id = parts
            .next()
            .and_then(Frame::into_bytes)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .ok_or_else(|| Error::UnexpectedReply {
                command: "XRANGE".into(),
                reply: "entry without id".into(),
            })?;
        // entries deleted while still pending come back with a null body
        let flat = match parts.next().and_then(Frame::into_array) {
            Some(flat) => bulk_items("XRANGE", flat)?,
            None => Vec::new(),
        };
        let mut fields = Vec::with_capacity(flat.len() / 2);
        let mut it = flat.into_iter();
        while let (Some(f), Some(v)) = (it.next(), it.next()) {
            fields.push((f, v));
        }
        out.push(StreamMessage { id, fields });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn string_and_missing_string() {
        assert_eq!(
            decode_value(DataType::String, bulk("v")).unwrap(),
            Some(Value::String(Bytes::from_static(b"v")))
        );
        assert_eq!(decode_value(DataType::String, Frame::Null).unwrap(), None);
    }

    #[test]
    fn empty_collection_means_gone() {
        assert_eq!(
            decode_value(DataType::List, Frame::Array(vec![])).unwrap(),
            None
        );
    }

    #[test]
    fn hash_from_flat_and_map() {
        let flat = Frame::Array(vec![bulk("f1"), bulk("v1"), bulk("f2"), bulk("v2")]);
        let map = Frame::Map(vec![(bulk("f2"), bulk("v2")), (bulk("f1"), bulk("v1"))]);
        let a = decode_value(DataType::Hash, flat).unwrap();
        let b = decode_value(DataType::Hash, map).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.map(|v| v.len()), Some(2));
    }

    #[test]
    fn zset_flat_and_paired() {
        let flat = Frame::Array(vec![bulk("a"), bulk("1"), bulk("b"), bulk("2.5")]);
        let paired = Frame::Array(vec![
            Frame::Array(vec![bulk("a"), bulk("1")]),
            Frame::Array(vec![bulk("b"), bulk("2.5")]),
        ]);
        let expected = Some(Value::ZSet(vec![
            ScoredMember::new("a", 1.0),
            ScoredMember::new("b", 2.5),
        ]));
        assert_eq!(decode_value(DataType::ZSet, flat).unwrap(), expected);
        assert_eq!(decode_value(DataType::ZSet, paired).unwrap(), expected);
    }

    #[test]
    fn zset_infinite_scores() {
        let flat = Frame::Array(vec![bulk("lo"), bulk("-inf"), bulk("hi"), bulk("inf")]);
        let Some(Value::ZSet(members)) = decode_value(DataType::ZSet, flat).unwrap() else {
            panic!("expected zset");
        };
        assert_eq!(members[0].score, f64::NEG_INFINITY);
        assert_eq!(members[1].score, f64::INFINITY);
    }

    #[test]
    fn stream_entries() {
        let reply = Frame::Array(vec![
            Frame::Array(vec![
                bulk("1-0"),
                Frame::Array(vec![bulk("f"), bulk("v")]),
            ]),
            Frame::Array(vec![bulk("2-0"), Frame::Null]),
        ]);
        let entries = decode_stream_entries(reply.into_array().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(
            entries[0].fields,
            vec![(Bytes::from_static(b"f"), Bytes::from_static(b"v"))]
        );
        assert!(entries[1].fields.is_empty());
    }

    #[test]
    fn malformed_replies_are_errors() {
        assert!(decode_value(DataType::Hash, Frame::Array(vec![bulk("odd")])).is_err());
        assert!(decode_value(DataType::Set, Frame::Integer(3)).is_err());
        assert!(decode_value(DataType::ZSet, Frame::Array(vec![bulk("a"), bulk("x")])).is_err());
    }

    #[test]
    fn unreadable_types_have_no_command() {
        let read = KeyValueRead::new(ReadMode::Struct);
        let key = Bytes::from_static(b"k");
        assert!(read.value_command(&key, DataType::Json).is_none());
        assert!(read.value_command(&key, DataType::None).is_none());
        assert_eq!(
            read.value_command(&key, DataType::ZSet).unwrap().tokens().len(),
            5
        );
        let dump = KeyValueRead::new(ReadMode::Dump);
        assert_eq!(dump.value_command(&key, DataType::Json).unwrap().name(), "DUMP");
    }
}
