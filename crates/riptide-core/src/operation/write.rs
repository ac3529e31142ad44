//! Writing key snapshots to a target store.

use bytes::Bytes;
use riptide_protocol::Cmd;

use crate::error::Result;
use crate::executor::{Batch, Operation, Reply};
use crate::time::now_ms;
use crate::types::{KeyValue, Value};

/// What happened to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Missing or expired at the source, so deleted at the target.
    Deleted,
    /// Nothing to write: the snapshot carried no value (over the memory
    /// limit, or a type that can't be read structurally).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub key: Bytes,
    pub status: WriteStatus,
}

/// Writes [`KeyValue`]s, replacing (or merging into) the target keys.
#[derive(Debug, Clone, Default)]
pub struct KeyValueWrite {
    merge: bool,
}

impl KeyValueWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds collection members to existing target keys instead of
    /// replacing the keys.
    pub fn merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    /// Commands that bring the target key in line with `kv`.
    pub(crate) fn commands(&self, kv: &KeyValue, now: i64) -> (Vec<Cmd>, WriteStatus) {
        let key = &kv.key;
        if !kv.exists() || kv.is_expired(now) {
            return (vec![Cmd::new("DEL").arg(key)], WriteStatus::Deleted);
        }
        let Some(value) = &kv.value else {
            return (Vec::new(), WriteStatus::Skipped);
        };
        if value.is_empty() {
            return (vec![Cmd::new("DEL").arg(key)], WriteStatus::Deleted);
        }

        if let Value::Dump(payload) = value {
            let mut restore = Cmd::new("RESTORE")
                .arg(key)
                .arg(kv.ttl.unwrap_or(0))
                .arg(payload)
                .arg("REPLACE");
            if kv.ttl.is_some() {
                restore.push("ABSTTL");
            }
            return (vec![restore], WriteStatus::Written);
        }

        let mut cmds = Vec::with_capacity(3);
        if !self.merge {
            cmds.push(Cmd::new("DEL").arg(key));
        }
        match value {
            Value::String(v) => cmds.push(Cmd::new("SET").arg(key).arg(v)),
            Value::List(items) => cmds.push(Cmd::new("RPUSH").arg(key).args(items)),
            Value::Set(members) => cmds.push(Cmd::new("SADD").arg(key).args(members)),
            Value::ZSet(members) => {
                let mut cmd = Cmd::new("ZADD").arg(key);
                for m in members {
                    cmd.push(m.score);
                    cmd.push(&m.member);
                }
                cmds.push(cmd);
            }
            Value::Hash(fields) => {
                let mut cmd = Cmd::new("HSET").arg(key);
                for (f, v) in fields {
                    cmd.push(f);
                    cmd.push(v);
                }
                cmds.push(cmd);
            }
            Value::Stream(messages) => {
                for msg in messages.iter().filter(|m| !m.fields.is_empty()) {
                    let mut cmd = Cmd::new("XADD").arg(key).arg(msg.id.as_str());
                    for (f, v) in &msg.fields {
                        cmd.push(f);
                        cmd.push(v);
                    }
                    cmds.push(cmd);
                }
            }
            Value::Dump(_) => {}
        }
        if let Some(at) = kv.ttl {
            cmds.push(Cmd::new("PEXPIREAT").arg(key).arg(at));
        }
        (cmds, WriteStatus::Written)
    }
}

impl Operation for KeyValueWrite {
    type Input = KeyValue;
    type Output = WriteOutcome;

    async fn execute(&self, batch: &mut Batch, items: Vec<KeyValue>) -> Result<Vec<WriteOutcome>> {
        let now = now_ms();
        let mut planned: Vec<(Bytes, WriteStatus, Vec<Reply>)> = Vec::with_capacity(items.len());
        for kv in items {
            let (cmds, status) = self.commands(&kv, now);
            let replies = cmds.into_iter().map(|cmd| batch.queue(cmd)).collect();
            planned.push((kv.key, status, replies));
        }
        batch.flush().await?;

        let mut out = Vec::with_capacity(planned.len());
        for (key, status, replies) in planned {
            for reply in replies {
                batch.resolve(reply).await?;
            }
            out.push(WriteOutcome { key, status });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::{ScoredMember, StreamMessage};

    fn names(cmds: &[Cmd]) -> Vec<&str> {
        cmds.iter().map(Cmd::name).collect()
    }

    #[test]
    fn missing_key_is_deleted() {
        let (cmds, status) = KeyValueWrite::new().commands(&KeyValue::missing("k"), 0);
        assert_eq!(names(&cmds), ["DEL"]);
        assert_eq!(status, WriteStatus::Deleted);
    }

    #[test]
    fn expired_key_is_deleted() {
        let kv = KeyValue::new("k", Value::String(Bytes::from_static(b"v"))).with_ttl(10);
        let (cmds, status) = KeyValueWrite::new().commands(&kv, 11);
        assert_eq!(names(&cmds), ["DEL"]);
        assert_eq!(status, WriteStatus::Deleted);
    }

    #[test]
    fn value_less_key_is_skipped() {
        let mut kv = KeyValue::new("k", Value::String(Bytes::from_static(b"v")));
        kv.value = None;
        let (cmds, status) = KeyValueWrite::new().commands(&kv, 0);
        assert!(cmds.is_empty());
        assert_eq!(status, WriteStatus::Skipped);
    }

    #[test]
    fn replace_then_expire() {
        let mut hash = BTreeMap::new();
        hash.insert(Bytes::from_static(b"f"), Bytes::from_static(b"v"));
        let kv = KeyValue::new("h", Value::Hash(hash)).with_ttl(5_000);
        let (cmds, _) = KeyValueWrite::new().commands(&kv, 0);
        assert_eq!(names(&cmds), ["DEL", "HSET", "PEXPIREAT"]);
        assert_eq!(cmds[1].tokens().len(), 4);
    }

    #[test]
    fn merge_skips_delete() {
        let kv = KeyValue::new("z", Value::ZSet(vec![ScoredMember::new("m", 2.0)]));
        let (cmds, _) = KeyValueWrite::new().merge(true).commands(&kv, 0);
        assert_eq!(names(&cmds), ["ZADD"]);
        assert_eq!(cmds[0].tokens()[2], Bytes::from_static(b"2"));
        assert_eq!(cmds[0].tokens()[3], Bytes::from_static(b"m"));
    }

    #[test]
    fn stream_keeps_ids() {
        let kv = KeyValue::new(
            "s",
            Value::Stream(vec![
                StreamMessage::new("1-1", vec![(Bytes::from_static(b"a"), Bytes::from_static(b"1"))]),
                StreamMessage::new("1-2", vec![]),
            ]),
        );
        let (cmds, _) = KeyValueWrite::new().commands(&kv, 0);
        assert_eq!(names(&cmds), ["DEL", "XADD"]);
        assert_eq!(cmds[1].tokens()[2], Bytes::from_static(b"1-1"));
    }

    #[test]
    fn dump_restores_with_absolute_ttl() {
        let kv = KeyValue {
            key: Bytes::from_static(b"d"),
            data_type: crate::types::DataType::Hash,
            value: Some(Value::Dump(Bytes::from_static(b"payload"))),
            ttl: Some(9_000),
            mem_usage: None,
        };
        let (cmds, status) = KeyValueWrite::new().commands(&kv, 0);
        assert_eq!(status, WriteStatus::Written);
        let tokens: Vec<&[u8]> = cmds[0].tokens().iter().map(|t| t.as_ref()).collect();
        assert_eq!(
            tokens,
            [
                &b"RESTORE"[..],
                &b"d"[..],
                &b"9000"[..],
                &b"payload"[..],
                &b"REPLACE"[..],
                &b"ABSTTL"[..],
            ]
        );
    }
}
