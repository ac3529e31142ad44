//! In-memory keyspace.
//!
//! A single map guarded by the server's lock. Expiry is lazy: an
//! expired key is removed the next time anything looks it up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use riptide_protocol::{parse_frame, Frame};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stream entry id, `ms-seq`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// Parses `ms-seq`, or a bare `ms` with `default_seq`.
    pub fn parse(raw: &[u8], default_seq: u64) -> Option<Self> {
        let s = std::str::from_utf8(raw).ok()?;
        match s.split_once('-') {
            Some((ms, seq)) => Some(Self {
                ms: ms.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(Self {
                ms: s.parse().ok()?,
                seq: default_seq,
            }),
        }
    }

    /// The smallest id greater than `self`.
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Group {
    pub last_delivered: StreamId,
    /// Delivered, unacknowledged entries and the consumer holding each.
    pub pending: BTreeMap<StreamId, Bytes>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Stream {
    pub entries: BTreeMap<StreamId, Vec<(Bytes, Bytes)>>,
    pub last_id: StreamId,
    pub groups: HashMap<Bytes, Group>,
}

#[derive(Debug, Clone)]
pub(crate) enum Data {
    String(Bytes),
    List(Vec<Bytes>),
    Set(BTreeSet<Bytes>),
    ZSet(HashMap<Bytes, f64>),
    Hash(BTreeMap<Bytes, Bytes>),
    Stream(Stream),
}

impl Data {
    pub fn type_name(&self) -> &'static str {
        match self {
            Data::String(_) => "string",
            Data::List(_) => "list",
            Data::Set(_) => "set",
            Data::ZSet(_) => "zset",
            Data::Hash(_) => "hash",
            Data::Stream(_) => "stream",
        }
    }

    /// A rough byte count in the spirit of MEMORY USAGE.
    pub fn approx_size(&self) -> usize {
        const OVERHEAD: usize = 16;
        match self {
            Data::String(v) => v.len(),
            Data::List(items) => items.iter().map(|i| i.len() + OVERHEAD).sum(),
            Data::Set(members) => members.iter().map(|m| m.len() + OVERHEAD).sum(),
            Data::ZSet(members) => members.keys().map(|m| m.len() + 8 + OVERHEAD).sum(),
            Data::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len() + OVERHEAD).sum(),
            Data::Stream(s) => s
                .entries
                .values()
                .map(|fields| {
                    16 + fields.iter().map(|(f, v)| f.len() + v.len()).sum::<usize>()
                })
                .sum(),
        }
    }

    /// DUMP payload. The format is private to this server: the value
    /// encoded as a RESP frame.
    pub fn dump(&self) -> Bytes {
        let bulk = |b: &Bytes| Frame::Bulk(b.clone());
        let body = match self {
            Data::String(v) => vec![bulk(v)],
            Data::List(items) => items.iter().map(bulk).collect(),
            Data::Set(members) => members.iter().map(bulk).collect(),
            Data::ZSet(members) => members
                .iter()
                .flat_map(|(m, s)| [bulk(m), Frame::Bulk(Bytes::from(s.to_string()))])
                .collect(),
            Data::Hash(fields) => fields.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect(),
            Data::Stream(s) => s
                .entries
                .iter()
                .map(|(id, fields)| {
                    Frame::Array(vec![
                        Frame::Bulk(id.to_bytes()),
                        Frame::Array(fields.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect()),
                    ])
                })
                .collect(),
        };
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(self.type_name().as_bytes())),
            Frame::Array(body),
        ]);
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        buf.freeze()
    }

    /// Decodes a payload produced by [`dump`](Self::dump).
    pub fn restore(payload: &[u8]) -> Option<Data> {
        let (frame, _) = parse_frame(payload).ok()??;
        let mut parts = frame.into_array()?.into_iter();
        let kind = parts.next()?.into_bytes()?;
        let body = parts.next()?.into_array()?;
        let flat = |body: Vec<Frame>| body.into_iter().map(Frame::into_bytes).collect::<Option<Vec<_>>>();
        let pairs = |items: Vec<Bytes>| {
            let mut it = items.into_iter();
            let mut out = Vec::new();
            while let (Some(a), Some(b)) = (it.next(), it.next()) {
                out.push((a, b));
            }
            out
        };
        let data = match &kind[..] {
            b"string" => Data::String(flat(body)?.into_iter().next()?),
            b"list" => Data::List(flat(body)?),
            b"set" => Data::Set(flat(body)?.into_iter().collect()),
            b"zset" => {
                let mut members = HashMap::new();
                for (m, s) in pairs(flat(body)?) {
                    members.insert(m, std::str::from_utf8(&s).ok()?.parse().ok()?);
                }
                Data::ZSet(members)
            }
            b"hash" => Data::Hash(pairs(flat(body)?).into_iter().collect()),
            b"stream" => {
                let mut stream = Stream::default();
                for entry in body {
                    let mut entry = entry.into_array()?.into_iter();
                    let id = StreamId::parse(&entry.next()?.into_bytes()?, 0)?;
                    let fields = pairs(flat(entry.next()?.into_array()?)?);
                    stream.last_id = stream.last_id.max(id);
                    stream.entries.insert(id, fields);
                }
                Data::Stream(stream)
            }
            _ => return None,
        };
        Some(data)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub data: Data,
    /// Absolute expiry in unix milliseconds.
    pub expires_at: Option<i64>,
}

impl Entry {
    pub fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    entries: HashMap<Bytes, Entry>,
}

impl Keyspace {
    pub fn get(&mut self, key: &[u8], now: i64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// The entry for `key`, created with `make` when missing.
    pub fn get_or_insert(&mut self, key: &Bytes, now: i64, make: impl FnOnce() -> Data) -> &mut Entry {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(make()))
    }

    pub fn insert(&mut self, key: Bytes, entry: Entry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &[u8], now: i64) -> bool {
        self.get(key, now).is_some() && self.entries.remove(key).is_some()
    }

    /// Every live key, sorted so SCAN cursors are stable positions.
    pub fn sorted_keys(&mut self, now: i64) -> Vec<Bytes> {
        self.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<Bytes> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&mut self, now: i64) -> usize {
        self.entries.retain(|_, e| !e.is_expired(now));
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids() {
        assert_eq!(StreamId::parse(b"5-3", 0), Some(StreamId { ms: 5, seq: 3 }));
        assert_eq!(StreamId::parse(b"5", u64::MAX), Some(StreamId { ms: 5, seq: u64::MAX }));
        assert_eq!(StreamId::parse(b"x-1", 0), None);
        assert_eq!(StreamId { ms: 1, seq: 2 }.next().to_string(), "1-3");
    }

    #[test]
    fn dump_restore_preserves_values() {
        let mut zset = HashMap::new();
        zset.insert(Bytes::from_static(b"a"), 1.5);
        let mut stream = Stream::default();
        let id = StreamId { ms: 1, seq: 1 };
        stream
            .entries
            .insert(id, vec![(Bytes::from_static(b"f"), Bytes::from_static(b"v"))]);
        stream.last_id = id;

        for data in [
            Data::String(Bytes::from_static(b"hello")),
            Data::List(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]),
            Data::ZSet(zset),
            Data::Stream(stream),
        ] {
            let restored = Data::restore(&data.dump()).unwrap();
            assert_eq!(restored.type_name(), data.type_name());
            assert_eq!(restored.dump(), data.dump());
        }
        assert!(Data::restore(b"garbage").is_none());
    }

    #[test]
    fn lazy_expiry() {
        let mut ks = Keyspace::default();
        let mut entry = Entry::new(Data::String(Bytes::from_static(b"v")));
        entry.expires_at = Some(100);
        ks.insert(Bytes::from_static(b"k"), entry);
        assert!(ks.get(b"k", 99).is_some());
        assert!(ks.get(b"k", 100).is_none());
        assert_eq!(ks.len(100), 0);
    }
}
