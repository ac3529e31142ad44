//! Command execution against the in-memory keyspace.
//!
//! Replies follow RESP2 conventions (flat arrays for hashes and scored
//! ranges, null bulk for missing values) since that is what most
//! deployed stores speak. Mutations publish keyspace and keyevent
//! notifications for the session's database.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use riptide_protocol::Frame;

use crate::pubsub::glob_match;
use crate::server::Shared;
use crate::store::{now_ms, Data, Entry, Group, Keyspace, Stream, StreamId};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Per-connection state.
#[derive(Debug)]
pub(crate) struct Session {
    pub authed: bool,
    pub db: i64,
}

impl Session {
    pub fn new(authed: bool) -> Self {
        Self { authed, db: 0 }
    }
}

/// Mutations made by a command, published once the keyspace lock is
/// released.
type Events = Vec<(&'static str, Bytes)>;

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

fn err(msg: impl Into<String>) -> Frame {
    Frame::Error(msg.into())
}

fn syntax() -> Frame {
    err("ERR syntax error")
}

fn arity(name: &str) -> Frame {
    err(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn not_int() -> Frame {
    err("ERR value is not an integer or out of range")
}

fn bulk(b: &Bytes) -> Frame {
    Frame::Bulk(b.clone())
}

fn int(n: usize) -> Frame {
    Frame::Integer(n as i64)
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn parse_score(raw: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(raw).ok()?;
    let score: f64 = s.parse().ok()?;
    (!score.is_nan()).then_some(score)
}

fn format_score(score: f64) -> Bytes {
    if score == f64::INFINITY {
        Bytes::from_static(b"inf")
    } else if score == f64::NEG_INFINITY {
        Bytes::from_static(b"-inf")
    } else {
        Bytes::from(score.to_string())
    }
}

fn upper(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_uppercase()
}

/// Resolves LRANGE-style inclusive indexes against `len`.
fn index_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start <= stop && start < len).then_some((start as usize, stop as usize))
}

fn stream_entry(id: StreamId, fields: Option<&Vec<(Bytes, Bytes)>>) -> Frame {
    let body = match fields {
        Some(fields) => Frame::Array(fields.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect()),
        None => Frame::Null,
    };
    Frame::Array(vec![Frame::Bulk(id.to_bytes()), body])
}

/// Runs one command. `args[0]` is the command name.
pub(crate) async fn dispatch(shared: &Shared, session: &mut Session, args: Vec<Bytes>) -> Frame {
    let Some(name) = args.first().map(|n| upper(n)) else {
        return err("ERR empty command");
    };

    if name == "AUTH" {
        return auth(shared, session, &args);
    }
    if !session.authed {
        return err("NOAUTH Authentication required.");
    }

    if name == "XREADGROUP" {
        return xreadgroup(shared, &args).await;
    }

    let mut events = Events::new();
    let reply = {
        let mut ks = shared.keyspace.lock();
        let now = now_ms();
        match name.as_str() {
            "PING" => match args.get(1) {
                Some(msg) => bulk(msg),
                None => Frame::Simple("PONG".into()),
            },
            "ECHO" if args.len() == 2 => bulk(&args[1]),
            "SELECT" => match args.get(1).and_then(|a| parse_i64(a)) {
                Some(db) if (0..16).contains(&db) => {
                    session.db = db;
                    ok()
                }
                _ => err("ERR DB index is out of range"),
            },
            "CONFIG" => match args.get(1).map(|a| upper(a)).as_deref() {
                Some("SET") => ok(),
                Some("GET") => Frame::Array(Vec::new()),
                _ => syntax(),
            },
            "DBSIZE" => int(ks.len(now)),
            "FLUSHALL" | "FLUSHDB" => {
                ks.clear();
                ok()
            }
            "PUBLISH" if args.len() == 3 => {
                drop(ks);
                return int(shared.pubsub.publish(&args[1], args[2].clone()));
            }
            "TYPE" if args.len() == 2 => Frame::Simple(
                ks.get(&args[1], now)
                    .map_or("none", |e| e.data.type_name())
                    .into(),
            ),
            "EXISTS" if args.len() >= 2 => {
                int(args[1..].iter().filter(|k| ks.get(k, now).is_some()).count())
            }
            "DEL" | "UNLINK" if args.len() >= 2 => {
                let mut n = 0;
                for key in &args[1..] {
                    if ks.remove(key, now) {
                        events.push(("del", key.clone()));
                        n += 1;
                    }
                }
                int(n)
            }
            "PTTL" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Integer(-2),
                Some(Entry { expires_at: None, .. }) => Frame::Integer(-1),
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => Frame::Integer((*at - now).max(0)),
            },
            "PEXPIRE" | "PEXPIREAT" if args.len() == 3 => {
                let Some(n) = parse_i64(&args[2]) else {
                    return not_int();
                };
                let at = if name == "PEXPIRE" { now + n } else { n };
                expire_at(&mut ks, &args[1], at, now, &mut events)
            }
            "GET" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Null,
                Some(Entry {
                    data: Data::String(v),
                    ..
                }) => bulk(v),
                Some(_) => err(WRONGTYPE),
            },
            "SET" if args.len() >= 3 => {
                ks.insert(args[1].clone(), Entry::new(Data::String(args[2].clone())));
                events.push(("set", args[1].clone()));
                ok()
            }
            "RPUSH" if args.len() >= 3 => {
                let entry = ks.get_or_insert(&args[1], now, || Data::List(Vec::new()));
                match &mut entry.data {
                    Data::List(items) => {
                        items.extend(args[2..].iter().cloned());
                        events.push(("rpush", args[1].clone()));
                        int(items.len())
                    }
                    _ => err(WRONGTYPE),
                }
            }
            "LRANGE" if args.len() == 4 => {
                let (Some(start), Some(stop)) = (parse_i64(&args[2]), parse_i64(&args[3])) else {
                    return not_int();
                };
                match ks.get(&args[1], now) {
                    None => Frame::Array(Vec::new()),
                    Some(Entry {
                        data: Data::List(items),
                        ..
                    }) => match index_range(items.len(), start, stop) {
                        Some((a, b)) => Frame::Array(items[a..=b].iter().map(bulk).collect()),
                        None => Frame::Array(Vec::new()),
                    },
                    Some(_) => err(WRONGTYPE),
                }
            }
            "SADD" if args.len() >= 3 => {
                let entry = ks.get_or_insert(&args[1], now, || Data::Set(BTreeSet::new()));
                match &mut entry.data {
                    Data::Set(members) => {
                        let added = args[2..].iter().filter(|m| members.insert((*m).clone())).count();
                        events.push(("sadd", args[1].clone()));
                        int(added)
                    }
                    _ => err(WRONGTYPE),
                }
            }
            "SMEMBERS" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Array(Vec::new()),
                Some(Entry {
                    data: Data::Set(members),
                    ..
                }) => Frame::Array(members.iter().map(bulk).collect()),
                Some(_) => err(WRONGTYPE),
            },
            "ZADD" if args.len() >= 4 && args.len() % 2 == 0 => {
                let mut pairs = Vec::with_capacity(args.len() / 2 - 1);
                for chunk in args[2..].chunks(2) {
                    match parse_score(&chunk[0]) {
                        Some(score) => pairs.push((chunk[1].clone(), score)),
                        None => return err("ERR value is not a valid float"),
                    }
                }
                let entry = ks.get_or_insert(&args[1], now, || Data::ZSet(HashMap::new()));
                match &mut entry.data {
                    Data::ZSet(members) => {
                        let added = pairs
                            .into_iter()
                            .filter(|(m, s)| members.insert(m.clone(), *s).is_none())
                            .count();
                        events.push(("zadd", args[1].clone()));
                        int(added)
                    }
                    _ => err(WRONGTYPE),
                }
            }
            "ZRANGE" if args.len() >= 4 => zrange(&mut ks, &args, now),
            "HSET" if args.len() >= 4 && args.len() % 2 == 0 => {
                let entry = ks.get_or_insert(&args[1], now, || Data::Hash(Default::default()));
                match &mut entry.data {
                    Data::Hash(fields) => {
                        let added = args[2..]
                            .chunks(2)
                            .filter(|c| fields.insert(c[0].clone(), c[1].clone()).is_none())
                            .count();
                        events.push(("hset", args[1].clone()));
                        int(added)
                    }
                    _ => err(WRONGTYPE),
                }
            }
            "HGETALL" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Array(Vec::new()),
                Some(Entry {
                    data: Data::Hash(fields),
                    ..
                }) => Frame::Array(fields.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect()),
                Some(_) => err(WRONGTYPE),
            },
            "XADD" if args.len() >= 5 && args.len() % 2 == 1 => {
                let reply = xadd(&mut ks, &args, now);
                if !reply.is_error() {
                    events.push(("xadd", args[1].clone()));
                }
                reply
            }
            "XRANGE" if args.len() == 4 => xrange(&mut ks, &args, now),
            "XLEN" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Integer(0),
                Some(Entry {
                    data: Data::Stream(s),
                    ..
                }) => int(s.entries.len()),
                Some(_) => err(WRONGTYPE),
            },
            "XGROUP" if args.len() >= 5 => xgroup(&mut ks, &args, now, &mut events),
            "XACK" if args.len() >= 4 => xack(&mut ks, &args, now),
            "XPENDING" if args.len() == 3 => xpending(&mut ks, &args, now),
            "DUMP" if args.len() == 2 => match ks.get(&args[1], now) {
                None => Frame::Null,
                Some(entry) => Frame::Bulk(entry.data.dump()),
            },
            "RESTORE" if args.len() >= 4 => restore(&mut ks, &args, now, &mut events),
            "MEMORY" if args.len() >= 3 && upper(&args[1]) == "USAGE" => {
                match ks.get(&args[2], now) {
                    None => Frame::Null,
                    Some(entry) => int(args[2].len() + entry.data.approx_size() + 48),
                }
            }
            "SCAN" if args.len() >= 2 => scan(&mut ks, &args, now),
            "PING" | "ECHO" | "PUBLISH" | "TYPE" | "EXISTS" | "DEL" | "UNLINK" | "PTTL"
            | "PEXPIRE" | "PEXPIREAT" | "GET" | "SET" | "RPUSH" | "LRANGE" | "SADD"
            | "SMEMBERS" | "ZADD" | "ZRANGE" | "HSET" | "HGETALL" | "XADD" | "XRANGE" | "XLEN"
            | "XGROUP" | "XACK" | "XPENDING" | "DUMP" | "RESTORE" | "MEMORY" | "SCAN" => {
                arity(&name)
            }
            _ => err(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            )),
        }
    };

    if events.iter().any(|(event, _)| *event == "xadd") {
        shared.stream_added.notify_waiters();
    }
    for (event, key) in events {
        shared.notify_keyspace(session.db, event, &key);
    }
    reply
}

fn auth(shared: &Shared, session: &mut Session, args: &[Bytes]) -> Frame {
    let Some(expected) = &shared.password else {
        return err("ERR AUTH <password> called without any password configured for the default user");
    };
    // AUTH [username] password
    let given = match args.len() {
        2 => &args[1],
        3 => &args[2],
        _ => return arity("AUTH"),
    };
    if &given[..] == expected.as_bytes() {
        session.authed = true;
        ok()
    } else {
        err("WRONGPASS invalid username-password pair or user is disabled.")
    }
}

fn expire_at(ks: &mut Keyspace, key: &Bytes, at: i64, now: i64, events: &mut Events) -> Frame {
    if at <= now {
        if ks.remove(key, now) {
            events.push(("del", key.clone()));
            return Frame::Integer(1);
        }
        return Frame::Integer(0);
    }
    match ks.get(key, now) {
        Some(entry) => {
            entry.expires_at = Some(at);
            events.push(("expire", key.clone()));
            Frame::Integer(1)
        }
        None => Frame::Integer(0),
    }
}

fn zrange(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let (Some(start), Some(stop)) = (parse_i64(&args[2]), parse_i64(&args[3])) else {
        return not_int();
    };
    let with_scores = match args.get(4) {
        None => false,
        Some(opt) if args.len() == 5 && upper(opt) == "WITHSCORES" => true,
        Some(_) => return syntax(),
    };
    let members = match ks.get(&args[1], now) {
        None => return Frame::Array(Vec::new()),
        Some(Entry {
            data: Data::ZSet(members),
            ..
        }) => members,
        Some(_) => return err(WRONGTYPE),
    };
    let mut sorted: Vec<(&Bytes, f64)> = members.iter().map(|(m, s)| (m, *s)).collect();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let Some((a, b)) = index_range(sorted.len(), start, stop) else {
        return Frame::Array(Vec::new());
    };
    let mut out = Vec::new();
    for (member, score) in &sorted[a..=b] {
        out.push(bulk(member));
        if with_scores {
            out.push(Frame::Bulk(format_score(*score)));
        }
    }
    Frame::Array(out)
}

fn xadd(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let entry = ks.get_or_insert(&args[1], now, || Data::Stream(Stream::default()));
    let Data::Stream(stream) = &mut entry.data else {
        return err(WRONGTYPE);
    };
    let id = if args[2].as_ref() == b"*" {
        let ms = (now.max(0) as u64).max(stream.last_id.ms);
        if ms == stream.last_id.ms {
            stream.last_id.next()
        } else {
            StreamId { ms, seq: 0 }
        }
    } else {
        match StreamId::parse(&args[2], 0) {
            Some(id) => id,
            None => return err("ERR Invalid stream ID specified as stream command argument"),
        }
    };
    if id == StreamId::default() {
        return err("ERR The ID specified in XADD must be greater than 0-0");
    }
    if id <= stream.last_id {
        return err(
            "ERR The ID specified in XADD is equal or smaller than the target stream top item",
        );
    }
    let fields = args[3..]
        .chunks(2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect();
    stream.entries.insert(id, fields);
    stream.last_id = id;
    Frame::Bulk(id.to_bytes())
}

fn xrange(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let start = match args[2].as_ref() {
        b"-" => Some(StreamId::default()),
        raw => StreamId::parse(raw, 0),
    };
    let end = match args[3].as_ref() {
        b"+" => Some(StreamId::MAX),
        raw => StreamId::parse(raw, u64::MAX),
    };
    let (Some(start), Some(end)) = (start, end) else {
        return err("ERR Invalid stream ID specified as stream command argument");
    };
    match ks.get(&args[1], now) {
        None => Frame::Array(Vec::new()),
        Some(Entry {
            data: Data::Stream(s),
            ..
        }) => {
            if start > end {
                return Frame::Array(Vec::new());
            }
            Frame::Array(
                s.entries
                    .range(start..=end)
                    .map(|(id, fields)| stream_entry(*id, Some(fields)))
                    .collect(),
            )
        }
        Some(_) => err(WRONGTYPE),
    }
}

fn xgroup(ks: &mut Keyspace, args: &[Bytes], now: i64, events: &mut Events) -> Frame {
    if upper(&args[1]) != "CREATE" {
        return syntax();
    }
    let key = &args[2];
    let mkstream = args[5..].iter().any(|a| upper(a) == "MKSTREAM");
    if ks.get(key, now).is_none() {
        if !mkstream {
            return err("ERR The XGROUP subcommand requires the key to exist. Note that for CREATE you may want to use the MKSTREAM option to create an empty stream automatically.");
        }
        ks.insert(key.clone(), Entry::new(Data::Stream(Stream::default())));
    }
    let Some(Entry {
        data: Data::Stream(stream),
        ..
    }) = ks.get(key, now)
    else {
        return err(WRONGTYPE);
    };
    if stream.groups.contains_key(&args[3]) {
        return err("BUSYGROUP Consumer Group name already exists");
    }
    let last_delivered = match args[4].as_ref() {
        b"$" => stream.last_id,
        raw => match StreamId::parse(raw, 0) {
            Some(id) => id,
            None => return err("ERR Invalid stream ID specified as stream command argument"),
        },
    };
    stream.groups.insert(
        args[3].clone(),
        Group {
            last_delivered,
            pending: Default::default(),
        },
    );
    events.push(("xgroup-create", key.clone()));
    ok()
}

fn xack(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let group = match ks.get(&args[1], now) {
        None => return Frame::Integer(0),
        Some(Entry {
            data: Data::Stream(s),
            ..
        }) => match s.groups.get_mut(&args[2]) {
            Some(group) => group,
            None => return Frame::Integer(0),
        },
        Some(_) => return err(WRONGTYPE),
    };
    let mut acked = 0;
    for raw in &args[3..] {
        let Some(id) = StreamId::parse(raw, 0) else {
            return err("ERR Invalid stream ID specified as stream command argument");
        };
        if group.pending.remove(&id).is_some() {
            acked += 1;
        }
    }
    int(acked)
}

fn xpending(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let nogroup = || {
        err(format!(
            "NOGROUP No such key '{}' or consumer group '{}'",
            String::from_utf8_lossy(&args[1]),
            String::from_utf8_lossy(&args[2])
        ))
    };
    let group = match ks.get(&args[1], now) {
        None => return nogroup(),
        Some(Entry {
            data: Data::Stream(s),
            ..
        }) => match s.groups.get(&args[2]) {
            Some(group) => group,
            None => return nogroup(),
        },
        Some(_) => return err(WRONGTYPE),
    };
    let (Some(first), Some(last)) = (group.pending.keys().next(), group.pending.keys().next_back())
    else {
        return Frame::Array(vec![Frame::Integer(0), Frame::Null, Frame::Null, Frame::Null]);
    };
    let mut per_consumer: std::collections::BTreeMap<&Bytes, usize> = Default::default();
    for consumer in group.pending.values() {
        *per_consumer.entry(consumer).or_default() += 1;
    }
    Frame::Array(vec![
        int(group.pending.len()),
        Frame::Bulk(first.to_bytes()),
        Frame::Bulk(last.to_bytes()),
        Frame::Array(
            per_consumer
                .into_iter()
                .map(|(c, n)| Frame::Array(vec![bulk(c), Frame::Bulk(Bytes::from(n.to_string()))]))
                .collect(),
        ),
    ])
}

fn restore(ks: &mut Keyspace, args: &[Bytes], now: i64, events: &mut Events) -> Frame {
    let Some(ttl) = parse_i64(&args[2]) else {
        return not_int();
    };
    let mut replace = false;
    let mut absttl = false;
    for opt in &args[4..] {
        match upper(opt).as_str() {
            "REPLACE" => replace = true,
            "ABSTTL" => absttl = true,
            _ => return syntax(),
        }
    }
    if ttl < 0 {
        return err("ERR Invalid TTL value, must be >= 0");
    }
    if !replace && ks.get(&args[1], now).is_some() {
        return err("BUSYKEY Target key name already exists.");
    }
    let Some(data) = Data::restore(&args[3]) else {
        return err("ERR DUMP payload version or checksum are wrong");
    };
    let expires_at = match (ttl, absttl) {
        (0, _) => None,
        (at, true) => Some(at),
        (ttl, false) => Some(now + ttl),
    };
    if expires_at.is_some_and(|at| at <= now) {
        // already expired: the key just goes away
        if ks.remove(&args[1], now) {
            events.push(("del", args[1].clone()));
        }
        return ok();
    }
    ks.insert(args[1].clone(), Entry { data, expires_at });
    events.push(("restore", args[1].clone()));
    ok()
}

fn scan(ks: &mut Keyspace, args: &[Bytes], now: i64) -> Frame {
    let Some(cursor) = parse_i64(&args[1]).filter(|c| *c >= 0) else {
        return err("ERR invalid cursor");
    };
    let mut pattern = None;
    let mut count = 10usize;
    let mut type_filter = None;
    for opt in args[2..].chunks(2) {
        let [name, value] = opt else {
            return syntax();
        };
        match upper(name).as_str() {
            "MATCH" => pattern = Some(value.clone()),
            "COUNT" => match parse_i64(value) {
                Some(n) if n > 0 => count = n as usize,
                _ => return syntax(),
            },
            "TYPE" => type_filter = Some(String::from_utf8_lossy(value).to_ascii_lowercase()),
            _ => return syntax(),
        }
    }

    let keys = ks.sorted_keys(now);
    let start = (cursor as usize).min(keys.len());
    let end = (start + count).min(keys.len());
    let mut batch = Vec::new();
    for key in &keys[start..end] {
        if pattern.as_ref().is_some_and(|p| !glob_match(p, key)) {
            continue;
        }
        if let Some(wanted) = &type_filter {
            let Some(entry) = ks.get(key, now) else {
                continue;
            };
            if entry.data.type_name() != wanted {
                continue;
            }
        }
        batch.push(bulk(key));
    }
    let next = if end >= keys.len() { 0 } else { end };
    Frame::Array(vec![
        Frame::Bulk(Bytes::from(next.to_string())),
        Frame::Array(batch),
    ])
}

/// Parsed XREADGROUP arguments.
struct ReadGroup {
    group: Bytes,
    consumer: Bytes,
    count: Option<usize>,
    block: Option<Duration>,
    noack: bool,
    streams: Vec<(Bytes, Bytes)>,
}

fn parse_read_group(args: &[Bytes]) -> Result<ReadGroup, Frame> {
    if args.len() < 7 || upper(&args[1]) != "GROUP" {
        return Err(syntax());
    }
    let mut read = ReadGroup {
        group: args[2].clone(),
        consumer: args[3].clone(),
        count: None,
        block: None,
        noack: false,
        streams: Vec::new(),
    };
    let mut i = 4;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "COUNT" => {
                let n = args.get(i + 1).and_then(|a| parse_i64(a)).ok_or_else(not_int)?;
                read.count = (n > 0).then_some(n as usize);
                i += 2;
            }
            "BLOCK" => {
                let ms = args.get(i + 1).and_then(|a| parse_i64(a)).ok_or_else(not_int)?;
                read.block = Some(Duration::from_millis(ms.max(0) as u64));
                i += 2;
            }
            "NOACK" => {
                read.noack = true;
                i += 1;
            }
            "STREAMS" => {
                let rest = &args[i + 1..];
                if rest.is_empty() || rest.len() % 2 != 0 {
                    return Err(err("ERR Unbalanced 'xreadgroup' list of streams: for each stream key an ID or '>' must be specified."));
                }
                let (keys, ids) = rest.split_at(rest.len() / 2);
                read.streams = keys.iter().cloned().zip(ids.iter().cloned()).collect();
                break;
            }
            _ => return Err(syntax()),
        }
    }
    if read.streams.is_empty() {
        return Err(syntax());
    }
    Ok(read)
}

/// One non-blocking pass. `Ok(None)` means only `>` ids were asked for
/// and nothing new was available.
fn read_group_once(ks: &mut Keyspace, read: &ReadGroup, now: i64) -> Result<Option<Frame>, Frame> {
    let limit = read.count.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    let mut history = false;
    for (key, id) in &read.streams {
        let nogroup = || {
            err(format!(
                "NOGROUP No such key '{}' or consumer group '{}' in XREADGROUP with GROUP option",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(&read.group)
            ))
        };
        let stream = match ks.get(key, now) {
            Some(Entry {
                data: Data::Stream(s),
                ..
            }) => s,
            Some(_) => return Err(err(WRONGTYPE)),
            None => return Err(nogroup()),
        };
        let Stream {
            entries, groups, ..
        } = stream;
        let Some(group) = groups.get_mut(&read.group) else {
            return Err(nogroup());
        };

        if id.as_ref() == b">" {
            let fresh: Vec<StreamId> = entries
                .range(group.last_delivered.next()..)
                .take(limit)
                .map(|(id, _)| *id)
                .collect();
            if fresh.is_empty() {
                continue;
            }
            let mut delivered = Vec::with_capacity(fresh.len());
            for id in fresh {
                group.last_delivered = id;
                if !read.noack {
                    group.pending.insert(id, read.consumer.clone());
                }
                delivered.push(stream_entry(id, entries.get(&id)));
            }
            out.push(Frame::Array(vec![bulk(key), Frame::Array(delivered)]));
        } else {
            history = true;
            let Some(after) = StreamId::parse(id, 0) else {
                return Err(err("ERR Invalid stream ID specified as stream command argument"));
            };
            let pending: Vec<Frame> = group
                .pending
                .range(after.next()..)
                .filter(|(_, owner)| **owner == read.consumer)
                .take(limit)
                .map(|(id, _)| stream_entry(*id, entries.get(id)))
                .collect();
            out.push(Frame::Array(vec![bulk(key), Frame::Array(pending)]));
        }
    }
    Ok((history || !out.is_empty()).then_some(Frame::Array(out)))
}

async fn xreadgroup(shared: &Shared, args: &[Bytes]) -> Frame {
    let read = match parse_read_group(args) {
        Ok(read) => read,
        Err(reply) => return reply,
    };
    // BLOCK 0 waits forever
    let deadline = read
        .block
        .filter(|d| !d.is_zero())
        .map(|d| tokio::time::Instant::now() + d);

    loop {
        let added = shared.stream_added.notified();
        tokio::pin!(added);
        added.as_mut().enable();

        let result = {
            let mut ks = shared.keyspace.lock();
            read_group_once(&mut ks, &read, now_ms())
        };
        match result {
            Err(reply) => return reply,
            Ok(Some(reply)) => return reply,
            Ok(None) if read.block.is_none() => return Frame::Null,
            Ok(None) => match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, added).await.is_err() {
                        return Frame::Null;
                    }
                }
                None => added.await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(index_range(5, 0, -1), Some((0, 4)));
        assert_eq!(index_range(5, -2, -1), Some((3, 4)));
        assert_eq!(index_range(5, 3, 100), Some((3, 4)));
        assert_eq!(index_range(5, 4, 2), None);
        assert_eq!(index_range(0, 0, -1), None);
        assert_eq!(index_range(5, 7, 9), None);
    }

    #[test]
    fn scores() {
        assert_eq!(parse_score(b"1.5"), Some(1.5));
        assert_eq!(parse_score(b"+inf"), Some(f64::INFINITY));
        assert_eq!(parse_score(b"nan"), None);
        assert_eq!(format_score(10.0), Bytes::from_static(b"10"));
        assert_eq!(format_score(f64::NEG_INFINITY), Bytes::from_static(b"-inf"));
    }
}
