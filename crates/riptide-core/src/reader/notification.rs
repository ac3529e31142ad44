//! Live key source fed by keyspace notifications.
//!
//! The store publishes a pub/sub message for every key mutation when
//! `notify-keyspace-events` is enabled. This reader subscribes with a
//! pattern, decodes each message into a key and an event name, and
//! offers the key to an [`InFlightQueue`]. The subscription task never
//! waits on consumers: keys that are already queued are dropped as
//! duplicates and keys arriving at a full queue are dropped outright.
//! Every decision is reported to the registered listeners.
//!
//! Two subscription shapes are used:
//!
//! - no key pattern: `__keyevent@{db}__:*`, where the channel suffix is
//!   the event and the payload is the key;
//! - with a key pattern: `__keyspace@{db}__:{pattern}`, where the channel
//!   suffix is the key and the payload is the event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfig, ReaderConfig};
use crate::connection::{Connection, PushMessage};
use crate::error::{Error, Result};
use crate::queue::{InFlightQueue, Offer};
use crate::types::DataType;

/// Outcome of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEventStatus {
    Accepted,
    /// The key was already waiting in the queue.
    Duplicate,
    /// The queue was full; the key was dropped.
    QueueFull,
    /// The event's data type didn't match the type filter.
    KeyTypeFiltered,
}

impl KeyEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyEventStatus::Accepted => "accepted",
            KeyEventStatus::Duplicate => "duplicate",
            KeyEventStatus::QueueFull => "queue_full",
            KeyEventStatus::KeyTypeFiltered => "key_type",
        }
    }
}

/// A decoded notification and what the reader did with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Bytes,
    pub event: String,
    pub status: KeyEventStatus,
}

/// Receives every [`KeyEvent`]. Called on the subscription task, so
/// implementations must not block.
pub trait KeyEventListener: Send + Sync {
    fn on_event(&self, event: &KeyEvent);
}

impl<F> KeyEventListener for F
where
    F: Fn(&KeyEvent) + Send + Sync,
{
    fn on_event(&self, event: &KeyEvent) {
        self(event)
    }
}

/// Counts notifications per status in `riptide_notifications_total`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsListener;

impl KeyEventListener for MetricsListener {
    fn on_event(&self, event: &KeyEvent) {
        crate::metrics::record_notification(event.status);
    }
}

/// Settings for a [`KeyNotificationReader`].
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub connection: ConnectionConfig,
    pub key_pattern: Option<String>,
    pub key_type: Option<DataType>,
    pub queue_capacity: usize,
    /// `read` returns `None` after this long without a key.
    pub idle_timeout: Option<Duration>,
    pub poll_timeout: Duration,
}

impl NotificationConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        let reader = ReaderConfig::default();
        Self::from_reader(connection, &reader)
    }

    pub fn from_reader(connection: ConnectionConfig, reader: &ReaderConfig) -> Self {
        Self {
            connection,
            key_pattern: reader.key_pattern.clone(),
            key_type: reader.key_type,
            queue_capacity: reader.notification_queue_capacity,
            idle_timeout: reader.idle_timeout,
            poll_timeout: reader.poll_timeout,
        }
    }
}

/// Subscription outcome shared with the listen task.
#[derive(Default)]
struct ListenState {
    finished: AtomicBool,
    error: Mutex<Option<String>>,
}

/// Emits keys as they change on the store.
///
/// Each [`open`](Self::open) after a [`close`](Self::close) starts over
/// with a new subscription, an empty queue and a clean subscription
/// outcome.
pub struct KeyNotificationReader {
    config: NotificationConfig,
    queue: Mutex<Arc<InFlightQueue>>,
    listeners: Vec<Arc<dyn KeyEventListener>>,
    state: Mutex<Arc<ListenState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_key: Mutex<Instant>,
    open: AtomicBool,
}

impl KeyNotificationReader {
    pub fn new(config: NotificationConfig) -> Self {
        let queue = Arc::new(InFlightQueue::new(config.queue_capacity));
        Self {
            config,
            queue: Mutex::new(queue),
            listeners: Vec::new(),
            state: Mutex::new(Arc::new(ListenState::default())),
            task: Mutex::new(None),
            last_key: Mutex::new(Instant::now()),
            open: AtomicBool::new(false),
        }
    }

    /// Registers a listener. Listeners added after [`open`](Self::open)
    /// are not called.
    pub fn add_listener(&mut self, listener: impl KeyEventListener + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    /// The pub/sub pattern this reader subscribes to.
    pub fn pattern(&self) -> String {
        let db = self.config.connection.database;
        match &self.config.key_pattern {
            None => format!("__keyevent@{db}__:*"),
            Some(pattern) => format!("__keyspace@{db}__:{pattern}"),
        }
    }

    /// Subscribes and starts the listen task. Returns once the store has
    /// confirmed the subscription.
    pub async fn open(&self) -> Result<()> {
        if self.config.poll_timeout.is_zero() {
            return Err(Error::Config("poll_timeout must be positive".into()));
        }
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pattern = self.pattern();
        let subscribed = async {
            let mut sub = Connection::connect(&self.config.connection)
                .await?
                .into_subscriber();
            sub.psubscribe(&pattern).await?;
            Ok::<_, Error>(sub)
        }
        .await;
        let mut sub = match subscribed {
            Ok(sub) => sub,
            Err(e) => {
                self.open.store(false, Ordering::Release);
                return Err(e);
            }
        };
        info!(%pattern, "subscribed to keyspace notifications");
        *self.last_key.lock() = Instant::now();

        let queue = Arc::new(InFlightQueue::new(self.config.queue_capacity));
        let state = Arc::new(ListenState::default());
        *self.queue.lock() = Arc::clone(&queue);
        *self.state.lock() = Arc::clone(&state);

        let decoder = Decoder {
            keyspace: self.config.key_pattern.is_some(),
            key_type: self.config.key_type,
            queue: Arc::clone(&queue),
            listeners: self.listeners.clone(),
        };
        let handle = tokio::spawn(async move {
            loop {
                match sub.next_message().await {
                    Ok(msg) => decoder.handle(msg),
                    Err(e) => {
                        if !queue.is_closed() {
                            warn!("keyspace notification subscription lost: {e}");
                            *state.error.lock() = Some(e.to_string());
                        }
                        break;
                    }
                }
            }
            state.finished.store(true, Ordering::Release);
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn queue(&self) -> Arc<InFlightQueue> {
        Arc::clone(&self.queue.lock())
    }

    fn state(&self) -> Arc<ListenState> {
        Arc::clone(&self.state.lock())
    }

    /// Waits up to `timeout` for the next key.
    pub async fn poll(&self, timeout: Duration) -> Option<Bytes> {
        let key = self.queue().dequeue(timeout).await;
        if key.is_some() {
            *self.last_key.lock() = Instant::now();
        }
        key
    }

    /// Waits for the next key.
    ///
    /// Returns `Ok(None)` once the reader is closed, or when an idle
    /// timeout is configured and no key arrived for that long. Returns
    /// [`Error::SubscriptionLost`] when the subscription ended and every
    /// key it queued has been consumed.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        loop {
            if let Some(key) = self.poll(self.config.poll_timeout).await {
                return Ok(Some(key));
            }
            let queue = self.queue();
            if queue.is_closed() {
                return Ok(None);
            }
            let state = self.state();
            if state.finished.load(Ordering::Acquire) && queue.is_empty() {
                return match state.error.lock().clone() {
                    Some(reason) => Err(Error::SubscriptionLost(reason)),
                    None => Ok(None),
                };
            }
            if let Some(idle) = self.config.idle_timeout {
                if self.last_key.lock().elapsed() >= idle {
                    debug!(?idle, "notification reader idle");
                    return Ok(None);
                }
            }
        }
    }

    /// True once the subscription has ended or the reader was closed.
    pub fn is_complete(&self) -> bool {
        self.queue().is_closed() || self.state().finished.load(Ordering::Acquire)
    }

    /// Number of keys waiting to be read.
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Unsubscribes and discards queued keys. Fails when the subscription
    /// had already been lost. The reader can be opened again afterwards.
    pub fn close(&self) -> Result<()> {
        self.queue().close();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.open.store(false, Ordering::Release);
        match self.state().error.lock().clone() {
            Some(reason) => Err(Error::SubscriptionLost(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for KeyNotificationReader {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Runs on the subscription task.
struct Decoder {
    keyspace: bool,
    key_type: Option<DataType>,
    queue: Arc<InFlightQueue>,
    listeners: Vec<Arc<dyn KeyEventListener>>,
}

impl Decoder {
    fn handle(&self, msg: PushMessage) {
        let Some((key, event)) = decode(self.keyspace, &msg) else {
            warn!(
                channel = %String::from_utf8_lossy(&msg.channel),
                "skipping malformed keyspace notification"
            );
            return;
        };
        let status = self.offer(key.clone(), &event);
        match status {
            KeyEventStatus::QueueFull => {
                warn!(key = %String::from_utf8_lossy(&key), %event, "notification queue full, key dropped")
            }
            _ => trace!(key = %String::from_utf8_lossy(&key), %event, status = status.as_str()),
        }
        let event = KeyEvent { key, event, status };
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    fn offer(&self, key: Bytes, event: &str) -> KeyEventStatus {
        if let Some(wanted) = self.key_type {
            if event_data_type(event) != wanted {
                return KeyEventStatus::KeyTypeFiltered;
            }
        }
        match self.queue.try_enqueue(key) {
            Offer::Accepted => KeyEventStatus::Accepted,
            Offer::Duplicate => KeyEventStatus::Duplicate,
            // a closed queue can't accept anything either
            Offer::Full | Offer::Closed => KeyEventStatus::QueueFull,
        }
    }
}

/// Splits a notification into `(key, event)`.
fn decode(keyspace: bool, msg: &PushMessage) -> Option<(Bytes, String)> {
    let sep = memchr::memchr(b':', &msg.channel)?;
    let suffix = msg.channel.slice(sep + 1..);
    if keyspace {
        if suffix.is_empty() {
            return None;
        }
        let event = std::str::from_utf8(&msg.payload).ok()?.to_owned();
        Some((suffix, event))
    } else {
        let event = std::str::from_utf8(&suffix).ok()?.to_owned();
        if event.is_empty() {
            return None;
        }
        Some((msg.payload.clone(), event))
    }
}

/// Infers the data type a mutation event applies to. Events that don't
/// identify a type (`del`, `expire`, `rename_from`...) infer `None`.
pub fn event_data_type(event: &str) -> DataType {
    match event {
        "set" | "setrange" | "incrby" | "incrbyfloat" | "append" | "getset" | "getdel"
        | "getex" | "setex" | "psetex" | "setnx" | "incr" | "decr" | "decrby" => {
            DataType::String
        }
        "lpush" | "rpush" | "lpop" | "rpop" | "linsert" | "lset" | "lrem" | "ltrim" | "lmove"
        | "blmove" | "rpoplpush" | "lmpop" | "blmpop" => DataType::List,
        "sadd" | "srem" | "spop" | "smove" | "sinterstore" | "sunionstore" | "sdiffstore" => {
            DataType::Set
        }
        "hset" | "hincrby" | "hincrbyfloat" | "hdel" | "hsetnx" => DataType::Hash,
        "xadd" | "xtrim" | "xdel" | "xsetid" => DataType::Stream,
        e if e.starts_with("xgroup-") => DataType::Stream,
        e if e.starts_with("zremrangeby") => DataType::ZSet,
        "zadd" | "zincr" | "zrem" | "zpopmin" | "zpopmax" | "zinterstore" | "zunionstore"
        | "zdiffstore" | "zrangestore" => DataType::ZSet,
        "json.set" | "json.del" | "json.merge" => DataType::Json,
        e if e.starts_with("ts.") => DataType::TimeSeries,
        _ => DataType::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(channel: &str, payload: &str) -> PushMessage {
        PushMessage {
            pattern: Bytes::new(),
            channel: Bytes::copy_from_slice(channel.as_bytes()),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    fn decoder(keyspace: bool, key_type: Option<DataType>, capacity: usize) -> Decoder {
        Decoder {
            keyspace,
            key_type,
            queue: Arc::new(InFlightQueue::new(capacity)),
            listeners: Vec::new(),
        }
    }

    #[test]
    fn keyevent_shape() {
        let (key, event) = decode(false, &msg("__keyevent@0__:hset", "user:1")).unwrap();
        assert_eq!(key, Bytes::from_static(b"user:1"));
        assert_eq!(event, "hset");
    }

    #[test]
    fn keyspace_shape_keeps_colons_in_key() {
        let (key, event) = decode(true, &msg("__keyspace@3__:user:1:name", "set")).unwrap();
        assert_eq!(key, Bytes::from_static(b"user:1:name"));
        assert_eq!(event, "set");
    }

    #[test]
    fn malformed_channel() {
        assert!(decode(false, &msg("nocolon", "k")).is_none());
        assert!(decode(true, &msg("__keyspace@0__:", "set")).is_none());
    }

    #[test]
    fn patterns() {
        let mut conn = ConnectionConfig::default();
        conn.database = 2;
        let mut config = NotificationConfig::new(conn);
        assert_eq!(
            KeyNotificationReader::new(config.clone()).pattern(),
            "__keyevent@2__:*"
        );
        config.key_pattern = Some("user:*".into());
        assert_eq!(
            KeyNotificationReader::new(config).pattern(),
            "__keyspace@2__:user:*"
        );
    }

    #[test]
    fn event_types() {
        assert_eq!(event_data_type("set"), DataType::String);
        assert_eq!(event_data_type("rpush"), DataType::List);
        assert_eq!(event_data_type("sadd"), DataType::Set);
        assert_eq!(event_data_type("zremrangebyscore"), DataType::ZSet);
        assert_eq!(event_data_type("hincrbyfloat"), DataType::Hash);
        assert_eq!(event_data_type("xgroup-create"), DataType::Stream);
        assert_eq!(event_data_type("del"), DataType::None);
        assert_eq!(event_data_type("expired"), DataType::None);
    }

    #[test]
    fn duplicates_and_full_queue() {
        let d = decoder(false, None, 1);
        assert_eq!(d.offer(Bytes::from_static(b"a"), "set"), KeyEventStatus::Accepted);
        assert_eq!(d.offer(Bytes::from_static(b"a"), "set"), KeyEventStatus::Duplicate);
        assert_eq!(d.offer(Bytes::from_static(b"b"), "set"), KeyEventStatus::QueueFull);
    }

    #[test]
    fn type_filter_runs_first() {
        let d = decoder(false, Some(DataType::Hash), 10);
        assert_eq!(
            d.offer(Bytes::from_static(b"a"), "set"),
            KeyEventStatus::KeyTypeFiltered
        );
        assert_eq!(d.offer(Bytes::from_static(b"a"), "hset"), KeyEventStatus::Accepted);
        assert_eq!(d.queue.len(), 1);
    }

    #[test]
    fn listeners_see_every_status() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut d = decoder(false, None, 10);
        let sink = Arc::clone(&seen);
        d.listeners.push(Arc::new(move |e: &KeyEvent| sink.lock().push(e.status)));

        for _ in 0..3 {
            d.handle(msg("__keyevent@0__:set", "a"));
        }
        assert_eq!(
            *seen.lock(),
            vec![
                KeyEventStatus::Accepted,
                KeyEventStatus::Duplicate,
                KeyEventStatus::Duplicate
            ]
        );
    }
}
