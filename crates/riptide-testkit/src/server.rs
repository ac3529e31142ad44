//! Accept loop and per-connection handling.
//!
//! Each connection reads as many complete frames as are buffered,
//! executes them in order and writes every reply in one go, so
//! pipelined clients see the same batching a real store gives them.
//! A PSUBSCRIBE or SUBSCRIBE switches the connection to subscriber
//! mode for the rest of its life.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use riptide_protocol::{parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commands::{self, Session};
use crate::pubsub::{PubMessage, PubSub};
use crate::store::Keyspace;

/// State shared by every connection.
pub(crate) struct Shared {
    pub keyspace: parking_lot::Mutex<Keyspace>,
    pub pubsub: PubSub,
    pub password: Option<String>,
    /// Woken on every XADD so blocked XREADGROUPs re-check.
    pub stream_added: Notify,
    delay: parking_lot::Mutex<Duration>,
    /// Bumped to disconnect every subscriber.
    kill_subscribers: watch::Sender<u64>,
}

impl Shared {
    pub fn notify_keyspace(&self, db: i64, event: &str, key: &Bytes) {
        let mut channel = format!("__keyspace@{db}__:").into_bytes();
        channel.extend_from_slice(key);
        self.pubsub
            .publish(&channel, Bytes::copy_from_slice(event.as_bytes()));
        let channel = format!("__keyevent@{db}__:{event}");
        self.pubsub.publish(channel.as_bytes(), key.clone());
    }
}

/// A Redis-compatible server on an ephemeral localhost port.
///
/// Stops when dropped.
pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// A server that requires AUTH with `password`.
    pub async fn with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_owned())).await
    }

    async fn spawn(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server address");
        let shared = Arc::new(Shared {
            keyspace: parking_lot::Mutex::new(Keyspace::default()),
            pubsub: PubSub::default(),
            password,
            stream_added: Notify::new(),
            delay: parking_lot::Mutex::new(Duration::ZERO),
            kill_subscribers: watch::channel(0).0,
        });
        let accept = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let shared = Arc::clone(&accept);
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, shared).await {
                        debug!("test connection {peer} ended: {e}");
                    }
                });
            }
        });
        Self { addr, shared, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Delays every reply by `delay`, to provoke client timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock() = delay;
    }

    /// Drops every subscriber connection, as a failover or a
    /// `CLIENT KILL TYPE pubsub` would.
    pub fn kill_subscribers(&self) {
        self.shared.kill_subscribers.send_modify(|n| *n += 1);
    }

    /// Active channel and pattern subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.shared.pubsub.subscriptions()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.shared.keyspace.lock().len(crate::store::now_ms())
    }

    /// Runs a command directly against the store, bypassing the network
    /// and authentication. Notifications are still published.
    pub async fn exec<I, A>(&self, args: I) -> Frame
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args = args
            .into_iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        let mut session = Session::new(true);
        commands::dispatch(&self.shared, &mut session, args).await
    }

    /// Waits until at least `n` subscriptions are active.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        while self.subscriptions() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame_args(frame: Frame) -> Option<Vec<Bytes>> {
    frame.into_array()?.into_iter().map(Frame::into_bytes).collect()
}

fn is_subscribe(args: &[Bytes]) -> bool {
    args.first().is_some_and(|name| {
        name.eq_ignore_ascii_case(b"PSUBSCRIBE") || name.eq_ignore_ascii_case(b"SUBSCRIBE")
    })
}

async fn handle(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = BytesMut::with_capacity(4096);
    let mut session = Session::new(shared.password.is_none());

    loop {
        loop {
            let (frame, consumed) = match parse_frame(&buf) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(e) => {
                    Frame::Error(format!("ERR Protocol error: {e}")).serialize(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            };
            let _ = buf.split_to(consumed);
            let Some(args) = frame_args(frame) else {
                Frame::Error("ERR Protocol error: expected an array of bulk strings".into())
                    .serialize(&mut out);
                continue;
            };

            if is_subscribe(&args) && session.authed {
                stream.write_all(&out).await?;
                out.clear();
                return subscriber_mode(stream, buf, &shared, args).await;
            }

            let delay = *shared.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            commands::dispatch(&shared, &mut session, args)
                .await
                .serialize(&mut out);
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

type Receivers = HashMap<Bytes, broadcast::Receiver<PubMessage>>;

/// Serves a subscribed connection until the client leaves or the
/// server kills subscribers.
async fn subscriber_mode(
    mut stream: TcpStream,
    mut buf: BytesMut,
    shared: &Shared,
    first: Vec<Bytes>,
) -> std::io::Result<()> {
    let mut channels = Receivers::new();
    let mut patterns = Receivers::new();
    let mut kill = shared.kill_subscribers.subscribe();
    let mut out = BytesMut::new();

    subscribe(shared, &first, &mut channels, &mut patterns, &mut out);
    stream.write_all(&out).await?;
    out.clear();

    let result = loop {
        tokio::select! {
            msg = recv_any(&mut channels, &mut patterns) => {
                if let Some(msg) = msg {
                    push_message(&msg, &mut out);
                    if let Err(e) = stream.write_all(&out).await {
                        break Err(e);
                    }
                    out.clear();
                }
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Err(e) => break Err(e),
                    Ok(_) => {}
                }
                while let Ok(Some((frame, consumed))) = parse_frame(&buf) {
                    let _ = buf.split_to(consumed);
                    let args = frame_args(frame).unwrap_or_default();
                    if is_subscribe(&args) {
                        subscribe(shared, &args, &mut channels, &mut patterns, &mut out);
                    } else if args.first().is_some_and(|n| n.eq_ignore_ascii_case(b"PING")) {
                        Frame::Array(vec![
                            Frame::Bulk(Bytes::from_static(b"pong")),
                            Frame::Bulk(Bytes::new()),
                        ])
                        .serialize(&mut out);
                    } else {
                        Frame::Error("ERR only (P)SUBSCRIBE / PING are allowed in this context".into())
                            .serialize(&mut out);
                    }
                }
                if let Err(e) = stream.write_all(&out).await {
                    break Err(e);
                }
                out.clear();
            }
            _ = kill.changed() => {
                debug!("killing subscriber connection");
                break Ok(());
            }
        }
    };

    let (channels, patterns): (Vec<Bytes>, Vec<Bytes>) = (
        channels.into_keys().collect(),
        patterns.into_keys().collect(),
    );
    for channel in channels {
        shared.pubsub.unsubscribe(&channel);
    }
    for pattern in patterns {
        shared
            .pubsub
            .punsubscribe(&String::from_utf8_lossy(&pattern));
    }
    result
}

fn subscribe(
    shared: &Shared,
    args: &[Bytes],
    channels: &mut Receivers,
    patterns: &mut Receivers,
    out: &mut BytesMut,
) {
    let pattern_mode = args[0].eq_ignore_ascii_case(b"PSUBSCRIBE");
    let kind: &'static [u8] = if pattern_mode {
        b"psubscribe"
    } else {
        b"subscribe"
    };
    for name in &args[1..] {
        let subs = if pattern_mode {
            &mut *patterns
        } else {
            &mut *channels
        };
        if !subs.contains_key(name) {
            let rx = if pattern_mode {
                shared.pubsub.psubscribe(&String::from_utf8_lossy(name))
            } else {
                shared.pubsub.subscribe(name.clone())
            };
            subs.insert(name.clone(), rx);
        }
        let count = channels.len() + patterns.len();
        Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(kind)),
            Frame::Bulk(name.clone()),
            Frame::Integer(count as i64),
        ])
        .serialize(out);
    }
}

type RecvFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = Result<PubMessage, broadcast::error::RecvError>> + Send + 'a>>;

/// Waits for a message on any subscription. Never resolves while there
/// are none.
async fn recv_any(channels: &mut Receivers, patterns: &mut Receivers) -> Option<PubMessage> {
    let mut pending: FuturesUnordered<RecvFuture<'_>> = FuturesUnordered::new();
    for rx in channels.values_mut().chain(patterns.values_mut()) {
        pending.push(Box::pin(rx.recv()));
    }
    if pending.is_empty() {
        return std::future::pending().await;
    }
    while let Some(result) = pending.next().await {
        match result {
            Ok(msg) => return Some(msg),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("test subscriber lagged, missed {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }
    None
}

fn push_message(msg: &PubMessage, out: &mut BytesMut) {
    let frame = match &msg.pattern {
        Some(pattern) => Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"pmessage")),
            Frame::Bulk(Bytes::copy_from_slice(pattern.as_bytes())),
            Frame::Bulk(msg.channel.clone()),
            Frame::Bulk(msg.data.clone()),
        ]),
        None => Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"message")),
            Frame::Bulk(msg.channel.clone()),
            Frame::Bulk(msg.data.clone()),
        ]),
    };
    frame.serialize(out);
}
