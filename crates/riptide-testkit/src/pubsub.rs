//! Channel and pattern subscriptions.
//!
//! Every subscription is a broadcast receiver held by the subscriber's
//! connection task. Publishing fans a message out to the exact channel
//! and to every pattern that matches it. Keyspace notifications go
//! through the same path as PUBLISH.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Messages buffered per subscription before a slow subscriber lags.
/// Large enough that test bursts of notifications are never dropped.
const CHANNEL_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct PubMessage {
    pub channel: Bytes,
    pub data: Bytes,
    /// Set for messages delivered to a pattern subscription.
    pub pattern: Option<Arc<str>>,
}

#[derive(Default)]
pub(crate) struct PubSub {
    channels: DashMap<Bytes, broadcast::Sender<PubMessage>>,
    patterns: DashMap<String, broadcast::Sender<PubMessage>>,
    subscriptions: AtomicUsize,
}

impl PubSub {
    pub fn subscribe(&self, channel: Bytes) -> broadcast::Receiver<PubMessage> {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn psubscribe(&self, pattern: &str) -> broadcast::Receiver<PubMessage> {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        self.patterns
            .entry(pattern.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Called once per subscription when a subscriber goes away, after
    /// its receiver has been dropped.
    pub fn unsubscribe(&self, channel: &[u8]) {
        self.subscriptions.fetch_sub(1, Ordering::Relaxed);
        self.channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0);
    }

    pub fn punsubscribe(&self, pattern: &str) {
        self.subscriptions.fetch_sub(1, Ordering::Relaxed);
        self.patterns
            .remove_if(pattern, |_, tx| tx.receiver_count() == 0);
    }

    /// Returns how many subscriptions received the message.
    pub fn publish(&self, channel: &[u8], data: Bytes) -> usize {
        let channel = Bytes::copy_from_slice(channel);
        let mut count = 0;
        if let Some(tx) = self.channels.get(&channel) {
            count += tx
                .send(PubMessage {
                    channel: channel.clone(),
                    data: data.clone(),
                    pattern: None,
                })
                .unwrap_or(0);
        }
        for entry in self.patterns.iter() {
            if glob_match(entry.key().as_bytes(), &channel) {
                count += entry
                    .value()
                    .send(PubMessage {
                        channel: channel.clone(),
                        data: data.clone(),
                        pattern: Some(Arc::from(entry.key().as_str())),
                    })
                    .unwrap_or(0);
            }
        }
        count
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }
}

/// Glob matching as used by PSUBSCRIBE and SCAN MATCH: `*`, `?`,
/// `[abc]`, `[^a-z]` and `\x` escapes, byte-wise.
pub(crate) fn glob_match(pat: &[u8], input: &[u8]) -> bool {
    let (mut pi, mut ii) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ii < input.len() {
        let step = match pat.get(pi) {
            Some(b'\\') if pi + 1 < pat.len() => (pat[pi + 1] == input[ii]).then_some(2),
            Some(b'?') => Some(1),
            Some(b'*') => {
                star = Some((pi, ii));
                pi += 1;
                continue;
            }
            Some(b'[') => match char_class(&pat[pi..], input[ii]) {
                Some((true, len)) => Some(len),
                _ => None,
            },
            Some(&c) if c == input[ii] => Some(1),
            _ => None,
        };
        match (step, star) {
            (Some(n), _) => {
                pi += n;
                ii += 1;
            }
            (None, Some((sp, si))) => {
                star = Some((sp, si + 1));
                pi = sp + 1;
                ii = si + 1;
            }
            (None, None) => return false,
        }
    }
    pat[pi..].iter().all(|&c| c == b'*')
}

/// Matches a `[...]` class against one byte. Returns whether it matched
/// and the class length, or `None` for an unterminated class.
fn char_class(pat: &[u8], ch: u8) -> Option<(bool, usize)> {
    let mut i = 1;
    let negate = pat.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < pat.len() && pat[i] != b']' {
        if i + 2 < pat.len() && pat[i + 1] == b'-' && pat[i + 2] != b']' {
            matched |= (pat[i]..=pat[i + 2]).contains(&ch);
            i += 3;
        } else {
            matched |= pat[i] == ch;
            i += 1;
        }
    }
    (i < pat.len()).then_some((matched ^ negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(p: &str, s: &str) -> bool {
        glob_match(p.as_bytes(), s.as_bytes())
    }

    #[test]
    fn glob() {
        assert!(m("*", "anything"));
        assert!(m("__keyevent@0__:*", "__keyevent@0__:set"));
        assert!(!m("__keyevent@0__:*", "__keyspace@0__:k"));
        assert!(m("user:*:name", "user:42:name"));
        assert!(m("h?llo", "hello"));
        assert!(!m("h?llo", "hllo"));
        assert!(m("h[ae]llo", "hallo"));
        assert!(m("h[^ae]llo", "hillo"));
        assert!(m("key[0-9]", "key7"));
        assert!(!m("key[0-9]", "keyx"));
        assert!(m("a\\*", "a*"));
        assert!(!m("a\\*", "ab"));
    }

    #[test]
    fn pattern_delivery() {
        let ps = PubSub::default();
        let mut rx = ps.psubscribe("__keyspace@0__:*");
        assert_eq!(ps.publish(b"__keyspace@0__:k", Bytes::from_static(b"set")), 1);
        assert_eq!(ps.publish(b"other", Bytes::from_static(b"x")), 0);
        let msg = rx.try_recv().unwrap();
        assert_eq!(&msg.channel[..], b"__keyspace@0__:k");
        assert_eq!(msg.pattern.as_deref(), Some("__keyspace@0__:*"));
    }

    #[test]
    fn unsubscribe_cleans_up() {
        let ps = PubSub::default();
        let rx = ps.subscribe(Bytes::from_static(b"ch"));
        assert_eq!(ps.subscriptions(), 1);
        drop(rx);
        ps.unsubscribe(b"ch");
        assert_eq!(ps.subscriptions(), 0);
        assert_eq!(ps.publish(b"ch", Bytes::new()), 0);
    }
}
