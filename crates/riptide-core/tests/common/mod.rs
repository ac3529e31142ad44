//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use riptide_core::ConnectionConfig;
use riptide_protocol::Frame;
use riptide_testkit::TestServer;

/// Connection settings for a test server, with short timeouts so
/// failures show up quickly.
pub fn config(server: &TestServer) -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(5),
        pool_acquire_timeout: Duration::from_secs(2),
        ..ConnectionConfig::new(server.host(), server.port())
    }
}

pub fn bulk(frame: &Frame) -> String {
    String::from_utf8_lossy(frame.as_bytes().expect("bulk reply")).into_owned()
}

/// Loads a few keys of every structured type under `prefix`.
pub async fn seed_all_types(server: &TestServer, prefix: &str) {
    let k = |name: &str| format!("{prefix}:{name}");
    server.exec(["SET", k("string").as_str(), "hello"]).await;
    server.exec(["RPUSH", k("list").as_str(), "a", "b", "a"]).await;
    server.exec(["SADD", k("set").as_str(), "x", "y", "z"]).await;
    server.exec(["ZADD", k("zset").as_str(), "1.5", "one", "2", "two"]).await;
    server.exec(["HSET", k("hash").as_str(), "f1", "v1", "f2", "v2"]).await;
    server.exec(["XADD", k("stream").as_str(), "1-1", "f", "v"]).await;
    server.exec(["XADD", k("stream").as_str(), "1-2", "g", "w"]).await;
}

/// Waits until `check` holds, polling every few milliseconds, or panics
/// after `timeout`.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
