//! riptide-testkit: an in-process Redis-compatible server.
//!
//! [`TestServer`] listens on an ephemeral localhost port and speaks
//! enough RESP for riptide's readers, writers and stream consumer:
//! strings, lists, sets, sorted sets, hashes and streams with consumer
//! groups, SCAN, DUMP/RESTORE, MEMORY USAGE, pub/sub and keyspace
//! notifications. It also has hooks for failure injection: slow
//! replies and dropped subscriber connections.
//!
//! ```no_run
//! # async fn demo() {
//! use riptide_testkit::TestServer;
//!
//! let server = TestServer::start().await;
//! server.exec(["SET", "greeting", "hello"]).await;
//! assert_eq!(server.key_count(), 1);
//! # }
//! ```

mod commands;
mod pubsub;
mod server;
mod store;

pub use server::TestServer;
