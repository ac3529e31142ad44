mod common;

use std::sync::Arc;
use std::time::Duration;

use riptide_core::{Batch, ConnectionConfig, Error, Operation, PooledExecutor, Result};
use riptide_protocol::Cmd;
use riptide_testkit::TestServer;

/// Echoes every item through the server.
struct Echo;

impl Operation for Echo {
    type Input = String;
    type Output = String;

    async fn execute(&self, batch: &mut Batch, items: Vec<String>) -> Result<Vec<String>> {
        let replies: Vec<_> = items
            .iter()
            .map(|item| batch.queue(Cmd::new("ECHO").arg(item.as_str())))
            .collect();
        batch.flush().await?;
        let mut out = Vec::with_capacity(replies.len());
        for reply in replies {
            out.push(common::bulk(&batch.resolve(reply).await?));
        }
        Ok(out)
    }
}

/// Sends one command per item and stops at the first error reply,
/// leaving later replies unread.
struct FailFast;

impl Operation for FailFast {
    type Input = &'static str;
    type Output = ();

    async fn execute(&self, batch: &mut Batch, items: Vec<&'static str>) -> Result<Vec<()>> {
        let replies: Vec<_> = items.iter().map(|&name| batch.queue(Cmd::new(name))).collect();
        for reply in replies {
            batch.resolve(reply).await?;
        }
        Ok(vec![(); items.len()])
    }
}

#[tokio::test]
async fn results_come_back_in_order() {
    let server = TestServer::start().await;
    let executor = PooledExecutor::new(common::config(&server), Echo);

    let items: Vec<String> = (0..100).map(|i| format!("item-{i}")).collect();
    let out = executor.execute(items.clone()).await.unwrap();
    assert_eq!(out, items);

    // the connection went back to the pool
    assert_eq!(executor.pool().idle_count(), 1);
}

#[tokio::test]
async fn concurrent_batches_use_separate_connections() {
    let server = TestServer::start().await;
    let executor = Arc::new(PooledExecutor::new(common::config(&server), Echo));

    let mut handles = Vec::new();
    for batch in 0..8 {
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            let items: Vec<String> = (0..20).map(|i| format!("{batch}:{i}")).collect();
            let out = executor.execute(items.clone()).await.unwrap();
            assert_eq!(out, items);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(executor.pool().idle_count() <= executor.pool().max_size());
}

#[tokio::test]
async fn slow_replies_time_out() {
    let server = TestServer::start().await;
    let config = ConnectionConfig {
        command_timeout: Duration::from_millis(100),
        ..common::config(&server)
    };
    let executor = PooledExecutor::new(config, Echo);

    server.set_delay(Duration::from_millis(300));
    let err = executor
        .execute(vec!["a".into(), "b".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");
    assert!(err.is_retryable());
    // replies were still in flight, so the connection was not reused
    assert_eq!(executor.pool().idle_count(), 0);

    server.set_delay(Duration::ZERO);
    let out = executor.execute(vec!["c".into()]).await.unwrap();
    assert_eq!(out, ["c"]);
}

#[tokio::test]
async fn error_reply_discards_connection() {
    let server = TestServer::start().await;
    let executor = PooledExecutor::new(common::config(&server), FailFast);

    let err = executor
        .execute(vec!["NOSUCHCOMMAND", "PING", "PING"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Command(ref msg) if msg.contains("unknown command")), "{err}");
    assert_eq!(executor.pool().idle_count(), 0);

    executor.execute(vec!["PING"]).await.unwrap();
    assert_eq!(executor.pool().idle_count(), 1);
}

#[tokio::test]
async fn exhausted_pool_fails_fast() {
    let server = TestServer::start().await;
    let config = ConnectionConfig {
        pool_size: 1,
        pool_acquire_timeout: Duration::from_millis(100),
        ..common::config(&server)
    };
    let executor = PooledExecutor::new(config, Echo);

    let held = executor.pool().get().await.unwrap();
    let err = executor.execute(vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");

    held.release();
    assert_eq!(executor.execute(vec!["x".into()]).await.unwrap(), ["x"]);
}

#[tokio::test]
async fn authenticates_new_connections() {
    let server = TestServer::with_password("s3cret").await;

    let denied = PooledExecutor::new(common::config(&server), Echo);
    let err = denied.execute(vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, Error::Command(ref msg) if msg.starts_with("NOAUTH")), "{err}");

    let config = ConnectionConfig {
        password: Some("s3cret".into()),
        ..common::config(&server)
    };
    let allowed = PooledExecutor::new(config.clone(), Echo);
    assert_eq!(allowed.execute(vec!["x".into()]).await.unwrap(), ["x"]);

    let wrong = PooledExecutor::new(
        ConnectionConfig {
            password: Some("nope".into()),
            ..config
        },
        Echo,
    );
    let err = wrong.execute(vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
}
