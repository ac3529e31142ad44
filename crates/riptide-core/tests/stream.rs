mod common;

use std::time::Duration;

use riptide_core::{AckPolicy, StreamConfig, StreamConsumer};
use riptide_testkit::TestServer;

fn stream_config(ack_policy: AckPolicy) -> StreamConfig {
    StreamConfig {
        ack_policy,
        group_start: "0".into(),
        block: Duration::from_millis(50),
        ..StreamConfig::new("events", "workers", "w1")
    }
}

async fn add_entries(server: &TestServer, ids: &[&str]) {
    for &id in ids {
        server.exec(["XADD", "events", id, "n", id]).await;
    }
}

fn ids(messages: &[riptide_core::StreamMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn unacknowledged_entries_are_replayed_after_restart() {
    let server = TestServer::start().await;
    add_entries(&server, &["1-1", "1-2", "1-3"]).await;

    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Manual));
    consumer.open().await.unwrap();
    let first = consumer.read_messages().await.unwrap();
    assert_eq!(ids(&first), ["1-1", "1-2", "1-3"]);
    assert!(!consumer.is_recovering());
    assert_eq!(consumer.pending_count().await.unwrap(), 3);
    // crash without acknowledging
    consumer.close();

    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Manual));
    consumer.open().await.unwrap();
    assert!(consumer.is_recovering());
    let replayed = consumer.read_messages().await.unwrap();
    assert_eq!(ids(&replayed), ["1-1", "1-2", "1-3"]);
    assert_eq!(replayed[0].fields[0].1, "1-1");
    assert_eq!(consumer.ack(&replayed).await.unwrap(), 3);

    // recovery finishes and nothing new arrives
    assert!(consumer.read_messages().await.unwrap().is_empty());
    assert!(!consumer.is_recovering());
    assert_eq!(consumer.pending_count().await.unwrap(), 0);
    consumer.close();
}

#[tokio::test]
async fn auto_ack_drains_pending_and_acknowledges_new_entries() {
    let server = TestServer::start().await;
    add_entries(&server, &["1-1", "1-2"]).await;

    // leave two entries pending
    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Manual));
    consumer.open().await.unwrap();
    assert_eq!(consumer.read_messages().await.unwrap().len(), 2);
    consumer.close();

    add_entries(&server, &["1-3"]).await;
    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Auto));
    consumer.open().await.unwrap();
    // pending entries are acknowledged without being returned
    let live = consumer.read_messages().await.unwrap();
    assert_eq!(ids(&live), ["1-3"]);
    assert_eq!(consumer.pending_count().await.unwrap(), 0);
    consumer.close();
}

#[tokio::test]
async fn recovery_starts_after_offset() {
    let server = TestServer::start().await;
    add_entries(&server, &["1-1", "1-2", "1-3"]).await;

    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Manual));
    consumer.open().await.unwrap();
    consumer.read_messages().await.unwrap();
    consumer.close();

    let config = StreamConfig {
        offset: Some("1-2".into()),
        ..stream_config(AckPolicy::Manual)
    };
    let mut consumer = StreamConsumer::new(common::config(&server), config);
    consumer.open().await.unwrap();
    assert_eq!(ids(&consumer.read_messages().await.unwrap()), ["1-3"]);
    consumer.close();
}

#[tokio::test]
async fn new_group_starts_at_end_of_stream() {
    let server = TestServer::start().await;
    add_entries(&server, &["1-1"]).await;

    let config = StreamConfig {
        group_start: "$".into(),
        ..stream_config(AckPolicy::Auto)
    };
    let mut consumer = StreamConsumer::new(common::config(&server), config);
    consumer.open().await.unwrap();
    assert!(consumer.read_messages().await.unwrap().is_empty());

    add_entries(&server, &["1-2"]).await;
    assert_eq!(ids(&consumer.read_messages().await.unwrap()), ["1-2"]);
    consumer.close();
}

#[tokio::test]
async fn blocked_read_wakes_on_new_entry() {
    let server = TestServer::start().await;
    let config = StreamConfig {
        block: Duration::from_secs(2),
        ..stream_config(AckPolicy::Auto)
    };
    let mut consumer = StreamConsumer::new(common::config(&server), config);
    consumer.open().await.unwrap();

    let read = tokio::spawn(async move {
        let messages = consumer.read_messages().await.unwrap();
        consumer.close();
        messages
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    add_entries(&server, &["5-1"]).await;
    let messages = read.await.unwrap();
    assert_eq!(ids(&messages), ["5-1"]);
}

#[tokio::test]
async fn group_is_created_with_the_stream() {
    let server = TestServer::start().await;
    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Auto));
    consumer.open().await.unwrap();
    assert_eq!(
        common::bulk(&server.exec(["TYPE", "events"]).await),
        "stream"
    );

    // opening again hits BUSYGROUP, which is fine
    consumer.open().await.unwrap();
    consumer.close();
    assert!(consumer.read_messages().await.is_err());
}

#[tokio::test]
async fn auto_ack_reads_no_more_than_asked() {
    let server = TestServer::start().await;
    let ids_in: Vec<String> = (1..=10).map(|i| format!("1-{i}")).collect();
    let refs: Vec<&str> = ids_in.iter().map(String::as_str).collect();
    add_entries(&server, &refs).await;

    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Auto));
    consumer.open().await.unwrap();
    let first = consumer.read_up_to(3).await.unwrap();
    assert_eq!(ids(&first), ["1-1", "1-2", "1-3"]);
    assert_eq!(consumer.pending_count().await.unwrap(), 0);
    consumer.close();

    // entries past the limit were never delivered, so a new consumer gets them
    let mut consumer = StreamConsumer::new(common::config(&server), stream_config(AckPolicy::Auto));
    consumer.open().await.unwrap();
    let rest = consumer.read_messages().await.unwrap();
    assert_eq!(rest.len(), 7);
    assert_eq!(rest[0].id, "1-4");
    consumer.close();
}
