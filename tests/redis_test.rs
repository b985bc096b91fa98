//! These need a redis server on 127.0.0.1:6379; run them with
//! `cargo test -- --ignored`.
#![cfg(feature = "redis")]

use listq::redis::RedisBackend;
use listq::{Backend as _, ConnectionOptions, Listener as _, Queue, QueueConfig, QueueError};
use rand::Rng as _;
use std::time::Duration;
use tokio::time::timeout;

fn queue_key() -> String {
    let rng = rand::thread_rng();
    let v: Vec<u8> = rng
        .sample_iter(rand::distributions::Alphanumeric)
        .take(16)
        .collect();
    let v = String::from_utf8(v).expect("from_utf8");
    format!("test-queue:{v}")
}

async fn connect(key: &str) -> Queue<RedisBackend> {
    let queue = Queue::local(key).await.expect("redis queue");
    queue.purge().await.expect("purge");
    queue
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_standard() -> anyhow::Result<()> {
    let key = queue_key();
    let queue = connect(&key).await;

    queue.publish("a").await?;
    queue.publish("b").await?;
    queue.publish("c").await?;

    assert_eq!(queue.get_task().await?.as_deref(), Some("a"));
    assert_eq!(queue.get_task().await?.as_deref(), Some("b"));
    assert_eq!(queue.count().await?, 1);
    assert_eq!(queue.get_task().await?.as_deref(), Some("c"));
    assert_eq!(queue.count().await?, 0);
    assert_eq!(queue.get_task().await?, None);

    queue.close().await?;
    assert!(matches!(queue.close().await, Err(QueueError::Closed)));
    Ok(())
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_consume_and_presence() -> anyhow::Result<()> {
    let key = queue_key();
    let queue = connect(&key).await;
    let producer = Queue::from_url(&key, "redis://127.0.0.1:6379/0").await?;
    let mut feed = queue.consume().await?;

    producer.publish_first("first").await?;
    let task = timeout(Duration::from_secs(10), feed.recv()).await?;
    assert_eq!(task.as_deref(), Some("first"));

    assert!(producer.list_consumers().await?.contains_key(queue.id()));

    queue.cancel().await?;
    assert_eq!(feed.recv().await, None);
    assert!(!producer.list_consumers().await?.contains_key(queue.id()));

    producer.close().await?;
    queue.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_heartbeat_picks_up_backlog() -> anyhow::Result<()> {
    let key = queue_key();
    let backend = RedisBackend::open("redis://127.0.0.1:6379/0").await?;
    let config = QueueConfig::default().with_heartbeat(Duration::from_millis(500));
    let queue = Queue::with_config(&key, backend, config).await?;
    queue.purge().await?;

    // nobody is subscribed yet, so this notification is lost.
    queue.publish("backlog").await?;
    let mut feed = queue.consume().await?;

    let task = timeout(Duration::from_secs(2), feed.recv()).await?;
    assert_eq!(task.as_deref(), Some("backlog"));

    queue.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_abandoned_waits_keep_notifications() -> anyhow::Result<()> {
    let channel = format!("{}:notify", queue_key());
    let backend = RedisBackend::open("redis://127.0.0.1:6379/0").await?;
    let mut listener = backend.listen().await?;
    listener.subscribe(&channel).await?;

    // give up on a few waits, the way the consumer loop does when a
    // heartbeat fires first.
    for _ in 0..3 {
        assert!(timeout(Duration::from_millis(50), listener.notified())
            .await
            .is_err());
    }

    backend.publish(&channel, "1").await?;
    timeout(Duration::from_secs(2), listener.notified()).await??;

    // a message that arrives while nobody is waiting is kept too.
    backend.publish(&channel, "1").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(2), listener.notified()).await??;

    listener.unsubscribe(&channel).await?;
    listener.close().await?;
    assert!(listener.close().await.is_err());
    backend.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_rejects_bad_urls() {
    assert!(matches!(
        Queue::from_url("jobs", "http://127.0.0.1").await,
        Err(QueueError::Config { .. })
    ));
    assert!(matches!(
        Queue::from_url("jobs", "redis://127.0.0.1/zero").await,
        Err(QueueError::Config { .. })
    ));

    let options = ConnectionOptions {
        port: 1,
        ..ConnectionOptions::default()
    };
    assert!(matches!(
        Queue::connect("jobs", &options).await,
        Err(QueueError::Connection { .. })
    ));
}
