//! Redis broker delivery tests. They need a live server and run only when
//! `MAINT_TEST_REDIS_URL` is set (e.g. `redis://127.0.0.1:6379/15`).

use std::time::Duration;

use maint_assist::broker::redis_backend::RedisBroker;
use maint_assist::broker::{Broker, BrokerChannel, JobConsumer, JobEnvelope};
use maint_assist::config::BrokerConfig;
use maint_assist_core::models::QueryJob;

fn redis_url() -> Option<String> {
    std::env::var("MAINT_TEST_REDIS_URL").ok()
}

fn broker(url: &str, queue: &str) -> RedisBroker {
    let config = BrokerConfig {
        url: url.to_string(),
        queue: queue.to_string(),
        heartbeat_ttl_secs: 1,
        ..Default::default()
    };
    RedisBroker::new(&config).unwrap()
}

fn unique_queue() -> String {
    format!("test_queue_{}", uuid::Uuid::new_v4().simple())
}

async fn queue_len(url: &str, queue: &str) -> i64 {
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("LLEN")
        .arg(queue)
        .query_async(&mut conn)
        .await
        .unwrap()
}

async fn publish(broker: &RedisBroker, query: &str) -> JobEnvelope {
    let envelope = JobEnvelope::for_job(&QueryJob::new("u1", query)).unwrap();
    let mut channel = broker.channel().await.unwrap();
    channel.publish_job(&envelope).await.unwrap();
    envelope
}

#[tokio::test]
async fn test_live_consumers_do_not_requeue_each_other() {
    let Some(url) = redis_url() else {
        eprintln!("MAINT_TEST_REDIS_URL not set; skipping");
        return;
    };
    let queue = unique_queue();
    let broker = broker(&url, &queue);
    publish(&broker, "press 3 leak").await;

    let mut a = broker.consumer("host-1-aaaa-0").await.unwrap();
    let held = a.next_job(Duration::from_secs(1)).await.unwrap().unwrap();

    // Longer than the heartbeat TTL: only a refreshed heartbeat keeps `a` alive.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut b = broker.consumer("host-1-bbbb-0").await.unwrap();
    assert_eq!(b.recover().await.unwrap(), 0);
    assert_eq!(queue_len(&url, &queue).await, 0);

    a.ack(&held).await.unwrap();
}

#[tokio::test]
async fn test_dead_consumer_jobs_are_reaped() {
    let Some(url) = redis_url() else {
        eprintln!("MAINT_TEST_REDIS_URL not set; skipping");
        return;
    };
    let queue = unique_queue();
    let broker = broker(&url, &queue);
    let sent = publish(&broker, "press 3 leak").await;

    let mut crashed = broker.consumer("old-host-1-cccc-0").await.unwrap();
    let _held = crashed
        .next_job(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    drop(crashed);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut replacement = broker.consumer("new-host-2-dddd-0").await.unwrap();
    assert_eq!(replacement.recover().await.unwrap(), 1);

    let redelivered = replacement
        .next_job(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(JobEnvelope::decode(&redelivered.payload).unwrap(), sent);
    replacement.ack(&redelivered).await.unwrap();
}
