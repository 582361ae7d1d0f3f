//! Integration tests for the fanout adapter
//!
//! These tests require a running Redis Cluster. Point them at one with
//! REDIS_CLUSTER_NODES, e.g.:
//! export REDIS_CLUSTER_NODES="127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002"
//!
//! Run with: cargo test --test fanout_tests -- --ignored

use bytes::Bytes;
use roomcast_cluster::ClusterConfig;
use roomcast_fanout::{FanoutAdapter, SubscribeOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> ClusterConfig {
    init_tracing();
    ClusterConfig::from_env().unwrap_or_else(|_| ClusterConfig::default_for_test())
}

/// RUST_LOG-driven logging for debugging live-cluster runs
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_channel(suffix: &str) -> String {
    format!("roomcast:test:{}:{}", std::process::id(), suffix)
}

async fn started_adapter(instance_id: &str) -> FanoutAdapter {
    let adapter = FanoutAdapter::start_with_instance_id(test_config(), instance_id.to_string());
    adapter
        .wait_for_ready()
        .await
        .expect("adapter failed to become ready");
    adapter
}

#[tokio::test]
#[ignore] // Requires running Redis Cluster
async fn test_echo_suppression_across_instances() {
    let channel = test_channel("echo");
    let instance_a = started_adapter("instance-a").await;
    let instance_b = started_adapter("instance-b").await;

    let a_invocations = Arc::new(AtomicUsize::new(0));
    let b_received = Arc::new(Mutex::new(Vec::new()));

    let counter = Arc::clone(&a_invocations);
    instance_a
        .subscribe(&channel, Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let sink = Arc::clone(&b_received);
    instance_b
        .subscribe(&channel, Arc::new(move |payload, origin| {
            sink.lock().unwrap().push((payload.to_vec(), origin.to_string()));
        }))
        .unwrap();

    // Let the new subscriptions reach the cluster
    tokio::time::sleep(Duration::from_millis(300)).await;

    instance_a.publish(&channel, b"user joined").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A never hears its own message; B hears it exactly once
    assert_eq!(a_invocations.load(Ordering::SeqCst), 0);
    let received = b_received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, b"user joined".to_vec());
    assert_eq!(received[0].1, "instance-a");

    instance_a.shutdown().await.unwrap();
    instance_b.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis Cluster
async fn test_self_delivery_opt_in() {
    let channel = test_channel("self");
    let adapter = started_adapter("instance-self").await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    adapter
        .subscribe_with(
            &channel,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions { deliver_self: true },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    adapter.publish(&channel, b"loopback").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis Cluster
async fn test_request_aggregates_all_responders() {
    let channel = test_channel("agg-all");
    let requester = started_adapter("requester").await;
    let responders = vec![
        started_adapter("responder-1").await,
        started_adapter("responder-2").await,
        started_adapter("responder-3").await,
    ];

    for (index, responder) in responders.iter().enumerate() {
        let count = format!("{}", index + 1);
        responder
            .serve(&channel, Arc::new(move |_, _| {
                Some(Bytes::from(count.clone().into_bytes()))
            }))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let responses = requester
        .request(&channel, b"socket-count", Duration::from_millis(1_000))
        .await
        .unwrap();

    let mut counts: Vec<String> = responses
        .iter()
        .map(|payload| String::from_utf8(payload.to_vec()).unwrap())
        .collect();
    counts.sort();
    assert_eq!(counts, vec!["1", "2", "3"]);

    requester.shutdown().await.unwrap();
    for responder in responders {
        responder.shutdown().await.unwrap();
    }
}

#[tokio::test]
#[ignore] // Requires running Redis Cluster
async fn test_request_returns_partial_results_on_timeout() {
    let channel = test_channel("agg-partial");
    let requester = started_adapter("requester-partial").await;
    let answering = started_adapter("answering").await;
    let silent = started_adapter("silent").await;

    answering
        .serve(&channel, Arc::new(|_, _| Some(Bytes::from_static(b"here"))))
        .unwrap();
    // The silent instance hears the request but never answers
    silent.serve(&channel, Arc::new(|_, _| None)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let responses = requester
        .request(&channel, b"socket-count", Duration::from_millis(500))
        .await
        .unwrap();

    // The deadline elapsed and the partial result is not an error
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].as_ref(), &b"here"[..]);

    requester.shutdown().await.unwrap();
    answering.shutdown().await.unwrap();
    silent.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis Cluster
async fn test_panicking_handler_does_not_kill_the_receive_loop() {
    let channel = test_channel("panic");
    let publisher = started_adapter("publisher-panic").await;
    let subscriber = started_adapter("subscriber-panic").await;

    let delivered = Arc::new(AtomicUsize::new(0));
    subscriber
        .subscribe(&channel, Arc::new(|_, _| panic!("handler bug")))
        .unwrap();
    let counter = Arc::clone(&delivered);
    subscriber
        .subscribe(&channel, Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    publisher.publish(&channel, b"first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    publisher.publish(&channel, b"second").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Both messages survived the panicking sibling handler
    assert_eq!(delivered.load(Ordering::SeqCst), 2);

    publisher.shutdown().await.unwrap();
    subscriber.shutdown().await.unwrap();
}
