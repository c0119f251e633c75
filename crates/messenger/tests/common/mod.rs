//! Shared helpers for messenger integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use envoy_messenger::{Handler, HostId, Messenger, MessengerConfig, Topic};
use tokio::time::{Instant, sleep};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("envoy_messenger=debug")
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> MessengerConfig {
    MessengerConfig {
        redial_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(3),
        join_timeout: Duration::from_secs(3),
        handshake_timeout: Duration::from_secs(1),
        ..MessengerConfig::default()
    }
}

pub async fn start() -> Messenger {
    start_with(test_config()).await
}

pub async fn start_with(config: MessengerConfig) -> Messenger {
    Messenger::with_config("127.0.0.1:0", config)
        .await
        .expect("Failed to start messenger")
}

/// Join `messenger` to each of `others`
pub async fn join(messenger: &Messenger, others: &[&Messenger]) {
    let addresses: Vec<String> = others.iter().map(|m| m.host_id().to_string()).collect();
    let addresses: Vec<&str> = addresses.iter().map(String::as_str).collect();
    messenger.join(&addresses).await.expect("Failed to join");
}

/// Handler replying with `tag:` followed by the request body
pub fn tagged(tag: &'static str) -> impl Handler {
    move |_topic: &Topic, body: Bytes| -> Bytes {
        let mut reply = format!("{tag}:").into_bytes();
        reply.extend_from_slice(&body);
        Bytes::from(reply)
    }
}

pub fn echo() -> impl Handler {
    |_topic: &Topic, body: Bytes| body
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("Timed out waiting for {what}");
}

/// Wait until `messenger` is linked to exactly `expected`
pub async fn wait_for_peers(messenger: &Messenger, expected: &[HostId]) {
    let mut expected = expected.to_vec();
    expected.sort();
    let what = format!("{} to have peers {:?}", messenger.host_id(), expected);
    wait_for(&what, || {
        let expected = expected.clone();
        async move { messenger.peers().await.map(|p| p == expected).unwrap_or(false) }
    })
    .await;
}
