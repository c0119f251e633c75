//! Handler panics and links that fail while requests are in flight

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use envoy_messenger::{MessengerConfig, MessengerError, Topic, WireError};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

mod common;
use common::{echo, init_tracing, join, start, start_with, tagged, test_config};

#[tokio::test]
async fn test_handler_panic_is_reported_and_contained() {
    init_tracing();

    let server = start().await;
    server
        .subscribe("job", |_topic: &Topic, body: Bytes| -> Bytes {
            if body.as_ref() == b"boom" {
                panic!("asked to explode");
            }
            body
        })
        .await
        .unwrap();

    let client = start().await;
    join(&client, &[&server]).await;

    match client.request("job", "boom").await {
        Err(MessengerError::HandlerFault { topic }) => assert_eq!(topic, Topic::from("job")),
        other => panic!("expected HandlerFault, got {other:?}"),
    }

    // Same server, same link, still serving
    let reply = client.request("job", "fine").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"fine"));
    assert_eq!(client.peers().await.unwrap(), vec![server.host_id()]);
}

#[tokio::test]
async fn test_request_moves_to_another_subscriber_when_link_drops() {
    init_tracing();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let doomed = start().await;
    doomed
        .subscribe("job", move |_topic: &Topic, body: Bytes| -> Bytes {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(1500));
            body
        })
        .await
        .unwrap();
    let survivor = start().await;

    let client = Arc::new(start().await);
    join(&client, &[&doomed, &survivor]).await;

    // Only the doomed host serves the topic when the request goes out
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("job", "hello").await }
    });
    timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .expect("request never reached the doomed host")
        .unwrap();

    survivor.subscribe("job", tagged("survivor")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    doomed.leave().await.unwrap();

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"survivor:hello"));
    assert_eq!(client.peers().await.unwrap(), vec![survivor.host_id()]);
}

#[tokio::test]
async fn test_request_fails_when_last_subscriber_drops() {
    init_tracing();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let doomed = start().await;
    doomed
        .subscribe("job", move |_topic: &Topic, body: Bytes| -> Bytes {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(1500));
            body
        })
        .await
        .unwrap();

    let client = Arc::new(start().await);
    join(&client, &[&doomed]).await;

    let started = Instant::now();
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("job", "hello").await }
    });
    timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .expect("request never reached the doomed host")
        .unwrap();

    doomed.leave().await.unwrap();

    let result = pending.await.unwrap();
    assert!(
        matches!(
            result,
            Err(MessengerError::NoSubscribers { .. } | MessengerError::Timeout(_))
        ),
        "unexpected result {result:?}"
    );
    assert!(started.elapsed() <= test_config().request_timeout + Duration::from_secs(1));
}

#[tokio::test]
async fn test_pending_request_fails_when_local_messenger_leaves() {
    init_tracing();

    let server = start().await;
    server
        .subscribe("job", |_topic: &Topic, body: Bytes| -> Bytes {
            std::thread::sleep(Duration::from_millis(500));
            body
        })
        .await
        .unwrap();

    let client = Arc::new(start().await);
    join(&client, &[&server]).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("job", "hello").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.leave().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(MessengerError::Closed)), "unexpected result {result:?}");
}

#[tokio::test]
async fn test_oversized_request_fails_without_dropping_link() {
    init_tracing();

    let config = MessengerConfig {
        max_frame_size: 1024,
        ..test_config()
    };
    let server = start_with(config.clone()).await;
    server.subscribe("job", echo()).await.unwrap();
    let client = start_with(config).await;
    join(&client, &[&server]).await;

    let started = Instant::now();
    match client.request("job", vec![7u8; 4096]).await {
        Err(MessengerError::Wire(WireError::FrameTooLarge { max, .. })) => assert_eq!(max, 1024),
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
    assert!(started.elapsed() < test_config().request_timeout);

    match client.publish("job", vec![7u8; 4096]).await {
        Err(MessengerError::Wire(WireError::FrameTooLarge { .. })) => {}
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }

    // The link survived and keeps serving
    assert_eq!(client.peers().await.unwrap(), vec![server.host_id()]);
    assert_eq!(server.peers().await.unwrap(), vec![client.host_id()]);
    let reply = client.request("job", "small").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"small"));
}
