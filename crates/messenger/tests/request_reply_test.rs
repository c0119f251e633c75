//! Request, reply and publish routing between connected hosts

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use envoy_messenger::{MessengerError, Topic};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};

mod common;
use common::{echo, init_tracing, join, start, start_with, tagged, test_config};

#[tokio::test]
async fn test_request_reply_echo() {
    init_tracing();

    let server = start().await;
    server.subscribe("job", tagged("server")).await.unwrap();

    let client = start().await;
    join(&client, &[&server]).await;

    let reply = client.request("job", "hello").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"server:hello"));

    // A second request gets a fresh id
    let again = client.request("job", "again").await.unwrap();
    assert_ne!(again.id, reply.id);
    assert_eq!(again.body, Bytes::from_static(b"server:again"));

    client.leave().await.unwrap();
    server.leave().await.unwrap();
}

#[tokio::test]
async fn test_requests_spread_across_subscribers() {
    init_tracing();

    let first = start().await;
    first.subscribe("job", tagged("first")).await.unwrap();
    let second = start().await;
    second.subscribe("job", tagged("second")).await.unwrap();
    join(&second, &[&first]).await;

    // Joining one server is enough to learn about the other
    let client = start().await;
    join(&client, &[&first]).await;
    let mut peers = vec![first.host_id(), second.host_id()];
    peers.sort();
    assert_eq!(client.peers().await.unwrap(), peers);

    let mut from_first = 0;
    let mut from_second = 0;
    for i in 0..100 {
        let reply = client.request("job", format!("req-{i}")).await.unwrap();
        if reply.body.starts_with(b"first:") {
            from_first += 1;
        } else if reply.body.starts_with(b"second:") {
            from_second += 1;
        } else {
            panic!("unexpected reply {:?}", reply.body);
        }
    }

    assert_eq!(from_first + from_second, 100);
    assert!(from_first >= 15, "first server only got {from_first} requests");
    assert!(from_second >= 15, "second server only got {from_second} requests");
}

#[tokio::test]
async fn test_no_subscribers_fails_fast() {
    init_tracing();

    let server = start().await;
    server.subscribe("job", echo()).await.unwrap();
    let client = start().await;
    join(&client, &[&server]).await;

    let started = Instant::now();
    let result = client.request("missing", "hello").await;
    match result {
        Err(MessengerError::NoSubscribers { topic }) => assert_eq!(topic, Topic::from("missing")),
        other => panic!("expected NoSubscribers, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let result = client.publish("missing", "event").await;
    assert!(matches!(result, Err(MessengerError::NoSubscribers { .. })));
}

#[tokio::test]
async fn test_request_without_peers_has_no_subscribers() {
    init_tracing();

    let lonely = start().await;
    lonely.subscribe("job", echo()).await.unwrap();

    // Local subscriptions are never used for local requests
    let result = lonely.request("job", "hello").await;
    assert!(matches!(result, Err(MessengerError::NoSubscribers { .. })));
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    init_tracing();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let server = start().await;
    server
        .subscribe("events", move |topic: &Topic, body: Bytes| -> Bytes {
            let _ = seen_tx.send((topic.clone(), body));
            Bytes::new()
        })
        .await
        .unwrap();

    let client = start().await;
    join(&client, &[&server]).await;

    client.publish("events", "something happened").await.unwrap();

    let (topic, body) = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("publish was not delivered")
        .unwrap();
    assert_eq!(topic, Topic::from("events"));
    assert_eq!(body, Bytes::from_static(b"something happened"));
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    init_tracing();

    let server = start().await;
    server
        .subscribe("slow", |_topic: &Topic, body: Bytes| -> Bytes {
            std::thread::sleep(Duration::from_secs(1));
            body
        })
        .await
        .unwrap();
    server.subscribe("fast", echo()).await.unwrap();

    let mut config = test_config();
    config.request_timeout = Duration::from_millis(200);
    let client = start_with(config).await;
    join(&client, &[&server]).await;

    let started = Instant::now();
    let result = client.request("slow", "hello").await;
    assert!(matches!(result, Err(MessengerError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(800));

    // The late reply is dropped and the link stays usable
    tokio::time::sleep(Duration::from_secs(1)).await;
    let reply = client.request("fast", "still here").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"still here"));
}

#[tokio::test]
async fn test_double_subscribe_rejected() {
    init_tracing();

    let messenger = start().await;
    messenger.subscribe("job", echo()).await.unwrap();

    let result = messenger.subscribe("job", echo()).await;
    assert!(matches!(result, Err(MessengerError::AlreadySubscribed { .. })));

    // Unsubscribing frees the topic again
    messenger.unsubscribe("job").await.unwrap();
    messenger.subscribe("job", echo()).await.unwrap();
}

#[tokio::test]
async fn test_broadcast_and_survey_not_implemented() {
    let messenger = start().await;

    assert!(matches!(
        messenger.broadcast("job", "hello").await,
        Err(MessengerError::NotImplemented("broadcast"))
    ));
    assert!(matches!(
        messenger.survey("job", "hello").await,
        Err(MessengerError::NotImplemented("survey"))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_get_matching_replies() {
    init_tracing();

    let first = start().await;
    first.subscribe("job", tagged("server")).await.unwrap();
    let second = start().await;
    second.subscribe("job", tagged("server")).await.unwrap();

    let client = Arc::new(start().await);
    join(&client, &[&first, &second]).await;

    let mut requests = JoinSet::new();
    for i in 0..200 {
        let client = client.clone();
        requests.spawn(async move {
            let body = format!("request-{i}");
            let reply = client.request("job", body.clone()).await;
            (body, reply)
        });
    }

    let mut ids = HashSet::new();
    while let Some(joined) = requests.join_next().await {
        let (body, reply) = joined.unwrap();
        let reply = reply.unwrap();
        assert_eq!(reply.body, Bytes::from(format!("server:{body}")));
        assert!(ids.insert(reply.id), "duplicate reply id {}", reply.id);
    }
    assert_eq!(ids.len(), 200);
}
