//! Mesh membership: joining, gossip, duplicate links and leaving

use std::time::Duration;

use bytes::Bytes;
use envoy_messenger::{Messenger, MessengerError};
use tokio::time::Instant;

mod common;
use common::{
    echo, init_tracing, join, start, start_with, tagged, test_config, wait_for, wait_for_peers,
};

#[tokio::test]
async fn test_join_learns_peers_through_gossip() {
    init_tracing();

    let a = start().await;
    let b = start().await;
    let c = start().await;

    join(&b, &[&c]).await;
    join(&a, &[&b]).await;

    // Join returns only after the gossip dial to C completed
    let mut expected = vec![b.host_id(), c.host_id()];
    expected.sort();
    assert_eq!(a.peers().await.unwrap(), expected);

    wait_for_peers(&b, &[a.host_id(), c.host_id()]).await;
    wait_for_peers(&c, &[a.host_id(), b.host_id()]).await;
}

#[tokio::test]
async fn test_simultaneous_join_keeps_one_link() {
    init_tracing();

    let a = start().await;
    let b = start().await;
    a.subscribe("to-a", tagged("a")).await.unwrap();
    b.subscribe("to-b", tagged("b")).await.unwrap();

    let a_addr = a.host_id().to_string();
    let b_addr = b.host_id().to_string();
    let b_seeds = [b_addr.as_str()];
    let a_seeds = [a_addr.as_str()];
    let (joined_a, joined_b) = tokio::join!(a.join(&b_seeds), b.join(&a_seeds));
    joined_a.unwrap();
    joined_b.unwrap();

    wait_for_peers(&a, &[b.host_id()]).await;
    wait_for_peers(&b, &[a.host_id()]).await;

    // Give the discarded link time to close, then check nothing was lost
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.peers().await.unwrap(), vec![b.host_id()]);
    assert_eq!(b.peers().await.unwrap(), vec![a.host_id()]);

    let reply = a.request("to-b", "ping").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"b:ping"));
    let reply = b.request("to-a", "ping").await.unwrap();
    assert_eq!(reply.body, Bytes::from_static(b"a:ping"));
}

#[tokio::test]
async fn test_subscriptions_propagate_after_join() {
    init_tracing();

    let server = start().await;
    let client = start().await;
    join(&client, &[&server]).await;

    let result = client.request("late", "hello").await;
    assert!(matches!(result, Err(MessengerError::NoSubscribers { .. })));

    server.subscribe("late", echo()).await.unwrap();
    let client_ref = &client;
    wait_for("subscription to reach the client", || async move {
        client_ref.request("late", "hello").await.is_ok()
    })
    .await;

    server.unsubscribe("late").await.unwrap();
    wait_for("unsubscription to reach the client", || async move {
        matches!(
            client_ref.request("late", "hello").await,
            Err(MessengerError::NoSubscribers { .. })
        )
    })
    .await;
}

#[tokio::test]
async fn test_leave_notifies_peers_and_closes() {
    init_tracing();

    let server = start().await;
    server.subscribe("job", echo()).await.unwrap();
    let client = start().await;
    join(&client, &[&server]).await;
    assert_eq!(client.peers().await.unwrap(), vec![server.host_id()]);

    server.leave().await.unwrap();
    wait_for_peers(&client, &[]).await;

    let result = client.request("job", "hello").await;
    assert!(matches!(result, Err(MessengerError::NoSubscribers { .. })));

    assert!(matches!(
        server.request("job", "hello").await,
        Err(MessengerError::Closed)
    ));
    assert!(matches!(server.peers().await, Err(MessengerError::Closed)));

    // Leaving twice is harmless
    server.leave().await.unwrap();
}

#[tokio::test]
async fn test_dropped_messenger_is_removed_from_peers() {
    init_tracing();

    let client = start().await;
    let server = start().await;
    join(&client, &[&server]).await;
    assert_eq!(client.peers().await.unwrap(), vec![server.host_id()]);

    drop(server);
    wait_for_peers(&client, &[]).await;
}

#[tokio::test]
async fn test_join_retries_unreachable_host() {
    init_tracing();

    // Reserve a port, then free it so nothing is listening there yet
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let late_addr = reserved.local_addr().unwrap().to_string();
    drop(reserved);

    let mut config = test_config();
    config.join_timeout = Duration::from_millis(300);
    let client = start_with(config).await;

    let started = Instant::now();
    client.join(&[late_addr.as_str()]).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(client.peers().await.unwrap().is_empty());

    let late = Messenger::with_config(&late_addr, test_config())
        .await
        .unwrap();
    wait_for_peers(&client, &[late.host_id()]).await;
    wait_for_peers(&late, &[client.host_id()]).await;
}

#[tokio::test]
async fn test_join_skips_self_and_unresolvable_addresses() {
    init_tracing();

    let messenger = start().await;
    let own = messenger.host_id().to_string();

    let started = Instant::now();
    messenger
        .join(&["definitely not an address", own.as_str()])
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(messenger.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_join_with_no_addresses_returns_immediately() {
    let messenger = start().await;
    let started = Instant::now();
    messenger.join(&[]).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_new_rejects_unresolvable_address() {
    let result = Messenger::new("definitely not an address").await;
    assert!(matches!(result, Err(MessengerError::Resolve { .. })));
}

#[tokio::test]
async fn test_host_id_is_bound_address() {
    let messenger = Messenger::with_config("0.0.0.0:0", test_config())
        .await
        .unwrap();
    let addr = messenger.host_id().addr();
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);
}
