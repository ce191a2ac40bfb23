//! Multi-node membership scenarios over the in-process transport.

mod common;

use bytes::Bytes;
use common::{cluster_config, shared_store, start_node};
use std::time::Duration;
use syncmesh::cluster::{Publication, RouterReply, SyncEvent};
use syncmesh::{ClusterError, LocalHub, NodeDescriptor, Transport};
use tokio::time::{sleep, timeout, Instant};

#[tokio::test(start_paused = true)]
async fn test_single_node_ready_with_empty_pool() {
    let hub = LocalHub::new();
    let store = shared_store();
    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;

    assert!(a.node.is_ready());
    a.facade.health().unwrap();

    let status = a.facade.status().await.unwrap();
    assert_eq!(status.member_count, 1);
    assert!(status.pool.is_empty());
    assert!(status.current.ready);

    let discovered = store.discover().await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].publish, a.id());
}

#[tokio::test(start_paused = true)]
async fn test_two_nodes_reach_quorum() {
    let hub = LocalHub::new();
    let store = shared_store();
    let config = cluster_config(2);

    let a = start_node(&hub, &store, "a", &config).await;
    assert!(!a.node.is_ready());
    assert!(matches!(a.facade.status().await, Err(ClusterError::NotReady)));
    assert!(matches!(a.facade.health(), Err(ClusterError::NotReady)));

    let b = start_node(&hub, &store, "b", &config).await;
    assert!(b.node.is_ready());

    timeout(Duration::from_secs(10), a.node.wait_ready())
        .await
        .expect("a joins before the timeout")
        .unwrap();

    let status_a = a.facade.status().await.unwrap();
    assert_eq!(status_a.member_count, 2);
    assert_eq!(status_a.pool[0].publish, b.id());

    let status_b = b.facade.status().await.unwrap();
    assert_eq!(status_b.pool[0].publish, a.id());

    // heartbeats keep both sides alive well past the expiry delay
    sleep(Duration::from_secs(30)).await;
    assert!(a.node.is_ready());
    assert!(b.node.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_removed_and_quorum_lost() {
    let hub = LocalHub::new();
    let store = shared_store();
    let config = cluster_config(2);

    let a = start_node(&hub, &store, "a", &config).await;
    let b = start_node(&hub, &store, "b", &config).await;
    timeout(Duration::from_secs(10), a.node.wait_ready())
        .await
        .expect("cluster formed")
        .unwrap();

    hub.isolate(&b.id());
    sleep(Duration::from_secs(25)).await;
    assert!(!a.node.is_ready());
    assert!(matches!(a.facade.status().await, Err(ClusterError::NotReady)));

    // a keeps re-joining and recovers once b is reachable again
    hub.restore(&b.id());
    timeout(Duration::from_secs(10), a.node.wait_ready())
        .await
        .expect("a re-joins")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_join_gives_up_after_retry_limit() {
    let hub = LocalHub::new();
    let store = shared_store();
    let mut config = cluster_config(2);
    config.retry_join = 2;

    let a = start_node(&hub, &store, "a", &config).await;
    sleep(Duration::from_secs(10)).await;

    // a late peer is added to the pool but a stopped joining
    let b = start_node(&hub, &store, "b", &cluster_config(2)).await;
    assert!(b.node.is_ready());
    sleep(Duration::from_secs(10)).await;
    assert!(!a.node.is_ready());
    assert!(b.node.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_leaves_the_cluster() {
    let hub = LocalHub::new();
    let store = shared_store();
    let config = cluster_config(1);

    let a = start_node(&hub, &store, "a", &config).await;
    let b = start_node(&hub, &store, "b", &config).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(a.facade.status().await.unwrap().pool.len(), 1);

    b.node.shutdown().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(a.facade.status().await.unwrap().pool.is_empty());
    assert!(a.node.is_ready());
    let discovered = store.discover().await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].publish, a.id());
    assert!(!b.node.is_ready());
}

/// A hand-driven peer: answers `remoteSub` and publishes arbitrary frames.
async fn fake_peer(
    hub: &LocalHub,
    store: &syncmesh::ClusterStore,
    name: &str,
) -> (syncmesh::transport::LocalTransport, NodeDescriptor) {
    let transport = hub.transport(name);
    let bound = transport.bind().await.unwrap();
    let descriptor = NodeDescriptor::new(bound.publish.clone(), bound.router.clone());
    store.register_node(&descriptor).await.unwrap();

    let mut inbound = bound.inbound;
    tokio::spawn(async move {
        while let Some(request) = inbound.requests.recv().await {
            let _ = request.reply.send(RouterReply::RemoteSub(true).encode().unwrap());
        }
    });
    (transport, descriptor)
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ready_peer_triggers_rejoin() {
    let hub = LocalHub::new();
    let store = shared_store();
    let (fake, fake_descriptor) = fake_peer(&hub, &store, "x").await;

    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;
    assert!(a.node.is_ready());
    assert_eq!(a.facade.status().await.unwrap().pool[0], fake_descriptor);

    let mut stranger = NodeDescriptor::new("local://y/pub", "local://y/router");
    stranger.ready = true;
    fake.publish(Publication::Ready(stranger).encode().unwrap());
    sleep(Duration::from_millis(10)).await;
    assert!(!a.node.is_ready());

    // the stranger has no router, it is dropped during the re-join
    timeout(Duration::from_secs(5), a.node.wait_ready())
        .await
        .expect("a re-joins")
        .unwrap();
    let status = a.facade.status().await.unwrap();
    assert_eq!(status.pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_known_ready_announcement_is_idempotent() {
    let hub = LocalHub::new();
    let store = shared_store();
    let (fake, mut fake_descriptor) = fake_peer(&hub, &store, "x").await;

    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;
    fake_descriptor.ready = true;
    for _ in 0..2 {
        fake.publish(Publication::Ready(fake_descriptor.clone()).encode().unwrap());
    }
    sleep(Duration::from_millis(10)).await;

    assert!(a.node.is_ready());
    let status = a.facade.status().await.unwrap();
    assert_eq!(status.pool, vec![fake_descriptor]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_sync_event_stops_the_node() {
    let hub = LocalHub::new();
    let store = shared_store();
    let (fake, _) = fake_peer(&hub, &store, "x").await;

    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;
    assert!(a.node.is_ready());

    fake.publish(Bytes::from_static(br#"["cluster:sync",{"event":"bogus"}]"#));
    let result = timeout(Duration::from_secs(1), a.node.finished())
        .await
        .expect("node stops");
    assert!(matches!(result, Err(ClusterError::UnknownSyncEvent(_))));
    assert!(!a.node.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_known_sync_event_with_bad_body_is_dropped() {
    let hub = LocalHub::new();
    let store = shared_store();
    let (fake, _) = fake_peer(&hub, &store, "x").await;

    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;
    fake.publish(Bytes::from_static(br#"["cluster:sync",{"event":"profile"}]"#));
    fake.publish(Bytes::from_static(
        br#"["cluster:sync",{"event":"autorefresh","index":"i","value":"yes"}]"#,
    ));
    fake.publish(Bytes::from_static(br#"["cluster:sync",{"index":"i"}]"#));
    fake.publish(
        Publication::Sync(SyncEvent::Profile {
            id: "admin".to_string(),
        })
        .encode()
        .unwrap(),
    );
    sleep(Duration::from_millis(10)).await;

    assert!(a.node.is_ready());
    assert_eq!(a.sink.invalidated_profiles(), vec!["admin".to_string()]);
    assert!(a.sink.auto_refresh().is_empty());
    assert!(timeout(Duration::from_secs(1), a.node.finished()).await.is_err());
}

/// A peer whose router accepts requests but never answers them.
async fn silent_peer(
    hub: &LocalHub,
    store: &syncmesh::ClusterStore,
    name: &str,
) -> NodeDescriptor {
    let transport = hub.transport(name);
    let bound = transport.bind().await.unwrap();
    let descriptor = NodeDescriptor::new(bound.publish.clone(), bound.router.clone());
    store.register_node(&descriptor).await.unwrap();

    let mut inbound = bound.inbound;
    tokio::spawn(async move {
        let _transport = transport;
        let mut held = Vec::new();
        while let Some(request) = inbound.requests.recv().await {
            held.push(request);
        }
    });
    descriptor
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out() {
    let hub = LocalHub::new();
    let store = shared_store();
    silent_peer(&hub, &store, "x").await;

    let config = cluster_config(1);
    let started = Instant::now();
    let a = start_node(&hub, &store, "a", &config).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= config.timers.discover_timeout());
    assert!(elapsed < config.timers.discover_timeout() + Duration::from_secs(1));
    assert!(a.node.is_ready());
    assert!(a.facade.status().await.unwrap().pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_does_not_block_other_peers() {
    let hub = LocalHub::new();
    let store = shared_store();
    silent_peer(&hub, &store, "x").await;
    let (_fake, fake_descriptor) = fake_peer(&hub, &store, "y").await;

    let a = start_node(&hub, &store, "a", &cluster_config(2)).await;
    assert!(a.node.is_ready());
    assert_eq!(a.facade.status().await.unwrap().pool, vec![fake_descriptor]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let hub = LocalHub::new();
    let store = shared_store();
    let (fake, _) = fake_peer(&hub, &store, "x").await;

    let a = start_node(&hub, &store, "a", &cluster_config(1)).await;
    fake.publish(Bytes::from_static(b"garbage"));
    fake.publish(Bytes::from_static(br#"["cluster:unknown",1]"#));
    fake.publish(Publication::Sync(SyncEvent::Validators).encode().unwrap());
    sleep(Duration::from_millis(10)).await;

    assert!(a.node.is_ready());
    assert_eq!(a.sink.validator_refreshes(), 1);
}
