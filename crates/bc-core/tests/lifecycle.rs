//! Manager Lifecycle Tests
//!
//! Listening, idempotent shutdown and post-destroy behaviour.

mod common;

use bc_core::network::{Transport, WrappedStream};
use bc_core::{
    BeaconError, BeaconEvent, ConnectionInfo, JoinOptions, MemoryDiscovery, PeerId, TransportKind,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

#[tokio::test]
async fn test_listen_emits_listening_once() {
    init_tracing();
    let net = MemoryNet::new();
    let (beacon, mut events) = spawn(memory_options(&net));

    assert!(!beacon.is_listening());
    assert!(beacon.address().is_none());

    let addr = beacon.listen(0).await.expect("Should listen");
    assert!(matches!(next_event(&mut events).await, BeaconEvent::Listening(a) if a == addr));
    assert!(beacon.is_listening());
    assert_eq!(beacon.address(), Some(addr));

    // A second listen resolves to the bound address without rebinding
    assert_eq!(beacon.listen(0).await.unwrap(), addr);
    assert!(events.try_recv().is_err());

    beacon.destroy().await;
}

#[tokio::test]
async fn test_concurrent_listens_share_outcome() {
    let net = MemoryNet::new();
    let (beacon, _events) = spawn(memory_options(&net));

    let (a, b) = tokio::join!(beacon.listen(0), beacon.listen(0));
    assert_eq!(a.unwrap(), b.unwrap());

    beacon.destroy().await;
}

#[tokio::test]
async fn test_destroy_twice_closes_once() {
    let net = MemoryNet::new();
    let (beacon, mut events) = spawn(memory_options(&net));
    beacon.listen(0).await.unwrap();

    let other = beacon.clone();
    tokio::join!(beacon.destroy(), other.destroy());
    beacon.destroy().await;

    assert!(beacon.is_destroyed());
    assert!(!beacon.is_listening());

    let mut closes = 0;
    while let Ok(event) = events.try_recv() {
        if let BeaconEvent::Close = event {
            closes += 1;
        }
    }
    assert_eq!(closes, 1, "Close must be emitted exactly once");
}

#[tokio::test]
async fn test_destroy_without_listening() {
    let net = MemoryNet::new();
    let (beacon, mut events) = spawn(memory_options(&net));

    beacon.close().await;
    assert!(matches!(next_event(&mut events).await, BeaconEvent::Close));
    assert!(beacon.is_destroyed());
}

#[tokio::test]
async fn test_destroy_releases_listeners() {
    let net = MemoryNet::new();
    let (beacon, mut events) = spawn(memory_options(&net));
    let addr = beacon.listen(0).await.unwrap();
    assert!(net.is_bound(TransportKind::Tcp, addr.port()));
    assert!(net.is_bound(TransportKind::Quic, addr.port()));

    beacon.destroy().await;
    wait_closed(&mut events).await;

    // Close waits for both listeners
    assert!(!net.is_bound(TransportKind::Tcp, addr.port()));
    assert!(!net.is_bound(TransportKind::Quic, addr.port()));
}

#[tokio::test]
async fn test_operations_after_destroy_are_no_ops() {
    let net = MemoryNet::new();
    let options = memory_options(&net).with_discovery(MemoryDiscovery::new());
    let (beacon, mut events) = spawn(options);
    beacon.destroy().await;
    wait_closed(&mut events).await;

    assert!(matches!(beacon.listen(0).await, Err(BeaconError::Destroyed)));
    beacon.join("topic", JoinOptions::default()).await.unwrap();
    beacon.leave("topic").await;
    beacon
        .connect("127.0.0.1:40000".parse().unwrap(), TransportKind::Tcp)
        .await
        .unwrap();
    beacon.destroy().await;

    assert!(!beacon.is_listening());
    assert_eq!(beacon.total_connections(), 0);
    assert!(beacon.address().is_none());
    assert!(
        tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .map_or(true, |event| event.is_none()),
        "No events after close"
    );
}

#[tokio::test]
async fn test_dropping_every_handle_shuts_down() {
    let net = MemoryNet::new();
    let (beacon, mut events) = spawn(memory_options(&net));
    let addr = beacon.listen(0).await.unwrap();
    assert!(matches!(next_event(&mut events).await, BeaconEvent::Listening(_)));

    drop(beacon);
    assert!(matches!(next_event(&mut events).await, BeaconEvent::Close));
    // The manager task is gone once the stream ends
    assert!(events.recv().await.is_none());
    assert!(!net.is_bound(TransportKind::Tcp, addr.port()));
}

#[tokio::test]
async fn test_destroy_aborts_established_connections() {
    let net = MemoryNet::new();
    let (server, mut server_events) = spawn(memory_options(&net));
    let (client, mut client_events) = spawn(memory_options(&net));

    let addr = server.listen(0).await.unwrap();
    client.connect(addr, TransportKind::Tcp).await.unwrap();

    let (mut conn, _) = next_connection(&mut server_events).await;
    let (_client_conn, _) = next_connection(&mut client_events).await;
    assert_eq!(server.connected(), 1);

    server.destroy().await;

    let mut buf = [0u8; 1];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    eventually(|| server.total_connections() == 0).await;

    client.destroy().await;
}

#[tokio::test]
async fn test_connect_to_nobody_fails() {
    let net = MemoryNet::new();
    let (beacon, _events) = spawn(memory_options(&net));

    let result = beacon
        .connect("127.0.0.1:1".parse().unwrap(), TransportKind::Tcp)
        .await;
    assert!(matches!(result, Err(BeaconError::DialFailed { .. })));
    assert_eq!(beacon.total_connections(), 0);

    beacon.destroy().await;
}

#[tokio::test]
async fn test_connect_over_disabled_transport_fails() {
    let net = MemoryNet::new();
    let (beacon, _events) = spawn(stream_only_options(&net));

    let result = beacon
        .connect("127.0.0.1:1".parse().unwrap(), TransportKind::Quic)
        .await;
    assert!(matches!(
        result,
        Err(BeaconError::TransportDisabled(TransportKind::Quic))
    ));

    beacon.destroy().await;
}

#[tokio::test]
async fn test_destroy_releases_unpolled_connections() {
    let net = MemoryNet::new();
    let (server, mut server_events) = spawn(memory_options(&net));
    let (client, mut client_events) = spawn(memory_options(&net));

    let addr = server.listen(0).await.unwrap();
    client.connect(addr, TransportKind::Tcp).await.unwrap();
    let (_held, _) = next_connection(&mut server_events).await;
    let (mut outbound, _) = next_connection(&mut client_events).await;

    // The server side is never polled again
    server.destroy().await;
    assert_eq!(server.total_connections(), 0);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(500), outbound.read(&mut buf))
        .await
        .expect("Peer should see the hang up");
    assert_eq!(read.unwrap(), 0);
    eventually(|| client.total_connections() == 0).await;

    client.destroy().await;
}

#[tokio::test]
async fn test_destroy_during_handshake_admits_nothing() {
    let net = MemoryNet::new();
    let (server, mut events) = spawn(memory_options(&net));
    let addr = server.listen(0).await.unwrap();

    let _silent = net
        .transport(TransportKind::Tcp)
        .connect(addr)
        .await
        .unwrap();
    eventually(|| server.connecting() == 1).await;

    server.destroy().await;
    assert_eq!(server.total_connections(), 0);
    loop {
        match next_event(&mut events).await {
            BeaconEvent::Connection(..) => panic!("handshaking socket admitted during shutdown"),
            BeaconEvent::Close => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_handshake_finishing_at_shutdown_is_not_kept() {
    let net = MemoryNet::new();
    let gate = Arc::new(Notify::new());
    let factory = {
        let gate = Arc::clone(&gate);
        move |_info: &ConnectionInfo| {
            let gate = Arc::clone(&gate);
            let (stream, wire) = tokio::io::duplex(1024);
            WrappedStream {
                stream: Box::new(stream),
                wire: Box::new(wire),
                handshake: Box::pin(async move {
                    gate.notified().await;
                    Ok::<_, std::io::Error>(Some(PeerId::from_bytes(&b"late"[..])))
                }),
            }
        }
    };
    let (server, mut events) = spawn(memory_options(&net).with_stream(factory));
    let addr = server.listen(0).await.unwrap();

    let _raw = net
        .transport(TransportKind::Tcp)
        .connect(addr)
        .await
        .unwrap();
    eventually(|| server.connecting() == 1).await;

    // The handshake resolves while shutdown is underway
    gate.notify_one();
    server.destroy().await;
    assert_eq!(server.total_connections(), 0);
    assert_eq!(server.connected(), 0);

    loop {
        match next_event(&mut events).await {
            BeaconEvent::Connection(conn, _) => assert!(conn.is_destroyed()),
            BeaconEvent::Close => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_destroy_from_connection_handler() {
    let net = MemoryNet::new();
    let (server, mut server_events) = spawn(memory_options(&net));
    let (client, mut client_events) = spawn(memory_options(&net));

    let addr = server.listen(0).await.unwrap();
    client.connect(addr, TransportKind::Tcp).await.unwrap();

    let handle = server.clone();
    let mut handled = 0;
    loop {
        match next_event(&mut server_events).await {
            BeaconEvent::Connection(conn, _) => {
                handle.destroy().await;
                assert!(conn.is_destroyed());
                handled += 1;
            }
            BeaconEvent::Close => break,
            _ => {}
        }
    }
    assert_eq!(handled, 1);
    assert!(server.is_destroyed());
    assert_eq!(server.total_connections(), 0);

    let _ = next_connection(&mut client_events).await;
    client.destroy().await;
}
