//! Sync sessions over an in-process duplex stream

use gossiplog::sync::{SyncResponse, SyncSource};
use gossiplog::{GossipLog, LogConfig, MemoryStore, MemoryTree, Node};
use gossiplog_core::KeyPair;
use gossiplog_net::framing::{write_frame, Frame, FrameReader, FrameType};
use gossiplog_net::{serve_sync, SyncClient};
use std::sync::Arc;
use tokio::sync::broadcast;

type Log = GossipLog<String, MemoryStore, MemoryTree>;

fn open_log(seed: u8) -> Arc<Log> {
    let config = LogConfig::new("room").with_keypair(KeyPair::from_seed([seed; 32]));
    Arc::new(GossipLog::open(config, MemoryStore::new(), MemoryTree::new()).unwrap())
}

#[tokio::test]
async fn test_full_sync_over_stream() {
    let responder = open_log(1);
    for i in 0..50 {
        responder.append(format!("message-{i}")).unwrap();
    }
    let initiator = open_log(2);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (shutdown_tx, _) = broadcast::channel(1);
    let server_log = responder.clone();
    let server_rx = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        serve_sync(server_io, server_log.tree(), server_log.store(), server_rx).await
    });

    let mut client = SyncClient::new(client_io);
    let stats = initiator.sync_from("responder", &mut client).await.unwrap();

    assert_eq!(stats.message_count, 50);
    assert_eq!(initiator.len().unwrap(), 50);
    assert_eq!(initiator.root().unwrap(), responder.root().unwrap());

    drop(client);
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bidirectional_convergence_over_streams() {
    let a = open_log(1);
    let b = open_log(2);
    for i in 0..8 {
        a.append(format!("a-{i}")).unwrap();
        b.append(format!("b-{i}")).unwrap();
    }

    for (initiator, responder, peer) in [(&a, &b, "b"), (&b, &a, "a")] {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, _) = broadcast::channel(1);
        let server_log = responder.clone();
        let server_rx = shutdown_tx.subscribe();
        let server_task = tokio::spawn(async move {
            serve_sync(server_io, server_log.tree(), server_log.store(), server_rx).await
        });

        let mut client = SyncClient::new(client_io);
        initiator.sync_from(peer, &mut client).await.unwrap();

        drop(client);
        server_task.await.unwrap().unwrap();
    }

    assert_eq!(a.root().unwrap(), b.root().unwrap());
    assert_eq!(a.len().unwrap(), 16);
    assert_eq!(a.heads(), b.heads());
}

#[tokio::test]
async fn test_server_stops_on_shutdown() {
    let log = open_log(1);
    let (_client_io, server_io) = tokio::io::duplex(1024);
    let (shutdown_tx, server_rx) = broadcast::channel(1);

    let task = tokio::spawn(async move {
        serve_sync(server_io, log.tree(), log.store(), server_rx).await
    });

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_out_of_order_responses_are_parked() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);

    // A responder that answers the first request only after sending an
    // unrelated response for a later sequence number.
    let responder = tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(server_io);
        let mut reader = FrameReader::new(read_half);

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::SyncRequest);

        let stray = SyncResponse::Node { seq: 99, node: None };
        let payload = postcard::to_allocvec(&stray).unwrap();
        write_frame(&mut write_half, Frame::new(FrameType::SyncResponse, payload))
            .await
            .unwrap();

        let root = Node {
            level: 2,
            key: None,
            hash: [7; 32],
        };
        let answer = SyncResponse::Root { seq: 1, root };
        let payload = postcard::to_allocvec(&answer).unwrap();
        write_frame(&mut write_half, Frame::new(FrameType::SyncResponse, payload))
            .await
            .unwrap();
    });

    let mut client = SyncClient::new(client_io);
    let root = client.get_root().await.unwrap();
    assert_eq!(root.level, 2);
    assert_eq!(root.hash, [7; 32]);

    responder.await.unwrap();
}
