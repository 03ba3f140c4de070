use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tcpcl_core::config::Framing;
use tcpcl_core::wire::{ContactHeader, DataFlags, SegmentHeader, ShutdownReason, ShutdownSegment};
use tcpcl_engine::{DuctState, MemorySink, OutboundBundle, Outduct, OutductRegistry, XmitOutcome};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Failures: shutdowns, resets, bad peers
// ══════════════════════════════════════════════════════════════════════════════

/// A Shutdown arriving mid-bundle discards the partial bundle but keeps
/// the ones already delivered.
#[tokio::test]
async fn test_shutdown_mid_stream_discards_partial_bundle() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 0, Framing::Tcpcl), Arc::new(sink.clone()));

    let mut client = TcpStream::connect(induct.addr).await.unwrap();
    raw_handshake(&mut client, 0, "dtn://raw.dtn").await;
    write_data(&mut client, DataFlags::SINGLE, b"kept").await;
    write_data(&mut client, DataFlags::FIRST, b"hello").await;
    write_shutdown(
        &mut client,
        ShutdownSegment {
            reason: Some(ShutdownReason::Busy),
            delay: Some(30),
        },
    )
    .await;

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(wait_until(|| induct.connections.is_empty()).await);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(&delivered[0].payload[..], b"kept");

    induct.stop().await;
}

/// The peer resets the connection between bundles; the next bundle on the
/// same outduct reconnects straight away instead of waiting out a backoff.
#[tokio::test]
async fn test_reset_between_bundles_reconnects() {
    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        raw_handshake(&mut first, 0, "dtn://peer.dtn").await;
        let (_, before) = read_data(&mut first).await.unwrap();
        SockRef::from(&first).set_linger(Some(Duration::ZERO)).unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        raw_handshake(&mut second, 0, "dtn://peer.dtn").await;
        let (_, after) = read_data(&mut second).await.unwrap();
        (before, after)
    });

    let recorder = Arc::new(Recorder::default());
    let registry = OutductRegistry::new();
    let mut duct = Outduct::new(
        settings("relay", addr, params("dtn://local.dtn", 0, Framing::Tcpcl)),
        registry.clone(),
        recorder.clone(),
    );

    let outcome = duct
        .transmit(OutboundBundle::from_bytes(1, "relay", Bytes::from_static(b"before")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);

    // Let the reset reach the session's receiver.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = duct
        .transmit(OutboundBundle::from_bytes(2, "relay", Bytes::from_static(b"after")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);
    assert_eq!(duct.state(), DuctState::Idle);

    let (before, after) = peer.await.unwrap();
    assert_eq!(before, b"before");
    assert_eq!(after, b"after");

    assert_eq!(*recorder.successes.lock().unwrap(), vec![(1, 6), (2, 5)]);
    assert!(recorder.failures.lock().unwrap().is_empty());
    assert!(recorder.blocked.lock().unwrap().is_empty());
    assert_eq!(registry.len(), 1);
}

/// The peer resets the connection in the middle of a large bundle. That
/// bundle goes to `xmit_failure`, and the same outduct delivers the next
/// one over a fresh connection.
#[tokio::test]
async fn test_reset_mid_transfer_then_reconnect() {
    const LARGE: usize = 64 * 1024 * 1024;

    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        raw_handshake(&mut first, 0, "dtn://peer.dtn").await;
        let header = read_segment(&mut first).await.unwrap();
        SockRef::from(&first).set_linger(Some(Duration::ZERO)).unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        raw_handshake(&mut second, 0, "dtn://peer.dtn").await;
        let (_, payload) = read_data(&mut second).await.unwrap();
        (header, payload)
    });

    let recorder = Arc::new(Recorder::default());
    let mut duct = Outduct::new(
        settings("relay", addr, params("dtn://local.dtn", 0, Framing::Tcpcl)),
        OutductRegistry::new(),
        recorder.clone(),
    );

    let outcome = duct
        .transmit(OutboundBundle::from_bytes(1, "relay", Bytes::from(vec![0x5a; LARGE])))
        .await;
    assert_eq!(outcome, XmitOutcome::Failed);
    assert!(duct.is_blocked());
    assert_eq!(duct.state(), DuctState::Disconnected);
    assert_eq!(*recorder.failures.lock().unwrap(), vec![1]);

    let outcome = duct
        .transmit(OutboundBundle::from_bytes(2, "relay", Bytes::from_static(b"retry")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);
    assert!(!duct.is_blocked());

    let (header, payload) = peer.await.unwrap();
    assert_eq!(
        header,
        SegmentHeader::Data {
            flags: DataFlags::SINGLE,
            length: LARGE as u64,
        }
    );
    assert_eq!(payload, b"retry");
    assert_eq!(*recorder.successes.lock().unwrap(), vec![(2, 5)]);
    assert_eq!(*recorder.blocked.lock().unwrap(), vec!["relay".to_string()]);
    assert_eq!(*recorder.unblocked.lock().unwrap(), vec!["relay".to_string()]);
}

/// A client with a bad magic is dropped without disturbing a healthy
/// session on the same induct.
#[tokio::test]
async fn test_bad_header_does_not_affect_other_sessions() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 0, Framing::Tcpcl), Arc::new(sink.clone()));

    let recorder = Arc::new(Recorder::default());
    let mut duct = Outduct::new(
        settings("to-sink", induct.addr, params("dtn://source.dtn", 0, Framing::Tcpcl)),
        OutductRegistry::new(),
        recorder.clone(),
    );
    let outcome = duct
        .transmit(OutboundBundle::from_bytes(1, "to-sink", Bytes::from_static(b"one")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);

    let mut bad = TcpStream::connect(induct.addr).await.unwrap();
    bad.write_all(b"xtn!").await.unwrap();
    let mut rest = Vec::new();
    bad.read_to_end(&mut rest).await.unwrap();
    assert!(rest.starts_with(b"dtn!"));

    let outcome = duct
        .transmit(OutboundBundle::from_bytes(2, "to-sink", Bytes::from_static(b"two")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);

    assert!(wait_until(|| sink.delivered().len() == 2).await);
    let payloads: Vec<Bytes> = sink.delivered().into_iter().map(|b| b.payload).collect();
    assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    assert!(wait_until(|| induct.connections.len() == 1).await);

    duct.shutdown().await;
    induct.stop().await;
}

/// A peer advertising version 2 fails the handshake: the duct blocks,
/// arms its backoff, and refuses the next bundle without connecting.
#[tokio::test]
async fn test_old_peer_version_blocks_outduct() {
    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let header = ContactHeader {
            version: 2,
            ..ContactHeader::local(0, "dtn://old.dtn")
        };
        write_contact_header(&mut stream, &header).await;
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let recorder = Arc::new(Recorder::default());
    let mut duct = Outduct::new(
        settings("relay", addr, params("dtn://local.dtn", 0, Framing::Tcpcl)),
        OutductRegistry::new(),
        recorder.clone(),
    );

    let first = duct
        .transmit(OutboundBundle::from_bytes(1, "relay", Bytes::from_static(b"x")))
        .await;
    assert_eq!(first, XmitOutcome::Failed);
    assert!(duct.is_blocked());

    let second = duct
        .transmit(OutboundBundle::from_bytes(2, "relay", Bytes::from_static(b"y")))
        .await;
    assert_eq!(second, XmitOutcome::Deferred);

    assert_eq!(*recorder.failures.lock().unwrap(), vec![1, 2]);
    assert_eq!(*recorder.blocked.lock().unwrap(), vec!["relay".to_string()]);
    peer.await.unwrap();
}
