use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use tcpcl_core::config::Framing;
use tcpcl_core::wire::{DataFlags, SegmentHeader, ShutdownReason, ShutdownSegment};
use tcpcl_engine::outduct::PROTOCOL_NAME;
use tcpcl_engine::{MemorySink, OutboundBundle, Outduct, OutductRegistry, XmitOutcome};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Session lifecycle: handshake, transfer, keepalive, shutdown
// ══════════════════════════════════════════════════════════════════════════════

/// Local asks for 15s, peer for 20s: both sides settle on 15. A 100 KiB
/// bundle goes out as one START|END segment, and an explicit shutdown sends
/// a bare Shutdown segment.
#[tokio::test]
async fn test_keepalive_negotiated_and_single_segment_bundle() {
    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let negotiated = raw_handshake(&mut stream, 20, "dtn://peer.dtn").await;
        let (flags, payload) = read_data(&mut stream).await.unwrap();
        let shutdown = read_segment(&mut stream).await.unwrap();
        (negotiated, flags, payload, shutdown)
    });

    let recorder = Arc::new(Recorder::default());
    let mut duct = Outduct::new(
        settings("relay", addr, params("dtn://local.dtn", 15, Framing::Tcpcl)),
        OutductRegistry::new(),
        recorder.clone(),
    );

    let data = pattern(100 * 1024);
    let outcome = duct
        .transmit(OutboundBundle::from_bytes(7, "relay", Bytes::from(data.clone())))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);

    let info = duct.session_info().cloned().expect("session should be up");
    assert_eq!(info.keepalive, 15);
    assert_eq!(info.peer.eid.as_deref(), Some("dtn://peer.dtn"));
    assert_eq!(info.peer.addr, addr);

    duct.shutdown().await;

    let (negotiated, flags, payload, shutdown) = peer.await.unwrap();
    assert_eq!(negotiated.peer.keepalive, 15);
    assert_eq!(negotiated.keepalive, 15);
    assert_eq!(negotiated.peer.local_eid, "dtn://local.dtn");
    assert_eq!(flags, DataFlags::SINGLE);
    assert_eq!(payload, data);
    assert_eq!(shutdown, SegmentHeader::Shutdown(ShutdownSegment::default()));

    assert_eq!(*recorder.successes.lock().unwrap(), vec![(7, 100 * 1024)]);
    assert!(recorder.failures.lock().unwrap().is_empty());
}

/// With a 1s keepalive the idle outduct keeps the link warm, then closes it
/// with Shutdown(Idle) once the idle limit passes.
#[tokio::test]
async fn test_keepalives_then_idle_shutdown() {
    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_handshake(&mut stream, 1, "dtn://peer.dtn").await;
        let (_, payload) = read_data(&mut stream).await.unwrap();

        let mut keepalives = 0;
        loop {
            match read_segment(&mut stream).await.unwrap() {
                SegmentHeader::Keepalive => keepalives += 1,
                SegmentHeader::Shutdown(shutdown) => return (payload, keepalives, shutdown),
                other => panic!("unexpected segment {other:?}"),
            }
        }
    });

    let mut duct_settings = settings("relay", addr, params("dtn://local.dtn", 1, Framing::Tcpcl));
    duct_settings.idle_shutdown = Some(Duration::from_millis(2500));

    let recorder = Arc::new(Recorder::default());
    let (queue_tx, queue_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(
        Outduct::new(duct_settings, OutductRegistry::new(), recorder.clone())
            .run(queue_rx, shutdown_rx),
    );

    queue_tx
        .send(OutboundBundle::from_bytes(1, "relay", Bytes::from_static(b"ping")))
        .await
        .unwrap();

    let (payload, keepalives, shutdown) = tokio::time::timeout(Duration::from_secs(10), peer)
        .await
        .expect("peer should see an idle shutdown")
        .unwrap();
    assert_eq!(payload, b"ping");
    assert!(keepalives >= 1, "expected keepalives before shutdown");
    assert_eq!(shutdown.reason, Some(ShutdownReason::Idle));
    assert_eq!(shutdown.delay, None);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert!(recorder.blocked.lock().unwrap().is_empty());
}

/// Outduct into a real induct: bundles arrive in order with the sender's
/// EID, and the registry tracks the connection while it is up.
#[tokio::test]
async fn test_outduct_to_induct_end_to_end() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 15, Framing::Tcpcl), Arc::new(sink.clone()));

    let registry = OutductRegistry::new();
    let recorder = Arc::new(Recorder::default());
    let mut duct = Outduct::new(
        settings("to-sink", induct.addr, params("dtn://source.dtn", 15, Framing::Tcpcl)),
        registry.clone(),
        recorder.clone(),
    );

    let bodies: [&'static [u8]; 3] = [b"alpha", b"bravo", b""];
    for (handle, body) in bodies.into_iter().enumerate() {
        let outcome = duct
            .transmit(OutboundBundle::from_bytes(
                handle as u64,
                "to-sink",
                Bytes::from_static(body),
            ))
            .await;
        assert_eq!(outcome, XmitOutcome::Sent);
    }

    let entry = registry.lookup(&induct.addr).expect("connection should be registered");
    assert_eq!(entry.protocol, PROTOCOL_NAME);
    assert_eq!(entry.duct, "to-sink");

    assert!(wait_until(|| sink.delivered().len() == 3).await);
    let delivered = sink.delivered();
    for (bundle, body) in delivered.iter().zip(bodies) {
        assert_eq!(&bundle.payload[..], body);
        assert_eq!(bundle.peer.eid.as_deref(), Some("dtn://source.dtn"));
    }

    duct.shutdown().await;
    assert!(registry.is_empty());
    assert!(wait_until(|| induct.connections.is_empty()).await);

    induct.stop().await;
}

/// A hand-driven client talks to a real induct: keepalive settles on 15,
/// one 100 KiB bundle is delivered, a keepalive is ignored, and a
/// Shutdown(Idle) makes the induct hang up and drop the connection.
#[tokio::test]
async fn test_induct_serves_bundle_keepalive_and_idle_shutdown() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 15, Framing::Tcpcl), Arc::new(sink.clone()));

    let mut client = tokio::net::TcpStream::connect(induct.addr).await.unwrap();
    let negotiated = raw_handshake(&mut client, 20, "dtn://client.dtn").await;
    assert_eq!(negotiated.keepalive, 15);
    assert_eq!(negotiated.peer.local_eid, "dtn://sink.dtn");

    let data = pattern(100 * 1024);
    write_data(&mut client, DataFlags::SINGLE, &data).await;
    client.write_all(&[0x40]).await.unwrap();
    write_shutdown(&mut client, ShutdownSegment::from_codes(1, -1).unwrap()).await;

    // The induct closes its side once the receive loop stops.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload.len(), 100 * 1024);
    assert_eq!(&delivered[0].payload[..], &data[..]);
    assert_eq!(delivered[0].peer.eid.as_deref(), Some("dtn://client.dtn"));
    assert!(wait_until(|| induct.connections.is_empty()).await);

    induct.stop().await;
}
