use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tcpcl_core::config::Framing;
use tcpcl_engine::{MemorySink, OutboundBundle, Outduct, OutductRegistry, XmitOutcome};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Simple framing: length-prefixed bundles, no handshake
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_simple_framing_end_to_end() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 0, Framing::Simple), Arc::new(sink.clone()));

    let mut duct = Outduct::new(
        settings("plain", induct.addr, params("dtn://source.dtn", 0, Framing::Simple)),
        OutductRegistry::new(),
        Arc::new(Recorder::default()),
    );

    let large = pattern(70_000);
    let bodies = vec![b"first".to_vec(), large, b"last".to_vec()];
    for (handle, body) in bodies.iter().enumerate() {
        let outcome = duct
            .transmit(OutboundBundle::from_bytes(
                handle as u64,
                "plain",
                Bytes::from(body.clone()),
            ))
            .await;
        assert_eq!(outcome, XmitOutcome::Sent);
    }
    let info = duct.session_info().cloned().expect("session should be up");
    assert_eq!(info.framing, Framing::Simple);
    assert_eq!(info.peer.eid, None);

    assert!(wait_until(|| sink.delivered().len() == 3).await);
    for (bundle, body) in sink.delivered().iter().zip(&bodies) {
        assert_eq!(&bundle.payload[..], &body[..]);
        assert_eq!(bundle.peer.eid, None);
    }

    duct.shutdown().await;
    induct.stop().await;
}

/// A zero length prefix is a keepalive, not an empty bundle.
#[tokio::test]
async fn test_simple_zero_length_is_keepalive() {
    let sink = MemorySink::new();
    let induct = start_induct(params("dtn://sink.dtn", 0, Framing::Simple), Arc::new(sink.clone()));

    let mut client = TcpStream::connect(induct.addr).await.unwrap();
    client.write_all(&[0, 0, 0, 0]).await.unwrap();
    client.write_all(&[0, 0, 0, 3]).await.unwrap();
    client.write_all(b"abc").await.unwrap();

    assert!(wait_until(|| !sink.delivered().is_empty()).await);
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(&delivered[0].payload[..], b"abc");

    drop(client);
    induct.stop().await;
}

/// No contact header goes out, and shutting down just closes the socket.
#[tokio::test]
async fn test_simple_outduct_sends_only_length_prefixed_bundles() {
    let (listener, addr) = raw_listener().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut everything = Vec::new();
        stream.read_to_end(&mut everything).await.unwrap();
        everything
    });

    let mut duct = Outduct::new(
        settings("plain", addr, params("dtn://local.dtn", 0, Framing::Simple)),
        OutductRegistry::new(),
        Arc::new(Recorder::default()),
    );
    let outcome = duct
        .transmit(OutboundBundle::from_bytes(1, "plain", Bytes::from_static(b"hey")))
        .await;
    assert_eq!(outcome, XmitOutcome::Sent);
    duct.shutdown().await;

    let everything = peer.await.unwrap();
    assert_eq!(everything, b"\x00\x00\x00\x03hey");
}
