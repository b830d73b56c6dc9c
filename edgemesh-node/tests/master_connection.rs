//! Master connection state machine tests, driven through an in-process wire
//! transport fake.

mod common;

use common::{metadata, FakeState, FakeWire};
use edgemesh_core::{
    ClosedInfo, ContentMetadata, ContentStore, EdgeMeshError, JobDescriptor, MasterMetadata,
    MemoryContentStore,
    MockLedgerClient, ReportPayload, WireEvent,
};
use edgemesh_node::master::{ConnectionState, MasterConnection, MasterEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    master: Arc<MasterConnection>,
    wire: Arc<FakeWire>,
    state: Arc<FakeState>,
    store: Arc<MemoryContentStore>,
    events: broadcast::Receiver<MasterEvent>,
}

fn harness() -> Harness {
    build_harness(None)
}

fn ledger_harness(ledger: MockLedgerClient) -> Harness {
    build_harness(Some(Arc::new(ledger)))
}

fn build_harness(ledger: Option<Arc<MockLedgerClient>>) -> Harness {
    let (wire, state) = FakeWire::new();
    let store = Arc::new(MemoryContentStore::new());
    let ledger = ledger.map(|l| l as Arc<dyn edgemesh_core::LedgerClient>);
    let master = MasterConnection::new(wire.clone(), store.clone(), ledger, metadata());
    let events = master.subscribe();
    Harness {
        master,
        wire,
        state,
        store,
        events,
    }
}

fn job() -> JobDescriptor {
    JobDescriptor {
        employer_address: "0xemployer".to_string(),
        job_post_address: "0xjobpost".to_string(),
        host: Some("master.example.com".to_string()),
        port: Some(8888),
        block_position: None,
    }
}

async fn expect_event(
    events: &mut broadcast::Receiver<MasterEvent>,
    matcher: impl Fn(&MasterEvent) -> bool,
) -> MasterEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if matcher(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test]
async fn connect_reaches_connected() {
    let mut h = harness();

    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
    h.master.connect("ws://master:8888", None).await.unwrap();
    assert_eq!(h.master.state().await, ConnectionState::Connected);
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 1);

    expect_event(&mut h.events, |e| matches!(e, MasterEvent::Connected)).await;

    // Handshake carried the node metadata, without ledger fields.
    let handshakes = h.state.handshakes.lock();
    assert_eq!(handshakes[0].metadata.node_id, "node-test");
    assert!(handshakes[0].signed.is_none());
}

#[tokio::test]
async fn empty_address_is_ignored() {
    let h = harness();
    h.master.connect("   ", None).await.unwrap();
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_while_connecting_is_a_noop() {
    let h = harness();
    h.state.gated.store(true, Ordering::SeqCst);

    let master = h.master.clone();
    let first = tokio::spawn(async move { master.connect("ws://master:8888", None).await });

    // Wait for the first attempt to reach Connecting.
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.master.state().await != ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Second connect returns immediately without a second open.
    h.master.connect("ws://other:8888", None).await.unwrap();
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.master.state().await, ConnectionState::Connecting);

    h.state.gated.store(false, Ordering::SeqCst);
    h.state.gate.notify_waiters();
    first.await.unwrap().unwrap();
    assert_eq!(h.master.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn handshake_failure_returns_to_disconnected() {
    let mut h = harness();
    h.state.reject.store(true, Ordering::SeqCst);

    let err = h.master.connect("ws://master:8888", None).await.unwrap_err();
    assert!(matches!(err, EdgeMeshError::HandshakeFailed(_)));
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    expect_event(&mut h.events, |e| matches!(e, MasterEvent::Error { .. })).await;
}

#[tokio::test]
async fn close_during_handshake_does_not_resurrect() {
    let h = harness();
    h.state.gated.store(true, Ordering::SeqCst);

    let master = h.master.clone();
    let attempt = tokio::spawn(async move { master.connect("ws://master:8888", None).await });
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.master.state().await != ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.master.close().await;
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    // Release the parked handshake; its completion must be discarded.
    h.state.gated.store(false, Ordering::SeqCst);
    h.state.gate.notify_waiters();
    attempt.await.unwrap().unwrap();
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    // The superseded channel was told to close.
    assert!(!h.state.closes.lock().is_empty());
}

#[tokio::test]
async fn remote_close_emits_closed_and_allows_reconnect() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.wire
        .events()
        .send(WireEvent::Closed(ClosedInfo {
            code: 1012,
            reason: "Restarting".to_string(),
            was_clean: true,
        }))
        .await
        .unwrap();

    let event = expect_event(&mut h.events, |e| matches!(e, MasterEvent::Closed(Some(_)))).await;
    match event {
        MasterEvent::Closed(Some(info)) => assert_eq!(info.code, 1012),
        _ => unreachable!(),
    }
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    // Reconnect with zero delay re-opens against the remembered address.
    h.master.reconnect(0).await;
    expect_event(&mut h.events, |e| matches!(e, MasterEvent::Connected)).await;
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clean_normal_close_emits_closed() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.wire
        .events()
        .send(WireEvent::Closed(ClosedInfo {
            code: 1000,
            reason: "Done".to_string(),
            was_clean: true,
        }))
        .await
        .unwrap();

    let event = expect_event(&mut h.events, |e| matches!(e, MasterEvent::Closed(Some(_)))).await;
    match event {
        MasterEvent::Closed(Some(info)) => assert_eq!(info.code, 1000),
        _ => unreachable!(),
    }
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn unclean_close_surfaces_as_an_error_with_backoff_hint() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.wire
        .events()
        .send(WireEvent::Closed(ClosedInfo {
            code: 1008,
            reason: "Policy violation".to_string(),
            was_clean: false,
        }))
        .await
        .unwrap();

    let event = expect_event(&mut h.events, |e| matches!(e, MasterEvent::Error { .. })).await;
    match event {
        MasterEvent::Error {
            message,
            suggested_backoff_secs,
        } => {
            assert!(message.contains("1008"));
            assert_eq!(suggested_backoff_secs, Some(60));
        }
        _ => unreachable!(),
    }
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn channel_ending_without_a_close_frame_is_an_error() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    // Dropping the sender ends the event stream mid-connection.
    h.wire.event_txs.lock().clear();

    let event = expect_event(&mut h.events, |e| matches!(e, MasterEvent::Error { .. })).await;
    match event {
        MasterEvent::Error {
            message,
            suggested_backoff_secs,
        } => {
            assert!(message.contains("1006"));
            assert_eq!(suggested_backoff_secs, None);
        }
        _ => unreachable!(),
    }
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn close_latches_reconnection_off() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();
    h.master.close().await;

    expect_event(&mut h.events, |e| matches!(e, MasterEvent::Closed(None))).await;

    h.master.reconnect(0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    // An explicit connect clears the latch.
    h.master.connect("ws://master:8888", None).await.unwrap();
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reports_are_dropped_while_disconnected() {
    let h = harness();

    h.master
        .report_uploaded("abc123".to_string(), "1.1.1.1".to_string(), 4096)
        .await;
    assert!(h.state.sent.lock().is_empty());

    h.master.connect("ws://master:8888", None).await.unwrap();
    h.master
        .report_uploaded("abc123".to_string(), "1.1.1.1".to_string(), 4096)
        .await;

    let sent = h.state.sent.lock();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        ReportPayload::Uploaded {
            content_id,
            client_ip,
            byte_count,
        } => {
            assert_eq!(content_id, "abc123");
            assert_eq!(client_ip, "1.1.1.1");
            assert_eq!(*byte_count, 4096);
        }
        other => panic!("unexpected report {other:?}"),
    }
}

#[tokio::test]
async fn clear_event_empties_the_store_and_acks() {
    let h = harness();
    h.store
        .insert("abc123", "a.bin", bytes::Bytes::from_static(b"aaaa"));
    h.store
        .insert("def456", "b.bin", bytes::Bytes::from_static(b"bbbb"));

    h.master.connect("ws://master:8888", None).await.unwrap();

    // An empty id list clears everything.
    h.wire
        .events()
        .send(WireEvent::Clear {
            content_ids: Vec::new(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !h.store.list().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let sent = h.state.sent.lock();
                if sent.iter().any(|r| matches!(r, ReportPayload::Cleared { content_ids } if content_ids.len() == 2)) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    drop(h.events);
}

#[tokio::test]
async fn seed_event_registers_content_and_announces() {
    let h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.wire
        .events()
        .send(WireEvent::Seed {
            metadata: ContentMetadata {
                content_id: "new-content".to_string(),
                piece_count: 4,
                piece_size: 1024 * 1024,
                total_length: 4 * 1024 * 1024,
                source_name: "movie.mp4".to_string(),
            },
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !h.store.list().await.contains(&"new-content".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let sent = h.state.sent.lock();
                if sent.iter().any(|r| matches!(r, ReportPayload::Seeding { .. })) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn work_order_event_is_forwarded() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.wire
        .events()
        .send(WireEvent::WorkOrder {
            address: "0xwork".to_string(),
        })
        .await
        .unwrap();

    let event = expect_event(&mut h.events, |e| matches!(e, MasterEvent::WorkOrder { .. })).await;
    match event {
        MasterEvent::WorkOrder { address } => assert_eq!(address, "0xwork"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn local_disconnect_sends_restarting_close_frame() {
    let mut h = harness();
    h.master.connect("ws://master:8888", None).await.unwrap();

    h.master.disconnect(true).await;
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);

    let closes = h.state.closes.lock();
    assert_eq!(closes[0].0, 1012);
    drop(closes);

    expect_event(&mut h.events, |e| {
        matches!(e, MasterEvent::Closed(Some(info)) if info.code == 1012)
    })
    .await;
}

#[tokio::test]
async fn ledger_handshake_signs_the_nonce() {
    let mut ledger = MockLedgerClient::new();
    ledger
        .expect_sign_message()
        .returning(|_| Ok("0xsignednonce".to_string()));
    ledger
        .expect_recover_address()
        .returning(|_, _| Ok("0xEmployer".to_string()));
    let h = ledger_harness(ledger);

    // The remote presents a signed nonce recovering to the employer, with
    // mixed case to cover the case-insensitive comparison.
    *h.state.remote.lock() = MasterMetadata {
        nonce: Some("feed".to_string()),
        nonce_signed: Some("0xmastersig".to_string()),
    };

    h.master
        .connect("ws://master:8888", Some(job()))
        .await
        .unwrap();
    assert_eq!(h.master.state().await, ConnectionState::Connected);

    let handshakes = h.state.handshakes.lock();
    let signed = handshakes[0].signed.as_ref().expect("ledger fields");
    assert_eq!(signed.nonce_signed, "0xsignednonce");
    assert_eq!(signed.job_post_address, "0xjobpost");
    assert!(!signed.nonce.is_empty());
}

#[tokio::test]
async fn wrong_employer_signature_is_rejected_with_no_fanout_after() {
    let mut ledger = MockLedgerClient::new();
    ledger
        .expect_sign_message()
        .returning(|_| Ok("0xsignednonce".to_string()));
    ledger
        .expect_recover_address()
        .returning(|_, _| Ok("0xsomeoneelse".to_string()));
    let mut h = ledger_harness(ledger);
    *h.state.remote.lock() = MasterMetadata {
        nonce: Some("feed".to_string()),
        nonce_signed: Some("0xmastersig".to_string()),
    };

    let err = h
        .master
        .connect("ws://master:8888", Some(job()))
        .await
        .unwrap_err();
    assert!(matches!(err, EdgeMeshError::HandshakeFailed(_)));
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
    expect_event(&mut h.events, |e| matches!(e, MasterEvent::Error { .. })).await;

    // The torn-down connection must not fan remote events out. The send may
    // fail outright because the receiving side is gone; either way no
    // subscriber sees a work order.
    let _ = h
        .wire
        .events()
        .send(WireEvent::WorkOrder {
            address: "0xwork".to_string(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = h.events.try_recv() {
        assert!(
            !matches!(event, MasterEvent::WorkOrder { .. }),
            "event fanned out after teardown"
        );
    }
}

#[tokio::test]
async fn missing_remote_signature_is_rejected_in_ledger_mode() {
    let mut ledger = MockLedgerClient::new();
    ledger
        .expect_sign_message()
        .returning(|_| Ok("0xsignednonce".to_string()));
    let h = ledger_harness(ledger);
    // Remote sends no nonce fields at all.

    let err = h
        .master
        .connect("ws://master:8888", Some(job()))
        .await
        .unwrap_err();
    assert!(matches!(err, EdgeMeshError::HandshakeFailed(_)));
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn ledger_mode_requires_a_job_descriptor() {
    let h = ledger_harness(MockLedgerClient::new());

    let err = h.master.connect("ws://master:8888", None).await.unwrap_err();
    assert!(matches!(err, EdgeMeshError::MissingJobDescriptor));
    assert_eq!(h.master.state().await, ConnectionState::Disconnected);
    assert_eq!(h.state.opens.load(Ordering::SeqCst), 0);
}
