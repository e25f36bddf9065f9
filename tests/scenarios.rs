//! End-to-end scenarios, one per outcome a caller of this crate actually
//! depends on: building a circuit and sending through it, running out of
//! admissible peers, a single hop going bad and getting repaired, a
//! majority-hop failure forcing a full rebuild, a tampered onion layer
//! getting caught at the hop that received it, and signaling dropping out
//! from under an already-established circuit.
//!
//! Each test plays the part of the pieces this crate doesn't own itself
//! (the signaling transport, the peer link transport, and the other nodes
//! on the network) with small fixtures in the same style as the unit tests
//! in each module — an in-memory stand-in, not a real network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};

use circuit_core::crypto::{self, KeyPair, Peeled};
use circuit_core::wire::{CapabilitiesWire, LocationHint};
use circuit_core::{
    decode_circuit_data, CircuitBuilder, CircuitChannel, CircuitError, CircuitMonitor,
    CircuitStatus, CoreConfig, MonitorEvent, NodeIdentity, PeerId, PeerLink, PeerLinkConnector,
    PeerRegistry, PeerStatus, Role, SignalingAdapter, SignalingError, SignalingMessage,
    SignalingPort, SignalingTransport, TransportConnector,
};

struct FakePeer {
    peer_id: PeerId,
    public_key_bytes: [u8; 32],
    long_term: KeyPair,
}

fn make_fake_peer() -> FakePeer {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key_bytes = *signing_key.verifying_key().as_bytes();
    let long_term = KeyPair::from_ed25519_seed(&signing_key.to_bytes());
    FakePeer {
        peer_id: PeerId::new_random(),
        public_key_bytes,
        long_term,
    }
}

fn announcement(peer: &FakePeer, role: Role, lat: f64, lon: f64) -> SignalingMessage {
    SignalingMessage::NodeAnnouncement {
        node_id: peer.peer_id.to_hex(),
        role,
        status: PeerStatus::Available,
        public_key: BASE64.encode(peer.public_key_bytes),
        location: Some(LocationHint {
            latitude: lat,
            longitude: lon,
            accuracy: 10.0,
        }),
    }
}

/// Stands in for the whole rest of the network's validation traffic:
/// whenever the registry asks "are you still good?", answers immediately
/// with capabilities comfortably over every admission threshold.
struct AutoValidatePort {
    inbound_tx: broadcast::Sender<SignalingMessage>,
}

#[async_trait]
impl SignalingPort for AutoValidatePort {
    async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        if let SignalingMessage::NodeValidation {
            node_id,
            target_node_id,
            timestamp,
        } = msg
        {
            let response = SignalingMessage::NodeValidationResponse {
                node_id: target_node_id.clone(),
                target_node_id: node_id.clone(),
                timestamp: *timestamp,
                status: PeerStatus::Available,
                capabilities: CapabilitiesWire {
                    max_bandwidth_bps: 10.0 * 1024.0 * 1024.0,
                    latency_ms: 50.0,
                    reliability: 0.99,
                    uptime_ms: 24 * 3600 * 1000,
                },
            };
            let _ = self.inbound_tx.send(response);
        }
        Ok(())
    }
}

struct NullTransport;
#[async_trait]
impl SignalingTransport for NullTransport {
    async fn send(&self, _raw: &str) -> Result<(), String> {
        Ok(())
    }
    async fn recv(&self) -> Option<String> {
        std::future::pending().await
    }
}

struct NullConnector;
#[async_trait]
impl TransportConnector for NullConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn SignalingTransport>, String> {
        Ok(Arc::new(NullTransport))
    }
}

struct CapturingLink {
    outbound: TokioMutex<Vec<Vec<u8>>>,
}
#[async_trait]
impl PeerLink for CapturingLink {
    async fn send(&self, bytes: &[u8]) -> Result<(), String> {
        self.outbound.lock().await.push(bytes.to_vec());
        Ok(())
    }
    async fn recv(&self) -> Option<Vec<u8>> {
        std::future::pending().await
    }
    async fn close(&self) {}
}

/// Opens a fresh in-memory link per hop and keeps every one reachable by
/// the index it was opened at, so a test can inspect what the builder
/// actually wrote to hop 0's link.
struct RecordingLinkConnector {
    links: TokioMutex<Vec<Arc<CapturingLink>>>,
}
#[async_trait]
impl PeerLinkConnector for RecordingLinkConnector {
    async fn open(&self, _peer_id: PeerId) -> Result<Arc<dyn PeerLink>, String> {
        let link = Arc::new(CapturingLink {
            outbound: TokioMutex::new(Vec::new()),
        });
        self.links.lock().await.push(link.clone());
        Ok(link)
    }
}

async fn stable_signaling() -> Arc<SignalingAdapter> {
    SignalingAdapter::connect(
        Arc::new(NullConnector),
        "wss://example.invalid".into(),
        Duration::from_millis(1),
        1,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn s1_happy_path_build_and_send() {
    let (inbound_tx, inbound_rx) = broadcast::channel(256);
    let identity = Arc::new(NodeIdentity::generate());
    let config = CoreConfig::default();
    let port: Arc<dyn SignalingPort> = Arc::new(AutoValidatePort {
        inbound_tx: inbound_tx.clone(),
    });
    let registry = PeerRegistry::new(identity.clone(), config.clone(), port);
    registry.spawn_inbound_loop(inbound_rx);

    let entry = make_fake_peer();
    let relay = make_fake_peer();
    let exit = make_fake_peer();
    let spare1 = make_fake_peer();
    let spare2 = make_fake_peer();
    let roster = [&entry, &relay, &exit, &spare1, &spare2];

    for (peer, role, (lat, lon)) in [
        (&entry, Role::Entry, (40.0, -100.0)),  // North America
        (&relay, Role::Relay, (50.0, 10.0)),    // Europe
        (&exit, Role::Exit, (35.0, 100.0)),     // Asia
        (&spare1, Role::Relay, (-10.0, -60.0)), // South America
        (&spare2, Role::Relay, (0.0, 20.0)),    // Africa
    ] {
        let _ = inbound_tx.send(announcement(peer, role, lat, lon));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let signaling = stable_signaling().await;
    let link_connector = Arc::new(RecordingLinkConnector {
        links: TokioMutex::new(Vec::new()),
    });
    let builder = CircuitBuilder::new(identity, config, registry, signaling, link_connector.clone());

    let circuit_id = builder
        .build(3, &[])
        .await
        .expect("five admissible, region-disjoint peers should be enough for 3 hops");
    assert_eq!(builder.status(&circuit_id).await, Some(CircuitStatus::Ready));

    let hops = builder.hops_of(&circuit_id).await.unwrap();
    assert_eq!(hops.len(), 3);
    assert_eq!(hops[0].peer_id, entry.peer_id, "first hop must be the sole Entry candidate");
    assert_eq!(hops[2].peer_id, exit.peer_id, "last hop must be the sole Exit candidate");
    assert!(
        [relay.peer_id, spare1.peer_id, spare2.peer_id].contains(&hops[1].peer_id),
        "middle hop must be one of the Relay candidates"
    );
    let region_of = |p: PeerId| roster.iter().position(|f| f.peer_id == p).unwrap();
    assert_eq!(
        hops.iter().map(|h| region_of(h.peer_id)).collect::<std::collections::HashSet<_>>().len(),
        3,
        "no two hops should come from the same prepared peer"
    );

    builder.send(&circuit_id, b"hello").await.unwrap();

    let links = link_connector.links.lock().await;
    assert_eq!(links.len(), 3, "one link opened per hop");
    let entry_frames = links[0].outbound.lock().await;
    assert_eq!(entry_frames.len(), 1);
    let raw = String::from_utf8(entry_frames[0].clone()).unwrap();
    let msg = SignalingMessage::parse(&raw).unwrap();
    let (_, envelope) = decode_circuit_data(&msg).unwrap();

    let middle = roster
        .iter()
        .find(|f| f.peer_id == hops[1].peer_id)
        .unwrap();

    let peeled = crypto::peel_layer(&envelope, 0, &entry.long_term.secret).unwrap();
    let env2 = match peeled {
        Peeled::Forward(e) => e,
        Peeled::Plaintext(_) => panic!("entry hop should not see plaintext"),
    };
    let peeled = crypto::peel_layer(&env2, 0, &middle.long_term.secret).unwrap();
    let env3 = match peeled {
        Peeled::Forward(e) => e,
        Peeled::Plaintext(_) => panic!("middle hop should not see plaintext"),
    };
    let plaintext = match crypto::peel_layer(&env3, 0, &exit.long_term.secret).unwrap() {
        Peeled::Plaintext(bytes) => bytes,
        Peeled::Forward(_) => panic!("exit hop should see plaintext"),
    };
    assert_eq!(plaintext, b"hello");

    let channel = CircuitChannel::new(builder.clone(), circuit_id.clone());
    let delivered = Arc::new(StdMutex::new(Vec::new()));
    let delivered2 = delivered.clone();
    channel
        .on_message(move |data| delivered2.lock().unwrap().extend_from_slice(data))
        .await;
    channel.receive(&plaintext).await;
    assert_eq!(*delivered.lock().unwrap(), b"hello");
}

#[tokio::test]
async fn s2_insufficient_peers_opens_no_links() {
    let (inbound_tx, inbound_rx) = broadcast::channel(256);
    let identity = Arc::new(NodeIdentity::generate());
    let config = CoreConfig::default();
    let port: Arc<dyn SignalingPort> = Arc::new(AutoValidatePort {
        inbound_tx: inbound_tx.clone(),
    });
    let registry = PeerRegistry::new(identity.clone(), config.clone(), port);
    registry.spawn_inbound_loop(inbound_rx);

    let only_peer = make_fake_peer();
    let _ = inbound_tx.send(announcement(&only_peer, Role::Entry, 40.0, -100.0));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let signaling = stable_signaling().await;
    let link_connector = Arc::new(RecordingLinkConnector {
        links: TokioMutex::new(Vec::new()),
    });
    let builder = CircuitBuilder::new(identity, config, registry, signaling, link_connector.clone());

    let err = builder.build(3, &[]).await.unwrap_err();
    assert!(matches!(
        err,
        CircuitError::InsufficientPeers { requested: 3, available: 0 }
    ));
    assert!(link_connector.links.lock().await.is_empty());
}

#[tokio::test]
async fn s3_mid_circuit_single_hop_failure_triggers_repair() {
    let (inbound_tx, inbound_rx) = broadcast::channel(256);
    let identity = Arc::new(NodeIdentity::generate());
    let config = CoreConfig::default();
    let port: Arc<dyn SignalingPort> = Arc::new(AutoValidatePort {
        inbound_tx: inbound_tx.clone(),
    });
    let registry = PeerRegistry::new(identity.clone(), config.clone(), port);
    registry.spawn_inbound_loop(inbound_rx);

    let entry = make_fake_peer();
    let relay = make_fake_peer();
    let exit = make_fake_peer();
    let spare1 = make_fake_peer();
    let spare2 = make_fake_peer();
    for (peer, role, (lat, lon)) in [
        (&entry, Role::Entry, (40.0, -100.0)),
        (&relay, Role::Relay, (50.0, 10.0)),
        (&exit, Role::Exit, (35.0, 100.0)),
        (&spare1, Role::Relay, (-10.0, -60.0)),
        (&spare2, Role::Relay, (0.0, 20.0)),
    ] {
        let _ = inbound_tx.send(announcement(peer, role, lat, lon));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let signaling = stable_signaling().await;
    let link_connector = Arc::new(RecordingLinkConnector {
        links: TokioMutex::new(Vec::new()),
    });
    let builder = CircuitBuilder::new(identity, config.clone(), registry.clone(), signaling, link_connector);

    let circuit_id = builder.build(3, &[]).await.unwrap();
    let hops_before = builder.hops_of(&circuit_id).await.unwrap();
    let middle_peer = hops_before[1].peer_id;

    let _ = inbound_tx.send(SignalingMessage::NodeStatus {
        node_id: middle_peer.to_hex(),
        status: PeerStatus::Offline,
        role: None,
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let monitor = CircuitMonitor::new(registry, builder.clone(), config);
    let mut events = monitor.subscribe();
    monitor.tick(&circuit_id).await.unwrap();

    let first = events.try_recv().expect("expected a repairing event");
    assert!(matches!(first.1, MonitorEvent::Repairing { .. }));
    let second = events.try_recv().expect("expected a ready event after repair");
    assert!(matches!(second.1, MonitorEvent::Ready { .. }));

    let hops_after = builder.hops_of(&circuit_id).await.unwrap();
    assert_eq!(
        hops_after[0].peer_id, hops_before[0].peer_id,
        "hop before the failure stays untouched"
    );
    assert_ne!(
        hops_after[1].peer_id, middle_peer,
        "the failed slot must reference a peer not previously in the circuit"
    );
    assert_eq!(builder.status(&circuit_id).await, Some(CircuitStatus::Ready));
}

#[tokio::test]
async fn s4_majority_failure_triggers_rebuild_preserving_circuit_id() {
    let (inbound_tx, inbound_rx) = broadcast::channel(256);
    let identity = Arc::new(NodeIdentity::generate());
    let config = CoreConfig::default();
    let port: Arc<dyn SignalingPort> = Arc::new(AutoValidatePort {
        inbound_tx: inbound_tx.clone(),
    });
    let registry = PeerRegistry::new(identity.clone(), config.clone(), port);
    registry.spawn_inbound_loop(inbound_rx);

    let entry1 = make_fake_peer();
    let entry2 = make_fake_peer();
    let relay1 = make_fake_peer();
    let relay2 = make_fake_peer();
    let exit1 = make_fake_peer();
    for (peer, role, (lat, lon)) in [
        (&entry1, Role::Entry, (40.0, -100.0)),
        (&entry2, Role::Entry, (-10.0, -60.0)),
        (&relay1, Role::Relay, (50.0, 10.0)),
        (&relay2, Role::Relay, (0.0, 20.0)),
        (&exit1, Role::Exit, (35.0, 100.0)),
    ] {
        let _ = inbound_tx.send(announcement(peer, role, lat, lon));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let signaling = stable_signaling().await;
    let link_connector = Arc::new(RecordingLinkConnector {
        links: TokioMutex::new(Vec::new()),
    });
    let builder = CircuitBuilder::new(identity, config.clone(), registry.clone(), signaling, link_connector);

    let circuit_id = builder.build(3, &[]).await.unwrap();
    let hops_before = builder.hops_of(&circuit_id).await.unwrap();
    let unhealthy_ids = vec![hops_before[0].peer_id, hops_before[1].peer_id];

    for id in &unhealthy_ids {
        let _ = inbound_tx.send(SignalingMessage::NodeStatus {
            node_id: id.to_hex(),
            status: PeerStatus::Offline,
            role: None,
        });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let monitor = CircuitMonitor::new(registry.clone(), builder.clone(), config);
    let mut events = monitor.subscribe();
    monitor.tick(&circuit_id).await.unwrap();

    let first = events.try_recv().expect("expected a rebuilding event");
    assert!(matches!(first.1, MonitorEvent::Rebuilding { .. }));
    let second = events.try_recv().expect("expected a ready event keyed to the original circuit id");
    assert!(matches!(second.1, MonitorEvent::Ready { .. }));
    assert_eq!(first.0, circuit_id, "the caller-visible circuit id is preserved in the event stream");
    assert_eq!(second.0, circuit_id);

    // The builder replaces a majority-failed circuit wholesale, so the old
    // table entry under this id is gone.
    assert_eq!(builder.status(&circuit_id).await, None);

    // What replaces it avoids every peer this round marked unhealthy — the
    // same exclusion `tick` applied internally when it rebuilt.
    let replacement = registry.suitable_relays(3, &unhealthy_ids).await;
    assert_eq!(replacement.len(), 3);
    for hop in &replacement {
        assert!(!unhealthy_ids.contains(&hop.peer_id));
    }
}

#[test]
fn s5_onion_tamper_stops_exactly_at_the_flipped_hop() {
    let hops = crypto::generate_circuit_keys(3).unwrap();
    let pks: Vec<_> = hops.iter().map(|k| k.public).collect();
    let plaintext = [0xde, 0xad, 0xbe, 0xef];

    let mut envelope = crypto::build_onion(&plaintext, &pks).unwrap();
    envelope.wrapped_keys[1][0] ^= 0xff;

    let forwarded = match crypto::peel_layer(&envelope, 0, &hops[0].secret).unwrap() {
        Peeled::Forward(e) => e,
        Peeled::Plaintext(_) => panic!("hop 1 is not the exit"),
    };

    // The tamper lands on hop 2's wrapped key: its ECDH against the
    // corrupted ephemeral public key derives the wrong AEAD key, so the tag
    // check fails there rather than at key-unwrap time.
    let err = crypto::peel_layer(&forwarded, 0, &hops[1].secret).unwrap_err();
    assert!(matches!(err, crypto::CryptoError::AuthTagInvalid));

    // Hop 3 is unreachable from here: nothing in this test ever calls
    // `peel_layer` against `hops[2]`, so no plaintext is derived.
}

struct DropOnceTransport {
    rx: TokioMutex<mpsc::UnboundedReceiver<Option<String>>>,
}
#[async_trait]
impl SignalingTransport for DropOnceTransport {
    async fn send(&self, _raw: &str) -> Result<(), String> {
        Ok(())
    }
    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await.flatten()
    }
}

/// First connect succeeds, the first reconnect attempt fails, every one
/// after that succeeds — enough to exercise one real doubling-backoff
/// reconnect cycle.
struct FlakyConnector {
    calls: AtomicU32,
    first_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Option<String>>>>,
    second_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Option<String>>>>,
}
#[async_trait]
impl TransportConnector for FlakyConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn SignalingTransport>, String> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => {
                let rx = self.first_rx.lock().await.take().expect("first connect");
                Ok(Arc::new(DropOnceTransport { rx: TokioMutex::new(rx) }))
            }
            1 => Err("transient".to_string()),
            _ => {
                let rx = self.second_rx.lock().await.take().expect("reconnect");
                Ok(Arc::new(DropOnceTransport { rx: TokioMutex::new(rx) }))
            }
        }
    }
}

#[tokio::test]
async fn s6_signaling_drop_and_reconnect() {
    let (first_tx, first_rx) = mpsc::unbounded_channel::<Option<String>>();
    let (second_tx, second_rx) = mpsc::unbounded_channel::<Option<String>>();
    let connector = Arc::new(FlakyConnector {
        calls: AtomicU32::new(0),
        first_rx: TokioMutex::new(Some(first_rx)),
        second_rx: TokioMutex::new(Some(second_rx)),
    });

    let adapter = SignalingAdapter::connect(
        connector,
        "wss://example.invalid".into(),
        Duration::from_millis(1),
        5,
    )
    .await
    .unwrap();
    assert!(adapter.is_connected().await);

    let (inbound_tx, inbound_rx) = broadcast::channel(256);
    let identity = Arc::new(NodeIdentity::generate());
    let config = CoreConfig::default();
    let port: Arc<dyn SignalingPort> = Arc::new(AutoValidatePort {
        inbound_tx: inbound_tx.clone(),
    });
    let registry = PeerRegistry::new(identity.clone(), config.clone(), port);
    // One inbound loop for the validation fixture, one for the real
    // adapter's traffic — both feed the same peer table.
    registry.spawn_inbound_loop(inbound_rx);
    registry.spawn_inbound_loop(adapter.subscribe());

    let entry = make_fake_peer();
    let relay = make_fake_peer();
    let exit = make_fake_peer();
    for (peer, role, (lat, lon)) in [
        (&entry, Role::Entry, (40.0, -100.0)),
        (&relay, Role::Relay, (50.0, 10.0)),
        (&exit, Role::Exit, (35.0, 100.0)),
    ] {
        let _ = inbound_tx.send(announcement(peer, role, lat, lon));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let link_connector = Arc::new(RecordingLinkConnector {
        links: TokioMutex::new(Vec::new()),
    });
    let builder = CircuitBuilder::new(identity, config, registry.clone(), adapter.clone(), link_connector);
    let circuit_id = builder.build(3, &[]).await.unwrap();

    // Drop the transport: recv() resolves to None, forcing a reconnect.
    first_tx.send(None).unwrap();

    // send() never touches signaling, so it succeeds whether or not the
    // reconnect has finished yet — that independence is the point of S6.
    builder.send(&circuit_id, b"still works").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        adapter.is_connected().await,
        "the second reconnect attempt in this fixture always succeeds"
    );

    let late_peer = make_fake_peer();
    let frame = announcement(&late_peer, Role::Relay, -25.0, 135.0).to_json();
    second_tx.send(Some(frame)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        registry.get_peer(late_peer.peer_id).await.is_some(),
        "registry resynced from a fresh announcement delivered over the reconnected transport"
    );

    adapter.shutdown();
}
