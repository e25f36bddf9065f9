//! Module wiring for the circuit engine. No FFI surface — the donor's
//! `uniffi::include_scaffolding!` and its UniFFI-facing wrapper types are
//! gone; this crate is consumed as an ordinary Rust library.
//!
//! `CircuitEngine::bootstrap` plays the role of the donor `store::bootstrap`:
//! one explicit async entry point that wires every component together from
//! caller-supplied parameters rather than reaching for module-level globals
//! (§9 Design Notes).

pub mod channel;
pub mod circuit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod monitor;
pub mod registry;
pub mod signaling;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

pub use channel::{ChannelError, ChannelState, CircuitChannel};
pub use circuit::{
    decode_circuit_data, decode_circuit_signaling, relay_one_layer, CircuitBuilder, CircuitError,
    CircuitStatus, Hop, PeerLink, PeerLinkConnector,
};
pub use config::{CoreConfig, RoleHint};
pub use crypto::{CryptoError, KeyPair};
pub use error::{CoreError, ErrorKind};
pub use identity::{NodeIdentity, PeerId};
pub use monitor::{CircuitMonitor, HealthDetails, MonitorEvent};
pub use registry::{
    BandwidthProbe, Capabilities, PeerEntry, PeerRegistry, Region, RegistryError, SignalingPort,
};
pub use signaling::{
    AdapterEvent, SignalingAdapter, SignalingError, SignalingTransport, TransportConnector,
};
pub use wire::{PeerStatus, Role, SignalingMessage};

/// Every live component for one local node, wired together once at startup.
///
/// `CircuitEngine` models the *originating* role described in §4.4: building
/// circuits, sending through them, and monitoring their health. Acting as a
/// relay for someone else's circuit only needs the stateless primitives
/// `decode_circuit_data`/`relay_one_layer` (onion data) and
/// `decode_circuit_signaling`/`crypto::open_establishment` (establishment
/// records, addressed by attempt-to-decrypt rather than a cleartext
/// recipient field) in `circuit.rs` — spec.md's external collaborators (§1)
/// name a peer-link transport that *opens* outbound links
/// (`PeerLinkConnector`) but no inbound link-acceptance surface, so this
/// crate exposes those primitives for an embedding application to drive
/// from its own inbound-connection handling rather than assuming a
/// dispatch loop here.
pub struct CircuitEngine {
    pub identity: Arc<NodeIdentity>,
    pub config: CoreConfig,
    pub signaling: Arc<SignalingAdapter>,
    pub registry: Arc<PeerRegistry>,
    pub builder: Arc<CircuitBuilder>,
    pub monitor: Arc<CircuitMonitor>,
}

impl CircuitEngine {
    /// Generates a fresh local identity, connects signaling (subject to the
    /// same backoff/cap as later reconnects per §4.2), and spawns the
    /// registry's inbound and announcement loops. Returns once the node is
    /// ready to build circuits.
    pub async fn bootstrap(
        config: CoreConfig,
        transport_connector: Arc<dyn TransportConnector>,
        link_connector: Arc<dyn PeerLinkConnector>,
    ) -> Result<Arc<Self>, CoreError> {
        let identity = Arc::new(NodeIdentity::generate());

        let signaling = SignalingAdapter::connect(
            transport_connector,
            config.signaling_endpoint.clone(),
            Duration::from_millis(config.reconnect_backoff_ms),
            config.max_reconnect_attempts,
        )
        .await?;

        let registry = PeerRegistry::new(identity.clone(), config.clone(), signaling.clone());
        registry.spawn_inbound_loop(signaling.subscribe());
        registry.spawn_announcement_loop();

        let builder = CircuitBuilder::new(
            identity.clone(),
            config.clone(),
            registry.clone(),
            signaling.clone(),
            link_connector,
        );
        let monitor = CircuitMonitor::new(registry.clone(), builder.clone(), config.clone());

        Ok(Arc::new(CircuitEngine {
            identity,
            config,
            signaling,
            registry,
            builder,
            monitor,
        }))
    }

    /// Builds a circuit with `requested_hops` hops (coerced up to
    /// `min_hops`), starts its monitor loop, and returns a channel façade
    /// bound to it.
    pub async fn open_circuit(
        self: &Arc<Self>,
        requested_hops: usize,
        exclude: &[PeerId],
    ) -> Result<Arc<CircuitChannel>, CoreError> {
        let circuit_id = self.builder.build(requested_hops, exclude).await?;
        self.monitor.spawn(circuit_id.clone());
        let channel = CircuitChannel::new(self.builder.clone(), circuit_id);
        channel.connect().await;
        Ok(channel)
    }

    pub fn subscribe_monitor(&self) -> tokio::sync::broadcast::Receiver<(String, MonitorEvent)> {
        self.monitor.subscribe()
    }

    pub fn subscribe_signaling_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
        self.signaling.subscribe_events()
    }

    pub fn shutdown(&self) {
        self.signaling.shutdown();
    }
}
