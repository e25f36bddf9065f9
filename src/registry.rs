//! Peer Registry (C3).
//!
//! Maintains the local view of the network: announces the local peer,
//! ingests announcements/status/validation traffic from the Signaling
//! Adapter, measures local capabilities, validates candidates, and answers
//! scored + diversity-constrained candidate queries for the Circuit
//! Builder.
//!
//! Grounded in the donor's `auth.rs` `MembershipState` (hash-map-of-entries
//! shape) for the peer table, and in the pack's
//! `botho-project-botho/botho/src/network/reputation.rs` for the weighted
//! scoring idiom — adapted to spec.md's exact formula and thresholds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use x25519_dalek::PublicKey as X25519Public;

use crate::config::CoreConfig;
use crate::crypto::ed25519_pubkey_to_x25519;
use crate::identity::{now_monotonic_ms, NodeIdentity, PeerId};
use crate::signaling::{SignalingAdapter, SignalingError};
use crate::wire::{CapabilitiesWire, LocationHint, PeerStatus, Role, SignalingMessage};

pub const STALENESS_WINDOW: Duration = Duration::from_secs(30);
const MIN_BANDWIDTH_BPS: f64 = 50.0 * 1024.0;
const MAX_LATENCY_MS: f64 = 1000.0;
const MIN_UPTIME: Duration = Duration::from_secs(5 * 60);
const MIN_RELIABILITY: f64 = 0.8;
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const BANDWIDTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
const BANDWIDTH_WINDOW: usize = 5;
const DEFAULT_BANDWIDTH_BPS: f64 = 1024.0 * 1024.0;
const ROLE_ROTATION_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such peer")]
    UnknownPeer,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("validation timed out")]
    ValidationTimeout,
    #[error("insufficient peers to fill all requested slots")]
    InsufficientPeers,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl From<LocationHint> for Location {
    fn from(h: LocationHint) -> Self {
        Location { latitude: h.latitude, longitude: h.longitude, accuracy: h.accuracy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    NorthAmerica,
    Europe,
    Asia,
    SouthAmerica,
    Africa,
    Oceania,
    Unknown,
}

/// Six fixed continental bounding boxes (lat_min, lat_max, lon_min, lon_max);
/// anything matching none of them, or a peer with no `location`, is
/// `Unknown`.
const BOUNDING_BOXES: [(Region, f64, f64, f64, f64); 6] = [
    (Region::NorthAmerica, 5.0, 83.0, -168.0, -52.0),
    (Region::SouthAmerica, -56.0, 13.0, -82.0, -34.0),
    (Region::Europe, 35.0, 71.0, -25.0, 45.0),
    (Region::Africa, -35.0, 38.0, -18.0, 52.0),
    (Region::Asia, -11.0, 81.0, 45.0, 180.0),
    (Region::Oceania, -50.0, 0.0, 110.0, 180.0),
];

pub fn region_for(location: Option<&Location>) -> Region {
    let Some(loc) = location else { return Region::Unknown };
    for (region, lat_min, lat_max, lon_min, lon_max) in BOUNDING_BOXES {
        if loc.latitude >= lat_min
            && loc.latitude <= lat_max
            && loc.longitude >= lon_min
            && loc.longitude <= lon_max
        {
            return region;
        }
    }
    Region::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub max_bandwidth_bps: f64,
    pub latency_ms: f64,
    pub reliability: f64,
    pub uptime_ms: u64,
}

impl Capabilities {
    pub fn unknown() -> Self {
        Capabilities {
            max_bandwidth_bps: 0.0,
            latency_ms: f64::INFINITY,
            reliability: 1.0,
            uptime_ms: 0,
        }
    }

    pub fn meets_admission_thresholds(&self) -> bool {
        self.max_bandwidth_bps >= MIN_BANDWIDTH_BPS
            && self.latency_ms.is_finite()
            && self.latency_ms <= MAX_LATENCY_MS
            && self.uptime_ms >= MIN_UPTIME.as_millis() as u64
            && self.reliability >= MIN_RELIABILITY
    }

    fn from_wire(w: &CapabilitiesWire) -> Self {
        Capabilities {
            max_bandwidth_bps: w.max_bandwidth_bps,
            latency_ms: w.latency_ms,
            reliability: w.reliability,
            uptime_ms: w.uptime_ms,
        }
    }

    fn to_wire(self) -> CapabilitiesWire {
        CapabilitiesWire {
            max_bandwidth_bps: self.max_bandwidth_bps,
            latency_ms: self.latency_ms,
            reliability: self.reliability,
            uptime_ms: self.uptime_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub role: Role,
    pub status: PeerStatus,
    pub raw_public_key: [u8; 32],
    pub location: Option<Location>,
    pub capabilities: Capabilities,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn public_key(&self) -> X25519Public {
        ed25519_pubkey_to_x25519(&self.raw_public_key)
    }

    /// Invariant (ii): a peer silent past the staleness window reads as
    /// Offline regardless of its last reported status.
    pub fn effective_status(&self) -> PeerStatus {
        if self.last_seen.elapsed() > STALENESS_WINDOW {
            PeerStatus::Offline
        } else {
            self.status
        }
    }

    fn region(&self) -> Region {
        region_for(self.location.as_ref())
    }
}

/// Minimal outbound surface the registry needs from the Signaling Adapter —
/// kept as a trait so registry tests don't need a live transport.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError>;
}

#[async_trait]
impl SignalingPort for SignalingAdapter {
    async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        SignalingAdapter::send(self, msg).await
    }
}

/// Measures local capabilities by touching the (externally-provided) peer
/// link transport. A real implementation opens a transient link to a known
/// test endpoint and times a 256 KiB transfer.
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    async fn transfer_256kib_bps(&self) -> Option<f64>;
    fn platform_downlink_estimate_bps(&self) -> Option<f64> {
        None
    }
}

struct LocalState {
    role: Role,
    status: PeerStatus,
    waiting_started_at: Instant,
    last_rotation: Instant,
    successful_transfers: u64,
    total_transfers: u64,
    bandwidth_samples: VecDeque<f64>,
    last_bandwidth_sample_at: Option<Instant>,
}

pub struct PeerRegistry {
    pub identity: Arc<NodeIdentity>,
    config: CoreConfig,
    signaling: Arc<dyn SignalingPort>,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    local: RwLock<LocalState>,
    pending_validations: Mutex<HashMap<PeerId, oneshot::Sender<(PeerStatus, Capabilities)>>>,
    pending_pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    ping_counter: AtomicU64,
}

impl PeerRegistry {
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: CoreConfig,
        signaling: Arc<dyn SignalingPort>,
    ) -> Arc<Self> {
        Arc::new(PeerRegistry {
            identity,
            config,
            signaling,
            peers: RwLock::new(HashMap::new()),
            local: RwLock::new(LocalState {
                role: Role::Relay,
                status: PeerStatus::Waiting,
                waiting_started_at: Instant::now(),
                last_rotation: Instant::now(),
                successful_transfers: 0,
                total_transfers: 0,
                bandwidth_samples: VecDeque::new(),
                last_bandwidth_sample_at: None,
            }),
            pending_validations: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            ping_counter: AtomicU64::new(1),
        })
    }

    /// Drives the registry from a stream of inbound signaling frames. Spawn
    /// once; runs until the channel closes.
    pub fn spawn_inbound_loop(self: &Arc<Self>, mut inbound: broadcast::Receiver<SignalingMessage>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(msg) => this.handle_inbound(msg).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Announces every 5s while Waiting; spawn once alongside the inbound loop.
    pub fn spawn_announcement_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let status = this.local.read().await.status;
                if status != PeerStatus::Waiting {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                let _ = this.announce_self().await;
                tokio::time::sleep(Duration::from_secs(5)).await;
                this.evaluate_waiting_window().await;
            }
        });
    }

    async fn announce_self(&self) -> Result<(), SignalingError> {
        let local = self.local.read().await;
        let msg = SignalingMessage::NodeAnnouncement {
            node_id: self.identity.peer_id.to_hex(),
            role: local.role,
            status: local.status,
            public_key: BASE64.encode(self.identity.public_key_bytes),
            location: None,
        };
        drop(local);
        self.signaling.send(&msg).await
    }

    /// If at least `min_nodes_required` other peers are Waiting/Available,
    /// promote to Available; otherwise re-enter the waiting window.
    async fn evaluate_waiting_window(&self) {
        let mut local = self.local.write().await;
        if local.status != PeerStatus::Waiting {
            return;
        }
        if local.waiting_started_at.elapsed() < Duration::from_millis(self.config.waiting_period_ms) {
            return;
        }
        let peers = self.peers.read().await;
        let candidates = peers
            .values()
            .filter(|p| matches!(p.effective_status(), PeerStatus::Waiting | PeerStatus::Available))
            .count();
        if candidates >= self.config.min_nodes_required {
            local.status = PeerStatus::Available;
        } else {
            local.waiting_started_at = Instant::now();
        }
    }

    async fn handle_inbound(self: &Arc<Self>, msg: SignalingMessage) {
        match msg {
            SignalingMessage::NodeAnnouncement { node_id, role, status, public_key, location } => {
                self.on_announcement(node_id, role, status, public_key, location).await;
            }
            SignalingMessage::NodeStatus { node_id, status, role } => {
                self.on_status(node_id, status, role).await;
            }
            SignalingMessage::NodeValidation { node_id, target_node_id, timestamp } => {
                self.on_validation_request(node_id, target_node_id, timestamp).await;
            }
            SignalingMessage::NodeValidationResponse { node_id, status, capabilities, .. } => {
                self.on_validation_response(node_id, status, capabilities).await;
            }
            SignalingMessage::NodePing { node_id, target_node_id, timestamp } => {
                self.on_ping(node_id, target_node_id, timestamp).await;
            }
            SignalingMessage::NodePong { timestamp, .. } => {
                self.on_pong(timestamp).await;
            }
            _ => {}
        }
    }

    async fn on_announcement(
        &self,
        node_id: String,
        role: Role,
        status: PeerStatus,
        public_key: String,
        location: Option<LocationHint>,
    ) {
        let Some(peer_id) = PeerId::from_hex(&node_id) else { return };
        if peer_id == self.identity.peer_id {
            return;
        }
        let Ok(raw_key) = BASE64.decode(public_key) else { return };
        if raw_key.len() != 32 {
            return;
        }
        let mut raw_public_key = [0u8; 32];
        raw_public_key.copy_from_slice(&raw_key);

        let mut peers = self.peers.write().await;
        let now = Instant::now();
        match peers.get_mut(&peer_id) {
            Some(existing) => {
                existing.role = role;
                existing.status = status;
                existing.raw_public_key = raw_public_key;
                existing.location = location.map(Location::from);
                existing.last_seen = existing.last_seen.max(now);
            }
            None => {
                peers.insert(
                    peer_id,
                    PeerEntry {
                        peer_id,
                        role,
                        status,
                        raw_public_key,
                        location: location.map(Location::from),
                        capabilities: Capabilities::unknown(),
                        last_seen: now,
                    },
                );
            }
        }
    }

    async fn on_status(&self, node_id: String, status: PeerStatus, role: Option<Role>) {
        let Some(peer_id) = PeerId::from_hex(&node_id) else { return };
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&peer_id) {
            entry.status = status;
            if let Some(r) = role {
                entry.role = r;
            }
            entry.last_seen = entry.last_seen.max(Instant::now());
        }
    }

    async fn on_validation_request(self: &Arc<Self>, requester: String, target: String, timestamp: u64) {
        if target != self.identity.peer_id.to_hex() {
            return;
        }
        let (status, capabilities) = {
            let local = self.local.read().await;
            (local.status, self.local_capabilities(&local))
        };
        let response = SignalingMessage::NodeValidationResponse {
            node_id: self.identity.peer_id.to_hex(),
            target_node_id: requester,
            timestamp,
            status,
            capabilities: capabilities.to_wire(),
        };
        let _ = self.signaling.send(&response).await;
    }

    async fn on_validation_response(&self, node_id: String, status: PeerStatus, capabilities: CapabilitiesWire) {
        let Some(peer_id) = PeerId::from_hex(&node_id) else { return };
        let caps = Capabilities::from_wire(&capabilities);

        if let Some(entry) = self.peers.write().await.get_mut(&peer_id) {
            entry.capabilities = caps;
            entry.status = status;
            entry.last_seen = entry.last_seen.max(Instant::now());
        }

        if let Some(tx) = self.pending_validations.lock().await.remove(&peer_id) {
            let _ = tx.send((status, caps));
        }
    }

    async fn on_ping(&self, requester: String, target: String, timestamp: u64) {
        if target != self.identity.peer_id.to_hex() {
            return;
        }
        let pong = SignalingMessage::NodePong {
            node_id: self.identity.peer_id.to_hex(),
            target_node_id: requester,
            timestamp,
        };
        let _ = self.signaling.send(&pong).await;
    }

    async fn on_pong(&self, timestamp: u64) {
        if let Some(tx) = self.pending_pings.lock().await.remove(&timestamp) {
            let _ = tx.send(());
        }
    }

    fn local_capabilities(&self, local: &LocalState) -> Capabilities {
        let bandwidth = local
            .bandwidth_samples
            .iter()
            .copied()
            .sum::<f64>()
            .checked_div_or(local.bandwidth_samples.len(), DEFAULT_BANDWIDTH_BPS);
        Capabilities {
            max_bandwidth_bps: bandwidth,
            latency_ms: 0.0,
            reliability: reliability_of(local.successful_transfers, local.total_transfers),
            uptime_ms: self.identity.uptime_ms(),
        }
    }

    /// Samples bandwidth at most once per 30s, falling back through a
    /// peer-link transfer, a platform downlink estimate, then a flat
    /// default — smoothed over the last five samples (§4.3).
    pub async fn sample_bandwidth(&self, probe: Option<&dyn BandwidthProbe>) {
        let mut local = self.local.write().await;
        if let Some(last) = local.last_bandwidth_sample_at {
            if last.elapsed() < BANDWIDTH_SAMPLE_INTERVAL {
                return;
            }
        }
        let sample = match probe {
            Some(p) => match p.transfer_256kib_bps().await {
                Some(v) => v,
                None => p.platform_downlink_estimate_bps().unwrap_or(DEFAULT_BANDWIDTH_BPS),
            },
            None => DEFAULT_BANDWIDTH_BPS,
        };
        local.bandwidth_samples.push_back(sample);
        if local.bandwidth_samples.len() > BANDWIDTH_WINDOW {
            local.bandwidth_samples.pop_front();
        }
        local.last_bandwidth_sample_at = Some(Instant::now());
    }

    /// Records the outcome of a transfer, feeding the local reliability
    /// figure reported on future validation responses.
    pub async fn record_transfer_outcome(&self, success: bool) {
        let mut local = self.local.write().await;
        local.total_transfers += 1;
        if success {
            local.successful_transfers += 1;
        }
    }

    /// RTT of a `node_ping`/`node_pong` round trip; `f64::INFINITY` on a 5s
    /// timeout.
    pub async fn measure_latency(&self, target: PeerId) -> f64 {
        let ts = self.ping_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().await.insert(ts, tx);

        let ping = SignalingMessage::NodePing {
            node_id: self.identity.peer_id.to_hex(),
            target_node_id: target.to_hex(),
            timestamp: ts,
        };
        if self.signaling.send(&ping).await.is_err() {
            self.pending_pings.lock().await.remove(&ts);
            return f64::INFINITY;
        }

        let start = Instant::now();
        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(())) => start.elapsed().as_secs_f64() * 1000.0,
            _ => {
                self.pending_pings.lock().await.remove(&ts);
                f64::INFINITY
            }
        }
    }

    /// Sends a `node_validation` request and awaits the response (5s
    /// timeout); admissible iff every threshold in §4.3 holds.
    pub async fn validate(&self, peer_id: PeerId) -> Result<bool, RegistryError> {
        if !self.peers.read().await.contains_key(&peer_id) {
            return Err(RegistryError::UnknownPeer);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_validations.lock().await.insert(peer_id, tx);

        let request = SignalingMessage::NodeValidation {
            node_id: self.identity.peer_id.to_hex(),
            target_node_id: peer_id.to_hex(),
            timestamp: now_monotonic_ms(),
        };
        self.signaling.send(&request).await?;

        match tokio::time::timeout(VALIDATION_TIMEOUT, rx).await {
            Ok(Ok((_status, caps))) => Ok(caps.meets_admission_thresholds()),
            _ => {
                self.pending_validations.lock().await.remove(&peer_id);
                Err(RegistryError::ValidationTimeout)
            }
        }
    }

    pub async fn get_peer(&self, peer_id: PeerId) -> Option<PeerEntry> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    pub async fn available_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.effective_status() == PeerStatus::Available)
            .count()
    }

    pub async fn local_role(&self) -> Role {
        self.local.read().await.role
    }

    pub async fn local_status(&self) -> PeerStatus {
        self.local.read().await.status
    }

    /// Advances the local role along Relay → Entry → Exit → Relay every 30
    /// minutes from the last rotation, announced via `node_status`.
    pub async fn update_status(&self) -> Result<(), SignalingError> {
        let mut rotated = false;
        {
            let mut local = self.local.write().await;
            if local.last_rotation.elapsed() >= ROLE_ROTATION_INTERVAL {
                local.role = local.role.next_in_rotation();
                local.last_rotation = Instant::now();
                rotated = true;
            }
        }
        if rotated {
            let local = self.local.read().await;
            let msg = SignalingMessage::NodeStatus {
                node_id: self.identity.peer_id.to_hex(),
                status: local.status,
                role: Some(local.role),
            };
            drop(local);
            self.signaling.send(&msg).await?;
        }
        Ok(())
    }

    /// Returns `n` validated peers ordered Entry → Relay(s) → Exit, honoring
    /// region diversity (at most two per region) and excluding `exclude`.
    /// Returns an empty vec if any slot cannot be filled.
    pub async fn suitable_relays(&self, n: usize, exclude: &[PeerId]) -> Vec<PeerEntry> {
        if n == 0 {
            return Vec::new();
        }

        let snapshot: Vec<PeerEntry> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| !exclude.contains(&p.peer_id))
                .filter(|p| p.effective_status() != PeerStatus::Offline)
                .cloned()
                .collect()
        };

        let mut admissible = Vec::new();
        for peer in snapshot {
            if self.validate(peer.peer_id).await.unwrap_or(false) {
                admissible.push(peer);
            }
        }

        let mut region_counts: HashMap<Region, u32> = HashMap::new();
        let mut scored: Vec<(f64, PeerEntry)> = Vec::new();
        for peer in admissible {
            let region = peer.region();
            let count = region_counts.entry(region).or_insert(0);
            if *count >= 2 {
                continue;
            }
            *count += 1;
            scored.push((score_peer(&peer.capabilities), peer));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let roles = role_sequence(n);
        let mut chosen: Vec<PeerEntry> = Vec::new();
        let mut rng = rand::thread_rng();

        for role in roles {
            let pool: Vec<&(f64, PeerEntry)> = scored
                .iter()
                .filter(|(_, p)| p.role == role && !chosen.iter().any(|c| c.peer_id == p.peer_id))
                .take(3)
                .collect();
            let Some((_, picked)) = pool.choose(&mut rng) else {
                return Vec::new();
            };
            chosen.push((*picked).clone());
        }

        chosen
    }
}

fn reliability_of(successful: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        successful as f64 / total.max(1) as f64
    }
}

fn score_peer(caps: &Capabilities) -> f64 {
    let bw_term = 0.3 * (caps.max_bandwidth_bps / (1024.0 * 1024.0)).min(1.0);
    let latency_term = 0.2 * (1.0 - caps.latency_ms / 1000.0).max(0.0);
    let reliability_term = 0.3 * caps.reliability;
    let uptime_hours_24 = 24.0 * 3600.0 * 1000.0;
    let uptime_term = 0.2 * (caps.uptime_ms as f64 / uptime_hours_24).min(1.0);
    bw_term + latency_term + reliability_term + uptime_term
}

/// [Entry, Relay×(n-2), Exit] for n ≥ 2; a single-hop request still needs an
/// Entry role to anchor the one slot.
fn role_sequence(n: usize) -> Vec<Role> {
    if n == 1 {
        return vec![Role::Entry];
    }
    let mut roles = vec![Role::Entry];
    roles.extend(std::iter::repeat(Role::Relay).take(n.saturating_sub(2)));
    roles.push(Role::Exit);
    roles
}

trait CheckedDiv {
    fn checked_div_or(self, count: usize, default: f64) -> f64;
}

impl CheckedDiv for f64 {
    fn checked_div_or(self, count: usize, default: f64) -> f64 {
        if count == 0 {
            default
        } else {
            self / count as f64
        }
    }
}
