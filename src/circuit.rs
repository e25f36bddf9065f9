//! Circuit Builder (C4).
//!
//! Owns the circuit lifetime state machine: candidate selection through C3,
//! sequential per-hop establishment, onion-wrapped sending over the first
//! peer link, and teardown with key zeroing.
//!
//! Grounded in the donor's `onion.rs` (layered build/peel, now generalized
//! to hold a circuit-lifetime ephemeral keypair per hop rather than a
//! fresh one per call) and `sealed_sender.rs` (sealing a record addressed
//! to one recipient under their long-term key) for the per-hop
//! establishment record, and in `network.rs`'s sequential-init-with-timeout
//! shape for the hop-by-hop build loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use x25519_dalek::PublicKey as X25519Public;

use crate::config::CoreConfig;
use crate::crypto::{
    self, build_onion_with_keys, zeroize_keypair, CryptoError, KeyPair, OnionEnvelope, Peeled,
};
use crate::identity::{NodeIdentity, PeerId};
use crate::registry::PeerRegistry;
use crate::signaling::{SignalingAdapter, SignalingError};
use crate::wire::SignalingMessage;

const HOP_ESTABLISH_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("fewer than {requested} suitable peers available ({available} found)")]
    InsufficientPeers { requested: usize, available: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("establishing hop {hop_index} timed out")]
    HopTimeout { hop_index: usize },
    #[error("peer link to hop {hop_index} failed: {reason}")]
    LinkFailed { hop_index: usize, reason: String },
    #[error("circuit is not in a state that permits this operation")]
    InvalidState,
    #[error("no such circuit")]
    UnknownCircuit,
    #[error("circuit is closed")]
    CircuitClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Building,
    Ready,
    Degraded,
    Repairing,
    Rebuilding,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EstablishmentRecord {
    circuit_id: String,
    hop_index: u32,
    previous_hop_id: Option<String>,
    next_hop_public_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct Hop {
    pub peer_id: PeerId,
    pub ephemeral_public_key: X25519Public,
}

/// The externally-provided ordered, reliable byte channel between two
/// peers (spec.md §1: the peer link transport is an out-of-scope
/// collaborator).
#[async_trait::async_trait]
pub trait PeerLink: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<(), String>;
    async fn recv(&self) -> Option<Vec<u8>>;
    async fn close(&self);
}

#[async_trait::async_trait]
pub trait PeerLinkConnector: Send + Sync {
    /// Opens a link to `peer_id`; resolving successfully is this circuit's
    /// "link-open confirmation" (§4.4 step 4).
    async fn open(&self, peer_id: PeerId) -> Result<Arc<dyn PeerLink>, String>;
}

pub struct Circuit {
    pub circuit_id: String,
    pub hops: Vec<Hop>,
    ephemeral_keys: Vec<KeyPair>,
    hop_long_term_keys: Vec<X25519Public>,
    links: Vec<Arc<dyn PeerLink>>,
    pub status: CircuitStatus,
}

impl Circuit {
    /// Onion-wraps `data` over every hop's reused circuit-lifetime
    /// ephemeral key and transmits it over `links[0]`.
    pub async fn send(&self, data: &[u8]) -> Result<(), CircuitError> {
        if self.status != CircuitStatus::Ready {
            return Err(CircuitError::InvalidState);
        }
        let envelope =
            build_onion_with_keys(data, &self.hop_long_term_keys, &self.ephemeral_keys)?;
        let frame = SignalingMessage::CircuitData {
            circuit_id: self.circuit_id.clone(),
            data: BASE64.encode(&envelope.payload),
            keys: envelope.wrapped_keys.iter().map(|k| BASE64.encode(k)).collect(),
            ivs: envelope.ivs.iter().map(|iv| iv.to_vec()).collect(),
        };
        let bytes = frame.to_json().into_bytes();
        self.links[0]
            .send(&bytes)
            .await
            .map_err(|_| CircuitError::CircuitClosed)
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    async fn zero_and_close(&mut self) {
        for link in &self.links {
            link.close().await;
        }
        for kp in &mut self.ephemeral_keys {
            zeroize_keypair(kp);
        }
        self.links.clear();
    }
}

/// Decodes an inbound `circuit_data` wire frame back into an `OnionEnvelope`
/// — used by a relaying hop, not by the circuit's originator.
pub fn decode_circuit_data(msg: &SignalingMessage) -> Option<(String, OnionEnvelope)> {
    let SignalingMessage::CircuitData { circuit_id, data, keys, ivs } = msg else {
        return None;
    };
    let payload = BASE64.decode(data).ok()?;
    let mut wrapped_keys = Vec::with_capacity(keys.len());
    for k in keys {
        let raw = BASE64.decode(k).ok()?;
        if raw.len() != 32 {
            return None;
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&raw);
        wrapped_keys.push(arr);
    }
    let mut parsed_ivs = Vec::with_capacity(ivs.len());
    for iv in ivs {
        if iv.len() != 24 {
            return None;
        }
        let mut arr = [0u8; 24];
        arr.copy_from_slice(iv);
        parsed_ivs.push(arr);
    }
    Some((circuit_id.clone(), OnionEnvelope { payload, wrapped_keys, ivs: parsed_ivs }))
}

/// Decodes an inbound `circuit_signaling` wire frame back into the raw
/// sealed bytes, ready for `crypto::open_establishment` — symmetric to
/// `decode_circuit_data` for the onion-data path. Every node on the
/// signaling channel receives this broadcast undifferentiated; only the
/// hop whose long-term secret opens it successfully was the one addressed.
pub fn decode_circuit_signaling(msg: &SignalingMessage) -> Option<Vec<u8>> {
    let SignalingMessage::CircuitSignaling { sealed_envelope } = msg else {
        return None;
    };
    BASE64.decode(sealed_envelope).ok()
}

/// Relays one layer on behalf of an intermediate hop: peels with the local
/// long-term secret, then either forwards the smaller envelope onward or
/// hands back plaintext at the exit. The hop never learns more than this.
pub fn relay_one_layer(
    envelope: &OnionEnvelope,
    local_long_term_secret: &x25519_dalek::StaticSecret,
) -> Result<Peeled, CryptoError> {
    crypto::peel_layer(envelope, 0, local_long_term_secret)
}

pub struct CircuitBuilder {
    identity: Arc<NodeIdentity>,
    config: CoreConfig,
    registry: Arc<PeerRegistry>,
    signaling: Arc<SignalingAdapter>,
    link_connector: Arc<dyn PeerLinkConnector>,
    circuits: RwLock<HashMap<String, Circuit>>,
}

impl CircuitBuilder {
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: CoreConfig,
        registry: Arc<PeerRegistry>,
        signaling: Arc<SignalingAdapter>,
        link_connector: Arc<dyn PeerLinkConnector>,
    ) -> Arc<Self> {
        Arc::new(CircuitBuilder {
            identity,
            config,
            registry,
            signaling,
            link_connector,
            circuits: RwLock::new(HashMap::new()),
        })
    }

    /// `build(n, exclude)` per §4.4: request candidates, generate ephemeral
    /// keys, then establish hops 0..n sequentially. Any failure rolls back
    /// every link opened so far and zeroes every ephemeral key before
    /// returning `Failed`.
    pub async fn build(
        self: &Arc<Self>,
        requested_hops: usize,
        exclude: &[PeerId],
    ) -> Result<String, CircuitError> {
        let n = self.config.coerce_hop_count(requested_hops);
        let circuit_id = PeerId::new_random().to_hex();

        let candidates = self.registry.suitable_relays(n, exclude).await;
        if candidates.len() < n {
            return Err(CircuitError::InsufficientPeers { requested: n, available: candidates.len() });
        }

        let ephemeral_keys = crypto::generate_circuit_keys(n)?;
        let hop_long_term_keys: Vec<X25519Public> =
            candidates.iter().map(|c| c.public_key()).collect();
        let hops: Vec<Hop> = candidates
            .iter()
            .zip(&ephemeral_keys)
            .map(|(c, k)| Hop { peer_id: c.peer_id, ephemeral_public_key: k.public })
            .collect();

        let mut links: Vec<Arc<dyn PeerLink>> = Vec::with_capacity(n);
        for i in 0..n {
            if let Err(err) = self
                .establish_hop(&circuit_id, i, &hops, &ephemeral_keys[i], hop_long_term_keys[i])
                .await
            {
                log::warn!("[circuit] hop {i} establishment failed for {circuit_id}: {err}");
                for link in &links {
                    link.close().await;
                }
                let mut keys = ephemeral_keys;
                for kp in &mut keys {
                    zeroize_keypair(kp);
                }
                return Err(err);
            }

            match tokio::time::timeout(HOP_ESTABLISH_DEADLINE, self.link_connector.open(candidates[i].peer_id)).await {
                Ok(Ok(link)) => links.push(link),
                Ok(Err(reason)) => {
                    for link in &links {
                        link.close().await;
                    }
                    let mut keys = ephemeral_keys;
                    for kp in &mut keys {
                        zeroize_keypair(kp);
                    }
                    return Err(CircuitError::LinkFailed { hop_index: i, reason });
                }
                Err(_) => {
                    for link in &links {
                        link.close().await;
                    }
                    let mut keys = ephemeral_keys;
                    for kp in &mut keys {
                        zeroize_keypair(kp);
                    }
                    return Err(CircuitError::HopTimeout { hop_index: i });
                }
            }
        }

        let circuit = Circuit {
            circuit_id: circuit_id.clone(),
            hops,
            ephemeral_keys,
            hop_long_term_keys,
            links,
            status: CircuitStatus::Ready,
        };
        self.circuits.write().await.insert(circuit_id.clone(), circuit);
        log::info!("[circuit] {} built {circuit_id} with {n} hops", self.identity.peer_id);
        Ok(circuit_id)
    }

    async fn establish_hop(
        &self,
        circuit_id: &str,
        hop_index: usize,
        hops: &[Hop],
        ephemeral: &KeyPair,
        hop_long_term_key: X25519Public,
    ) -> Result<(), CircuitError> {
        let previous_hop_id = if hop_index == 0 { None } else { Some(hops[hop_index - 1].peer_id.to_hex()) };
        let next_hop_public_key = hops.get(hop_index + 1).map(|h| *h.ephemeral_public_key.as_bytes());

        let record = EstablishmentRecord {
            circuit_id: circuit_id.to_string(),
            hop_index: hop_index as u32,
            previous_hop_id,
            next_hop_public_key,
        };
        let record_bytes = serde_json::to_vec(&record).expect("establishment record always serializes");
        let sealed = crypto::seal_establishment(
            &record_bytes,
            &self.identity.public_key_bytes,
            &hop_long_term_key,
            ephemeral,
        )?;

        let msg = SignalingMessage::CircuitSignaling {
            sealed_envelope: BASE64.encode(&sealed),
        };
        self.signaling.send(&msg).await?;
        Ok(())
    }

    pub async fn send(&self, circuit_id: &str, data: &[u8]) -> Result<(), CircuitError> {
        let circuits = self.circuits.read().await;
        let circuit = circuits.get(circuit_id).ok_or(CircuitError::UnknownCircuit)?;
        circuit.send(data).await
    }

    pub async fn status(&self, circuit_id: &str) -> Option<CircuitStatus> {
        self.circuits.read().await.get(circuit_id).map(|c| c.status)
    }

    pub async fn set_status(&self, circuit_id: &str, status: CircuitStatus) {
        if let Some(c) = self.circuits.write().await.get_mut(circuit_id) {
            c.status = status;
        }
    }

    pub async fn hops_of(&self, circuit_id: &str) -> Option<Vec<Hop>> {
        self.circuits.read().await.get(circuit_id).map(|c| c.hops.clone())
    }

    /// Replaces hop `index` by rebuilding it and every hop after it (the
    /// suffix) with fresh candidates and ephemeral keys, leaving hops
    /// `0..index` untouched.
    pub async fn replace_hop(self: &Arc<Self>, circuit_id: &str, index: usize) -> Result<(), CircuitError> {
        let (prefix_hops, prefix_keys, prefix_long_term, prefix_links, total) = {
            let mut circuits = self.circuits.write().await;
            let circuit = circuits.get_mut(circuit_id).ok_or(CircuitError::UnknownCircuit)?;
            if index >= circuit.hops.len() {
                return Err(CircuitError::InvalidState);
            }
            circuit.status = CircuitStatus::Repairing;
            let total = circuit.hops.len();
            let prefix_hops = circuit.hops[..index].to_vec();
            let prefix_keys: Vec<KeyPair> = circuit.ephemeral_keys.drain(..index).collect();
            let prefix_long_term = circuit.hop_long_term_keys[..index].to_vec();
            let prefix_links = circuit.links[..index].to_vec();
            for link in circuit.links[index..].iter() {
                link.close().await;
            }
            for kp in circuit.ephemeral_keys.iter_mut() {
                zeroize_keypair(kp);
            }
            (prefix_hops, prefix_keys, prefix_long_term, prefix_links, total)
        };

        let suffix_len = total - index;
        let exclude: Vec<PeerId> = prefix_hops.iter().map(|h| h.peer_id).collect();
        let suffix_candidates = self.registry.suitable_relays(suffix_len, &exclude).await;
        if suffix_candidates.len() < suffix_len {
            self.set_status(circuit_id, CircuitStatus::Failed).await;
            return Err(CircuitError::InsufficientPeers {
                requested: suffix_len,
                available: suffix_candidates.len(),
            });
        }

        let suffix_ephemeral = crypto::generate_circuit_keys(suffix_len)?;
        let suffix_hop_long_term: Vec<X25519Public> =
            suffix_candidates.iter().map(|c| c.public_key()).collect();
        let mut new_hops = prefix_hops;
        new_hops.extend(suffix_candidates.iter().zip(&suffix_ephemeral).map(|(c, k)| Hop {
            peer_id: c.peer_id,
            ephemeral_public_key: k.public,
        }));

        let mut links = prefix_links;
        for (offset, candidate) in suffix_candidates.iter().enumerate() {
            let hop_index = index + offset;
            self.establish_hop(
                circuit_id,
                hop_index,
                &new_hops,
                &suffix_ephemeral[offset],
                suffix_hop_long_term[offset],
            )
            .await?;
            match tokio::time::timeout(HOP_ESTABLISH_DEADLINE, self.link_connector.open(candidate.peer_id)).await {
                Ok(Ok(link)) => links.push(link),
                Ok(Err(reason)) => {
                    self.set_status(circuit_id, CircuitStatus::Failed).await;
                    return Err(CircuitError::LinkFailed { hop_index, reason });
                }
                Err(_) => {
                    self.set_status(circuit_id, CircuitStatus::Failed).await;
                    return Err(CircuitError::HopTimeout { hop_index });
                }
            }
        }

        let mut all_keys = prefix_keys;
        all_keys.extend(suffix_ephemeral);
        let mut all_long_term = prefix_long_term;
        all_long_term.extend(suffix_hop_long_term);

        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(circuit_id) {
            circuit.hops = new_hops;
            circuit.ephemeral_keys = all_keys;
            circuit.hop_long_term_keys = all_long_term;
            circuit.links = links;
            circuit.status = CircuitStatus::Ready;
        }
        Ok(())
    }

    /// Closes every peer link, zeroes key material, and removes the
    /// circuit from the table.
    pub async fn close(&self, circuit_id: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(mut circuit) = circuits.remove(circuit_id) {
            circuit.zero_and_close().await;
        }
    }
}
