//! Local node identity: peer id, long-term keypair, and start time, threaded
//! into the registry at construction rather than held as module-level
//! globals (§9 Design Notes) so a test process can spin up several logical
//! nodes side by side.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// Opaque, globally-unique identifier chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    pub fn new_random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Some(PeerId(out))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The local participant's identity for the lifetime of one process run.
/// A fresh identity is generated every run — the core persists nothing
/// across restarts.
pub struct NodeIdentity {
    pub peer_id: PeerId,
    pub signing_key: SigningKey,
    /// Raw 32-byte Ed25519 public key, announced on the wire as SPKI/base64
    /// by the signaling layer.
    pub public_key_bytes: [u8; 32],
    pub start_time: std::time::Instant,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key_bytes = *signing_key.verifying_key().as_bytes();
        NodeIdentity {
            peer_id: PeerId::new_random(),
            signing_key,
            public_key_bytes,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// The 32-byte Ed25519 seed, used by `crypto::KeyPair::from_ed25519_seed`
    /// to derive the long-term X25519 wrap key for this identity.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

pub fn now_monotonic_ms() -> u64 {
    // Wall-clock millis used only for wire timestamps (e.g. node_ping echo);
    // ordering decisions in the registry use `std::time::Instant`.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
