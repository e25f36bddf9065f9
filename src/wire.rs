//! §6 signaling wire messages — JSON objects carried by the Signaling
//! Adapter. Shapes mirror the donor's `ops.rs` CBOR envelope structs, but
//! serialized as JSON per spec.md's "full-duplex message channel delivering
//! JSON-shaped frames" requirement.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "ENTRY")]
    Entry,
    #[serde(rename = "RELAY")]
    Relay,
    #[serde(rename = "EXIT")]
    Exit,
}

impl Role {
    /// Cyclic rotation order: Relay → Entry → Exit → Relay (§4.3).
    pub fn next_in_rotation(&self) -> Role {
        match self {
            Role::Relay => Role::Entry,
            Role::Entry => Role::Exit,
            Role::Exit => Role::Relay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "WAITING")]
    Waiting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationHint {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesWire {
    #[serde(rename = "maxBandwidthBps")]
    pub max_bandwidth_bps: f64,
    #[serde(rename = "latencyMs")]
    pub latency_ms: f64,
    pub reliability: f64,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

/// One variant per recognized `type` discriminant of §6. `#[serde(tag =
/// "type")]` gives us the "unknown `type` values are ignored" rule for free:
/// deserializing into an untagged fallback and discarding it is how callers
/// should treat a parse failure against this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "node_announcement")]
    NodeAnnouncement {
        #[serde(rename = "nodeId")]
        node_id: String,
        role: Role,
        status: PeerStatus,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(default)]
        location: Option<LocationHint>,
    },
    #[serde(rename = "node_status")]
    NodeStatus {
        #[serde(rename = "nodeId")]
        node_id: String,
        status: PeerStatus,
        #[serde(default)]
        role: Option<Role>,
    },
    #[serde(rename = "node_validation")]
    NodeValidation {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "targetNodeId")]
        target_node_id: String,
        timestamp: u64,
    },
    #[serde(rename = "node_validation_response")]
    NodeValidationResponse {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "targetNodeId")]
        target_node_id: String,
        timestamp: u64,
        status: PeerStatus,
        capabilities: CapabilitiesWire,
    },
    #[serde(rename = "node_discovery")]
    NodeDiscovery {
        #[serde(rename = "requestId")]
        request_id: String,
        capabilities: CapabilitiesWire,
    },
    #[serde(rename = "node_ping")]
    NodePing {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "targetNodeId")]
        target_node_id: String,
        timestamp: u64,
    },
    #[serde(rename = "node_pong")]
    NodePong {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "targetNodeId")]
        target_node_id: String,
        timestamp: u64,
    },
    /// Carries a sealed establishment record (`crypto::seal_establishment`)
    /// addressed to one hop. Deliberately has no cleartext recipient field:
    /// every node on the signaling channel receives the same broadcast, and
    /// only the addressed hop's long-term secret will open it.
    #[serde(rename = "circuit_signaling")]
    CircuitSignaling {
        #[serde(rename = "sealedEnvelope")]
        sealed_envelope: String,
    },
    #[serde(rename = "circuit_data")]
    CircuitData {
        #[serde(rename = "circuitId")]
        circuit_id: String,
        data: String,
        keys: Vec<String>,
        ivs: Vec<Vec<u8>>,
    },
}

impl SignalingMessage {
    /// Best-effort parse that treats an unrecognized `type` (or any
    /// malformed frame) the way §6 mandates: ignored, not an error that
    /// bubbles up to the caller.
    pub fn parse(raw: &str) -> Option<SignalingMessage> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SignalingMessage always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_roundtrips_through_json() {
        let msg = SignalingMessage::NodeAnnouncement {
            node_id: "abc".into(),
            role: Role::Relay,
            status: PeerStatus::Waiting,
            public_key: "base64key".into(),
            location: None,
        };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"node_announcement\""));
        let parsed = SignalingMessage::parse(&json).unwrap();
        matches!(parsed, SignalingMessage::NodeAnnouncement { .. });
    }

    #[test]
    fn unknown_type_is_ignored_not_an_error() {
        let raw = r#"{"type":"something_new","foo":1}"#;
        assert!(SignalingMessage::parse(raw).is_none());
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert!(SignalingMessage::parse("not json").is_none());
    }

    #[test]
    fn role_rotation_cycle() {
        assert_eq!(Role::Relay.next_in_rotation(), Role::Entry);
        assert_eq!(Role::Entry.next_in_rotation(), Role::Exit);
        assert_eq!(Role::Exit.next_in_rotation(), Role::Relay);
    }
}
