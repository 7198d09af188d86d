// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker <-> coordinator wire protocol.
//!
//! Simple length-prefixed JSON protocol. Message boundaries are
//! preserved by the length prefix; delivery is at-least-once with
//! idempotent handling on the coordinator side, keyed by
//! `(node_name, generation)`. A worker that misses an ack retransmits
//! its last update after the next discovery cycle.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use crate::labels::Emission;
use crate::rules::RuleSet;
use crate::snapshot::FeatureSnapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Default cap on a single wire message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message exceeds the negotiated size cap.
    #[error("message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    /// Zero-length frame.
    #[error("empty message")]
    Empty,

    /// Payload was not valid JSON for the expected message type.
    #[error("invalid message: {0}")]
    Json(String),
}

/// A worker's per-cycle submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureUpdate {
    /// Node this snapshot describes.
    pub node_name: String,

    /// Monotonic per-worker generation, for idempotent handling and
    /// supersede ordering.
    pub generation: u64,

    /// The discovered feature snapshot.
    pub snapshot: FeatureSnapshot,

    /// Emission of the worker-local rules (may be empty).
    pub local_emission: Emission,
}

/// Messages sent by the worker to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Submit a discovery result.
    #[serde(rename = "node_feature_update")]
    NodeFeatureUpdate(NodeFeatureUpdate),
}

/// Messages sent by the coordinator to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorMessage {
    /// A submission was accepted and cached.
    #[serde(rename = "ack")]
    Ack { generation: u64 },

    /// The cluster-scoped rule set (pushed on connect and on reload).
    #[serde(rename = "rule_set")]
    RuleSet(RuleSet),

    /// Error report.
    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

/// Encode a message with its length prefix.
pub fn encode<T: Serialize>(msg: &T, max_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg).map_err(|e| ProtocolError::Json(e.to_string()))?;
    if json.len() > max_size {
        return Err(ProtocolError::TooLarge {
            len: json.len(),
            max: max_size,
        });
    }
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a message payload (without the length prefix).
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Write an encoded message to a blocking stream.
pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    msg: &T,
    max_size: usize,
) -> Result<(), ProtocolError> {
    let buf = encode(msg, max_size)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one message from a blocking stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly at a
/// frame boundary. Read timeouts surface as `Io` errors of kind
/// `WouldBlock`/`TimedOut` for the caller to interpret.
pub fn read_message<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::Empty);
    }
    if len > max_size {
        return Err(ProtocolError::TooLarge { len, max: max_size });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(decode(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::snapshot::DomainFeatures;

    fn update() -> NodeFeatureUpdate {
        let mut snapshot = FeatureSnapshot::new();
        let mut cpu = DomainFeatures::new();
        cpu.add_flag("flags", "avx2");
        snapshot.insert_domain("cpu", cpu);

        NodeFeatureUpdate {
            node_name: "n1".to_string(),
            generation: 5,
            snapshot,
            local_emission: Emission::new(),
        }
    }

    #[test]
    fn test_roundtrip_worker_message() {
        let msg = WorkerMessage::NodeFeatureUpdate(update());
        let encoded = encode(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);

        let decoded: WorkerMessage = decode(&encoded[4..]).unwrap();
        match decoded {
            WorkerMessage::NodeFeatureUpdate(u) => {
                assert_eq!(u.node_name, "n1");
                assert_eq!(u.generation, 5);
                assert!(u.snapshot.flag_set("cpu", "flags").is_some());
            }
        }
    }

    #[test]
    fn test_roundtrip_coordinator_messages() {
        let ack = CoordinatorMessage::Ack { generation: 7 };
        let encoded = encode(&ack, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let json = std::str::from_utf8(&encoded[4..]).unwrap();
        assert!(json.contains("\"type\":\"ack\""));

        let rules = CoordinatorMessage::RuleSet(RuleSet::new(3, vec![Rule::named("r1")]));
        let encoded = encode(&rules, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let decoded: CoordinatorMessage = decode(&encoded[4..]).unwrap();
        match decoded {
            CoordinatorMessage::RuleSet(set) => {
                assert_eq!(set.version, 3);
                assert_eq!(set.rules.len(), 1);
            }
            other => panic!("expected RuleSet, got {:?}", other),
        }
    }

    #[test]
    fn test_size_cap_enforced_on_encode() {
        let msg = WorkerMessage::NodeFeatureUpdate(update());
        assert!(matches!(
            encode(&msg, 8),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_read_message_from_stream() {
        let msg = CoordinatorMessage::Ack { generation: 2 };
        let encoded = encode(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let mut cursor = std::io::Cursor::new(encoded);
        let decoded: Option<CoordinatorMessage> =
            read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert!(matches!(
            decoded,
            Some(CoordinatorMessage::Ack { generation: 2 })
        ));

        // Clean EOF at frame boundary.
        let decoded: Option<CoordinatorMessage> =
            read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_read_message_rejects_oversized_frame() {
        let msg = CoordinatorMessage::Ack { generation: 2 };
        let encoded = encode(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        let result: Result<Option<CoordinatorMessage>, _> = read_message(&mut cursor, 4);
        assert!(matches!(result, Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn test_truncated_payload_is_an_io_error() {
        let msg = CoordinatorMessage::Ack { generation: 2 };
        let mut encoded = encode(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        encoded.truncate(encoded.len() - 3);

        let mut cursor = std::io::Cursor::new(encoded);
        let result: Result<Option<CoordinatorMessage>, _> =
            read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
