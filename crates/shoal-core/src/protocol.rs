//! Wire protocol: discovery beacons and transport records.
//!
//! Two surfaces share one JSON vocabulary. Discovery sends a single-datagram
//! [`Beacon`] over UDP; the transport carries newline-delimited [`Envelope`]
//! records over TCP, each serialized as `{"type": ..., "peer_id": ...,
//! "data": ...}` on one line.
//!
//! The record set is a closed enum. The router matches on it exhaustively, so
//! adding a message type is a compile-checked change, and a record whose
//! `type` this build does not know decodes to [`ProtocolError::UnknownType`]
//! rather than poisoning the connection. Binary chunk payloads are base64
//! inside `data`, which keeps every record free of raw newlines.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::FileId;

/// Record types this build understands, as they appear on the wire.
const KNOWN_TYPES: [&str; 7] = [
    "ANNOUNCE",
    "FILE_LIST_REQUEST",
    "FILE_LIST_RESPONSE",
    "CHUNK_REQUEST",
    "CHUNK_DATA",
    "CHUNK_NOT_FOUND",
    "GOODBYE",
];

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Valid JSON carrying a `type` this build does not know. Dropped without
    /// penalty so newer peers can talk past us.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Discovery ───────────────────────────────────────────────────────────────

/// Discovery datagram, broadcast on the LAN segment.
///
/// One variant today; the tag keeps the datagram self-describing and leaves
/// room for future beacon kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Beacon {
    /// "I exist": the sender's identity and the TCP port it accepts
    /// connections on. The sender's address comes from the datagram itself.
    Announce { peer_id: String, port: u16 },
}

impl Beacon {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ── Transport records ───────────────────────────────────────────────────────

/// One transport record: a single JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender identity, carried on every record so either side of a
    /// symmetric connection can attribute a message without extra state.
    pub peer_id: String,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Record payloads, tagged on the wire as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    /// Directory refresh over TCP, sent first on every outbound connection.
    /// Reaches peers the UDP beacon cannot.
    Announce { port: u16 },
    /// Ask a peer for the files it shares itself.
    FileListRequest {},
    FileListResponse { files: Vec<FileAdvert> },
    ChunkRequest {
        file_id: FileId,
        chunk_index: u32,
    },
    ChunkData {
        file_id: FileId,
        chunk_index: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Hash of `data`, claimed by the sender and re-checked on receipt.
        hash: String,
    },
    /// Explicit refusal for a chunk the responder cannot serve.
    ChunkNotFound {
        file_id: FileId,
        chunk_index: u32,
    },
    /// Orderly departure. The sender is leaving now, not timing out later.
    Goodbye {},
}

/// One advertised file in a `FILE_LIST_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAdvert {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    /// Whole-file content hash, lowercase hex.
    pub hash: String,
    pub chunks_total: u32,
}

impl Envelope {
    pub fn new(peer_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            peer_id: peer_id.into(),
            payload,
        }
    }

    /// Encode as one JSON line, without the trailing newline.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode one line received from a peer.
    ///
    /// An unrecognized `type` in otherwise valid JSON is reported as
    /// [`ProtocolError::UnknownType`] so the caller can drop the record and
    /// keep the connection; anything else is [`ProtocolError::Malformed`].
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => Ok(envelope),
            Err(err) => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                    if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
                        if !KNOWN_TYPES.contains(&kind) {
                            return Err(ProtocolError::UnknownType(kind.to_string()));
                        }
                    }
                }
                Err(ProtocolError::Malformed(err))
            }
        }
    }
}

/// Serde adapter: `Vec<u8>` as a standard base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
