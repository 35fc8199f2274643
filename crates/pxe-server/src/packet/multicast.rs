//! Multicast distribution wire format.
//!
//! Data packets carry one chunk of the source image:
//!
//! ```text
//! [0..5]    magic "MCAST"
//! [5]       protocol version
//! [6..10]   chunk index (u32 BE)
//! [10..14]  total chunks (u32 BE)
//! [14..18]  payload length (u32 BE)
//! [18..22]  checksum (u32 BE, sum of payload bytes mod 2^32)
//! [22..]    payload
//! ```
//!
//! Control packets travel on the control port as JSON objects tagged by
//! `type`.

use super::PacketError;
use imaging_store::SessionStatus;
use serde::{Deserialize, Serialize};

pub const MAGIC: &[u8; 5] = b"MCAST";
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 22;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Additive checksum over a chunk.
///
/// Detects loss and truncation only; it is not an integrity check.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &byte| acc.wrapping_add(u32::from(byte)))
}

/// A framed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl DataPacket {
    /// Frames `payload`, computing its checksum.
    pub fn new(chunk_index: u32, total_chunks: u32, payload: Vec<u8>) -> Self {
        Self {
            chunk_index,
            total_chunks,
            checksum: checksum(&payload),
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_data(self.chunk_index, self.total_chunks, &self.payload)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        if &buf[..5] != MAGIC {
            return Err(PacketError::BadMagic);
        }
        if buf[5] != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(buf[5]));
        }

        let field = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let declared = field(14) as usize;
        let payload = &buf[HEADER_LEN..];
        if declared != payload.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self {
            chunk_index: field(6),
            total_chunks: field(10),
            checksum: field(18),
            payload: payload.to_vec(),
        })
    }

    /// Whether the payload still sums to the carried checksum.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// Frames a chunk without taking ownership of the payload.
pub fn encode_data(chunk_index: u32, total_chunks: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&chunk_index.to_be_bytes());
    buf.extend_from_slice(&total_chunks.to_be_bytes());
    // Chunk sizes are bounded far below u32::MAX by the datagram limit
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Sent by the server when transmission begins
    Start {
        session_id: String,
        total_chunks: u32,
        total_size: u64,
        chunk_size: u32,
    },
    /// Sent by the server when transmission stops for any reason
    End {
        session_id: String,
        status: SessionStatus,
    },
    Join {
        session_id: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac_address: Option<String>,
    },
    Ack {
        session_id: String,
        client_id: String,
        chunk_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_received: Option<u64>,
    },
    Nack {
        session_id: String,
        client_id: String,
        chunk_index: u32,
    },
    Status {
        session_id: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
}

impl ControlMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        serde_json::from_slice(buf).map_err(|e| PacketError::Control(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::Control(e.to_string()))
    }

    /// Session the message refers to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Start { session_id, .. }
            | Self::End { session_id, .. }
            | Self::Join { session_id, .. }
            | Self::Ack { session_id, .. }
            | Self::Nack { session_id, .. }
            | Self::Status { session_id, .. } => session_id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::End { .. } => "end",
            Self::Join { .. } => "join",
            Self::Ack { .. } => "ack",
            Self::Nack { .. } => "nack",
            Self::Status { .. } => "status",
        }
    }
}
