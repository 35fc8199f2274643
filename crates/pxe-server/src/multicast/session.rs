//! Session and client state.

use super::source::ImageSource;
use chrono::{DateTime, Utc};
use imaging_store::{ParticipantStatus, SessionStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Multicast session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random v4 UUID identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Client identifier chosen by the client in its `join`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A registered receiver.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub client_id: ClientId,
    pub device_id: Option<String>,
    pub mac_address: Option<String>,
    pub addr: SocketAddr,
    pub acked: BTreeSet<u32>,
    pub last_ack_at: Option<DateTime<Utc>>,
    /// Percentage, 0 to 100
    pub progress: f64,
    pub bytes_received: u64,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

impl ClientState {
    pub fn new(client_id: ClientId, device_id: Option<String>, mac_address: Option<String>, addr: SocketAddr) -> Self {
        Self {
            client_id,
            device_id,
            mac_address,
            addr,
            acked: BTreeSet::new(),
            last_ack_at: None,
            progress: 0.0,
            bytes_received: 0,
            status: ParticipantStatus::Registered,
            joined_at: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            client_id: self.client_id.clone(),
            device_id: self.device_id.clone(),
            mac_address: self.mac_address.clone(),
            address: self.addr,
            status: self.status,
            progress: self.progress,
            bytes_received: self.bytes_received,
            acked_chunks: self.acked.len(),
            last_ack_at: self.last_ack_at,
            joined_at: self.joined_at,
        }
    }
}

/// Mutable state of one session. Lives behind the session's own lock.
#[derive(Debug)]
pub struct MulticastSessionState {
    pub id: SessionId,
    pub image_id: Option<String>,
    /// Set once the session is started
    pub source: Option<ImageSource>,
    pub group: Ipv4Addr,
    pub port: u16,
    pub chunk_size: usize,
    pub total_size: u64,
    pub total_chunks: u32,
    /// Next chunk the loop will send
    pub current_chunk: u32,
    pub bytes_sent: u64,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub clients: BTreeMap<ClientId, ClientState>,
    /// Chunk index → clients waiting for its repair
    pub pending_retransmits: BTreeMap<u32, BTreeSet<ClientId>>,
}

impl MulticastSessionState {
    pub fn new(id: SessionId, group: Ipv4Addr, port: u16, chunk_size: usize) -> Self {
        Self {
            id,
            image_id: None,
            source: None,
            group,
            port,
            chunk_size,
            total_size: 0,
            total_chunks: 0,
            current_chunk: 0,
            bytes_sent: 0,
            status: SessionStatus::Waiting,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            clients: BTreeMap::new(),
            pending_retransmits: BTreeMap::new(),
        }
    }

    /// Group address and data port.
    pub fn data_target(&self) -> SocketAddr {
        SocketAddr::from((self.group, self.port))
    }

    /// Group address and control port.
    pub fn control_target(&self) -> SocketAddr {
        SocketAddr::from((self.group, self.port.wrapping_add(1)))
    }

    /// Byte offset of chunk `index`.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size as u64
    }

    /// Payload length of chunk `index`; only the last chunk is short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let remaining = self.total_size.saturating_sub(self.chunk_offset(index));
        // Bounded by chunk_size, which is a usize
        remaining.min(self.chunk_size as u64) as usize
    }

    /// Bytes sent as a percentage of the image, capped at 99 until the
    /// session completes.
    pub fn sent_percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 * 100.0 / self.total_size as f64).min(99.0)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            image_id: self.image_id.clone(),
            multicast_address: self.group,
            port: self.port,
            status: self.status,
            chunk_size: self.chunk_size,
            total_size: self.total_size,
            total_chunks: self.total_chunks,
            current_chunk: self.current_chunk,
            bytes_sent: self.bytes_sent,
            pending_retransmits: self.pending_retransmits.len(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            clients: self.clients.values().map(ClientState::snapshot).collect(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub image_id: Option<String>,
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    pub status: SessionStatus,
    pub chunk_size: usize,
    pub total_size: u64,
    pub total_chunks: u32,
    pub current_chunk: u32,
    pub bytes_sent: u64,
    pub pending_retransmits: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub clients: Vec<ClientSnapshot>,
}

/// Point-in-time view of a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub device_id: Option<String>,
    pub mac_address: Option<String>,
    pub address: SocketAddr,
    pub status: ParticipantStatus,
    pub progress: f64,
    pub bytes_received: u64,
    pub acked_chunks: usize,
    pub last_ack_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(total_size: u64, chunk_size: usize) -> MulticastSessionState {
        let mut state = MulticastSessionState::new(SessionId::from("s1"), Ipv4Addr::new(239, 255, 0, 1), 9000, chunk_size);
        state.total_size = total_size;
        state.total_chunks = total_size.div_ceil(chunk_size as u64) as u32;
        state
    }

    #[test]
    fn test_chunk_lengths_sum_to_size() {
        for (size, chunk) in [(10 * 1024 * 1024, 64 * 1024), (1_000_001, 4096), (4096, 4096), (1, 512)] {
            let state = sized(size, chunk);
            let total: u64 = (0..state.total_chunks).map(|i| state.chunk_len(i) as u64).sum();
            assert_eq!(total, size);
            assert_eq!(u64::from(state.total_chunks), size.div_ceil(chunk as u64));
        }
    }

    #[test]
    fn test_last_chunk_is_short() {
        let state = sized(1000, 300);
        assert_eq!(state.total_chunks, 4);
        assert_eq!(state.chunk_len(0), 300);
        assert_eq!(state.chunk_len(3), 100);
        assert_eq!(state.chunk_offset(3), 900);
        assert_eq!(state.chunk_len(4), 0);
    }

    #[test]
    fn test_targets() {
        let state = sized(1, 1);
        assert_eq!(state.data_target(), "239.255.0.1:9000".parse().unwrap());
        assert_eq!(state.control_target(), "239.255.0.1:9001".parse().unwrap());
    }

    #[test]
    fn test_sent_percentage_capped() {
        let mut state = sized(1000, 100);
        assert_eq!(state.sent_percentage(), 0.0);
        state.bytes_sent = 500;
        assert_eq!(state.sent_percentage(), 50.0);
        state.bytes_sent = 1000;
        assert_eq!(state.sent_percentage(), 99.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut state = sized(1000, 100);
        let client = ClientState::new(ClientId::from("c1"), Some("7".into()), None, "10.0.0.5:9001".parse().unwrap());
        state.clients.insert(client.client_id.clone(), client);

        let value = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["multicastAddress"], "239.255.0.1");
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["totalChunks"], 10);
        assert_eq!(value["clients"][0]["clientId"], "c1");
        assert_eq!(value["clients"][0]["status"], "registered");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
