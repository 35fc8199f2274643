//! PXE server errors

use crate::packet::PacketError;
use imaging_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PxeError {
    #[error("DHCP error: {0}")]
    Dhcp(String),

    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Client {client} not registered in session {session}")]
    ClientNotFound { session: String, client: String },

    #[error("Session {0} has no registered clients")]
    NoClients(String),

    #[error("Session {session} is {status}: {reason}")]
    InvalidState {
        session: String,
        status: String,
        reason: String,
    },

    #[error("Chunk {index} out of range (session has {total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("No multicast addresses available")]
    AddressPoolExhausted,
}
