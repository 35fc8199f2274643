//! Lifecycle notifications published by the engine.

use super::session::{ClientId, SessionId};
use serde::Serialize;

/// Fire-and-forget event. Lagging receivers miss events; the engine never
/// waits for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MulticastEvent {
    SessionInitialized {
        session_id: SessionId,
        total_size: u64,
        total_chunks: u32,
    },
    TransmissionStarted {
        session_id: SessionId,
        clients: usize,
    },
    Progress {
        session_id: SessionId,
        chunks_sent: u32,
        total_chunks: u32,
        bytes_sent: u64,
        /// Bytes per second since transmission began
        throughput: f64,
    },
    ClientJoined {
        session_id: SessionId,
        client_id: ClientId,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    SessionCompleted {
        session_id: SessionId,
        bytes_sent: u64,
        duration_secs: f64,
    },
    SessionFailed {
        session_id: SessionId,
        error: String,
    },
    SessionCancelled {
        session_id: SessionId,
    },
}

impl MulticastEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionInitialized { session_id, .. }
            | Self::TransmissionStarted { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::ClientJoined { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionCancelled { session_id } => session_id,
        }
    }
}
