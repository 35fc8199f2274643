//! Persistence models for multicast imaging sessions.
//!
//! These mirror the records the external storage layer keeps for a
//! deployment session and the devices taking part in it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Lifecycle status of a multicast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Prepared, accepting joins, nothing sent yet
    #[default]
    Waiting,
    /// Chunks are being transmitted
    Active,
    /// Every chunk was sent
    Completed,
    /// Transmission aborted on an error
    Failed,
    /// Stopped by an operator
    Cancelled,
}

impl SessionStatus {
    /// Whether the session can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name as stored and sent on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer status of a single receiver within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    #[default]
    Registered,
    Waiting,
    Downloading,
    Completed,
    Failed,
}

impl ParticipantStatus {
    /// Whether the participant has finished, successfully or not.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Image record as exposed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: String,
    /// File name relative to the images directory
    pub filename: String,
    /// Size recorded at capture time, in bytes
    #[serde(default)]
    pub size: u64,
}

/// Data needed to create a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a session record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub image_id: Option<String>,
    pub total_size: Option<u64>,
    pub bytes_sent: Option<u64>,
    /// Bytes per second
    pub throughput: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SessionUpdate {
    /// Update carrying only a status change.
    #[must_use]
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Data needed to register a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewParticipant {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
    pub joined_at: DateTime<Utc>,
}

/// Partial update of a participant record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub status: Option<ParticipantStatus>,
    /// Percentage, 0 to 100
    pub progress: Option<f64>,
    pub bytes_received: Option<u64>,
}

/// Stored session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub image_id: Option<String>,
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    pub status: SessionStatus,
    pub total_size: u64,
    pub bytes_sent: u64,
    pub throughput: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SessionRecord {
    /// Creates a fresh record in `waiting` state.
    #[must_use]
    pub fn from_new(session: NewSession) -> Self {
        Self {
            session_id: session.session_id,
            image_id: session.image_id,
            multicast_address: session.multicast_address,
            port: session.port,
            status: SessionStatus::Waiting,
            total_size: 0,
            bytes_sent: 0,
            throughput: 0.0,
            created_at: session.created_at,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Applies the set fields of `update`.
    pub fn apply(&mut self, update: SessionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(image_id) = update.image_id {
            self.image_id = Some(image_id);
        }
        if let Some(total_size) = update.total_size {
            self.total_size = total_size;
        }
        if let Some(bytes_sent) = update.bytes_sent {
            self.bytes_sent = bytes_sent;
        }
        if let Some(throughput) = update.throughput {
            self.throughput = throughput;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
    }
}

/// Stored participant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub device_id: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub status: ParticipantStatus,
    pub progress: f64,
    pub bytes_received: u64,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantRecord {
    #[must_use]
    pub fn from_new(participant: NewParticipant) -> Self {
        Self {
            device_id: participant.device_id,
            mac_address: participant.mac_address,
            ip_address: participant.ip_address,
            status: ParticipantStatus::Registered,
            progress: 0.0,
            bytes_received: 0,
            joined_at: participant.joined_at,
        }
    }

    pub fn apply(&mut self, update: ParticipantUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(bytes_received) = update.bytes_received {
            self.bytes_received = bytes_received;
        }
    }
}

/// One line of the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_terminal() {
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_session_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(SessionStatus::Active.to_string(), "active");
    }

    #[test]
    fn test_session_update_leaves_unset_fields() {
        let mut record = SessionRecord::from_new(NewSession {
            session_id: "s1".to_string(),
            image_id: Some("img".to_string()),
            multicast_address: Ipv4Addr::new(239, 255, 0, 1),
            port: 9000,
            created_at: Utc::now(),
        });
        record.apply(SessionUpdate {
            total_size: Some(1024),
            ..Default::default()
        });
        record.apply(SessionUpdate::status(SessionStatus::Active));

        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.total_size, 1024);
        assert_eq!(record.image_id.as_deref(), Some("img"));
        assert!(record.error.is_none());
    }
}
