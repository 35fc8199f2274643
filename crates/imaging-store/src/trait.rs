//! Collaborator traits for session persistence and image lookup
//!
//! The multicast engine only talks to storage through these traits. The
//! database-backed implementation lives outside this workspace; tests and
//! the standalone daemon use [`crate::InMemoryStore`].

use crate::error::StoreError;
use crate::models::*;

/// Durable record of multicast sessions, their participants and activity.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the record for a newly prepared session
    async fn create_session(&self, session: NewSession) -> Result<(), StoreError>;

    /// Apply a partial update (status, counters, timestamps) to a session
    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> Result<(), StoreError>;

    /// Register a device as participant of a session
    async fn add_participant(&self, session_id: &str, participant: NewParticipant) -> Result<(), StoreError>;

    /// Apply a partial update to a participant
    async fn update_participant(
        &self,
        session_id: &str,
        device_id: &str,
        update: ParticipantUpdate,
    ) -> Result<(), StoreError>;

    /// Append a human-readable line to the activity log
    async fn log_activity(&self, session_id: Option<&str>, message: &str) -> Result<(), StoreError>;
}

/// Read-only lookup of captured images.
#[async_trait::async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn get_image(&self, image_id: &str) -> Result<ImageRecord, StoreError>;
}
