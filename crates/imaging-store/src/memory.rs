//! In-memory session store and image catalog
//!
//! Stores records in process memory. Used by the standalone daemon when no
//! external storage layer is wired in, and by tests to observe what the
//! multicast engine persisted.

use crate::error::StoreError;
use crate::models::*;
use crate::store_trait::{ImageCatalog, SessionStore};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct SessionEntry {
    record: Option<SessionRecord>,
    participants: HashMap<String, ParticipantRecord>,
}

/// In-memory implementation of [`SessionStore`] and [`ImageCatalog`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    images: Arc<Mutex<HashMap<String, ImageRecord>>>,
    activity: Arc<Mutex<Vec<ActivityEntry>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image to the catalog
    pub fn add_image(&self, image: ImageRecord) {
        lock(&self.images).insert(image.id.clone(), image);
    }

    /// Register every regular file in `dir` as an image, keyed by its file
    /// stem. Returns the number of images added.
    pub fn register_images_in(&self, dir: &Path) -> Result<usize, StoreError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| StoreError::Backend(format!("cannot read {}: {e}", dir.display())))?;

        let mut added = 0;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let (Some(stem), Some(filename)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            debug!(image_id = stem, filename, size = metadata.len(), "Registered image");
            self.add_image(ImageRecord {
                id: stem.to_string(),
                filename: filename.to_string(),
                size: metadata.len(),
            });
            added += 1;
        }
        Ok(added)
    }

    /// Snapshot of a stored session record
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        lock(&self.sessions)
            .get(session_id)
            .and_then(|entry| entry.record.clone())
    }

    /// Snapshot of a session's participants, ordered by device id
    #[must_use]
    pub fn participants(&self, session_id: &str) -> Vec<ParticipantRecord> {
        let sessions = lock(&self.sessions);
        let mut participants: Vec<_> = sessions
            .get(session_id)
            .map(|entry| entry.participants.values().cloned().collect())
            .unwrap_or_default();
        participants.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        participants
    }

    /// Snapshot of the activity log
    #[must_use]
    pub fn activities(&self) -> Vec<ActivityEntry> {
        lock(&self.activity).clone()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: NewSession) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions.entry(session.session_id.clone()).or_default();
        if entry.record.is_some() {
            return Err(StoreError::InvalidRequest(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        debug!(session_id = %session.session_id, "Creating session record");
        entry.record = Some(SessionRecord::from_new(session));
        Ok(())
    }

    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let record = sessions
            .get_mut(session_id)
            .and_then(|entry| entry.record.as_mut())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        record.apply(update);
        Ok(())
    }

    async fn add_participant(&self, session_id: &str, participant: NewParticipant) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions
            .get_mut(session_id)
            .filter(|entry| entry.record.is_some())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        // A device re-joining replaces its previous record
        entry
            .participants
            .insert(participant.device_id.clone(), ParticipantRecord::from_new(participant));
        Ok(())
    }

    async fn update_participant(
        &self,
        session_id: &str,
        device_id: &str,
        update: ParticipantUpdate,
    ) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let participant = sessions
            .get_mut(session_id)
            .and_then(|entry| entry.participants.get_mut(device_id))
            .ok_or_else(|| StoreError::NotFound(format!("participant {device_id} in session {session_id}")))?;
        participant.apply(update);
        Ok(())
    }

    async fn log_activity(&self, session_id: Option<&str>, message: &str) -> Result<(), StoreError> {
        lock(&self.activity).push(ActivityEntry {
            session_id: session_id.map(str::to_string),
            message: message.to_string(),
            logged_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ImageCatalog for InMemoryStore {
    async fn get_image(&self, image_id: &str) -> Result<ImageRecord, StoreError> {
        lock(&self.images)
            .get(image_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image {image_id}")))
    }
}
