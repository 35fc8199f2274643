//! Session registry, lifecycle and the chunk loop.
//!
//! The registry lock is only held to look up, insert or remove handles and
//! never across an `.await`. Each session's state sits behind its own async
//! mutex, which the chunk loop takes briefly per chunk and never while
//! sending or sleeping, so control traffic is served during transmission.

use super::MulticastOptions;
use super::address;
use super::events::MulticastEvent;
use super::session::{MulticastSessionState, SessionId, SessionSnapshot};
use super::sink::DatagramSink;
use super::source::ImageSource;
use crate::error::PxeError;
use crate::packet::multicast::{ControlMessage, encode_data};
use chrono::Utc;
use imaging_store::{
    ImageCatalog, NewParticipant, NewSession, ParticipantStatus, ParticipantUpdate, SessionStatus, SessionStore,
    SessionUpdate,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Chunks between progress reports.
const PROGRESS_INTERVAL: u32 = 100;

/// Registry entry for one session.
#[derive(Debug)]
pub(super) struct SessionHandle {
    pub(super) state: Mutex<MulticastSessionState>,
    /// Cuts the throttle sleep short on cancellation
    wake: Notify,
}

/// Binds a session to an image and sizes it.
///
/// A session that does not exist yet is prepared first, on the given group
/// or an allocated one.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub session_id: SessionId,
    pub image_id: String,
    #[serde(default)]
    pub multicast_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub port: Option<u16>,
}

struct ResolvedImage {
    image_id: String,
    source: ImageSource,
    total_size: u64,
}

struct ProgressReport {
    chunks_sent: u32,
    total_chunks: u32,
    bytes_sent: u64,
    throughput: f64,
    participants: Vec<(String, f64)>,
}

/// Multicast distribution engine.
///
/// Shared as `Arc<MulticastEngine>` between the control listener, the
/// management API and the chunk loops it spawns.
pub struct MulticastEngine {
    options: MulticastOptions,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    /// Serialises address choice with session insertion
    allocation: Mutex<()>,
    store: Arc<dyn SessionStore>,
    catalog: Arc<dyn ImageCatalog>,
    pub(super) sink: Arc<dyn DatagramSink>,
    events: broadcast::Sender<MulticastEvent>,
}

impl MulticastEngine {
    /// Creates an engine with an empty session registry.
    pub fn new(
        options: MulticastOptions,
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn ImageCatalog>,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            options,
            sessions: RwLock::new(HashMap::new()),
            allocation: Mutex::new(()),
            store,
            catalog,
            sink,
            events,
        }
    }

    pub fn options(&self) -> &MulticastOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MulticastEvent> {
        self.events.subscribe()
    }

    /// Lowest pool address not used by a session that is still running.
    pub async fn allocate_address(&self) -> Result<Ipv4Addr, PxeError> {
        let _allocation = self.allocation.lock().await;
        self.free_address().await
    }

    /// Callers hold `allocation` so the result stays free until inserted.
    async fn free_address(&self) -> Result<Ipv4Addr, PxeError> {
        let handles: Vec<_> = self.read_sessions().values().cloned().collect();
        let mut in_use = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.state.lock().await;
            if !state.status.is_terminal() {
                in_use.push(state.group);
            }
        }
        address::allocate_address(in_use)
    }

    /// Creates a `waiting` session with no image so clients can join early.
    ///
    /// `port` must be the configured data port: the control listener only
    /// serves `default_port + 1`.
    pub async fn prepare_session(
        &self,
        id: SessionId,
        group: Option<Ipv4Addr>,
        port: Option<u16>,
    ) -> Result<SessionSnapshot, PxeError> {
        let port = match port {
            Some(port) if port != self.options.default_port => {
                return Err(PxeError::InvalidRequest(format!(
                    "session port {port} differs from the multicast data port {}",
                    self.options.default_port
                )));
            }
            _ => self.options.default_port,
        };

        let snapshot = {
            let _allocation = self.allocation.lock().await;
            if self.read_sessions().contains_key(&id) {
                return Err(PxeError::SessionExists(id.to_string()));
            }
            let group = match group {
                Some(group) => group,
                None => self.free_address().await?,
            };
            let state = MulticastSessionState::new(id.clone(), group, port, self.options.chunk_size);
            let snapshot = state.snapshot();
            self.write_sessions().insert(
                id.clone(),
                Arc::new(SessionHandle {
                    state: Mutex::new(state),
                    wake: Notify::new(),
                }),
            );
            snapshot
        };
        let group = snapshot.multicast_address;

        let record = NewSession {
            session_id: id.to_string(),
            image_id: None,
            multicast_address: group,
            port,
            created_at: snapshot.created_at,
        };
        if let Err(e) = self.store.create_session(record).await {
            warn!(session_id = %id, error = %e, "Failed to persist new session");
        }
        self.log_activity(&id, &format!("Session prepared on {group}:{port}")).await;
        info!(session_id = %id, group = %group, port, "Multicast session prepared");
        Ok(snapshot)
    }

    /// Prepares a session and, when `image_id` is given, binds the image.
    ///
    /// The image is resolved before anything is registered, so a failure
    /// leaves no session behind.
    pub async fn create_session(
        &self,
        id: SessionId,
        group: Option<Ipv4Addr>,
        port: Option<u16>,
        image_id: Option<&str>,
    ) -> Result<SessionSnapshot, PxeError> {
        let image = match image_id {
            Some(image_id) => Some(self.resolve_image(&id, image_id).await?),
            None => None,
        };
        let snapshot = self.prepare_session(id.clone(), group, port).await?;
        let Some(image) = image else {
            return Ok(snapshot);
        };
        let handle = self.handle(&id)?;
        match self.assign_image(&id, &handle, image).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.discard(&id, &handle).await;
                Err(e)
            }
        }
    }

    /// Resolves the image, fixes the chunk count and keeps the session
    /// `waiting`. Clients that joined during prepare are kept.
    pub async fn start_session(&self, request: StartRequest) -> Result<SessionSnapshot, PxeError> {
        let id = request.session_id;
        let image = self.resolve_image(&id, &request.image_id).await?;
        let (handle, prepared) = match self.handle(&id) {
            Ok(handle) => (handle, false),
            Err(_) => {
                self.prepare_session(id.clone(), request.multicast_address, request.port)
                    .await?;
                (self.handle(&id)?, true)
            }
        };
        match self.assign_image(&id, &handle, image).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                if prepared {
                    self.discard(&id, &handle).await;
                }
                Err(e)
            }
        }
    }

    async fn resolve_image(&self, id: &SessionId, image_id: &str) -> Result<ResolvedImage, PxeError> {
        if self.options.chunk_size == 0 {
            return Err(PxeError::Configuration("chunk size must be positive".to_string()));
        }
        let image = self.catalog.get_image(image_id).await?;
        let path = self.options.images_dir.join(&image.filename);
        let (source, total_size) = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => (ImageSource::File(path), metadata.len()),
            _ if image.size > 0 => {
                warn!(session_id = %id, path = %path.display(), "Image file missing, sending filler of recorded size");
                (ImageSource::Synthetic, image.size)
            }
            _ => {
                warn!(session_id = %id, path = %path.display(), "Image file missing, sending simulated image");
                (ImageSource::Synthetic, self.options.simulated_size)
            }
        };
        Ok(ResolvedImage {
            image_id: image.id,
            source,
            total_size,
        })
    }

    async fn assign_image(
        &self,
        id: &SessionId,
        handle: &SessionHandle,
        image: ResolvedImage,
    ) -> Result<SessionSnapshot, PxeError> {
        let ResolvedImage {
            image_id,
            source,
            total_size,
        } = image;
        let snapshot = {
            let mut state = handle.state.lock().await;
            if state.status != SessionStatus::Waiting {
                return Err(invalid_state(&state, "session has already started"));
            }
            let total_chunks = u32::try_from(total_size.div_ceil(state.chunk_size as u64))
                .map_err(|_| invalid_state(&state, "image needs more than u32::MAX chunks"))?;
            state.image_id = Some(image_id.clone());
            state.source = Some(source);
            state.total_size = total_size;
            state.total_chunks = total_chunks;
            state.current_chunk = 0;
            state.bytes_sent = 0;
            state.snapshot()
        };

        self.persist_session(
            id,
            SessionUpdate {
                status: Some(SessionStatus::Waiting),
                image_id: Some(image_id.clone()),
                total_size: Some(total_size),
                ..Default::default()
            },
        )
        .await;
        self.emit(MulticastEvent::SessionInitialized {
            session_id: id.clone(),
            total_size,
            total_chunks: snapshot.total_chunks,
        });
        self.log_activity(
            id,
            &format!(
                "Session initialized with image {image_id} ({total_size} bytes, {} chunks)",
                snapshot.total_chunks
            ),
        )
        .await;
        info!(
            session_id = %id,
            image_id = %image_id,
            total_size,
            total_chunks = snapshot.total_chunks,
            clients = snapshot.clients.len(),
            "Multicast session initialized"
        );
        Ok(snapshot)
    }

    /// Drops a session prepared for a request that then failed.
    async fn discard(&self, id: &SessionId, handle: &Arc<SessionHandle>) {
        self.remove_handle(id, handle);
        self.persist_session(
            id,
            SessionUpdate {
                status: Some(SessionStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
        debug!(session_id = %id, "Discarded session after failed start");
    }

    /// Moves a sized session with at least one client to `active` and spawns
    /// the chunk loop.
    pub async fn begin_transmission(self: &Arc<Self>, id: &SessionId) -> Result<JoinHandle<()>, PxeError> {
        let handle = self.handle(id)?;
        let (clients, devices, started_at) = {
            let mut state = handle.state.lock().await;
            if state.status != SessionStatus::Waiting {
                return Err(invalid_state(&state, "transmission can only begin from waiting"));
            }
            if state.source.is_none() {
                return Err(invalid_state(&state, "no image assigned"));
            }
            if state.clients.is_empty() {
                return Err(PxeError::NoClients(id.to_string()));
            }
            let now = Utc::now();
            state.status = SessionStatus::Active;
            state.started_at = Some(now);
            let mut devices = Vec::new();
            for client in state.clients.values_mut() {
                if !client.status.is_finished() {
                    client.status = ParticipantStatus::Downloading;
                }
                devices.extend(client.device_id.clone());
            }
            (state.clients.len(), devices, now)
        };

        self.persist_session(
            id,
            SessionUpdate {
                status: Some(SessionStatus::Active),
                started_at: Some(started_at),
                ..Default::default()
            },
        )
        .await;
        for device in &devices {
            self.persist_participant(
                id,
                device,
                ParticipantUpdate {
                    status: Some(ParticipantStatus::Downloading),
                    ..Default::default()
                },
            )
            .await;
        }
        self.emit(MulticastEvent::TransmissionStarted {
            session_id: id.clone(),
            clients,
        });
        self.log_activity(id, &format!("Transmission started to {clients} clients")).await;
        info!(session_id = %id, clients, "Multicast transmission started");

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.run(handle).await }))
    }

    /// Stops a session that has not finished, announces `end` and drops it
    /// from the registry.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<SessionSnapshot, PxeError> {
        let handle = self.handle(id)?;
        let (snapshot, control_target) = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Err(invalid_state(&state, "session has already finished"));
            }
            state.status = SessionStatus::Cancelled;
            state.completed_at = Some(Utc::now());
            (state.snapshot(), state.control_target())
        };
        handle.wake.notify_one();
        self.remove_handle(id, &handle);

        self.announce_end(id, SessionStatus::Cancelled, control_target).await;
        self.persist_session(
            id,
            SessionUpdate {
                status: Some(SessionStatus::Cancelled),
                bytes_sent: Some(snapshot.bytes_sent),
                completed_at: snapshot.completed_at,
                ..Default::default()
            },
        )
        .await;
        self.emit(MulticastEvent::SessionCancelled { session_id: id.clone() });
        self.log_activity(id, "Session cancelled").await;
        info!(session_id = %id, bytes_sent = snapshot.bytes_sent, "Multicast session cancelled");
        Ok(snapshot)
    }

    /// Drops a finished session from the registry.
    pub async fn remove_session(&self, id: &SessionId) -> Result<SessionSnapshot, PxeError> {
        let handle = self.handle(id)?;
        let snapshot = {
            let state = handle.state.lock().await;
            if !state.status.is_terminal() {
                return Err(invalid_state(&state, "cancel the session before removing it"));
            }
            state.snapshot()
        };
        self.remove_handle(id, &handle);
        debug!(session_id = %id, "Multicast session removed");
        Ok(snapshot)
    }

    pub async fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let handle = self.handle(id).ok()?;
        let state = handle.state.lock().await;
        Some(state.snapshot())
    }

    /// Snapshots of every registered session, oldest first.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = self.read_sessions().values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.state.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        snapshots
    }

    /// Cancels every active session.
    pub async fn shutdown(&self) {
        for snapshot in self.sessions().await {
            if snapshot.status == SessionStatus::Active {
                if let Err(e) = self.cancel_session(&snapshot.session_id).await {
                    debug!(session_id = %snapshot.session_id, error = %e, "Session finished during shutdown");
                }
            }
        }
    }

    async fn run(self: Arc<Self>, handle: Arc<SessionHandle>) {
        match self.transmit(&handle).await {
            Ok(true) => self.complete(&handle).await,
            // Cancelled; the canceller already announced and persisted it
            Ok(false) => {}
            Err(e) => self.fail(&handle, e.to_string()).await,
        }
    }

    /// Sends every chunk. Returns `false` when the session stopped being
    /// active before the last chunk.
    async fn transmit(&self, handle: &SessionHandle) -> Result<bool, PxeError> {
        let (id, source, start, control_target, data_target, total_chunks, first_chunk) = {
            let state = handle.state.lock().await;
            let source = state
                .source
                .clone()
                .ok_or_else(|| invalid_state(&state, "no image assigned"))?;
            let start = ControlMessage::Start {
                session_id: state.id.to_string(),
                total_chunks: state.total_chunks,
                total_size: state.total_size,
                chunk_size: u32::try_from(state.chunk_size).unwrap_or(u32::MAX),
            };
            (
                state.id.clone(),
                source,
                start,
                state.control_target(),
                state.data_target(),
                state.total_chunks,
                state.current_chunk,
            )
        };

        self.send_control(&start, control_target).await?;
        let mut reader = source.open().await?;
        let throttle = self.options.throttle;
        let started = Instant::now();

        let mut index = first_chunk;
        while index < total_chunks {
            let (offset, len) = {
                let state = handle.state.lock().await;
                if state.status != SessionStatus::Active {
                    return Ok(false);
                }
                (state.chunk_offset(index), state.chunk_len(index))
            };

            let payload = reader.read_at(offset, len).await?;
            self.sink
                .send_to(&encode_data(index, total_chunks, &payload), data_target)
                .await?;
            index += 1;

            let report = {
                let mut state = handle.state.lock().await;
                if state.status != SessionStatus::Active {
                    return Ok(false);
                }
                state.current_chunk = index;
                state.bytes_sent += len as u64;
                if index % PROGRESS_INTERVAL == 0 || index == total_chunks {
                    let elapsed = started.elapsed().as_secs_f64();
                    let throughput = if elapsed > 0.0 { state.bytes_sent as f64 / elapsed } else { 0.0 };
                    let percentage = state.sent_percentage();
                    let mut participants = Vec::new();
                    for client in state.clients.values_mut() {
                        if client.status.is_finished() {
                            continue;
                        }
                        client.progress = client.progress.max(percentage);
                        if let Some(device) = &client.device_id {
                            participants.push((device.clone(), client.progress));
                        }
                    }
                    Some(ProgressReport {
                        chunks_sent: index,
                        total_chunks,
                        bytes_sent: state.bytes_sent,
                        throughput,
                        participants,
                    })
                } else {
                    None
                }
            };
            if let Some(report) = report {
                self.report_progress(&id, report).await;
            }

            if !throttle.is_zero() && index < total_chunks {
                tokio::select! {
                    () = tokio::time::sleep(throttle) => {}
                    () = handle.wake.notified() => {}
                }
            }
        }
        Ok(true)
    }

    async fn report_progress(&self, id: &SessionId, report: ProgressReport) {
        debug!(
            session_id = %id,
            chunks_sent = report.chunks_sent,
            total_chunks = report.total_chunks,
            bytes_sent = report.bytes_sent,
            "Multicast progress"
        );
        self.persist_session(
            id,
            SessionUpdate {
                bytes_sent: Some(report.bytes_sent),
                throughput: Some(report.throughput),
                ..Default::default()
            },
        )
        .await;
        for (device, progress) in &report.participants {
            self.persist_participant(
                id,
                device,
                ParticipantUpdate {
                    progress: Some(*progress),
                    ..Default::default()
                },
            )
            .await;
        }
        self.emit(MulticastEvent::Progress {
            session_id: id.clone(),
            chunks_sent: report.chunks_sent,
            total_chunks: report.total_chunks,
            bytes_sent: report.bytes_sent,
            throughput: report.throughput,
        });
    }

    async fn complete(&self, handle: &SessionHandle) {
        let now = Utc::now();
        let (id, control_target, bytes_sent, duration_secs, devices) = {
            let mut state = handle.state.lock().await;
            if state.status != SessionStatus::Active {
                return;
            }
            state.status = SessionStatus::Completed;
            state.completed_at = Some(now);
            let mut devices = Vec::new();
            for client in state.clients.values_mut() {
                client.status = ParticipantStatus::Completed;
                client.progress = 100.0;
                devices.extend(client.device_id.clone());
            }
            let duration_secs = state
                .started_at
                .map_or(0.0, |started| (now - started).num_milliseconds() as f64 / 1000.0);
            (state.id.clone(), state.control_target(), state.bytes_sent, duration_secs, devices)
        };

        self.announce_end(&id, SessionStatus::Completed, control_target).await;
        let throughput = if duration_secs > 0.0 { bytes_sent as f64 / duration_secs } else { 0.0 };
        self.persist_session(
            &id,
            SessionUpdate {
                status: Some(SessionStatus::Completed),
                bytes_sent: Some(bytes_sent),
                throughput: Some(throughput),
                completed_at: Some(now),
                ..Default::default()
            },
        )
        .await;
        for device in &devices {
            self.persist_participant(
                &id,
                device,
                ParticipantUpdate {
                    status: Some(ParticipantStatus::Completed),
                    progress: Some(100.0),
                    ..Default::default()
                },
            )
            .await;
        }
        self.emit(MulticastEvent::SessionCompleted {
            session_id: id.clone(),
            bytes_sent,
            duration_secs,
        });
        self.log_activity(&id, &format!("Session completed, {bytes_sent} bytes in {duration_secs:.1}s"))
            .await;
        info!(session_id = %id, bytes_sent, duration_secs, "Multicast session completed");
    }

    async fn fail(&self, handle: &SessionHandle, message: String) {
        let now = Utc::now();
        let (id, control_target, bytes_sent, devices) = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = SessionStatus::Failed;
            state.error = Some(message.clone());
            state.completed_at = Some(now);
            let mut devices = Vec::new();
            for client in state.clients.values_mut() {
                client.status = ParticipantStatus::Failed;
                devices.extend(client.device_id.clone());
            }
            (state.id.clone(), state.control_target(), state.bytes_sent, devices)
        };

        error!(session_id = %id, error = %message, "Multicast session failed");
        self.announce_end(&id, SessionStatus::Failed, control_target).await;
        self.persist_session(
            &id,
            SessionUpdate {
                status: Some(SessionStatus::Failed),
                bytes_sent: Some(bytes_sent),
                completed_at: Some(now),
                error: Some(message.clone()),
                ..Default::default()
            },
        )
        .await;
        for device in &devices {
            self.persist_participant(
                &id,
                device,
                ParticipantUpdate {
                    status: Some(ParticipantStatus::Failed),
                    ..Default::default()
                },
            )
            .await;
        }
        self.log_activity(&id, &format!("Session failed: {message}")).await;
        self.emit(MulticastEvent::SessionFailed {
            session_id: id,
            error: message,
        });
    }

    pub(super) fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>, PxeError> {
        self.read_sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| PxeError::SessionNotFound(id.to_string()))
    }

    fn remove_handle(&self, id: &SessionId, handle: &Arc<SessionHandle>) {
        let mut sessions = self.write_sessions();
        if sessions.get(id).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            sessions.remove(id);
        }
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionHandle>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionHandle>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) async fn send_control(&self, message: &ControlMessage, target: SocketAddr) -> Result<(), PxeError> {
        let bytes = message.encode()?;
        self.sink.send_to(&bytes, target).await?;
        Ok(())
    }

    async fn announce_end(&self, id: &SessionId, status: SessionStatus, target: SocketAddr) {
        let end = ControlMessage::End {
            session_id: id.to_string(),
            status,
        };
        if let Err(e) = self.send_control(&end, target).await {
            warn!(session_id = %id, error = %e, "Failed to announce end of session");
        }
    }

    pub(super) async fn persist_session(&self, id: &SessionId, update: SessionUpdate) {
        if let Err(e) = self.store.update_session(id.as_str(), update).await {
            warn!(session_id = %id, error = %e, "Failed to persist session update");
        }
    }

    pub(super) async fn persist_new_participant(&self, id: &SessionId, participant: NewParticipant) {
        let device_id = participant.device_id.clone();
        if let Err(e) = self.store.add_participant(id.as_str(), participant).await {
            warn!(session_id = %id, device_id = %device_id, error = %e, "Failed to persist participant");
        }
    }

    pub(super) async fn persist_participant(&self, id: &SessionId, device_id: &str, update: ParticipantUpdate) {
        if let Err(e) = self.store.update_participant(id.as_str(), device_id, update).await {
            warn!(session_id = %id, device_id = %device_id, error = %e, "Failed to persist participant update");
        }
    }

    pub(super) async fn log_activity(&self, id: &SessionId, message: &str) {
        if let Err(e) = self.store.log_activity(Some(id.as_str()), message).await {
            warn!(session_id = %id, error = %e, "Failed to log activity");
        }
    }

    pub(super) fn emit(&self, event: MulticastEvent) {
        let _ = self.events.send(event);
    }
}

pub(super) fn invalid_state(state: &MulticastSessionState, reason: &str) -> PxeError {
    PxeError::InvalidState {
        session: state.id.to_string(),
        status: state.status.to_string(),
        reason: reason.to_string(),
    }
}
