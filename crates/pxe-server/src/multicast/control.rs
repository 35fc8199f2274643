//! Control channel: client `join`/`ack`/`nack`/`status` handling and the
//! UDP listener on `port + 1`.
//!
//! Clients send control datagrams to the server address; the server's own
//! `start`/`end` announcements go to the group and are ignored if they loop
//! back.

use super::engine::{MulticastEngine, invalid_state};
use super::events::MulticastEvent;
use super::session::{ClientId, ClientState, SessionId};
use super::sink::bind_reusable;
use crate::error::PxeError;
use crate::packet::multicast::{ControlMessage, encode_data};
use chrono::Utc;
use imaging_store::{NewParticipant, ParticipantStatus, ParticipantUpdate, SessionStatus};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

impl MulticastEngine {
    /// Decodes and applies one control datagram from `from`.
    pub async fn handle_control_datagram(&self, buf: &[u8], from: SocketAddr) -> Result<(), PxeError> {
        let message = ControlMessage::decode(buf)?;
        self.handle_control(message, from).await
    }

    pub async fn handle_control(&self, message: ControlMessage, from: SocketAddr) -> Result<(), PxeError> {
        match message {
            ControlMessage::Join {
                session_id,
                client_id,
                device_id,
                mac_address,
            } => {
                self.join(session_id.into(), client_id.into(), device_id, mac_address, from)
                    .await
            }
            ControlMessage::Ack {
                session_id,
                client_id,
                chunk_index,
                progress,
                bytes_received,
            } => {
                self.ack(session_id.into(), client_id.into(), chunk_index, progress, bytes_received)
                    .await
            }
            ControlMessage::Nack {
                session_id,
                client_id,
                chunk_index,
            } => self.nack(session_id.into(), client_id.into(), chunk_index).await,
            ControlMessage::Status {
                session_id,
                client_id,
                progress,
            } => self.client_status(session_id.into(), client_id.into(), progress).await,
            ControlMessage::Start { session_id, .. } | ControlMessage::End { session_id, .. } => {
                debug!(session_id = %session_id, peer = %from, "Ignoring server announcement");
                Ok(())
            }
        }
    }

    async fn join(
        &self,
        session_id: SessionId,
        client_id: ClientId,
        device_id: Option<String>,
        mac_address: Option<String>,
        from: SocketAddr,
    ) -> Result<(), PxeError> {
        let handle = self.handle(&session_id)?;
        let participant = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Err(invalid_state(&state, "session has finished"));
            }
            if state.clients.contains_key(&client_id) {
                debug!(session_id = %session_id, client_id = %client_id, "Duplicate join ignored");
                return Ok(());
            }
            let mut client = ClientState::new(client_id.clone(), device_id.clone(), mac_address.clone(), from);
            if state.status == SessionStatus::Active {
                client.status = ParticipantStatus::Downloading;
            }
            let joined_at = client.joined_at;
            state.clients.insert(client_id.clone(), client);
            device_id.clone().map(|device_id| NewParticipant {
                device_id,
                mac_address,
                ip_address: Some(from.ip()),
                joined_at,
            })
        };

        if let Some(participant) = participant {
            self.persist_new_participant(&session_id, participant).await;
        }
        self.emit(MulticastEvent::ClientJoined {
            session_id: session_id.clone(),
            client_id: client_id.clone(),
            device_id,
        });
        self.log_activity(&session_id, &format!("Client {client_id} joined from {from}"))
            .await;
        info!(session_id = %session_id, client_id = %client_id, peer = %from, "Client joined");
        Ok(())
    }

    async fn ack(
        &self,
        session_id: SessionId,
        client_id: ClientId,
        chunk_index: u32,
        progress: Option<f64>,
        bytes_received: Option<u64>,
    ) -> Result<(), PxeError> {
        let handle = self.handle(&session_id)?;
        let update = {
            let mut state = handle.state.lock().await;
            let (total_chunks, chunk_size, total_size) = (state.total_chunks, state.chunk_size, state.total_size);
            let Some(client) = state.clients.get_mut(&client_id) else {
                return Err(client_not_found(&session_id, &client_id));
            };
            if chunk_index >= total_chunks {
                return Err(PxeError::ChunkOutOfRange {
                    index: chunk_index,
                    total: total_chunks,
                });
            }

            client.acked.insert(chunk_index);
            client.last_ack_at = Some(Utc::now());
            let acked = client.acked.len() as u64;
            let derived = acked as f64 * 100.0 / f64::from(total_chunks);
            client.progress = progress.unwrap_or(derived).clamp(0.0, 100.0);
            client.bytes_received =
                bytes_received.unwrap_or_else(|| (acked * chunk_size as u64).min(total_size));
            if acked == u64::from(total_chunks) {
                client.status = ParticipantStatus::Completed;
                client.progress = 100.0;
            } else if !client.status.is_finished() {
                client.status = ParticipantStatus::Downloading;
            }

            client.device_id.clone().map(|device_id| {
                (
                    device_id,
                    ParticipantUpdate {
                        status: Some(client.status),
                        progress: Some(client.progress),
                        bytes_received: Some(client.bytes_received),
                    },
                )
            })
        };

        if let Some((device_id, update)) = update {
            self.persist_participant(&session_id, &device_id, update).await;
        }
        debug!(session_id = %session_id, client_id = %client_id, chunk = chunk_index, "ACK");
        Ok(())
    }

    /// Re-reads the requested chunk and re-sends it to the whole group.
    async fn nack(&self, session_id: SessionId, client_id: ClientId, chunk_index: u32) -> Result<(), PxeError> {
        let handle = self.handle(&session_id)?;
        let (source, offset, len, total_chunks, target) = {
            let mut state = handle.state.lock().await;
            if state.status != SessionStatus::Active {
                return Err(invalid_state(&state, "retransmission needs an active session"));
            }
            if !state.clients.contains_key(&client_id) {
                return Err(client_not_found(&session_id, &client_id));
            }
            if chunk_index >= state.total_chunks {
                return Err(PxeError::ChunkOutOfRange {
                    index: chunk_index,
                    total: state.total_chunks,
                });
            }
            let source = state
                .source
                .clone()
                .ok_or_else(|| invalid_state(&state, "no image assigned"))?;
            state
                .pending_retransmits
                .entry(chunk_index)
                .or_default()
                .insert(client_id.clone());
            (
                source,
                state.chunk_offset(chunk_index),
                state.chunk_len(chunk_index),
                state.total_chunks,
                state.data_target(),
            )
        };

        let payload = source.read_chunk(offset, len).await?;
        self.sink
            .send_to(&encode_data(chunk_index, total_chunks, &payload), target)
            .await?;

        // The group repair serves every client queued for this chunk
        let served = handle
            .state
            .lock()
            .await
            .pending_retransmits
            .remove(&chunk_index)
            .map_or(0, |clients| clients.len());
        debug!(
            session_id = %session_id,
            client_id = %client_id,
            chunk = chunk_index,
            served,
            "Chunk retransmitted"
        );
        Ok(())
    }

    async fn client_status(
        &self,
        session_id: SessionId,
        client_id: ClientId,
        progress: Option<f64>,
    ) -> Result<(), PxeError> {
        let handle = self.handle(&session_id)?;
        let update = {
            let mut state = handle.state.lock().await;
            let Some(client) = state.clients.get_mut(&client_id) else {
                return Err(client_not_found(&session_id, &client_id));
            };
            let Some(progress) = progress else {
                return Ok(());
            };
            client.progress = progress.clamp(0.0, 100.0);
            client.device_id.clone().map(|device_id| (device_id, client.progress))
        };

        if let Some((device_id, progress)) = update {
            self.persist_participant(
                &session_id,
                &device_id,
                ParticipantUpdate {
                    progress: Some(progress),
                    ..Default::default()
                },
            )
            .await;
        }
        Ok(())
    }
}

fn client_not_found(session_id: &SessionId, client_id: &ClientId) -> PxeError {
    PxeError::ClientNotFound {
        session: session_id.to_string(),
        client: client_id.to_string(),
    }
}

/// UDP listener for the control channel.
pub struct ControlServer {
    engine: Arc<MulticastEngine>,
    bind: SocketAddr,
}

impl ControlServer {
    /// Listener for sessions whose data port is `data_port`.
    pub fn new(engine: Arc<MulticastEngine>, data_port: u16) -> Self {
        Self {
            engine,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, data_port.wrapping_add(1))),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    pub async fn bind(&self) -> Result<UdpSocket, PxeError> {
        let socket = bind_reusable(self.bind)?;
        info!(addr = %self.bind, "Multicast control channel listening");
        Ok(socket)
    }

    /// Handles control datagrams until the task is aborted.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), PxeError> {
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Control receive error");
                    continue;
                }
            };
            match self.engine.handle_control_datagram(&buf[..len], peer).await {
                Ok(()) => {}
                Err(PxeError::Packet(e)) => debug!(peer = %peer, error = %e, "Discarding malformed control datagram"),
                Err(e) => warn!(peer = %peer, error = %e, "Control message rejected"),
            }
        }
    }

    /// Binds and serves.
    pub async fn start(&self) -> Result<(), PxeError> {
        let socket = self.bind().await?;
        self.serve(socket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::engine::tests as fixtures;
    use crate::multicast::sink::RecordingSink;
    use imaging_store::{ImageRecord, InMemoryStore};
    use std::path::Path;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "10.0.0.20:40000".parse().unwrap()
    }

    fn setup(throttle: Duration) -> (InMemoryStore, RecordingSink, Arc<MulticastEngine>) {
        let store = InMemoryStore::new();
        store.add_image(ImageRecord {
            id: "img".to_string(),
            filename: "gone.img".to_string(),
            size: 10 * 1024,
        });
        let sink = RecordingSink::new();
        let engine = fixtures::engine(fixtures::options(Path::new("/nonexistent"), 1024, throttle), &store, &sink);
        (store, sink, engine)
    }

    fn ack(client: &str, chunk_index: u32, progress: Option<f64>) -> ControlMessage {
        ControlMessage::Ack {
            session_id: "s1".to_string(),
            client_id: client.to_string(),
            chunk_index,
            progress,
            bytes_received: None,
        }
    }

    fn nack(client: &str, chunk_index: u32) -> ControlMessage {
        ControlMessage::Nack {
            session_id: "s1".to_string(),
            client_id: client.to_string(),
            chunk_index,
        }
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        let result = engine
            .handle_control(
                ControlMessage::Join {
                    session_id: "nope".to_string(),
                    client_id: "c1".to_string(),
                    device_id: None,
                    mac_address: None,
                },
                peer(),
            )
            .await;
        assert!(matches!(result, Err(PxeError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_join_registers_once_and_persists_devices() {
        let (store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.prepare_session(id.clone(), None, None).await.unwrap();

        fixtures::join(&engine, "s1", "c1", Some("dev-1")).await;
        fixtures::join(&engine, "s1", "c1", Some("dev-1")).await;
        fixtures::join(&engine, "s1", "c2", None).await;

        let snapshot = engine.session(&id).await.unwrap();
        assert_eq!(snapshot.clients.len(), 2);
        assert_eq!(snapshot.clients[0].status, ParticipantStatus::Registered);
        let participants = store.participants("s1");
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].device_id, "dev-1");
        assert_eq!(participants[0].ip_address, Some("10.0.0.20".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_join_finished_session_rejected() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;
        engine.begin_transmission(&id).await.unwrap().await.unwrap();

        let result = engine
            .handle_control(
                ControlMessage::Join {
                    session_id: "s1".to_string(),
                    client_id: "late".to_string(),
                    device_id: None,
                    mac_address: None,
                },
                peer(),
            )
            .await;
        assert!(matches!(result, Err(PxeError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_ack_derives_progress() {
        let (store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", Some("dev-1")).await;

        for chunk in [0, 1, 1, 2] {
            engine.handle_control(ack("c1", chunk, None), peer()).await.unwrap();
        }

        let client = engine.session(&id).await.unwrap().clients.remove(0);
        assert_eq!(client.acked_chunks, 3);
        assert_eq!(client.progress, 30.0);
        assert_eq!(client.bytes_received, 3 * 1024);
        assert_eq!(client.status, ParticipantStatus::Downloading);
        assert!(client.last_ack_at.is_some());

        let participant = store.participants("s1").remove(0);
        assert_eq!(participant.progress, 30.0);
        assert_eq!(participant.bytes_received, 3 * 1024);
    }

    #[tokio::test]
    async fn test_ack_prefers_reported_values() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;

        let message = ControlMessage::Ack {
            session_id: "s1".to_string(),
            client_id: "c1".to_string(),
            chunk_index: 0,
            progress: Some(42.5),
            bytes_received: Some(4321),
        };
        engine.handle_control(message, peer()).await.unwrap();

        let client = engine.session(&id).await.unwrap().clients.remove(0);
        assert_eq!(client.progress, 42.5);
        assert_eq!(client.bytes_received, 4321);
    }

    #[tokio::test]
    async fn test_acking_every_chunk_completes_client() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;

        for chunk in 0..10 {
            engine.handle_control(ack("c1", chunk, None), peer()).await.unwrap();
        }
        let client = engine.session(&id).await.unwrap().clients.remove(0);
        assert_eq!(client.status, ParticipantStatus::Completed);
        assert_eq!(client.progress, 100.0);
        assert_eq!(client.bytes_received, 10 * 1024);
    }

    #[tokio::test]
    async fn test_ack_errors() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;

        assert!(matches!(
            engine.handle_control(ack("stranger", 0, None), peer()).await,
            Err(PxeError::ClientNotFound { .. })
        ));
        assert!(matches!(
            engine.handle_control(ack("c1", 10, None), peer()).await,
            Err(PxeError::ChunkOutOfRange { index: 10, total: 10 })
        ));
    }

    #[tokio::test]
    async fn test_nack_requires_active_session() {
        let (_store, sink, engine) = setup(Duration::ZERO);
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;

        assert!(matches!(
            engine.handle_control(nack("c1", 0), peer()).await,
            Err(PxeError::InvalidState { .. })
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_nack_resends_chunk_to_group() {
        let (_store, sink, engine) = setup(Duration::from_secs(60));
        let id = SessionId::from("s1");
        engine.start_session(fixtures::start_request("s1", "img")).await.unwrap();
        fixtures::join(&engine, "s1", "c1", None).await;
        let task = engine.begin_transmission(&id).await.unwrap();

        // Wait for the first chunk; the loop then sleeps for the throttle
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.data_packets().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.handle_control(nack("c1", 7), peer()).await.unwrap();
        let packets = sink.data_packets();
        let repair = packets.last().unwrap();
        assert_eq!(repair.chunk_index, 7);
        assert_eq!(repair.payload, crate::multicast::source::filler(7 * 1024, 1024));
        assert_eq!(sink.sent().last().unwrap().0, "239.255.0.1:9000".parse().unwrap());
        assert_eq!(engine.session(&id).await.unwrap().pending_retransmits, 0);

        assert!(matches!(
            engine.handle_control(nack("c1", 10), peer()).await,
            Err(PxeError::ChunkOutOfRange { .. })
        ));
        assert!(matches!(
            engine.handle_control(nack("stranger", 1), peer()).await,
            Err(PxeError::ClientNotFound { .. })
        ));

        engine.cancel_session(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_updates_progress() {
        let (store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.prepare_session(id.clone(), None, None).await.unwrap();
        fixtures::join(&engine, "s1", "c1", Some("dev-1")).await;

        let status = |progress| ControlMessage::Status {
            session_id: "s1".to_string(),
            client_id: "c1".to_string(),
            progress,
        };
        engine.handle_control(status(Some(55.0)), peer()).await.unwrap();
        engine.handle_control(status(None), peer()).await.unwrap();
        engine.handle_control(status(Some(250.0)), peer()).await.unwrap();

        assert_eq!(engine.session(&id).await.unwrap().clients[0].progress, 100.0);
        assert_eq!(store.participants("s1")[0].progress, 100.0);
    }

    #[tokio::test]
    async fn test_malformed_datagram() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        assert!(matches!(
            engine.handle_control_datagram(b"{\"type\":\"join\"", peer()).await,
            Err(PxeError::Packet(_))
        ));
        // Our own announcements are ignored
        let end = br#"{"type":"end","sessionId":"s1","status":"completed"}"#;
        assert!(engine.handle_control_datagram(end, peer()).await.is_ok());
    }

    #[tokio::test]
    async fn test_control_server_over_udp() {
        let (_store, _sink, engine) = setup(Duration::ZERO);
        let id = SessionId::from("s1");
        engine.prepare_session(id.clone(), None, None).await.unwrap();

        let server = ControlServer::new(Arc::clone(&engine), 9000);
        assert_eq!(server.bind_addr().port(), 9001);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move { server.serve(socket).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"garbage", server_addr).await.unwrap();
        client
            .send_to(
                br#"{"type":"join","sessionId":"s1","clientId":"c1","macAddress":"52:54:00:12:34:56"}"#,
                server_addr,
            )
            .await
            .unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = engine.session(&id).await.unwrap();
                if let Some(client) = snapshot.clients.into_iter().next() {
                    return client;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(joined.client_id, ClientId::from("c1"));
        assert_eq!(joined.address, client.local_addr().unwrap());
        assert_eq!(joined.mac_address.as_deref(), Some("52:54:00:12:34:56"));
        task.abort();
    }
}
