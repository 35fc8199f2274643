//! TFTP server implementation.
//!
//! This module implements a read-only TFTP server for serving boot
//! programs, kernels and initrds during PXE boot.
//!
//! Each peer `(address, port)` has at most one transfer in flight. A
//! transfer moves in lockstep: DATA block `n` is sent, the peer ACKs `n`,
//! block `n + 1` follows. A DATA block shorter than 512 bytes is final; a
//! file whose size is an exact multiple of 512 ends with an empty block.
//!
//! There is no retransmission timer. PXE firmware retries its RRQ or last
//! ACK on timeout, and a retried RRQ restarts the transfer. A transfer whose
//! peer goes silent keeps its file open until that peer sends a new RRQ.
//!
//! **Note:** TFTP is IPv4-only here.

use crate::error::PxeError;
use crate::packet::PacketError;
use crate::packet::tftp::{BLOCK_SIZE, ErrorCode, TftpPacket, TransferMode};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

/// Largest TFTP datagram we expect to receive (RRQ with options).
const RECV_BUFFER_LEN: usize = 1500;

/// Observable transfer milestones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpEvent {
    /// A read request was accepted and the first block sent
    ReadRequest {
        peer: SocketAddr,
        filename: String,
        size: u64,
    },
    /// The final block was acknowledged
    TransferCompleted {
        peer: SocketAddr,
        filename: String,
        bytes: u64,
    },
    /// The transfer was abandoned (peer error or read failure)
    TransferFailed {
        peer: SocketAddr,
        filename: String,
        reason: String,
    },
}

#[derive(Debug)]
struct TransferState {
    filename: String,
    file: File,
    /// Block number of the last DATA sent, i.e. the ACK we wait for
    block: u16,
    /// Payload length of the last DATA sent
    last_len: usize,
    bytes_sent: u64,
    total_size: u64,
}

type TransferHandle = Arc<AsyncMutex<TransferState>>;

/// Per-peer transfer state machine over a confined, read-only root.
#[derive(Debug)]
pub struct TftpEngine {
    root: PathBuf,
    transfers: Mutex<HashMap<SocketAddr, TransferHandle>>,
    events: broadcast::Sender<TftpEvent>,
}

impl TftpEngine {
    /// Creates an engine serving files below `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PxeError> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root)
            .map_err(|e| PxeError::Configuration(format!("TFTP root {}: {e}", root.display())))?;
        if !root.is_dir() {
            return Err(PxeError::Configuration(format!(
                "TFTP root {} is not a directory",
                root.display()
            )));
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            root,
            transfers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Receiver for transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TftpEvent> {
        self.events.subscribe()
    }

    /// Number of transfers awaiting an ACK.
    pub fn active_transfers(&self) -> usize {
        self.lock_transfers().len()
    }

    /// Decodes and handles one datagram, returning the reply to send.
    ///
    /// Malformed datagrams produce no reply; unknown opcodes are answered
    /// with ERROR 4.
    pub async fn handle_datagram(&self, buf: &[u8], peer: SocketAddr) -> Option<TftpPacket> {
        match TftpPacket::decode(buf) {
            Ok(packet) => self.handle_packet(packet, peer).await,
            Err(PacketError::UnknownOpcode(opcode)) => {
                debug!(peer = %peer, opcode, "Rejecting unknown TFTP opcode");
                Some(TftpPacket::error(ErrorCode::IllegalOperation, "Illegal operation"))
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Discarding malformed TFTP datagram");
                None
            }
        }
    }

    pub async fn handle_packet(&self, packet: TftpPacket, peer: SocketAddr) -> Option<TftpPacket> {
        match packet {
            TftpPacket::ReadRequest { filename, mode } => Some(self.read_request(filename, &mode, peer).await),
            TftpPacket::Ack { block } => self.ack(block, peer).await,
            TftpPacket::WriteRequest { filename, .. } => {
                warn!(peer = %peer, filename = %filename, "Rejecting TFTP write request");
                Some(TftpPacket::error(ErrorCode::IllegalOperation, "Illegal operation"))
            }
            TftpPacket::Error { code, message } => {
                if let Some(filename) = self.abort(peer) {
                    warn!(peer = %peer, code, message = %message, "Peer aborted TFTP transfer");
                    self.emit(TftpEvent::TransferFailed {
                        peer,
                        filename,
                        reason: format!("peer error {code}: {message}"),
                    });
                }
                None
            }
            TftpPacket::Data { .. } => Some(TftpPacket::error(ErrorCode::IllegalOperation, "Illegal operation")),
        }
    }

    /// Drops the peer's transfer, returning its filename if there was one.
    pub fn abort(&self, peer: SocketAddr) -> Option<String> {
        let handle = self.lock_transfers().remove(&peer)?;
        // A concurrent handler may hold the lock; the name is best effort
        handle.try_lock().ok().map(|state| state.filename.clone())
    }

    async fn read_request(&self, filename: String, mode: &str, peer: SocketAddr) -> TftpPacket {
        if TransferMode::parse(mode) != Some(TransferMode::Octet) {
            warn!(peer = %peer, mode = %mode, "Unsupported TFTP mode");
            return TftpPacket::error(ErrorCode::IllegalOperation, "Unsupported mode");
        }

        let path = match self.resolve(&filename).await {
            Ok(path) => path,
            Err(reply) => {
                warn!(peer = %peer, filename = %filename, "TFTP read request refused");
                return reply;
            }
        };

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => return io_error_reply(&e),
        };
        let total_size = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => return io_error_reply(&e),
        };
        let payload = match read_block(&mut file).await {
            Ok(payload) => payload,
            Err(e) => return io_error_reply(&e),
        };

        info!(peer = %peer, filename = %filename, size = total_size, "TFTP read request");

        let state = TransferState {
            filename: filename.clone(),
            file,
            block: 1,
            last_len: payload.len(),
            bytes_sent: payload.len() as u64,
            total_size,
        };
        // A retried RRQ restarts the transfer from block 1
        self.lock_transfers()
            .insert(peer, Arc::new(AsyncMutex::new(state)));

        self.emit(TftpEvent::ReadRequest {
            peer,
            filename,
            size: total_size,
        });
        TftpPacket::Data { block: 1, payload }
    }

    async fn ack(&self, block: u16, peer: SocketAddr) -> Option<TftpPacket> {
        let Some(handle) = self.lock_transfers().get(&peer).cloned() else {
            debug!(peer = %peer, block, "ACK for unknown transfer");
            return Some(TftpPacket::error(ErrorCode::UnknownTransferId, "Unknown transfer ID"));
        };

        let mut state = handle.lock().await;
        if block != state.block {
            debug!(peer = %peer, block, expected = state.block, "Ignoring stale ACK");
            return None;
        }

        if state.last_len < BLOCK_SIZE {
            self.remove_if_current(peer, &handle);
            info!(
                peer = %peer,
                filename = %state.filename,
                bytes = state.bytes_sent,
                "TFTP transfer completed"
            );
            self.emit(TftpEvent::TransferCompleted {
                peer,
                filename: state.filename.clone(),
                bytes: state.bytes_sent,
            });
            return None;
        }

        let payload = match read_block(&mut state.file).await {
            Ok(payload) => payload,
            Err(e) => {
                self.remove_if_current(peer, &handle);
                warn!(peer = %peer, filename = %state.filename, error = %e, "TFTP read failed");
                self.emit(TftpEvent::TransferFailed {
                    peer,
                    filename: state.filename.clone(),
                    reason: e.to_string(),
                });
                return Some(io_error_reply(&e));
            }
        };

        state.block = state.block.wrapping_add(1);
        state.last_len = payload.len();
        state.bytes_sent += payload.len() as u64;
        debug!(
            peer = %peer,
            block = state.block,
            sent = state.bytes_sent,
            total = state.total_size,
            "TFTP block"
        );
        Some(TftpPacket::Data {
            block: state.block,
            payload,
        })
    }

    /// Maps a requested name to a file below the root.
    ///
    /// Names containing `..` or `~`, and names resolving (through symlinks)
    /// outside the root, are refused with ERROR 2.
    pub async fn resolve(&self, filename: &str) -> Result<PathBuf, TftpPacket> {
        let access_denied = || TftpPacket::error(ErrorCode::AccessViolation, "Access denied");
        let not_found = || TftpPacket::error(ErrorCode::FileNotFound, "File not found");

        let normalized = filename.replace('\\', "/");
        if normalized.contains("..") || normalized.contains('~') {
            return Err(access_denied());
        }
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            return Err(not_found());
        }

        let resolved = match tokio::fs::canonicalize(self.root.join(relative)).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(_) => return Err(access_denied()),
        };
        if !resolved.starts_with(&self.root) {
            return Err(access_denied());
        }
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => Ok(resolved),
            _ => Err(not_found()),
        }
    }

    fn remove_if_current(&self, peer: SocketAddr, handle: &TransferHandle) {
        let mut transfers = self.lock_transfers();
        if transfers.get(&peer).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            transfers.remove(&peer);
        }
    }

    fn lock_transfers(&self) -> MutexGuard<'_, HashMap<SocketAddr, TransferHandle>> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TftpEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn io_error_reply(error: &std::io::Error) -> TftpPacket {
    match error.kind() {
        ErrorKind::NotFound => TftpPacket::error(ErrorCode::FileNotFound, "File not found"),
        ErrorKind::PermissionDenied => TftpPacket::error(ErrorCode::AccessViolation, "Access denied"),
        _ => TftpPacket::error(ErrorCode::NotDefined, "Read error"),
    }
}

/// Reads up to one block; shorter only at end of file.
async fn read_block(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut payload = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = file.read(&mut payload[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    payload.truncate(filled);
    Ok(payload)
}

/// TFTP server for PXE boot file delivery (IPv4 only).
///
/// Owns the UDP loop and hands every datagram to the [`TftpEngine`].
pub struct TftpServer {
    engine: Arc<TftpEngine>,
    bind: SocketAddr,
}

impl TftpServer {
    /// Creates a new TFTP server instance (IPv4 only).
    pub fn new(root: impl AsRef<Path>, port: u16) -> Result<Self, PxeError> {
        Ok(Self {
            engine: Arc::new(TftpEngine::new(root)?),
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
        })
    }

    pub fn engine(&self) -> Arc<TftpEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn bind(&self) -> Result<UdpSocket, PxeError> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .map_err(|e| PxeError::Tftp(format!("cannot bind {}: {e}", self.bind)))?;
        info!(addr = %self.bind, root = %self.engine.root().display(), "TFTP server listening");
        Ok(socket)
    }

    /// Serves requests on `socket` until the task is aborted.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), PxeError> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    debug!(error = %e, "TFTP receive error");
                    continue;
                }
            };
            let datagram = buf[..len].to_vec();
            let engine = Arc::clone(&self.engine);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let Some(reply) = engine.handle_datagram(&datagram, peer).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&reply.encode(), peer).await {
                    warn!(peer = %peer, error = %e, "TFTP send failed, dropping transfer");
                    engine.abort(peer);
                }
            });
        }
    }

    /// Binds and serves.
    pub async fn start(&self) -> Result<(), PxeError> {
        let socket = self.bind().await?;
        self.serve(socket).await
    }
}
