//! Outbound datagram path for data and control packets.

use crate::packet::multicast::{ControlMessage, DataPacket};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;

/// Sends one datagram to a target address.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
}

/// Creates a non-blocking IPv4 UDP socket with `SO_REUSEADDR` and broadcast
/// enabled, bound to `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn bind_reusable(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = configured_socket()?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn configured_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// UDP sender for multicast groups.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    /// Binds an ephemeral sender socket with the given multicast TTL and
    /// loopback setting.
    pub fn bind(ttl: u32, loopback: bool) -> io::Result<Self> {
        let socket = configured_socket()?;
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_multicast_loop_v4(loopback)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }
}

#[async_trait]
impl DatagramSink for UdpSink {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, target).await
    }
}

/// Sink that keeps every datagram in memory instead of sending it.
///
/// Used for dry runs and tests. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every datagram recorded so far, with its target.
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded datagrams that decode as data packets.
    pub fn data_packets(&self) -> Vec<DataPacket> {
        self.sent()
            .iter()
            .filter_map(|(_, bytes)| DataPacket::decode(bytes).ok())
            .collect()
    }

    /// Recorded datagrams that decode as control messages.
    pub fn control_messages(&self) -> Vec<ControlMessage> {
        self.sent()
            .iter()
            .filter_map(|(_, bytes)| ControlMessage::decode(bytes).ok())
            .collect()
    }
}

#[async_trait]
impl DatagramSink for RecordingSink {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, payload.to_vec()));
        Ok(payload.len())
    }
}
