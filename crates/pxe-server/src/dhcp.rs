//! ProxyDHCP responder implementation.
//!
//! This module answers PXE boot requests with boot parameters (TFTP server
//! and boot filename) without leasing addresses, so it can sit next to the
//! site's existing DHCP server.
//!
//! The responder listens on a non-standard port and replies by broadcast to
//! the BOOTP client port.

use crate::config::ServerConfig;
use crate::error::PxeError;
use crate::multicast::sink::bind_reusable;
use crate::packet::dhcp::{self, client_arch, decode_boot_request, vendor_class};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// BOOTP client port.
pub const CLIENT_PORT: u16 = 68;

/// Vendor class prefix announced by PXE firmware.
pub const PXE_VENDOR_CLASS: &[u8] = b"PXEClient";

/// RFC 4578 architectures that boot an EFI binary.
const EFI_ARCHITECTURES: [u16; 5] = [6, 7, 9, 10, 11];

/// Builds PXE offers. Stateless.
#[derive(Debug, Clone)]
pub struct PxeResponder {
    server_ip: Ipv4Addr,
    server_name: String,
    boot_filename: String,
    efi_boot_filename: Option<String>,
}

impl PxeResponder {
    pub fn new(server_ip: Ipv4Addr, server_name: impl Into<String>, boot_filename: impl Into<String>) -> Self {
        Self {
            server_ip,
            server_name: server_name.into(),
            boot_filename: boot_filename.into(),
            efi_boot_filename: None,
        }
    }

    /// Offers `filename` instead of the BIOS one to EFI clients.
    pub fn with_efi_boot_filename(mut self, filename: impl Into<String>) -> Self {
        self.efi_boot_filename = Some(filename.into());
        self
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let responder = Self::new(
            config.server_ip,
            config.dhcp_server_name(),
            config.dhcp.boot_filename.clone(),
        );
        match &config.dhcp.efi_boot_filename {
            Some(filename) => responder.with_efi_boot_filename(filename.clone()),
            None => responder,
        }
    }

    /// Inspects a raw datagram and returns the encoded offer, or `None` when
    /// the packet is not a PXE boot request.
    pub fn respond(&self, buf: &[u8]) -> Option<Vec<u8>> {
        let request = match decode_boot_request(buf) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Ignoring non-BOOTREQUEST datagram");
                return None;
            }
        };

        if !vendor_class(&request).is_some_and(|class| class.starts_with(PXE_VENDOR_CLASS)) {
            debug!(xid = request.xid(), "Ignoring request without PXEClient vendor class");
            return None;
        }

        match request.opts().get(OptionCode::MessageType) {
            None | Some(DhcpOption::MessageType(MessageType::Discover | MessageType::Request)) => {}
            Some(other) => {
                debug!(xid = request.xid(), message_type = ?other, "Ignoring PXE message type");
                return None;
            }
        }

        let offer = self.offer(&request, client_arch(buf));
        match dhcp::encode_message(&offer) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(xid = request.xid(), error = %e, "Failed to encode PXE offer");
                None
            }
        }
    }

    /// Boot filename for the announced client architecture.
    pub fn boot_filename_for(&self, arch: Option<u16>) -> &str {
        match (&self.efi_boot_filename, arch) {
            (Some(efi), Some(arch)) if EFI_ARCHITECTURES.contains(&arch) => efi,
            _ => &self.boot_filename,
        }
    }

    /// Builds the BOOTREPLY for `request`.
    pub fn offer(&self, request: &Message, arch: Option<u16>) -> Message {
        let filename = self.boot_filename_for(arch);

        let mut reply = Message::new_with_id(
            request.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            self.server_ip,
            request.giaddr(),
            request.chaddr(),
        );
        reply.set_opcode(Opcode::BootReply);
        reply.set_flags(request.flags());
        reply.set_sname_str(&self.server_name);
        reply.set_fname_str(filename);

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(MessageType::Offer));
        opts.insert(DhcpOption::ServerIdentifier(self.server_ip));
        opts.insert(DhcpOption::ClassIdentifier(PXE_VENDOR_CLASS.to_vec()));
        opts.insert(DhcpOption::TFTPServerName(self.server_name.as_bytes().to_vec()));
        opts.insert(DhcpOption::BootfileName(filename.as_bytes().to_vec()));

        info!(
            xid = request.xid(),
            arch = ?arch,
            boot_file = %filename,
            "PXE offer"
        );
        reply
    }
}

/// ProxyDHCP server for PXE boot (IPv4).
pub struct DhcpServer {
    responder: Arc<PxeResponder>,
    bind: SocketAddr,
    reply_to: SocketAddr,
}

impl DhcpServer {
    /// Creates a new DHCP server instance listening on `port`.
    pub fn new(responder: PxeResponder, port: u16) -> Self {
        Self {
            responder: Arc::new(responder),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            reply_to: SocketAddr::from((Ipv4Addr::BROADCAST, CLIENT_PORT)),
        }
    }

    /// Overrides the broadcast destination of offers.
    pub fn with_reply_target(mut self, target: SocketAddr) -> Self {
        self.reply_to = target;
        self
    }

    pub fn responder(&self) -> &PxeResponder {
        &self.responder
    }

    /// Binds the listening socket with `SO_REUSEADDR` and broadcast enabled.
    pub async fn bind(&self) -> Result<UdpSocket, PxeError> {
        let socket = bind_reusable(self.bind)
            .map_err(|e| PxeError::Dhcp(format!("cannot bind {}: {e}", self.bind)))?;
        info!(addr = %self.bind, "ProxyDHCP responder listening");
        Ok(socket)
    }

    /// Answers requests on `socket` until the task is aborted.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), PxeError> {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "DHCP receive error");
                    continue;
                }
            };
            let Some(reply) = self.responder.respond(&buf[..len]) else {
                continue;
            };
            if let Err(e) = socket.send_to(&reply, self.reply_to).await {
                warn!(peer = %peer, target = %self.reply_to, error = %e, "Failed to send PXE offer");
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
    use crate::packet::dhcp::encode_message;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF];

    fn responder() -> PxeResponder {
        PxeResponder::new(SERVER, "192.168.1.10", "pxelinux.0")
    }

    fn request(options: Vec<DhcpOption>) -> Vec<u8> {
        let mut message = Message::new_with_id(
            0x1234_5678,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(10, 0, 0, 1),
            &MAC,
        );
        message
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        for option in options {
            message.opts_mut().insert(option);
        }
        encode_message(&message).unwrap()
    }

    fn pxe_request(arch: Option<u16>) -> Vec<u8> {
        let mut raw = request(vec![DhcpOption::ClassIdentifier(
            b"PXEClient:Arch:00000:UNDI:002001".to_vec(),
        )]);
        if let Some(arch) = arch {
            // Splice option 93 in front of END
            let mut at = 240;
            while raw[at] != 255 {
                at += 2 + usize::from(raw[at + 1]);
            }
            let [hi, lo] = arch.to_be_bytes();
            raw.splice(at..at, [93, 2, hi, lo]);
        }
        raw
    }

    fn decode_reply(bytes: &[u8]) -> Message {
        use dhcproto::{Decodable, Decoder};
        Message::decode(&mut Decoder::new(bytes)).unwrap()
    }

    fn option_bytes(message: &Message, code: OptionCode) -> Option<Vec<u8>> {
        match message.opts().get(code)? {
            DhcpOption::BootfileName(value)
            | DhcpOption::TFTPServerName(value)
            | DhcpOption::ClassIdentifier(value) => Some(value.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_offer_for_pxe_client() {
        let reply = responder()
            .respond(&request(vec![DhcpOption::ClassIdentifier(b"PXEClient:Arch:00000".to_vec())]))
            .unwrap();
        let message = decode_reply(&reply);

        assert_eq!(message.opcode(), Opcode::BootReply);
        assert_eq!(message.xid(), 0x1234_5678);
        assert_eq!(message.chaddr(), &MAC[..]);
        assert_eq!(message.siaddr(), SERVER);
        assert_eq!(message.giaddr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            message.opts().get(OptionCode::MessageType),
            Some(&DhcpOption::MessageType(MessageType::Offer))
        );
        assert_eq!(
            message.opts().get(OptionCode::ServerIdentifier),
            Some(&DhcpOption::ServerIdentifier(SERVER))
        );
        assert_eq!(option_bytes(&message, OptionCode::BootfileName), Some(b"pxelinux.0".to_vec()));
        assert_eq!(
            option_bytes(&message, OptionCode::TFTPServerName),
            Some(b"192.168.1.10".to_vec())
        );
        assert_eq!(option_bytes(&message, OptionCode::ClassIdentifier), Some(b"PXEClient".to_vec()));
        assert_eq!(reply.last(), Some(&255));
    }

    #[test]
    fn test_no_reply_without_pxe_vendor_class() {
        let responder = responder();
        assert!(responder.respond(&request(vec![])).is_none());
        assert!(responder
            .respond(&request(vec![DhcpOption::ClassIdentifier(b"MSFT 5.0".to_vec())]))
            .is_none());
        assert!(responder
            .respond(&request(vec![DhcpOption::ClassIdentifier(b"pxeclient".to_vec())]))
            .is_none());
    }

    #[test]
    fn test_no_reply_to_garbage() {
        let responder = responder();
        assert!(responder.respond(&[]).is_none());
        assert!(responder.respond(&[1u8; 100]).is_none());
        let mut reply = pxe_request(None);
        reply[0] = 2;
        assert!(responder.respond(&reply).is_none());
    }

    #[test]
    fn test_no_reply_to_release() {
        let raw = request(vec![
            DhcpOption::ClassIdentifier(b"PXEClient".to_vec()),
            DhcpOption::MessageType(MessageType::Release),
        ]);
        assert!(responder().respond(&raw).is_none());
    }

    #[test]
    fn test_efi_client_gets_efi_filename() {
        let responder = responder().with_efi_boot_filename("bootx64.efi");

        let efi = decode_reply(&responder.respond(&pxe_request(Some(7))).unwrap());
        assert_eq!(option_bytes(&efi, OptionCode::BootfileName), Some(b"bootx64.efi".to_vec()));

        let bios = decode_reply(&responder.respond(&pxe_request(Some(0))).unwrap());
        assert_eq!(option_bytes(&bios, OptionCode::BootfileName), Some(b"pxelinux.0".to_vec()));

        let unknown = decode_reply(&responder.respond(&pxe_request(None)).unwrap());
        assert_eq!(option_bytes(&unknown, OptionCode::BootfileName), Some(b"pxelinux.0".to_vec()));
    }

    #[test]
    fn test_efi_arch_without_efi_file_uses_default() {
        assert_eq!(responder().boot_filename_for(Some(9)), "pxelinux.0");
    }

    #[test]
    fn test_from_config() {
        let mut config = ServerConfig::default();
        config.server_ip = SERVER;
        config.dhcp.boot_filename = "undionly.kpxe".to_string();
        config.dhcp.efi_boot_filename = Some("ipxe.efi".to_string());

        let responder = PxeResponder::from_config(&config);
        assert_eq!(responder.boot_filename_for(None), "undionly.kpxe");
        assert_eq!(responder.boot_filename_for(Some(10)), "ipxe.efi");
    }

    #[tokio::test]
    async fn test_server_replies_over_udp() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = DhcpServer::new(responder(), 0).with_reply_target(client.local_addr().unwrap());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move { server.serve(socket).await });

        client.send_to(&pxe_request(None), server_addr).await.unwrap();
        let mut buf = vec![0u8; 1500];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_reply(&buf[..len]).xid(), 0x1234_5678);
        task.abort();
    }
}
