//! DHCPv4 (BOOTP) packet handling for the PXE responder.
//!
//! Header and option encoding is delegated to `dhcproto`. This module adds
//! the pre-checks a proxy responder needs before decoding and the lookups
//! for the PXE-specific options.
//!
//! ```text
//! 0      op | htype | hlen | hops
//! 4      xid
//! 8      secs | flags
//! 12     ciaddr, yiaddr, siaddr, giaddr
//! 28     chaddr (16)
//! 44     sname (64)
//! 108    file (128)
//! 236    magic cookie 63 82 53 63
//! 240    options (code, len, value)... 255
//! ```

use super::PacketError;
use dhcproto::v4::{DhcpOption, Message, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};

/// Fixed BOOTP header plus the magic cookie.
pub const MIN_PACKET_LEN: usize = 240;

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const MAGIC_COOKIE_OFFSET: usize = 236;
const BOOTREQUEST: u8 = 1;

/// Option 93, client system architecture (RFC 4578)
pub const OPTION_CLIENT_ARCH: u8 = 93;
const OPTION_PAD: u8 = 0;
const OPTION_END: u8 = 255;

/// Decodes a BOOTREQUEST, rejecting short packets, replies and packets
/// without the DHCP magic cookie before handing the bytes to `dhcproto`.
pub fn decode_boot_request(buf: &[u8]) -> Result<Message, PacketError> {
    if buf.len() < MIN_PACKET_LEN {
        return Err(PacketError::Truncated {
            needed: MIN_PACKET_LEN,
            actual: buf.len(),
        });
    }
    if buf[0] != BOOTREQUEST {
        return Err(PacketError::NotBootRequest(buf[0]));
    }
    if buf[MAGIC_COOKIE_OFFSET..MIN_PACKET_LEN] != MAGIC_COOKIE {
        return Err(PacketError::BadMagic);
    }

    let message = Message::decode(&mut Decoder::new(buf)).map_err(|e| PacketError::Dhcp(e.to_string()))?;
    if message.opcode() != Opcode::BootRequest {
        return Err(PacketError::NotBootRequest(buf[0]));
    }
    Ok(message)
}

/// Encodes a message, options terminated by END.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, PacketError> {
    let mut buf = Vec::with_capacity(576);
    let mut encoder = Encoder::new(&mut buf);
    message
        .encode(&mut encoder)
        .map_err(|e| PacketError::Dhcp(e.to_string()))?;
    Ok(buf)
}

/// Value of option 60 (Vendor Class Identifier), if present.
pub fn vendor_class(message: &Message) -> Option<&[u8]> {
    match message.opts().get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(value)) => Some(value.as_slice()),
        _ => None,
    }
}

/// Scans the raw option area for `code` and returns its value.
///
/// Stops at END or at the first option whose length runs past the buffer.
pub fn raw_option(buf: &[u8], code: u8) -> Option<&[u8]> {
    let mut at = MIN_PACKET_LEN;
    while at < buf.len() {
        match buf[at] {
            OPTION_PAD => at += 1,
            OPTION_END => return None,
            current => {
                let len = usize::from(*buf.get(at + 1)?);
                let value = buf.get(at + 2..at + 2 + len)?;
                if current == code {
                    return Some(value);
                }
                at += 2 + len;
            }
        }
    }
    None
}

/// Client system architecture from option 93, if present.
pub fn client_arch(buf: &[u8]) -> Option<u16> {
    match raw_option(buf, OPTION_CLIENT_ARCH)? {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
