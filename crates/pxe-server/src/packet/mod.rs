//! Wire formats for the TFTP, DHCP and multicast engines.
//!
//! Decoders never panic on malformed input. They return a [`PacketError`]
//! and the socket loops discard the datagram.

pub mod dhcp;
pub mod multicast;
pub mod tftp;

use thiserror::Error;

/// Decoding failures shared by all codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes than the header or field requires
    #[error("packet truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// TFTP opcode outside 1..=5
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    /// Filename, mode or message not NUL-terminated
    #[error("string field is missing its NUL terminator")]
    MissingTerminator,

    /// Filename, mode or message is not UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Multicast frame without the `MCAST` prefix
    #[error("bad magic")]
    BadMagic,

    /// Multicast frame from another protocol version
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Multicast payload length field disagrees with the datagram
    #[error("declared payload length {declared} but {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    /// DHCP packet with `op` other than 1
    #[error("not a BOOTREQUEST (op {0})")]
    NotBootRequest(u8),

    /// `dhcproto` rejected the packet
    #[error("DHCP codec: {0}")]
    Dhcp(String),

    /// Control datagram that is not a valid JSON message
    #[error("invalid control message: {0}")]
    Control(String),
}
