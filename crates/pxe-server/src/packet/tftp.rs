//! TFTP packet codec (RFC 1350).
//!
//! ```text
//! RRQ/WRQ | 01/02 | filename | 0 | mode | 0 |
//! DATA    | 03    | block    | data (0-512 bytes) |
//! ACK     | 04    | block    |
//! ERROR   | 05    | code     | message | 0 |
//! ```
//!
//! Anything after the mode string of a request (RFC 2347 options) is ignored.

use super::PacketError;

/// Payload bytes per DATA block. A shorter block ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Packet type, the first two bytes of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    /// `None` for opcodes outside RFC 1350.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried by ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Transfer mode named in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Raw bytes. Some firmware says "binary" instead of "octet".
    Octet,
    NetAscii,
    Mail,
}

impl TransferMode {
    /// Case-insensitive parse; `None` for modes outside RFC 1350.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "octet" | "binary" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl TftpPacket {
    /// Builds an ERROR packet.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    /// Decodes a datagram. Unknown opcodes are reported as
    /// [`PacketError::UnknownOpcode`] so the server can answer them.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let opcode = read_u16(buf, 0)?;
        let opcode = Opcode::from_u16(opcode).ok_or(PacketError::UnknownOpcode(opcode))?;

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest => {
                let (filename, next) = read_cstr(buf, 2)?;
                let (mode, _) = read_cstr(buf, next)?;
                if opcode == Opcode::ReadRequest {
                    Ok(Self::ReadRequest { filename, mode })
                } else {
                    Ok(Self::WriteRequest { filename, mode })
                }
            }
            Opcode::Data => Ok(Self::Data {
                block: read_u16(buf, 2)?,
                payload: buf[4..].to_vec(),
            }),
            Opcode::Ack => Ok(Self::Ack {
                block: read_u16(buf, 2)?,
            }),
            Opcode::Error => {
                let code = read_u16(buf, 2)?;
                // Some clients omit the trailing NUL on error messages
                let message = match read_cstr(buf, 4) {
                    Ok((message, _)) => message,
                    Err(PacketError::MissingTerminator) => String::from_utf8_lossy(&buf[4..]).into_owned(),
                    Err(e) => return Err(e),
                };
                Ok(Self::Error { code, message })
            }
        }
    }

    /// Encodes the packet for the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ReadRequest { filename, mode } => encode_request(Opcode::ReadRequest, filename, mode),
            Self::WriteRequest { filename, mode } => encode_request(Opcode::WriteRequest, filename, mode),
            Self::Data { block, payload } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Self::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Self::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }
}

fn encode_request(opcode: Opcode, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&(opcode as u16).to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, PacketError> {
    match buf.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(PacketError::Truncated {
            needed: at + 2,
            actual: buf.len(),
        }),
    }
}

/// Reads a NUL-terminated string starting at `at`, returning it and the
/// offset just past the terminator.
fn read_cstr(buf: &[u8], at: usize) -> Result<(String, usize), PacketError> {
    let rest = buf.get(at..).ok_or(PacketError::Truncated {
        needed: at,
        actual: buf.len(),
    })?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::MissingTerminator)?;
    let value = std::str::from_utf8(&rest[..end]).map_err(|_| PacketError::InvalidUtf8)?;
    Ok((value.to_string(), at + end + 1))
}
