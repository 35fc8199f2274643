//! PXE Boot Server
//!
//! Custom Rust PXE boot server built on `dhcproto`, `tokio` and `axum`.
//!
//! This server provides:
//! - ProxyDHCP responder pointing PXE clients at the boot server (IPv4)
//! - Read-only TFTP server for bootloaders, kernels and initrds
//! - Multicast image distribution to many clients at once, with a UDP
//!   control channel for join/ack/nack/status
//! - HTTP management API for multicast sessions
//!
//! Session state and image metadata are reached through the
//! [`imaging_store`] traits so the engines can run against any backend.

pub mod api;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod multicast;
pub mod packet;
pub mod server;
pub mod tftp;

pub use config::ServerConfig;
pub use error::*;
pub use server::*;
