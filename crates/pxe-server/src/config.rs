//! Server configuration.
//!
//! Configuration comes from an optional YAML file (path in `PXE_CONFIG`),
//! then environment variable overrides. Every field has a default, so an
//! empty file or no file at all yields a runnable configuration once
//! `server_ip` is set.
//!
//! ```yaml
//! server_ip: 192.168.10.2
//! tftp:
//!   port: 6969
//!   root: /srv/tftp
//! dhcp:
//!   boot_filename: pxelinux.0
//!   efi_boot_filename: bootx64.efi
//! multicast:
//!   port: 9000
//!   images_dir: /srv/images
//!   throttle_ms: 10
//! api:
//!   bind: 0.0.0.0:8081
//! ```

use crate::error::PxeError;
use crate::multicast::MulticastOptions;
use crate::packet::multicast::{HEADER_LEN, MAX_DATAGRAM_LEN};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest chunk whose framed packet fits one IPv4 UDP datagram.
pub const MAX_CHUNK_SIZE: usize = MAX_DATAGRAM_LEN - HEADER_LEN;

/// Top-level configuration for all services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address announced to PXE clients (DHCP option 54 and `siaddr`)
    pub server_ip: Ipv4Addr,
    pub tftp: TftpConfig,
    pub dhcp: DhcpConfig,
    pub multicast: MulticastConfig,
    pub api: ApiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::UNSPECIFIED,
            tftp: TftpConfig::default(),
            dhcp: DhcpConfig::default(),
            multicast: MulticastConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub enabled: bool,
    pub port: u16,
    /// Directory boot files are served from; requests cannot leave it
    pub root: PathBuf,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 6969,
            root: PathBuf::from("/var/lib/pxe/tftp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub enabled: bool,
    /// Non-standard port so the responder can run next to a real DHCP server
    pub port: u16,
    /// Option 66; defaults to `server_ip` when unset
    pub server_name: Option<String>,
    /// Option 67 for BIOS clients
    pub boot_filename: String,
    /// Option 67 for UEFI clients, when different
    pub efi_boot_filename: Option<String>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 4067,
            server_name: None,
            boot_filename: "pxelinux.0".to_string(),
            efi_boot_filename: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub enabled: bool,
    /// Data port; the control channel listens on `port + 1`
    pub port: u16,
    pub images_dir: PathBuf,
    pub chunk_size: usize,
    pub throttle_ms: u64,
    /// Size used when a session's image file is missing (dry runs)
    pub simulated_size: u64,
    pub ttl: u32,
    /// Deliver our own multicast traffic back to local receivers
    pub loopback: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9000,
            images_dir: PathBuf::from("/var/lib/pxe/images"),
            // Largest whole-KiB chunk that still fits one datagram
            chunk_size: 63 * 1024,
            throttle_ms: 10,
            simulated_size: crate::multicast::DEFAULT_SIMULATED_SIZE,
            ttl: 1,
            loopback: false,
        }
    }
}

impl MulticastConfig {
    /// Engine options derived from this configuration.
    pub fn options(&self) -> MulticastOptions {
        MulticastOptions {
            images_dir: self.images_dir.clone(),
            chunk_size: self.chunk_size,
            throttle: Duration::from_millis(self.throttle_ms),
            simulated_size: self.simulated_size,
            default_port: self.port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `PXE_CONFIG` (if set) and the process
    /// environment, then validates it.
    pub fn load() -> Result<Self, PxeError> {
        let mut config = match std::env::var("PXE_CONFIG") {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PxeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PxeError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, PxeError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| PxeError::Configuration(format!("invalid YAML: {e}")))
    }

    /// Applies `PXE_*` overrides obtained through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), PxeError> {
        if let Some(value) = lookup("PXE_SERVER_IP") {
            self.server_ip = parse_var("PXE_SERVER_IP", &value)?;
        }
        if let Some(value) = lookup("PXE_TFTP_ROOT") {
            self.tftp.root = PathBuf::from(value);
        }
        if let Some(value) = lookup("PXE_TFTP_PORT") {
            self.tftp.port = parse_var("PXE_TFTP_PORT", &value)?;
        }
        if let Some(value) = lookup("PXE_DHCP_PORT") {
            self.dhcp.port = parse_var("PXE_DHCP_PORT", &value)?;
        }
        if let Some(value) = lookup("PXE_BOOT_FILE") {
            self.dhcp.boot_filename = value;
        }
        if let Some(value) = lookup("PXE_MULTICAST_PORT") {
            self.multicast.port = parse_var("PXE_MULTICAST_PORT", &value)?;
        }
        if let Some(value) = lookup("PXE_IMAGES_DIR") {
            self.multicast.images_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("PXE_API_BIND") {
            self.api.bind = parse_var("PXE_API_BIND", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PxeError> {
        if self.dhcp.enabled && self.server_ip.is_unspecified() {
            return Err(PxeError::Configuration(
                "server_ip (PXE_SERVER_IP) is required when the DHCP responder is enabled".to_string(),
            ));
        }
        if self.dhcp.enabled && self.dhcp.boot_filename.trim().is_empty() {
            return Err(PxeError::Configuration("dhcp.boot_filename must not be empty".to_string()));
        }
        if self.multicast.chunk_size == 0 {
            return Err(PxeError::Configuration("multicast.chunk_size must be positive".to_string()));
        }
        if self.multicast.chunk_size > MAX_CHUNK_SIZE {
            return Err(PxeError::Configuration(format!(
                "multicast.chunk_size {} exceeds {} bytes, the largest chunk that fits a UDP datagram",
                self.multicast.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.multicast.port == u16::MAX {
            return Err(PxeError::Configuration(
                "multicast.port leaves no room for the control port (port + 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Option 66 value announced to clients.
    pub fn dhcp_server_name(&self) -> String {
        self.dhcp
            .server_name
            .clone()
            .unwrap_or_else(|| self.server_ip.to_string())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PxeError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PxeError::Configuration(format!("invalid {key} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> ServerConfig {
        ServerConfig {
            server_ip: Ipv4Addr::new(192, 168, 10, 2),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.tftp.port, 6969);
        assert_eq!(config.dhcp.port, 4067);
        assert_eq!(config.multicast.port, 9000);
        assert_eq!(config.multicast.throttle_ms, 10);
        assert!(config.multicast.chunk_size <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let config = ServerConfig::from_yaml_str(
            "server_ip: 10.0.0.5\ntftp:\n  root: /srv/tftp\nmulticast:\n  throttle_ms: 0\n",
        )
        .unwrap();
        assert_eq!(config.server_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.tftp.root, PathBuf::from("/srv/tftp"));
        assert_eq!(config.tftp.port, 6969);
        assert_eq!(config.multicast.throttle_ms, 0);
        assert_eq!(config.multicast.port, 9000);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = ServerConfig::from_yaml_str("  \n").unwrap();
        assert_eq!(config.dhcp.boot_filename, "pxelinux.0");
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let result = ServerConfig::from_yaml_str("tftp: [unterminated");
        assert!(matches!(result, Err(PxeError::Configuration(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PXE_SERVER_IP", "172.16.0.1"),
            ("PXE_TFTP_PORT", "69"),
            ("PXE_BOOT_FILE", "undionly.kpxe"),
            ("PXE_API_BIND", "127.0.0.1:9090"),
        ]);
        let mut config = ServerConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.server_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(config.tftp.port, 69);
        assert_eq!(config.dhcp.boot_filename, "undionly.kpxe");
        assert_eq!(config.api.bind, SocketAddr::from(([127, 0, 0, 1], 9090)));
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = ServerConfig::default();
        let result = config.apply_env(|key| (key == "PXE_TFTP_PORT").then(|| "seventy".to_string()));
        assert!(matches!(result, Err(PxeError::Configuration(_))));
    }

    #[test]
    fn test_validate_requires_server_ip_for_dhcp() {
        assert!(ServerConfig::default().validate().is_err());

        let mut config = ServerConfig::default();
        config.dhcp.enabled = false;
        assert!(config.validate().is_ok());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_size_fits_datagram() {
        let mut config = valid();
        config.multicast.chunk_size = 64 * 1024;
        assert!(config.validate().is_err());

        config.multicast.chunk_size = MAX_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        config.multicast.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_name_falls_back_to_ip() {
        let mut config = valid();
        assert_eq!(config.dhcp_server_name(), "192.168.10.2");
        config.dhcp.server_name = Some("boot.lab".to_string());
        assert_eq!(config.dhcp_server_name(), "boot.lab");
    }
}
