//! Main PXE server implementation.
//!
//! This module builds the engines once from [`ServerConfig`] and runs each
//! enabled service (ProxyDHCP, TFTP, multicast control channel, management
//! API) as its own task. A service that cannot bind is logged and left out;
//! the others keep running.

use crate::api::ApiServer;
use crate::config::ServerConfig;
use crate::dhcp::{DhcpServer, PxeResponder};
use crate::error::PxeError;
use crate::multicast::sink::{DatagramSink, UdpSink};
use crate::multicast::{ControlServer, MulticastEngine};
use crate::tftp::TftpServer;
use imaging_store::{ImageCatalog, SessionStore};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A service that bound its socket and is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningService {
    pub name: &'static str,
    pub addr: SocketAddr,
}

/// Main PXE boot server.
///
/// Coordinates the ProxyDHCP responder, the TFTP server and multicast image
/// distribution.
pub struct PxeServer {
    config: ServerConfig,
    multicast: Arc<MulticastEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PxeServer {
    /// Creates a new PXE server instance sending multicast traffic through a
    /// UDP socket. Must be called from within a Tokio runtime.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn ImageCatalog>,
    ) -> Result<Self, PxeError> {
        let sink = UdpSink::bind(config.multicast.ttl, config.multicast.loopback)?;
        Self::with_sink(config, store, catalog, Arc::new(sink))
    }

    /// Creates a server with a custom multicast sink.
    pub fn with_sink(
        config: ServerConfig,
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn ImageCatalog>,
        sink: Arc<dyn DatagramSink>,
    ) -> Result<Self, PxeError> {
        config.validate()?;
        let multicast = Arc::new(MulticastEngine::new(config.multicast.options(), store, catalog, sink));
        Ok(Self {
            config,
            multicast,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle to the multicast engine.
    pub fn multicast(&self) -> Arc<MulticastEngine> {
        Arc::clone(&self.multicast)
    }

    /// Binds and spawns every enabled service.
    ///
    /// Fails only when nothing could be started.
    pub async fn start(&self) -> Result<Vec<RunningService>, PxeError> {
        info!(server_ip = %self.config.server_ip, "Starting PXE boot server");
        let mut running = Vec::new();

        if self.config.tftp.enabled {
            match self.start_tftp().await {
                Ok(service) => running.push(service),
                Err(e) => error!(error = %e, "TFTP server disabled"),
            }
        }
        if self.config.dhcp.enabled {
            match self.start_dhcp().await {
                Ok(service) => running.push(service),
                Err(e) => error!(error = %e, "ProxyDHCP responder disabled"),
            }
        }
        if self.config.multicast.enabled {
            match self.start_control().await {
                Ok(service) => running.push(service),
                Err(e) => error!(error = %e, "Multicast control channel disabled"),
            }
        }
        if self.config.api.enabled {
            match self.start_api().await {
                Ok(service) => running.push(service),
                Err(e) => error!(error = %e, "Management API disabled"),
            }
        }

        if running.is_empty() {
            return Err(PxeError::Configuration("no service could be started".to_string()));
        }
        for service in &running {
            info!(service = service.name, addr = %service.addr, "Service running");
        }
        Ok(running)
    }

    async fn start_tftp(&self) -> Result<RunningService, PxeError> {
        let server = TftpServer::new(&self.config.tftp.root, self.config.tftp.port)?;
        let socket = server.bind().await?;
        let addr = socket.local_addr()?;
        self.spawn("tftp", async move { server.serve(socket).await });
        Ok(RunningService { name: "tftp", addr })
    }

    async fn start_dhcp(&self) -> Result<RunningService, PxeError> {
        let server = DhcpServer::new(PxeResponder::from_config(&self.config), self.config.dhcp.port);
        let socket = server.bind().await?;
        let addr = socket.local_addr()?;
        self.spawn("dhcp", async move { server.serve(socket).await });
        Ok(RunningService { name: "dhcp", addr })
    }

    async fn start_control(&self) -> Result<RunningService, PxeError> {
        let server = ControlServer::new(self.multicast(), self.config.multicast.port);
        let socket = server.bind().await?;
        let addr = socket.local_addr()?;
        self.spawn("multicast-control", async move { server.serve(socket).await });
        Ok(RunningService {
            name: "multicast-control",
            addr,
        })
    }

    async fn start_api(&self) -> Result<RunningService, PxeError> {
        let server = ApiServer::new(self.multicast(), self.config.api.bind);
        let listener = server.bind().await?;
        let addr = listener.local_addr()?;
        self.spawn("api", async move { server.serve(listener).await });
        Ok(RunningService { name: "api", addr })
    }

    fn spawn<F>(&self, name: &'static str, service: F)
    where
        F: Future<Output = Result<(), PxeError>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            if let Err(e) = service.await {
                error!(service = name, error = %e, "Service stopped");
            }
        });
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    /// Shuts down the PXE server: cancels active multicast sessions and stops
    /// every service task.
    pub async fn shutdown(&self) -> Result<(), PxeError> {
        info!("Shutting down PXE boot server");
        self.multicast.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Service task panicked");
                }
            }
        }
        Ok(())
    }
}
