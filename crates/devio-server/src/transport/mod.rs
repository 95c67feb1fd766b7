//! Transports move request and response frames between one client and the server loop.
//!
//! Both transports share the frame layout from `devio_protocol`; they differ in how frames are
//! delimited and where bulk data lives (a socket stream, or the data region of a mapping).

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use devio_protocol::layout::{DEFAULT_BUFFER_SIZE, DEFAULT_SHM_DIR};
use devio_protocol::Request;

use crate::stop::{Interrupt, StopSignal};
use crate::ServerError;

#[cfg(target_os = "linux")]
pub(crate) mod shm;
mod tcp;

pub use tcp::TcpConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmConfig {
    /// Identity of the mapping and its semaphores.
    pub name: String,
    /// Directory holding the mapping and lock files.
    pub dir: PathBuf,
    /// Size of the data region, and therefore the maximum transfer size.
    pub buffer_size: usize,
}

impl ShmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            name: "devio".to_string(),
            dir: PathBuf::from(DEFAULT_SHM_DIR),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Tcp(TcpConfig),
    Shm(ShmConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Tcp(TcpConfig::default())
    }
}

/// Where a ready server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Shm { name: String, dir: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Shm { name, dir } => write!(f, "shm://{}/{name}", dir.display()),
        }
    }
}

pub(crate) enum Accepted {
    Client,
    Stop,
}

pub(crate) enum Incoming {
    Request(Request),
    Disconnected,
    Stop,
}

pub(crate) trait Transport {
    fn endpoint(&self) -> Endpoint;

    fn max_transfer_size(&self) -> usize;

    fn interrupter(&self) -> Arc<dyn Interrupt>;

    /// Wait for a client to attach.
    fn accept(
        &mut self,
        deadline: Option<Instant>,
        stop: &mut StopSignal,
    ) -> Result<Accepted, ServerError>;

    /// Wait for and decode the next request's fixed fields.
    fn receive(&mut self, stop: &mut StopSignal) -> Result<Incoming, ServerError>;

    /// Bulk data buffer of `len <= max_transfer_size()` bytes.
    fn data_mut(&mut self, len: usize) -> &mut [u8];

    /// Make the `len`-byte WRITE payload available in [`Transport::data_mut`].
    fn receive_payload(&mut self, len: usize) -> Result<(), ServerError>;

    /// Send `frame` followed by the first `payload_len` bytes of the data buffer.
    fn respond(&mut self, frame: &[u8], payload_len: usize) -> Result<(), ServerError>;
}

pub(crate) fn open(config: &TransportConfig) -> Result<Box<dyn Transport>, ServerError> {
    match config {
        TransportConfig::Tcp(tcp) => Ok(Box::new(tcp::TcpTransport::bind(tcp)?)),
        #[cfg(target_os = "linux")]
        TransportConfig::Shm(shm) => Ok(Box::new(shm::ShmTransport::create(shm)?)),
        #[cfg(not(target_os = "linux"))]
        TransportConfig::Shm(_) => Err(ServerError::Unsupported("shared-memory transport")),
    }
}
