//! Block-device protocol server.
//!
//! A [`Server`] proxies one [`Provider`] (a virtual disk) to one client over either a TCP
//! connection or, on Linux, a named shared-memory mapping signalled through POSIX semaphores.
//! Requests are served strictly one at a time, in receipt order.
//!
//! ```no_run
//! use devio_server::{Server, StreamProvider, TcpConfig};
//! use devio_storage::{AligningStream, MemStream};
//!
//! let disk = AligningStream::new(MemStream::with_len(1 << 20)?, 512, 0)?;
//! let mut server = Server::new(StreamProvider::new(disk), TcpConfig::default());
//! server.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod client;
mod error;
mod provider;
mod server;
mod shared_keys;
mod stop;
mod transport;

#[cfg(target_os = "linux")]
pub use client::ShmClient;
pub use client::{Client, RemoteStream, TcpClient};
pub use error::ServerError;
pub use provider::{Provider, StreamProvider, ZeroProvider};
pub use server::{Server, ServerConfig, ServerEvent, ServerHandle, ServerState};
pub use shared_keys::{Reservation, SharedKeyRegistry, SharedKeysProvider};
pub use stop::StopHandle;
pub use transport::{Endpoint, ShmConfig, TcpConfig, TransportConfig};
