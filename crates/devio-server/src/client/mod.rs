//! Clients for talking to a devio server, and a [`Stream`] over a remote disk.

use std::io::SeekFrom;

use devio_protocol::{InfoFlags, InfoResponse, IoResponse, SharedRequest, SharedResponse};
use devio_storage::util::resolve_seek;
use devio_storage::{Stream, StreamError};

use crate::ServerError;

#[cfg(target_os = "linux")]
mod shm;
mod tcp;

#[cfg(target_os = "linux")]
pub use shm::ShmClient;
pub use tcp::TcpClient;

/// Request/response access to a remote virtual disk.
///
/// Transfers larger than [`Client::max_transfer_size`] are split into several requests.
pub trait Client {
    fn max_transfer_size(&self) -> usize;

    fn info(&mut self) -> Result<InfoResponse, ServerError>;

    /// Read into `buf` at `offset`. A short count means the end of the disk was reached.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ServerError>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, ServerError>;

    fn shared_keys(&mut self, request: &SharedRequest) -> Result<SharedResponse, ServerError>;

    /// Ask the server to end the session. No response is expected.
    fn close(&mut self) -> Result<(), ServerError>;
}

fn wire_offset(offset: u64) -> Result<i64, ServerError> {
    i64::try_from(offset).map_err(|_| ServerError::Storage(StreamError::OffsetOverflow))
}

/// Disk offset of the chunk starting `done` bytes into a transfer at `offset`.
fn chunk_offset(offset: u64, done: usize) -> Result<u64, ServerError> {
    offset
        .checked_add(done as u64)
        .ok_or(ServerError::Storage(StreamError::OffsetOverflow))
}

/// Validate a READ/WRITE response for a request of `requested` bytes.
fn check_io(
    response: IoResponse,
    op: &str,
    offset: u64,
    requested: usize,
) -> Result<usize, ServerError> {
    if response.error != devio_protocol::IO_OK {
        return Err(ServerError::Remote(format!(
            "{op} of {requested} bytes at offset {offset} failed"
        )));
    }
    match usize::try_from(response.length) {
        Ok(n) if n <= requested => Ok(n),
        _ => Err(ServerError::ProtocolViolation {
            length: response.length,
            max: requested as u64,
        }),
    }
}

/// A remote virtual disk used as a [`Stream`].
pub struct RemoteStream<C> {
    client: C,
    length: u64,
    alignment: u32,
    read_only: bool,
    position: u64,
}

impl<C: Client> RemoteStream<C> {
    pub fn new(mut client: C) -> Result<Self, ServerError> {
        let info = client.info()?;
        Ok(Self {
            client,
            length: info.length,
            alignment: u32::try_from(info.alignment).unwrap_or(u32::MAX),
            read_only: info.flags.contains(InfoFlags::READ_ONLY),
            position: 0,
        })
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }
}

impl<C: Client> Stream for RemoteStream<C> {
    fn len(&self) -> devio_storage::Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> devio_storage::Result<u64> {
        self.position = resolve_seek(pos, self.position, self.length)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> devio_storage::Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let n = self
            .client
            .read_at(buf, self.position)
            .map_err(ServerError::into_stream_error)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> devio_storage::Result<usize> {
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .client
            .write_at(buf, self.position)
            .map_err(ServerError::into_stream_error)?;
        self.position += n as u64;
        Ok(n)
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }
}
