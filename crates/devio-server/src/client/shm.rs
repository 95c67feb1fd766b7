use std::fs::OpenOptions;
use std::path::Path;
use std::time::{Duration, Instant};

use devio_protocol::layout::{
    request_semaphore_name, response_semaphore_name, DATA_OFFSET, DEFAULT_SHM_DIR, HEADER_SIZE,
    MAX_SHARED_KEYS,
};
use devio_protocol::{
    InfoResponse, IoRequest, IoResponse, Request, SharedRequest, SharedResponse,
};
use memmap2::MmapMut;

use super::{check_io, chunk_offset, wire_offset, Client};
use crate::transport::shm::{map_file, Semaphore};
use crate::ServerError;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the shared-memory transport.
pub struct ShmClient {
    request: Semaphore,
    response: Semaphore,
    map: MmapMut,
    buffer_size: usize,
    timeout: Option<Duration>,
    frame: Vec<u8>,
}

impl ShmClient {
    pub fn open(name: &str) -> Result<Self, ServerError> {
        Self::open_in(Path::new(DEFAULT_SHM_DIR), name)
    }

    pub fn open_in(dir: &Path, name: &str) -> Result<Self, ServerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(name))?;
        let map = map_file(&file)?;
        let buffer_size = map
            .len()
            .checked_sub(HEADER_SIZE)
            .ok_or(ServerError::Unsupported("mapping smaller than the frame header"))?;
        Ok(Self {
            request: Semaphore::open(&request_semaphore_name(name))?,
            response: Semaphore::open(&response_semaphore_name(name))?,
            map,
            buffer_size,
            timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            frame: Vec::new(),
        })
    }

    /// How long to wait for each response. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn post(&mut self, request: &Request) -> Result<(), ServerError> {
        self.frame.clear();
        request.encode_into(&mut self.frame);
        self.map[..self.frame.len()].copy_from_slice(&self.frame);
        self.request.post()?;
        Ok(())
    }

    fn exchange(&mut self, request: &Request) -> Result<(), ServerError> {
        self.post(request)?;
        let deadline = self
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        if !self.response.wait(deadline)? {
            return Err(ServerError::Timeout);
        }
        Ok(())
    }
}

impl Client for ShmClient {
    fn max_transfer_size(&self) -> usize {
        self.buffer_size
    }

    fn info(&mut self) -> Result<InfoResponse, ServerError> {
        self.exchange(&Request::Info)?;
        Ok(InfoResponse::decode(&self.map[..HEADER_SIZE])?)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ServerError> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(self.buffer_size);
            let at = chunk_offset(offset, done)?;
            self.exchange(&Request::Read(IoRequest {
                offset: wire_offset(at)?,
                length: chunk as u64,
            }))?;
            let response = IoResponse::decode(&self.map[..HEADER_SIZE])?;
            let n = check_io(response, "READ", at, chunk)?;
            buf[done..done + n].copy_from_slice(&self.map[DATA_OFFSET..DATA_OFFSET + n]);
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, ServerError> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(self.buffer_size);
            let at = chunk_offset(offset, done)?;
            self.map[DATA_OFFSET..DATA_OFFSET + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.exchange(&Request::Write(IoRequest {
                offset: wire_offset(at)?,
                length: chunk as u64,
            }))?;
            let response = IoResponse::decode(&self.map[..HEADER_SIZE])?;
            let n = check_io(response, "WRITE", at, chunk)?;
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    }

    fn shared_keys(&mut self, request: &SharedRequest) -> Result<SharedResponse, ServerError> {
        self.exchange(&Request::Shared(*request))?;
        Ok(SharedResponse::decode(
            &self.map[..HEADER_SIZE],
            MAX_SHARED_KEYS,
        )?)
    }

    fn close(&mut self) -> Result<(), ServerError> {
        self.post(&Request::Close)
    }
}
