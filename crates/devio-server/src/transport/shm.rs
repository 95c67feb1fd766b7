use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use devio_protocol::decode_request;
use devio_protocol::layout::{
    is_valid_name, lock_file_name, mapping_size, request_semaphore_name,
    response_semaphore_name, DATA_OFFSET, HEADER_SIZE,
};
use memmap2::MmapMut;
use tracing::{debug, info, warn};

use super::{Accepted, Endpoint, Incoming, ShmConfig, Transport};
use crate::stop::{Interrupt, StopSignal};
use crate::ServerError;

/// A POSIX named semaphore.
pub(crate) struct Semaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

// SAFETY: POSIX semaphore operations are thread-safe; the handle is only closed on drop.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a fresh semaphore with a count of zero, replacing any stale one of the same name.
    pub(crate) fn create(name: &str) -> io::Result<Self> {
        let name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: `name` is a valid NUL-terminated string.
        unsafe { libc::sem_unlink(name.as_ptr()) };
        // SAFETY: as above; mode and initial value are passed as promoted variadic integers.
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem, name })
    }

    pub(crate) fn open(name: &str) -> io::Result<Self> {
        let name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: `name` is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem, name })
    }

    pub(crate) fn post(&self) -> io::Result<()> {
        // SAFETY: `self.sem` is an open semaphore until drop.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for the semaphore. Returns `Ok(false)` if `deadline` passed first.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> io::Result<bool> {
        loop {
            let rc = match deadline {
                None => {
                    // SAFETY: `self.sem` is an open semaphore until drop.
                    unsafe { libc::sem_wait(self.sem) }
                }
                Some(deadline) => {
                    let abs = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        + deadline.saturating_duration_since(Instant::now());
                    // SAFETY: `timespec` is plain old data; some targets carry padding fields.
                    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                    ts.tv_sec = abs.as_secs() as libc::time_t;
                    ts.tv_nsec = abs.subsec_nanos() as libc::c_long;
                    // SAFETY: `self.sem` is open and `ts` outlives the call.
                    unsafe { libc::sem_timedwait(self.sem, &ts) }
                }
            };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub(crate) fn unlink(&self) {
        // SAFETY: `self.name` is a valid NUL-terminated string.
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

impl Interrupt for Semaphore {
    fn interrupt(&self) {
        if let Err(err) = self.post() {
            warn!(error = %err, "failed to signal request semaphore");
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: the handle came from `sem_open` and is closed exactly once.
        unsafe { libc::sem_close(self.sem) };
    }
}

/// Map `file` shared and writable.
pub(crate) fn map_file(file: &File) -> io::Result<MmapMut> {
    // SAFETY: the mapping file is private to the server/client pair, which coordinate every
    // access through the request/response semaphores.
    unsafe { MmapMut::map_mut(file) }
}

fn acquire_lock(path: &Path, name: &str) -> Result<File, ServerError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    // SAFETY: `file` is an open descriptor for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(ServerError::InUse(name.to_string()));
        }
        return Err(err.into());
    }
    Ok(file)
}

/// Server side of the shared-memory transport.
///
/// Fields drop in declaration order, releasing the semaphores, then the mapping, then the
/// identity lock.
pub(crate) struct ShmTransport {
    request: Arc<Semaphore>,
    response: Semaphore,
    map: MmapMut,
    _lock: File,
    name: String,
    dir: PathBuf,
    map_path: PathBuf,
    lock_path: PathBuf,
    buffer_size: usize,
    pending: bool,
}

impl ShmTransport {
    pub(crate) fn create(config: &ShmConfig) -> Result<Self, ServerError> {
        if !is_valid_name(&config.name) {
            return Err(ServerError::Bind {
                addr: config.name.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid shared-memory name"),
            });
        }
        let size = mapping_size(config.buffer_size).ok_or_else(|| ServerError::Bind {
            addr: config.name.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "buffer size too large"),
        })?;

        let lock_path = config.dir.join(lock_file_name(&config.name));
        let lock = acquire_lock(&lock_path, &config.name)?;

        let map_path = config.dir.join(&config.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&map_path)?;
        file.set_len(size as u64)?;
        let map = map_file(&file)?;

        let request = Semaphore::create(&request_semaphore_name(&config.name))
            .map_err(|err| semaphore_error(&config.name, err))?;
        let response = Semaphore::create(&response_semaphore_name(&config.name))
            .map_err(|err| semaphore_error(&config.name, err))?;

        debug!(name = %config.name, size, "shared-memory transport created");
        Ok(Self {
            request: Arc::new(request),
            response,
            map,
            _lock: lock,
            name: config.name.clone(),
            dir: config.dir.clone(),
            map_path,
            lock_path,
            buffer_size: config.buffer_size,
            pending: false,
        })
    }
}

fn semaphore_error(name: &str, err: io::Error) -> ServerError {
    if err.raw_os_error() == Some(libc::EEXIST) {
        ServerError::InUse(name.to_string())
    } else {
        ServerError::Io(err)
    }
}

impl Transport for ShmTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Shm {
            name: self.name.clone(),
            dir: self.dir.clone(),
        }
    }

    fn max_transfer_size(&self) -> usize {
        self.buffer_size
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.request.clone()
    }

    fn accept(
        &mut self,
        deadline: Option<Instant>,
        stop: &mut StopSignal,
    ) -> Result<Accepted, ServerError> {
        if stop.is_set() {
            return Ok(Accepted::Stop);
        }
        // A client attaches by posting its first request.
        if !self.request.wait(deadline)? {
            return Err(ServerError::Timeout);
        }
        if stop.is_set() {
            return Ok(Accepted::Stop);
        }
        self.pending = true;
        info!(name = %self.name, "client attached");
        Ok(Accepted::Client)
    }

    fn receive(&mut self, stop: &mut StopSignal) -> Result<Incoming, ServerError> {
        if !std::mem::take(&mut self.pending) {
            if stop.is_set() {
                return Ok(Incoming::Stop);
            }
            self.request.wait(None)?;
        }
        // A forced stop posts the request semaphore without writing a frame.
        if stop.is_set() {
            return Ok(Incoming::Stop);
        }
        Ok(Incoming::Request(decode_request(&self.map[..HEADER_SIZE])?))
    }

    fn data_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.map[DATA_OFFSET..DATA_OFFSET + len]
    }

    fn receive_payload(&mut self, _len: usize) -> Result<(), ServerError> {
        // The client places WRITE payloads in the data region before signalling.
        Ok(())
    }

    fn respond(&mut self, frame: &[u8], _payload_len: usize) -> Result<(), ServerError> {
        self.map[..frame.len()].copy_from_slice(frame);
        self.response.post()?;
        Ok(())
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        self.request.unlink();
        self.response.unlink();
        if let Err(err) = fs::remove_file(&self.map_path) {
            warn!(path = %self.map_path.display(), error = %err, "failed to remove mapping file");
        }
        let _ = fs::remove_file(&self.lock_path);
        debug!(name = %self.name, "shared-memory transport released");
    }
}
