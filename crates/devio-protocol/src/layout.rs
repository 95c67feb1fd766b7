//! Shared-memory layout contract for the devio shared-memory transport.
//!
//! A server owns one named mapping split into two regions:
//!
//! - header: `[0, HEADER_SIZE)`, holds exactly one request or response frame at offset 0
//! - data: `[HEADER_SIZE, HEADER_SIZE + buffer_size)`, holds READ results and WRITE payloads
//!
//! Two named semaphores hand the mapping back and forth: the client posts `request` once a
//! request frame (and any WRITE payload) is in place, the server posts `response` once the
//! response frame (and any READ payload) is in place.

use crate::protocol::SHARED_RESPONSE_HEADER_LEN;

/// Size of the frame region at the start of the mapping.
pub const HEADER_SIZE: usize = 4096;

/// Byte offset of the data region.
pub const DATA_OFFSET: usize = HEADER_SIZE;

/// Default data region size; also the maximum transfer size of a shared-memory server.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Directory holding mapping and lock files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Largest key list a SHARED response may carry, bounded by what fits in the header region.
pub const MAX_SHARED_KEYS: usize = (HEADER_SIZE - SHARED_RESPONSE_HEADER_LEN) / 8;

/// Total mapping size for a data region of `buffer_size` bytes.
pub fn mapping_size(buffer_size: usize) -> Option<usize> {
    HEADER_SIZE.checked_add(buffer_size)
}

/// Name of the semaphore a client posts after writing a request.
pub fn request_semaphore_name(name: &str) -> String {
    format!("/{name}_request")
}

/// Name of the semaphore the server posts after writing a response.
pub fn response_semaphore_name(name: &str) -> String {
    format!("/{name}_response")
}

/// File name (relative to the shm directory) of the identity lock.
pub fn lock_file_name(name: &str) -> String {
    format!("{name}.lock")
}

/// Whether `name` can be used as a mapping/semaphore identity.
///
/// POSIX semaphore names are limited to `NAME_MAX - 4` bytes including the leading slash and
/// may not contain further slashes.
pub fn is_valid_name(name: &str) -> bool {
    const MAX_NAME: usize = 251 - "_response".len();
    !name.is_empty()
        && name.len() <= MAX_NAME
        && !name.contains('/')
        && name != "."
        && name != ".."
        && !name.contains('\0')
}
