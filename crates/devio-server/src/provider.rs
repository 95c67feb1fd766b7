use std::io::SeekFrom;

use devio_protocol::{SharedRequest, SharedResponse, SharedResponseCode};
use devio_storage::{Result, Stream, StreamError, SECTOR_SIZE};

/// The virtual disk a [`crate::Server`] proxies.
///
/// Every method reports failures through [`StreamError`]; the server turns them into error
/// responses so a failing request never ends the connection.
pub trait Provider: Send {
    fn length(&self) -> Result<u64>;

    /// Advertised sector size. Not enforced by the server.
    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn can_write(&self) -> bool;

    /// Alignment reported to clients in the INFO response.
    fn alignment(&self) -> u32 {
        1
    }

    fn supports_shared_keys(&self) -> bool {
        false
    }

    /// Read into `buf` starting at `offset`. Returns fewer bytes (possibly 0) at end of media.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Providers without shared-storage semantics answer with an empty key list.
    fn shared_keys(&mut self, _request: &SharedRequest) -> Result<SharedResponse> {
        Ok(SharedResponse::empty(SharedResponseCode::NoError))
    }
}

impl<P: Provider + ?Sized> Provider for Box<P> {
    fn length(&self) -> Result<u64> {
        (**self).length()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn alignment(&self) -> u32 {
        (**self).alignment()
    }

    fn supports_shared_keys(&self) -> bool {
        (**self).supports_shared_keys()
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn shared_keys(&mut self, request: &SharedRequest) -> Result<SharedResponse> {
        (**self).shared_keys(request)
    }
}

/// Serves any [`Stream`] composition as a virtual disk.
pub struct StreamProvider<S> {
    stream: S,
    sector_size: u32,
}

impl<S: Stream + Send> StreamProvider<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sector_size: SECTOR_SIZE,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Stream + Send> Provider for StreamProvider<S> {
    fn length(&self) -> Result<u64> {
        self.stream.len()
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn can_write(&self) -> bool {
        self.stream.can_write()
    }

    fn alignment(&self) -> u32 {
        self.stream.alignment()
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let length = self.stream.len()?;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let available = usize::try_from(length - offset).unwrap_or(usize::MAX);
        let count = buf.len().min(available);
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.read_full(&mut buf[..count])
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.stream.can_write() {
            return Err(StreamError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        Ok(buf.len())
    }
}

/// Read-only disk of `length` zero bytes with no backing store.
#[derive(Debug, Clone, Copy)]
pub struct ZeroProvider {
    length: u64,
}

impl ZeroProvider {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

impl Provider for ZeroProvider {
    fn length(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn can_write(&self) -> bool {
        false
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let available = usize::try_from(self.length - offset).unwrap_or(usize::MAX);
        let count = buf.len().min(available);
        buf[..count].fill(0);
        Ok(count)
    }

    fn write_at(&mut self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(StreamError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devio_storage::{AligningStream, MemStream};

    #[test]
    fn stream_provider_reads_are_clamped_at_end_of_media() {
        let mut provider = StreamProvider::new(MemStream::from_vec(vec![7u8; 100]));
        let mut buf = [0u8; 64];
        assert_eq!(provider.read_at(&mut buf, 80).unwrap(), 20);
        assert_eq!(provider.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(provider.read_at(&mut buf, u64::MAX).unwrap(), 0);
    }

    #[test]
    fn stream_provider_reports_stream_alignment() {
        let stream = AligningStream::new(MemStream::with_len(4096).unwrap(), 512, 0).unwrap();
        let provider = StreamProvider::new(stream);
        assert_eq!(provider.alignment(), 512);
        assert_eq!(provider.sector_size(), 512);
        assert!(provider.can_write());
    }

    #[test]
    fn stream_provider_write_failure_is_an_error_not_a_panic() {
        let stream = AligningStream::new(MemStream::with_len(1024).unwrap(), 512, 0).unwrap();
        let mut provider = StreamProvider::new(stream);
        let err = provider.write_at(&[1u8; 10], 1020).unwrap_err();
        assert!(matches!(err, StreamError::WriteBeyondEnd { .. }));
    }

    #[test]
    fn read_only_stream_provider_rejects_writes() {
        let mut provider = StreamProvider::new(MemStream::with_len(16).unwrap().read_only());
        assert!(!provider.can_write());
        assert!(matches!(
            provider.write_at(&[1], 0).unwrap_err(),
            StreamError::ReadOnly
        ));
    }

    #[test]
    fn zero_provider() {
        let mut provider = ZeroProvider::new(10);
        let mut buf = [0xFFu8; 16];
        assert_eq!(provider.read_at(&mut buf, 4).unwrap(), 6);
        assert!(buf[..6].iter().all(|b| *b == 0));
        assert!(buf[6..].iter().all(|b| *b == 0xFF));
        assert!(provider.write_at(&[1], 0).is_err());
        assert!(provider
            .shared_keys(&SharedRequest::default())
            .unwrap()
            .keys
            .is_empty());
    }
}
