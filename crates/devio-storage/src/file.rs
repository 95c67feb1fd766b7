use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::util::{checked_end, resolve_seek};
use crate::{Result, Stream, StreamError};

/// Stream over a `std::fs::File` (disk image, block device node, ...).
///
/// The stream keeps its own logical position and seeks the file before every access, so the
/// file cursor is only meaningful while a call is in progress.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    position: u64,
    read_only: bool,
}

impl FileStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            position: 0,
            read_only: true,
        })
    }

    /// Create (or truncate) a file and size it to `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file,
            position: 0,
            read_only: false,
        }
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl Stream for FileStream {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match pos {
            SeekFrom::End(_) => self.len()?,
            _ => 0,
        };
        self.position = resolve_seek(pos, self.position, len)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.position))?;
        let n = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        let end = checked_end(self.position, buf.len())?;
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(buf)?;
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.flush()?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }
}
