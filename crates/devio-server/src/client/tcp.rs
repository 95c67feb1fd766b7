use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use devio_protocol::layout::{DEFAULT_BUFFER_SIZE, MAX_SHARED_KEYS};
use devio_protocol::{
    DecodeError, InfoResponse, IoRequest, IoResponse, Request, SharedRequest, SharedResponse,
    INFO_RESPONSE_LEN, IO_RESPONSE_LEN, SHARED_RESPONSE_HEADER_LEN,
};

use super::{check_io, chunk_offset, wire_offset, Client};
use crate::ServerError;

/// Client for the stream-socket transport.
pub struct TcpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    max_transfer_size: usize,
    out: Vec<u8>,
}

impl TcpClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ServerError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            max_transfer_size: DEFAULT_BUFFER_SIZE,
            out: Vec::new(),
        })
    }

    /// Must not exceed the server's limit, or WRITE requests end the connection.
    pub fn with_max_transfer_size(mut self, max_transfer_size: usize) -> Self {
        self.max_transfer_size = max_transfer_size.max(1);
        self
    }

    fn send(&mut self, request: &Request, payload: &[u8]) -> Result<(), ServerError> {
        self.out.clear();
        request.encode_into(&mut self.out);
        self.out.extend_from_slice(payload);
        self.writer.write_all(&self.out)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_io_response(&mut self) -> Result<IoResponse, ServerError> {
        let mut raw = [0u8; IO_RESPONSE_LEN];
        self.reader.read_exact(&mut raw)?;
        Ok(IoResponse::decode(&raw)?)
    }
}

impl Client for TcpClient {
    fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    fn info(&mut self) -> Result<InfoResponse, ServerError> {
        self.send(&Request::Info, &[])?;
        let mut raw = [0u8; INFO_RESPONSE_LEN];
        self.reader.read_exact(&mut raw)?;
        Ok(InfoResponse::decode(&raw)?)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ServerError> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(self.max_transfer_size);
            let at = chunk_offset(offset, done)?;
            let request = Request::Read(IoRequest {
                offset: wire_offset(at)?,
                length: chunk as u64,
            });
            self.send(&request, &[])?;
            let response = self.read_io_response()?;
            let n = check_io(response, "READ", at, chunk)?;
            self.reader.read_exact(&mut buf[done..done + n])?;
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
            let chunk = (buf.len() - done).min(self.max_transfer_size);
            let at = chunk_offset(offset, done)?;
            let request = Request::Write(IoRequest {
                offset: wire_offset(at)?,
                length: chunk as u64,
            });
            self.send(&request, &buf[done..done + chunk])?;
            let response = self.read_io_response()?;
            let n = check_io(response, "WRITE", at, chunk)?;
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    }

    fn shared_keys(&mut self, request: &SharedRequest) -> Result<SharedResponse, ServerError> {
        self.send(&Request::Shared(*request), &[])?;
        let mut header = [0u8; SHARED_RESPONSE_HEADER_LEN];
        self.reader.read_exact(&mut header)?;
        let (code, count) = SharedResponse::decode_header(&header)?;
        let count = match usize::try_from(count) {
            Ok(count) if count <= MAX_SHARED_KEYS => count,
            _ => return Err(DecodeError::TooManyKeys.into()),
        };
        let mut raw = vec![0u8; count * 8];
        self.reader.read_exact(&mut raw)?;
        let keys = raw
            .chunks_exact(8)
            .map(|key| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(key);
                u64::from_le_bytes(bytes)
            })
            .collect();
        Ok(SharedResponse { code, keys })
    }

    fn close(&mut self) -> Result<(), ServerError> {
        self.send(&Request::Close, &[])?;
        let _ = self.writer.shutdown(Shutdown::Write);
        Ok(())
    }
}
