use std::io::{self, BufReader, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use devio_protocol::layout::DEFAULT_BUFFER_SIZE;
use devio_protocol::{request_body_len, Request, REQUEST_CODE_LEN, SHARED_REQUEST_LEN};
use tracing::{debug, info};

use super::{Accepted, Endpoint, Incoming, Transport};
use crate::stop::{Interrupt, StopSignal};
use crate::ServerError;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    pub listen: SocketAddr,
    /// Largest READ/WRITE payload accepted on a connection.
    pub max_transfer_size: usize,
}

impl TcpConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 9000)),
            max_transfer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
}

#[derive(Default)]
struct TcpInterrupt {
    stream: Mutex<Option<TcpStream>>,
}

impl Interrupt for TcpInterrupt {
    fn interrupt(&self) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(stream) = stream.as_ref() {
            // Unblocks the pending read with end-of-stream.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

pub(crate) struct TcpTransport {
    /// Closed once the single client is accepted, so later connects are refused.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    max_transfer_size: usize,
    conn: Option<Connection>,
    interrupt: Arc<TcpInterrupt>,
    data: Vec<u8>,
    out: Vec<u8>,
}

impl TcpTransport {
    pub(crate) fn bind(config: &TcpConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen).map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                ServerError::InUse(config.listen.to_string())
            } else {
                ServerError::Bind {
                    addr: config.listen.to_string(),
                    source,
                }
            }
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "listening");
        Ok(Self {
            listener: Some(listener),
            local_addr,
            max_transfer_size: config.max_transfer_size,
            conn: None,
            interrupt: Arc::new(TcpInterrupt::default()),
            data: Vec::new(),
            out: Vec::new(),
        })
    }

    fn attach(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        *self
            .interrupt
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stream.try_clone()?);
        self.conn = Some(Connection {
            reader: BufReader::new(stream),
            writer,
            peer,
        });
        Ok(())
    }

    fn ensure_data(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl Transport for TcpTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.local_addr)
    }

    fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupt.clone()
    }

    fn accept(
        &mut self,
        deadline: Option<Instant>,
        stop: &mut StopSignal,
    ) -> Result<Accepted, ServerError> {
        loop {
            if stop.is_set() {
                return Ok(Accepted::Stop);
            }
            let listener = self
                .listener
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.listener = None;
                    self.attach(stream, peer)?;
                    info!(%peer, "client connected");
                    return Ok(Accepted::Client);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(ServerError::Timeout);
                    }
                    if stop.wait(ACCEPT_POLL) {
                        return Ok(Accepted::Stop);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn receive(&mut self, stop: &mut StopSignal) -> Result<Incoming, ServerError> {
        if stop.is_set() {
            return Ok(Incoming::Stop);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(Incoming::Disconnected);
        };

        let mut code = [0u8; REQUEST_CODE_LEN];
        if let Err(err) = conn.reader.read_exact(&mut code) {
            if stop.is_set() {
                return Ok(Incoming::Stop);
            }
            if is_disconnect(&err) {
                debug!(peer = %conn.peer, "client disconnected");
                return Ok(Incoming::Disconnected);
            }
            return Err(err.into());
        }
        let code = u64::from_le_bytes(code);

        let mut body = [0u8; SHARED_REQUEST_LEN];
        let body = &mut body[..request_body_len(code)];
        if let Err(err) = conn.reader.read_exact(body) {
            if stop.is_set() {
                return Ok(Incoming::Stop);
            }
            return Err(err.into());
        }
        Ok(Incoming::Request(Request::decode_body(code, body)?))
    }

    fn data_mut(&mut self, len: usize) -> &mut [u8] {
        self.ensure_data(len);
        &mut self.data[..len]
    }

    fn receive_payload(&mut self, len: usize) -> Result<(), ServerError> {
        self.ensure_data(len);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        conn.reader.read_exact(&mut self.data[..len])?;
        Ok(())
    }

    fn respond(&mut self, frame: &[u8], payload_len: usize) -> Result<(), ServerError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.out.clear();
        self.out.extend_from_slice(frame);
        self.out.extend_from_slice(&self.data[..payload_len]);
        conn.writer.write_all(&self.out)?;
        conn.writer.flush()?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.interrupt
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(conn) = self.conn.take() {
            let _ = conn.writer.shutdown(Shutdown::Both);
            debug!(peer = %conn.peer, "connection closed");
        }
    }
}
