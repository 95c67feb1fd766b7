use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use devio_protocol::layout::MAX_SHARED_KEYS;
use devio_protocol::{
    InfoFlags, InfoResponse, IoRequest, IoResponse, Request, RequestCode, SharedRequest,
    SharedResponse, SharedResponseCode,
};
use tracing::{debug, error, info, trace, warn};

use crate::stop::{Control, Interrupt, StopHandle, StopSignal};
use crate::transport::{self, Accepted, Endpoint, Incoming, Transport};
use crate::{Provider, ServerError, ShmConfig, TcpConfig, TransportConfig};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// How long to wait for a client before giving up. `None` waits forever.
    pub accept_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }
}

impl From<TransportConfig> for ServerConfig {
    fn from(transport: TransportConfig) -> Self {
        Self {
            transport,
            accept_timeout: None,
        }
    }
}

impl From<TcpConfig> for ServerConfig {
    fn from(config: TcpConfig) -> Self {
        TransportConfig::Tcp(config).into()
    }
}

impl From<ShmConfig> for ServerConfig {
    fn from(config: ShmConfig) -> Self {
        TransportConfig::Shm(config).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initializing,
    Ready,
    Serving,
    Closing,
    ShutDown,
    InitFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Transport resources are allocated and the server waits for a client.
    Ready(Endpoint),
    InitFailed(String),
    Stopping,
    ShutDown,
}

enum Flow {
    Continue,
    Close,
}

/// Serves one [`Provider`] to one client over one transport.
///
/// A server goes through `Initializing → Ready → Serving → Closing → ShutDown` exactly once;
/// failing to allocate the transport ends in `InitFailed` instead.
pub struct Server<P> {
    provider: P,
    config: ServerConfig,
    state: Arc<Mutex<ServerState>>,
    observers: Vec<Sender<ServerEvent>>,
    control: Sender<Control>,
    signal: StopSignal,
    interrupt: Arc<Mutex<Option<Arc<dyn Interrupt>>>>,
    frame: Vec<u8>,
}

impl<P: Provider> Server<P> {
    pub fn new(provider: P, config: impl Into<ServerConfig>) -> Self {
        let (control, rx) = mpsc::channel();
        Self {
            provider,
            config: config.into(),
            state: Arc::new(Mutex::new(ServerState::Initializing)),
            observers: Vec::new(),
            control,
            signal: StopSignal::new(rx),
            interrupt: Arc::new(Mutex::new(None)),
            frame: Vec::with_capacity(64),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.control.clone(), Arc::clone(&self.interrupt))
    }

    /// Receive every lifecycle event emitted from now on.
    pub fn subscribe(&mut self) -> Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    pub fn state(&self) -> ServerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Run the whole lifecycle on the calling thread.
    ///
    /// Returns once the client closed or disconnected, a stop was requested, or a
    /// connection-fatal error occurred. Request-level failures never end the run.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.set_state(ServerState::Initializing);
        let mut transport = match transport::open(&self.config.transport) {
            Ok(transport) => transport,
            Err(err) => {
                error!(error = %err, "failed to initialize transport");
                self.set_state(ServerState::InitFailed);
                self.notify(ServerEvent::InitFailed(err.to_string()));
                return Err(err);
            }
        };
        self.install_interrupt(Some(transport.interrupter()));

        let endpoint = transport.endpoint();
        self.set_state(ServerState::Ready);
        info!(%endpoint, max_transfer_size = transport.max_transfer_size(), "server ready");
        self.notify(ServerEvent::Ready(endpoint));

        let result = self.serve(transport.as_mut());
        if let Err(err) = &result {
            error!(error = %err, "connection terminated");
        }

        self.set_state(ServerState::Closing);
        self.notify(ServerEvent::Stopping);
        self.install_interrupt(None);
        drop(transport);

        self.set_state(ServerState::ShutDown);
        info!("server shut down");
        self.notify(ServerEvent::ShutDown);
        result
    }

    fn serve(&mut self, transport: &mut dyn Transport) -> Result<(), ServerError> {
        let deadline = self
            .config
            .accept_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        match transport.accept(deadline, &mut self.signal)? {
            Accepted::Client => {}
            Accepted::Stop => {
                info!("stop requested before a client attached");
                return Ok(());
            }
        }
        self.set_state(ServerState::Serving);

        loop {
            let request = match transport.receive(&mut self.signal)? {
                Incoming::Request(request) => request,
                Incoming::Stop => {
                    info!("forced shutdown");
                    return Ok(());
                }
                Incoming::Disconnected => {
                    info!("client disconnected");
                    return Ok(());
                }
            };
            match self.dispatch(transport, request)? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    fn dispatch(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
    ) -> Result<Flow, ServerError> {
        trace!(?request, "request");
        match request {
            Request::Info => {
                let info = self.info();
                self.frame.clear();
                info.encode_into(&mut self.frame);
                transport.respond(&self.frame, 0)?;
            }
            Request::Read(io) => self.read(transport, io)?,
            Request::Write(io) => self.write(transport, io)?,
            Request::Shared(shared) => self.shared(transport, &shared)?,
            Request::Close => {
                debug!("client requested close");
                return Ok(Flow::Close);
            }
            Request::Unknown(code) => {
                warn!(
                    code,
                    known = ?RequestCode::from_u64(code),
                    "unrecognized request, closing connection"
                );
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    fn info(&self) -> InfoResponse {
        let length = match self.provider.length() {
            Ok(length) => length,
            Err(err) => {
                warn!(error = %err, "failed to query provider length");
                0
            }
        };
        let mut flags = InfoFlags::empty();
        if !self.provider.can_write() {
            flags |= InfoFlags::READ_ONLY;
        }
        if self.provider.supports_shared_keys() {
            flags |= InfoFlags::SUPPORTS_SHARED;
        }
        InfoResponse {
            length,
            alignment: u64::from(self.provider.alignment()),
            flags,
        }
    }

    fn read(&mut self, transport: &mut dyn Transport, io: IoRequest) -> Result<(), ServerError> {
        let max = transport.max_transfer_size();
        let len = usize::try_from(io.length).map_or(max, |len| len.min(max));

        let result = match io.start() {
            Ok(offset) => self
                .provider
                .read_at(transport.data_mut(len), offset)
                .map_err(ServerError::from),
            Err(err) => Err(err.into()),
        };
        let (response, payload) = match result {
            Ok(n) => (IoResponse::ok(n as u64), n),
            Err(err) => {
                warn!(offset = io.offset, length = io.length, error = %err, "read failed");
                (IoResponse::failed(), 0)
            }
        };
        self.frame.clear();
        response.encode_into(&mut self.frame);
        transport.respond(&self.frame, payload)
    }

    fn write(&mut self, transport: &mut dyn Transport, io: IoRequest) -> Result<(), ServerError> {
        let max = transport.max_transfer_size();
        let len = match usize::try_from(io.length) {
            Ok(len) if len <= max => len,
            _ => {
                error!(
                    offset = io.offset,
                    length = io.length,
                    max,
                    "write exceeds maximum transfer size"
                );
                return Err(ServerError::ProtocolViolation {
                    length: io.length,
                    max: max as u64,
                });
            }
        };
        transport.receive_payload(len)?;

        let result = match io.start() {
            Ok(offset) => self
                .provider
                .write_at(transport.data_mut(len), offset)
                .map_err(ServerError::from),
            Err(err) => Err(err.into()),
        };
        let response = match result {
            Ok(n) => IoResponse::ok(n as u64),
            Err(err) => {
                warn!(offset = io.offset, length = io.length, error = %err, "write failed");
                IoResponse::failed()
            }
        };
        self.frame.clear();
        response.encode_into(&mut self.frame);
        transport.respond(&self.frame, 0)
    }

    fn shared(
        &mut self,
        transport: &mut dyn Transport,
        request: &SharedRequest,
    ) -> Result<(), ServerError> {
        let mut response = match self.provider.shared_keys(request) {
            Ok(response) => response,
            Err(err) => {
                warn!(operation = request.operation, error = %err, "shared-key request failed");
                SharedResponse::empty(SharedResponseCode::IoError)
            }
        };
        if response.keys.len() > MAX_SHARED_KEYS {
            warn!(
                keys = response.keys.len(),
                max = MAX_SHARED_KEYS,
                "truncating shared-key response"
            );
            response.keys.truncate(MAX_SHARED_KEYS);
        }
        self.frame.clear();
        response.encode_into(&mut self.frame);
        transport.respond(&self.frame, 0)
    }

    fn set_state(&self, state: ServerState) {
        debug!(?state, "state transition");
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn notify(&mut self, event: ServerEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    fn install_interrupt(&self, interrupt: Option<Arc<dyn Interrupt>>) {
        *self
            .interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = interrupt;
    }
}

impl<P: Provider + 'static> Server<P> {
    /// Run the server on its own thread.
    pub fn spawn(mut self) -> Result<ServerHandle, ServerError> {
        let events = self.subscribe();
        let stop = self.stop_handle();
        let state = Arc::clone(&self.state);
        let join = thread::Builder::new()
            .name("devio-server".to_string())
            .spawn(move || self.run())?;
        Ok(ServerHandle {
            stop,
            events,
            state,
            join: Some(join),
        })
    }
}

/// Owner of a server running on its own thread. Dropping it stops and joins the server.
pub struct ServerHandle {
    stop: StopHandle,
    events: Receiver<ServerEvent>,
    state: Arc<Mutex<ServerState>>,
    join: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn events(&self) -> &Receiver<ServerEvent> {
        &self.events
    }

    pub fn state(&self) -> ServerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until the server reports `Ready` (returning its endpoint) or fails to start.
    pub fn wait_ready(&self, timeout: Duration) -> Result<Endpoint, ServerError> {
        match self.events.recv_timeout(timeout) {
            Ok(ServerEvent::Ready(endpoint)) => Ok(endpoint),
            Ok(ServerEvent::InitFailed(reason)) => Err(ServerError::Remote(reason)),
            Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => Err(ServerError::Stopped),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ServerError::Timeout),
        }
    }

    /// Wait for the server thread to finish and return its result.
    pub fn join(mut self) -> Result<(), ServerError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<(), ServerError> {
        match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|_| {
                Err(ServerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "server thread panicked",
                )))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop.stop();
            let _ = self.join_inner();
        }
    }
}
