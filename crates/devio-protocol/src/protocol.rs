use bitflags::bitflags;
use thiserror::Error;

/// Size of the request code that starts every request.
pub const REQUEST_CODE_LEN: usize = 8;
/// READ/WRITE request fields after the code: `offset: i64, length: u64`.
pub const IO_REQUEST_LEN: usize = 16;
/// READ/WRITE response: `error: u64, length: u64`.
pub const IO_RESPONSE_LEN: usize = 16;
/// INFO response: `length: u64, alignment: u64, flags: u64`.
pub const INFO_RESPONSE_LEN: usize = 24;
/// SHARED request fields after the code.
pub const SHARED_REQUEST_LEN: usize = 48;
/// SHARED response header: `error: u32, length: u64`. Followed by `length` keys.
pub const SHARED_RESPONSE_HEADER_LEN: usize = 12;

/// `error` value of a successful READ/WRITE response.
pub const IO_OK: u64 = 0;
/// `error` value of a failed READ/WRITE response.
pub const IO_ERROR: u64 = 1;

/// Request codes. Only INFO, READ, WRITE, CLOSE and SHARED are served; the rest are listed so
/// they can be logged by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    Null = 0,
    Info = 1,
    Read = 2,
    Write = 3,
    Connect = 4,
    Close = 5,
    Unmap = 6,
    Zero = 7,
    Scsi = 8,
    Shared = 9,
}

impl RequestCode {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => RequestCode::Null,
            1 => RequestCode::Info,
            2 => RequestCode::Read,
            3 => RequestCode::Write,
            4 => RequestCode::Connect,
            5 => RequestCode::Close,
            6 => RequestCode::Unmap,
            7 => RequestCode::Zero,
            8 => RequestCode::Scsi,
            9 => RequestCode::Shared,
            _ => return None,
        })
    }

    pub fn to_u64(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for RequestCode {
    type Error = DecodeError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        Self::from_u64(v).ok_or(DecodeError::UnknownRequest(v))
    }
}

bitflags! {
    /// Capability flags carried in the INFO response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InfoFlags: u64 {
        const READ_ONLY = 1;
        const SUPPORTS_UNMAP = 2;
        const SUPPORTS_ZERO = 4;
        const SUPPORTS_SCSI = 8;
        const SUPPORTS_SHARED = 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoResponse {
    pub length: u64,
    pub alignment: u64,
    pub flags: InfoFlags,
}

impl InfoResponse {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u64(out, self.length);
        push_u64(out, self.alignment);
        push_u64(out, self.flags.bits());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            length: r.read_u64()?,
            alignment: r.read_u64()?,
            flags: InfoFlags::from_bits_retain(r.read_u64()?),
        })
    }
}

/// READ/WRITE request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub offset: i64,
    pub length: u64,
}

impl IoRequest {
    /// The offset as an unsigned byte position; negative offsets are never valid on a disk.
    pub fn start(&self) -> Result<u64, DecodeError> {
        u64::try_from(self.offset).map_err(|_| DecodeError::NegativeOffset)
    }
}

/// READ/WRITE response header. READ responses are followed by `length` data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResponse {
    pub error: u64,
    pub length: u64,
}

impl IoResponse {
    pub fn ok(length: u64) -> Self {
        Self {
            error: IO_OK,
            length,
        }
    }

    pub fn failed() -> Self {
        Self {
            error: IO_ERROR,
            length: 0,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u64(out, self.error);
        push_u64(out, self.length);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            error: r.read_u64()?,
            length: r.read_u64()?,
        })
    }
}

/// Shared-key (persistent reservation) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedOp {
    GetUniqueId = 0,
    ReadKeys = 1,
    Register = 2,
    ClearKeys = 3,
    Reserve = 4,
    Release = 5,
    Preempt = 6,
}

impl SharedOp {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => SharedOp::GetUniqueId,
            1 => SharedOp::ReadKeys,
            2 => SharedOp::Register,
            3 => SharedOp::ClearKeys,
            4 => SharedOp::Reserve,
            5 => SharedOp::Release,
            6 => SharedOp::Preempt,
            _ => return None,
        })
    }
}

/// SHARED request fields. `operation` is kept raw so unknown operations can be answered with
/// [`SharedResponseCode::InvalidParameter`] instead of failing to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedRequest {
    pub operation: u64,
    pub reserve_scope: u64,
    pub reserve_type: u64,
    pub existing_reservation_key: u64,
    pub current_channel_key: u64,
    pub operation_channel_key: u64,
}

impl SharedRequest {
    pub fn new(op: SharedOp) -> Self {
        Self {
            operation: op as u64,
            ..Self::default()
        }
    }

    pub fn op(&self) -> Option<SharedOp> {
        SharedOp::from_u64(self.operation)
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        push_u64(out, self.operation);
        push_u64(out, self.reserve_scope);
        push_u64(out, self.reserve_type);
        push_u64(out, self.existing_reservation_key);
        push_u64(out, self.current_channel_key);
        push_u64(out, self.operation_channel_key);
    }

    fn decode_fields(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            operation: r.read_u64()?,
            reserve_scope: r.read_u64()?,
            reserve_type: r.read_u64()?,
            existing_reservation_key: r.read_u64()?,
            current_channel_key: r.read_u64()?,
            operation_channel_key: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedResponseCode {
    NoError = 0,
    ReservationCollision = 1,
    InvalidParameter = 2,
    IoError = 3,
}

impl SharedResponseCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => SharedResponseCode::NoError,
            1 => SharedResponseCode::ReservationCollision,
            2 => SharedResponseCode::InvalidParameter,
            3 => SharedResponseCode::IoError,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResponse {
    pub code: SharedResponseCode,
    pub keys: Vec<u64>,
}

impl SharedResponse {
    pub fn empty(code: SharedResponseCode) -> Self {
        Self {
            code,
            keys: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        SHARED_RESPONSE_HEADER_LEN + self.keys.len() * 8
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u32(out, self.code as u32);
        push_u64(out, self.keys.len() as u64);
        for key in &self.keys {
            push_u64(out, *key);
        }
    }

    /// Decode the fixed header, returning the response code and the announced key count.
    pub fn decode_header(bytes: &[u8]) -> Result<(SharedResponseCode, u64), DecodeError> {
        let mut r = Reader::new(bytes);
        let raw = r.read_u32()?;
        let code = SharedResponseCode::from_u32(raw).ok_or(DecodeError::UnknownResponseCode(raw))?;
        Ok((code, r.read_u64()?))
    }

    /// Decode a complete response, rejecting key counts above `max_keys`.
    pub fn decode(bytes: &[u8], max_keys: usize) -> Result<Self, DecodeError> {
        let (code, count) = Self::decode_header(bytes)?;
        let count = usize::try_from(count).map_err(|_| DecodeError::TooManyKeys)?;
        if count > max_keys {
            return Err(DecodeError::TooManyKeys);
        }
        let mut r = Reader::new(&bytes[SHARED_RESPONSE_HEADER_LEN..]);
        let keys = (0..count)
            .map(|_| r.read_u64())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { code, keys })
    }
}

/// A decoded request (without any WRITE payload, which follows the fixed fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Info,
    Read(IoRequest),
    Write(IoRequest),
    Close,
    Shared(SharedRequest),
    /// Any code this server does not serve. Carries the raw code for logging.
    Unknown(u64),
}

impl Request {
    pub fn code(&self) -> u64 {
        match self {
            Request::Info => RequestCode::Info.to_u64(),
            Request::Read(_) => RequestCode::Read.to_u64(),
            Request::Write(_) => RequestCode::Write.to_u64(),
            Request::Close => RequestCode::Close.to_u64(),
            Request::Shared(_) => RequestCode::Shared.to_u64(),
            Request::Unknown(code) => *code,
        }
    }

    /// Encode the code and fixed fields.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u64(out, self.code());
        match self {
            Request::Read(io) | Request::Write(io) => {
                push_u64(out, io.offset as u64);
                push_u64(out, io.length);
            }
            Request::Shared(shared) => shared.encode_fields(out),
            Request::Info | Request::Close | Request::Unknown(_) => {}
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_CODE_LEN + SHARED_REQUEST_LEN);
        self.encode_into(&mut out);
        out
    }

    /// Decode the fixed fields of a request whose code has already been read.
    ///
    /// `body` must hold at least [`request_body_len`] bytes for `code`.
    pub fn decode_body(code: u64, body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(body);
        Ok(match RequestCode::from_u64(code) {
            Some(RequestCode::Info) => Request::Info,
            Some(RequestCode::Close) => Request::Close,
            Some(RequestCode::Read) => Request::Read(IoRequest {
                offset: r.read_u64()? as i64,
                length: r.read_u64()?,
            }),
            Some(RequestCode::Write) => Request::Write(IoRequest {
                offset: r.read_u64()? as i64,
                length: r.read_u64()?,
            }),
            Some(RequestCode::Shared) => Request::Shared(SharedRequest::decode_fields(&mut r)?),
            _ => Request::Unknown(code),
        })
    }
}

/// Number of fixed bytes that follow `code` in a request.
pub fn request_body_len(code: u64) -> usize {
    match RequestCode::from_u64(code) {
        Some(RequestCode::Read | RequestCode::Write) => IO_REQUEST_LEN,
        Some(RequestCode::Shared) => SHARED_REQUEST_LEN,
        _ => 0,
    }
}

/// Decode a request (code plus fixed fields) from the start of `bytes`.
pub fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    let mut r = Reader::new(bytes);
    let code = r.read_u64()?;
    let body = r.read_bytes(request_body_len(code))?;
    Request::decode_body(code, body)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("unknown request code {0}")]
    UnknownRequest(u64),
    #[error("unknown shared-key response code {0}")]
    UnknownResponseCode(u32),
    #[error("too many shared keys")]
    TooManyKeys,
    #[error("negative offset")]
    NegativeOffset,
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}
