#![forbid(unsafe_code)]

//! Wire protocol between a devio client (kernel driver or remote consumer) and the devio server.
//!
//! Every request starts with an 8-byte little-endian request code followed by the fixed fields of
//! that request. Responses mirror the request shape. The same byte layout is used by both
//! transports: the stream-socket transport sends frames back to back, the shared-memory transport
//! places them at the start of the mapped header region (see [`layout`]).
//!
//! ```text
//! INFO    req: code                                  resp: length u64, alignment u64, flags u64
//! READ    req: code, offset i64, length u64          resp: error u64, length u64, [bytes]
//! WRITE   req: code, offset i64, length u64, [bytes] resp: error u64, length u64
//! CLOSE   req: code                                  (no response)
//! SHARED  req: code, 6 x u64 key-operation fields    resp: error u32, length u64, [u64 keys]
//! ```

pub mod layout;
mod protocol;

pub use protocol::{
    decode_request, request_body_len, DecodeError, InfoFlags, InfoResponse, IoRequest,
    IoResponse, Request, RequestCode, SharedOp, SharedRequest, SharedResponse,
    SharedResponseCode, INFO_RESPONSE_LEN, IO_ERROR, IO_OK, IO_REQUEST_LEN, IO_RESPONSE_LEN,
    REQUEST_CODE_LEN, SHARED_REQUEST_LEN, SHARED_RESPONSE_HEADER_LEN,
};
