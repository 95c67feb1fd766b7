use devio_protocol::{
    decode_request, request_body_len, DecodeError, InfoFlags, InfoResponse, IoRequest,
    IoResponse, Request, RequestCode, SharedOp, SharedRequest, SharedResponse,
    SharedResponseCode, IO_ERROR, IO_REQUEST_LEN, REQUEST_CODE_LEN, SHARED_REQUEST_LEN,
};

#[test]
fn read_request_layout_is_code_offset_length() {
    let req = Request::Read(IoRequest {
        offset: 1000,
        length: 100,
    });
    let bytes = req.encode();
    assert_eq!(bytes.len(), REQUEST_CODE_LEN + IO_REQUEST_LEN);
    assert_eq!(&bytes[..8], &2u64.to_le_bytes());
    assert_eq!(&bytes[8..16], &1000i64.to_le_bytes());
    assert_eq!(&bytes[16..24], &100u64.to_le_bytes());

    assert_eq!(decode_request(&bytes).unwrap(), req);
}

#[test]
fn negative_offset_survives_decoding() {
    let req = Request::Write(IoRequest {
        offset: -512,
        length: 512,
    });
    let decoded = decode_request(&req.encode()).unwrap();
    let Request::Write(io) = decoded else {
        panic!("expected WRITE, got {decoded:?}");
    };
    assert_eq!(io.offset, -512);
    assert_eq!(io.start(), Err(DecodeError::NegativeOffset));
}

#[test]
fn info_and_close_have_no_body() {
    assert_eq!(request_body_len(RequestCode::Info.to_u64()), 0);
    assert_eq!(request_body_len(RequestCode::Close.to_u64()), 0);
    assert_eq!(decode_request(&1u64.to_le_bytes()).unwrap(), Request::Info);
    assert_eq!(decode_request(&5u64.to_le_bytes()).unwrap(), Request::Close);
}

#[test]
fn unserved_codes_decode_as_unknown() {
    // UNMAP is a known code this server does not implement.
    assert_eq!(
        decode_request(&6u64.to_le_bytes()).unwrap(),
        Request::Unknown(6)
    );
    assert_eq!(
        decode_request(&0xDEAD_u64.to_le_bytes()).unwrap(),
        Request::Unknown(0xDEAD)
    );
    assert_eq!(request_body_len(0xDEAD), 0);
}

#[test]
fn truncated_frames_are_rejected() {
    let bytes = Request::Read(IoRequest {
        offset: 0,
        length: 1,
    })
    .encode();
    assert_eq!(
        decode_request(&bytes[..bytes.len() - 1]),
        Err(DecodeError::UnexpectedEof)
    );
    assert_eq!(decode_request(&[1, 0, 0]), Err(DecodeError::UnexpectedEof));
}

#[test]
fn shared_request_carries_six_fields() {
    let req = SharedRequest {
        operation: SharedOp::Reserve as u64,
        reserve_scope: 0,
        reserve_type: 3,
        existing_reservation_key: 0,
        current_channel_key: 0xAAAA,
        operation_channel_key: 0xBBBB,
    };
    let bytes = Request::Shared(req).encode();
    assert_eq!(bytes.len(), REQUEST_CODE_LEN + SHARED_REQUEST_LEN);
    assert_eq!(&bytes[8..16], &4u64.to_le_bytes());
    assert_eq!(&bytes[40..48], &0xAAAAu64.to_le_bytes());

    let Request::Shared(decoded) = decode_request(&bytes).unwrap() else {
        panic!("expected SHARED");
    };
    assert_eq!(decoded, req);
    assert_eq!(decoded.op(), Some(SharedOp::Reserve));
}

#[test]
fn info_response_flags() {
    let resp = InfoResponse {
        length: 10 * 1024 * 1024,
        alignment: 512,
        flags: InfoFlags::READ_ONLY | InfoFlags::SUPPORTS_SHARED,
    };
    let mut out = Vec::new();
    resp.encode_into(&mut out);
    assert_eq!(&out[16..24], &17u64.to_le_bytes());
    assert_eq!(InfoResponse::decode(&out).unwrap(), resp);
}

#[test]
fn failed_io_response_has_zero_length() {
    let mut out = Vec::new();
    IoResponse::failed().encode_into(&mut out);
    let decoded = IoResponse::decode(&out).unwrap();
    assert_eq!(decoded.error, IO_ERROR);
    assert_eq!(decoded.length, 0);
}

#[test]
fn shared_response_key_count_is_bounded() {
    let resp = SharedResponse {
        code: SharedResponseCode::NoError,
        keys: vec![1, 2, 3],
    };
    let mut out = Vec::new();
    resp.encode_into(&mut out);
    assert_eq!(SharedResponse::decode(&out, 8).unwrap(), resp);
    assert_eq!(
        SharedResponse::decode(&out, 2),
        Err(DecodeError::TooManyKeys)
    );

    let mut bad = out.clone();
    bad[..4].copy_from_slice(&9u32.to_le_bytes());
    assert_eq!(
        SharedResponse::decode(&bad, 8),
        Err(DecodeError::UnknownResponseCode(9))
    );
}
