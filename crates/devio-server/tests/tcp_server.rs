use std::io::{Read, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use devio_protocol::{
    InfoFlags, IoRequest, IoResponse, Request, SharedOp, SharedRequest, SharedResponseCode,
    IO_ERROR, IO_RESPONSE_LEN,
};
use devio_server::{
    Client, Endpoint, Provider, RemoteStream, Server, ServerConfig, ServerError, ServerEvent,
    ServerHandle, ServerState, SharedKeysProvider, StreamProvider, TcpClient, TcpConfig,
    ZeroProvider,
};
use devio_storage::{AligningStream, FileStream, MemStream, Stream, SubStream};

const TEN_MIB: u64 = 10 * 1024 * 1024;
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn local_config(max_transfer_size: usize) -> TcpConfig {
    TcpConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        max_transfer_size,
    }
}

fn spawn<P: Provider + 'static>(
    provider: P,
    max_transfer_size: usize,
) -> (ServerHandle, SocketAddr) {
    let handle = Server::new(provider, local_config(max_transfer_size))
        .spawn()
        .unwrap();
    let Endpoint::Tcp(addr) = handle.wait_ready(READY_TIMEOUT).unwrap() else {
        panic!("expected a TCP endpoint");
    };
    (handle, addr)
}

fn aligned_mem_disk(len: u64) -> StreamProvider<AligningStream<MemStream>> {
    StreamProvider::new(AligningStream::new(MemStream::with_len(len).unwrap(), 512, 0).unwrap())
}

fn send_raw(stream: &mut TcpStream, request: Request) {
    stream.write_all(&request.encode()).unwrap();
}

fn read_io_response(stream: &mut TcpStream) -> IoResponse {
    let mut raw = [0u8; IO_RESPONSE_LEN];
    stream.read_exact(&mut raw).unwrap();
    IoResponse::decode(&raw).unwrap()
}

#[test]
fn info_reports_length_alignment_and_flags() {
    let (handle, addr) = spawn(aligned_mem_disk(TEN_MIB), 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();

    let first = client.info().unwrap();
    let second = client.info().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.length, TEN_MIB);
    assert_eq!(first.alignment, 512);
    assert_eq!(first.flags, InfoFlags::empty());

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn second_client_is_refused_while_serving() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 4096);
    let mut client = TcpClient::connect(addr).unwrap();
    client.info().unwrap();
    assert_eq!(handle.state(), ServerState::Serving);

    let err = TcpStream::connect_timeout(&addr, Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

    // The attached client is unaffected.
    assert_eq!(client.info().unwrap().length, 4096);
    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn offsets_beyond_wire_range_fail_locally() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 4096);
    let mut client = TcpClient::connect(addr).unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(
        client.read_at(&mut buf, u64::MAX - 1).unwrap_err(),
        ServerError::Storage(_)
    ));
    assert!(matches!(
        client.write_at(&buf, u64::MAX).unwrap_err(),
        ServerError::Storage(_)
    ));
    // Nothing reached the wire, so the session is still in sync.
    assert_eq!(client.info().unwrap().length, 4096);

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn misaligned_write_is_read_back_and_neighbours_stay_zero() {
    let (handle, addr) = spawn(aligned_mem_disk(TEN_MIB), 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();

    assert_eq!(client.write_at(&[0xAB; 100], 1000).unwrap(), 100);

    let mut back = vec![0u8; 100];
    assert_eq!(client.read_at(&mut back, 1000).unwrap(), 100);
    assert!(back.iter().all(|b| *b == 0xAB));

    let mut head = vec![0xFFu8; 1000];
    assert_eq!(client.read_at(&mut head, 0).unwrap(), 1000);
    assert!(head.iter().all(|b| *b == 0));

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn read_at_or_past_end_returns_no_data_without_error() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut stream = TcpStream::connect(addr).unwrap();

    send_raw(
        &mut stream,
        Request::Read(IoRequest {
            offset: 4096,
            length: 512,
        }),
    );
    assert_eq!(read_io_response(&mut stream), IoResponse::ok(0));

    send_raw(
        &mut stream,
        Request::Read(IoRequest {
            offset: 4000,
            length: 512,
        }),
    );
    let response = read_io_response(&mut stream);
    assert_eq!(response, IoResponse::ok(96));
    let mut payload = [0u8; 96];
    stream.read_exact(&mut payload).unwrap();

    send_raw(&mut stream, Request::Close);
    handle.join().unwrap();
}

#[test]
fn read_is_clamped_to_max_transfer_size() {
    let (handle, addr) = spawn(ZeroProvider::new(1 << 20), 4096);
    let mut stream = TcpStream::connect(addr).unwrap();

    send_raw(
        &mut stream,
        Request::Read(IoRequest {
            offset: 0,
            length: 8192,
        }),
    );
    assert_eq!(read_io_response(&mut stream), IoResponse::ok(4096));
    let mut payload = vec![0xFFu8; 4096];
    stream.read_exact(&mut payload).unwrap();
    assert!(payload.iter().all(|b| *b == 0));

    send_raw(&mut stream, Request::Close);
    handle.join().unwrap();
}

#[test]
fn negative_offset_is_a_request_error() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut stream = TcpStream::connect(addr).unwrap();

    send_raw(
        &mut stream,
        Request::Read(IoRequest {
            offset: -1,
            length: 16,
        }),
    );
    let response = read_io_response(&mut stream);
    assert_eq!(response.error, IO_ERROR);
    assert_eq!(response.length, 0);

    // The WRITE payload is still consumed so the connection stays in sync.
    let mut frame = Request::Write(IoRequest {
        offset: -512,
        length: 4,
    })
    .encode();
    frame.extend_from_slice(&[1, 2, 3, 4]);
    stream.write_all(&frame).unwrap();
    assert_eq!(read_io_response(&mut stream).error, IO_ERROR);

    send_raw(&mut stream, Request::Info);
    let mut info = [0u8; 24];
    stream.read_exact(&mut info).unwrap();
    assert_eq!(&info[..8], &4096u64.to_le_bytes());

    send_raw(&mut stream, Request::Close);
    handle.join().unwrap();
}

#[test]
fn failed_write_keeps_connection_open() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();

    let err = client.write_at(&[1u8; 10], 4090).unwrap_err();
    assert!(matches!(err, ServerError::Remote(_)));

    assert_eq!(client.info().unwrap().length, 4096);
    assert_eq!(client.write_at(&[1u8; 10], 0).unwrap(), 10);

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn read_only_disk_rejects_writes() {
    let provider = StreamProvider::new(MemStream::with_len(1024).unwrap().read_only());
    let (handle, addr) = spawn(provider, 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();

    assert!(client.info().unwrap().flags.contains(InfoFlags::READ_ONLY));
    assert!(client.write_at(&[1], 0).is_err());

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn oversized_write_tears_down_connection_without_corrupting_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    FileStream::create(&path, 64 * 1024).unwrap();
    let stream = AligningStream::new(FileStream::open(&path).unwrap(), 512, 0).unwrap();

    let (handle, addr) = spawn(StreamProvider::new(stream), 4096);
    let mut client = TcpClient::connect(addr)
        .unwrap()
        .with_max_transfer_size(1 << 20);

    assert_eq!(client.write_at(&[0x11; 512], 0).unwrap(), 512);
    assert!(client.write_at(&[0x22; 8192], 512).is_err());

    let err = handle.join().unwrap_err();
    assert!(matches!(
        err,
        ServerError::ProtocolViolation {
            length: 8192,
            max: 4096
        }
    ));

    let data = std::fs::read(&path).unwrap();
    assert!(data[..512].iter().all(|b| *b == 0x11));
    assert!(data[512..].iter().all(|b| *b == 0));
}

#[test]
fn unrecognized_request_closes_connection() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut stream = TcpStream::connect(addr).unwrap();

    // UNMAP is not served.
    stream.write_all(&6u64.to_le_bytes()).unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    handle.join().unwrap();
}

#[test]
fn client_disconnect_ends_session() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    {
        let mut client = TcpClient::connect(addr).unwrap();
        client.info().unwrap();
    }
    handle.join().unwrap();
}

#[test]
fn stop_interrupts_a_blocked_server() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();
    client.info().unwrap();
    assert_eq!(handle.state(), ServerState::Serving);

    // The server is now blocked waiting for the next request.
    handle.stop();
    assert_eq!(
        handle.events().recv_timeout(READY_TIMEOUT).unwrap(),
        ServerEvent::Stopping
    );
    assert_eq!(
        handle.events().recv_timeout(READY_TIMEOUT).unwrap(),
        ServerEvent::ShutDown
    );
    assert_eq!(handle.state(), ServerState::ShutDown);
    assert!(client.info().is_err());
    handle.join().unwrap();
}

#[test]
fn stop_before_any_client_shuts_down_cleanly() {
    let (handle, _addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    handle.stop();
    assert_eq!(
        handle.events().recv_timeout(READY_TIMEOUT).unwrap(),
        ServerEvent::Stopping
    );
    assert_eq!(
        handle.events().recv_timeout(READY_TIMEOUT).unwrap(),
        ServerEvent::ShutDown
    );
    handle.join().unwrap();
}

#[test]
fn accept_timeout_is_reported() {
    let config =
        ServerConfig::from(local_config(4096)).with_accept_timeout(Duration::from_millis(50));
    let handle = Server::new(aligned_mem_disk(4096), config).spawn().unwrap();
    handle.wait_ready(READY_TIMEOUT).unwrap();
    assert!(matches!(handle.join().unwrap_err(), ServerError::Timeout));
}

#[test]
fn address_in_use_fails_initialization() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = TcpConfig::new(taken.local_addr().unwrap());

    let mut server = Server::new(aligned_mem_disk(4096), config);
    let events = server.subscribe();
    let err = server.run().unwrap_err();
    assert!(err.is_transport_fatal());
    assert_eq!(server.state(), ServerState::InitFailed);
    assert!(matches!(events.try_recv().unwrap(), ServerEvent::InitFailed(_)));
}

#[test]
fn shared_keys_round_trip() {
    let provider = SharedKeysProvider::new(aligned_mem_disk(4096));
    let (handle, addr) = spawn(provider, 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();

    assert!(client.info().unwrap().flags.contains(InfoFlags::SUPPORTS_SHARED));

    let id = client
        .shared_keys(&SharedRequest::new(SharedOp::GetUniqueId))
        .unwrap();
    assert_eq!(id.code, SharedResponseCode::NoError);
    assert_eq!(id.keys.len(), 2);

    let register = SharedRequest {
        operation_channel_key: 0x1234,
        ..SharedRequest::new(SharedOp::Register)
    };
    assert_eq!(
        client.shared_keys(&register).unwrap().code,
        SharedResponseCode::NoError
    );
    let keys = client
        .shared_keys(&SharedRequest::new(SharedOp::ReadKeys))
        .unwrap();
    assert_eq!(keys.keys, vec![0x1234]);

    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn shared_keys_on_plain_provider_are_empty() {
    let (handle, addr) = spawn(aligned_mem_disk(4096), 1 << 20);
    let mut client = TcpClient::connect(addr).unwrap();
    let response = client
        .shared_keys(&SharedRequest::new(SharedOp::ReadKeys))
        .unwrap();
    assert_eq!(response.code, SharedResponseCode::NoError);
    assert!(response.keys.is_empty());
    client.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn remote_stream_composes_with_sub_stream() {
    let (handle, addr) = spawn(aligned_mem_disk(64 * 1024), 4096);
    let client = TcpClient::connect(addr).unwrap().with_max_transfer_size(4096);
    let remote = RemoteStream::new(client).unwrap();
    assert_eq!(remote.alignment(), 512);

    let mut window = SubStream::new(remote, 8192, 16 * 1024).unwrap();
    window.seek(SeekFrom::Start(100)).unwrap();
    // Larger than one transfer, so the client splits it.
    let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    window.write_all(&data).unwrap();

    let mut back = vec![0u8; data.len()];
    window.seek(SeekFrom::Start(100)).unwrap();
    assert_eq!(window.read_full(&mut back).unwrap(), data.len());
    assert_eq!(back, data);

    let mut remote = window.into_inner();
    let mut raw = vec![0u8; 10];
    remote.seek(SeekFrom::Start(8192 + 100)).unwrap();
    remote.read_full(&mut raw).unwrap();
    assert_eq!(&raw, &data[..10]);

    remote.into_client().close().unwrap();
    handle.join().unwrap();
}
