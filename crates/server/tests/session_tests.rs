//! End-to-end session tests
//!
//! Each test boots the real listener on an ephemeral port with the scripted
//! mock backend behind it, then drives the wire protocol over TCP exactly
//! as an importing peer would.
//!
//! Run with: `cargo test -p server --test session_tests`

use bytes::Bytes;
use common::BackendError;
use common::test_utils::{
    MockBackendConfig, MockBackendState, MockOutcome, MockTransferScript, spawn_mock_backend,
    test_device,
};
use protocol::{
    DevlistReply, Direction, Header, SubmitReply, SubmitRequest, UnlinkReply, UnlinkRequest,
};
use server::config::ServerConfig;
use server::network::Listener;
use server::state::ServerCounters;
use server::usb::claim::ClaimArbiter;
use server::usb::registry::DeviceRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, watch};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    backend_state: Arc<MockBackendState>,
    claims: Arc<ClaimArbiter>,
    counters: Arc<ServerCounters>,
}

async fn start_server(mock: MockBackendConfig, config: ServerConfig) -> TestServer {
    let (backend, backend_state) = spawn_mock_backend(mock);
    let shared_config = Arc::new(RwLock::new(config));
    let registry = Arc::new(DeviceRegistry::new(backend.clone(), shared_config.clone()));
    let claims = Arc::new(ClaimArbiter::new(None));
    let counters = ServerCounters::new();

    let listener = Listener::new(
        shared_config,
        backend,
        registry,
        claims.clone(),
        counters.clone(),
    );
    let tcp = listener.bind().await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = listener.run(tcp, shutdown_rx).await;
    });

    TestServer {
        addr,
        shutdown,
        backend_state,
        claims,
        counters,
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        // Port 0 gets an ephemeral port from the OS
        port: 0,
        connection_timeout: 5,
        ..ServerConfig::default()
    }
}

fn single_device_mock() -> MockBackendConfig {
    MockBackendConfig {
        devices: vec![test_device("1-1", "1-4")],
        ..Default::default()
    }
}

async fn connect(server: &TestServer) -> TcpStream {
    TcpStream::connect(server.addr).await.unwrap()
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8]) {
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(bytes))
        .await
        .expect("write timed out")
        .unwrap();
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Read one complete server-to-client message, returning its header and the
/// full encoded bytes
async fn read_reply(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut bytes = read_exact(stream, Header::SIZE).await;
    let header = Header::read_from(&mut std::io::Cursor::new(&bytes)).unwrap();

    match (header.version, header.command) {
        (protocol::USBIP_VERSION, protocol::OP_REP_DEVLIST) => {
            let count_bytes = read_exact(stream, 4).await;
            let count = u32::from_be_bytes(count_bytes.clone().try_into().unwrap()) as usize;
            bytes.extend_from_slice(&count_bytes);
            bytes.extend(read_exact(stream, count * protocol::ExportedDevice::SIZE).await);
        }
        (protocol::USBIP_VERSION, protocol::OP_REP_IMPORT) => {
            if header.status == protocol::ST_OK {
                bytes.extend(read_exact(stream, protocol::ExportedDevice::SIZE).await);
            }
        }
        (0, protocol::RET_SUBMIT) => {
            let body = read_exact(stream, SubmitReply::FIXED_SIZE - Header::SIZE).await;
            let direction = u32::from_be_bytes(body[8..12].try_into().unwrap());
            let status = i32::from_be_bytes(body[16..20].try_into().unwrap());
            let actual_length = u32::from_be_bytes(body[20..24].try_into().unwrap());
            bytes.extend_from_slice(&body);
            if direction == 1 && status == 0 && actual_length > 0 {
                bytes.extend(read_exact(stream, actual_length as usize).await);
            }
        }
        (0, protocol::RET_UNLINK) => {
            bytes.extend(read_exact(stream, UnlinkReply::SIZE - Header::SIZE).await);
        }
        other => panic!("unexpected reply header: {:?}", other),
    }

    (header, bytes)
}

fn devlist_request() -> Vec<u8> {
    vec![0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]
}

fn import_request(bus_id: &str) -> Vec<u8> {
    let mut bytes = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
    bytes.extend_from_slice(bus_id.as_bytes());
    bytes.resize(40, 0);
    bytes
}

fn submit(seqnum: u32, ep: u32, direction: u32, length: u32, data: Option<Bytes>) -> Vec<u8> {
    SubmitRequest {
        seqnum,
        devid: 0x10004,
        direction,
        ep,
        transfer_flags: 0,
        transfer_buffer_length: length,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: if ep == 0 {
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        } else {
            [0u8; 8]
        },
        data,
    }
    .encode()
    .unwrap()
}

fn unlink(seqnum: u32, unlink_seqnum: u32) -> Vec<u8> {
    UnlinkRequest {
        seqnum,
        devid: 0x10004,
        direction: 0,
        ep: 0,
        unlink_seqnum,
    }
    .encode()
    .unwrap()
}

async fn import_device(stream: &mut TcpStream, bus_id: &str) {
    write_all(stream, &import_request(bus_id)).await;
    let (header, bytes) = read_reply(stream).await;
    assert_eq!(header.status, protocol::ST_OK);
    assert_eq!(bytes.len(), 320);
}

// S1: empty device list
#[tokio::test]
async fn devlist_empty() {
    let server = start_server(MockBackendConfig::default(), test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &devlist_request()).await;
    let (_, bytes) = read_reply(&mut stream).await;
    assert_eq!(
        bytes,
        vec![0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn devlist_reports_exportable_devices() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &devlist_request()).await;
    let (_, bytes) = read_reply(&mut stream).await;
    let reply = DevlistReply::decode(&bytes).unwrap();
    assert_eq!(reply.devices.len(), 1);
    assert_eq!(reply.devices[0].bus_id, "1-1");

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn devlist_respects_allow_list() {
    let mock = MockBackendConfig {
        devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
        ..Default::default()
    };
    let config = ServerConfig {
        allowed_devices: vec!["2-1".to_string()],
        ..test_config()
    };
    let server = start_server(mock, config).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &devlist_request()).await;
    let (_, bytes) = read_reply(&mut stream).await;
    let reply = DevlistReply::decode(&bytes).unwrap();
    assert_eq!(reply.devices.len(), 1);
    assert_eq!(reply.devices[0].bus_id, "2-1");

    // Importing a filtered device fails with no-such-device
    write_all(&mut stream, &import_request("1-1")).await;
    let (header, _) = read_reply(&mut stream).await;
    assert_eq!(header.status, protocol::ST_NO_SUCH_DEVICE);

    let _ = server.shutdown.send(true);
}

// S2: import success
#[tokio::test]
async fn import_claims_device() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &import_request("1-1")).await;
    let (header, bytes) = read_reply(&mut stream).await;
    assert_eq!(header.command, protocol::OP_REP_IMPORT);
    assert_eq!(header.status, 0);
    assert_eq!(bytes.len(), 320);
    // The bus_id slot sits after the header and the 256-byte path slot
    assert_eq!(&bytes[8 + 256..8 + 256 + 3], b"1-1");

    assert!(server.claims.is_claimed("1-1-1-4").await);
    assert_eq!(
        server.backend_state.claims.lock().unwrap().as_slice(),
        ["1-1"]
    );

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn second_import_is_refused() {
    let server = start_server(single_device_mock(), test_config()).await;

    let mut first = connect(&server).await;
    import_device(&mut first, "1-1").await;

    let mut second = connect(&server).await;
    write_all(&mut second, &import_request("1-1")).await;
    let (header, bytes) = read_reply(&mut second).await;
    assert_eq!(header.status, protocol::ST_DEVICE_BUSY);
    assert_eq!(bytes.len(), 8);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn import_backend_refusal_stays_in_op_phase() {
    let mut mock = single_device_mock();
    mock.claim_errors
        .insert("1-1".to_string(), BackendError::AccessDenied);
    let server = start_server(mock, test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &import_request("1-1")).await;
    let (header, _) = read_reply(&mut stream).await;
    assert_eq!(header.status, protocol::ST_NA);

    // Still in op phase: a devlist must be answered
    write_all(&mut stream, &devlist_request()).await;
    let (header, _) = read_reply(&mut stream).await;
    assert_eq!(header.command, protocol::OP_REP_DEVLIST);

    let _ = server.shutdown.send(true);
}

// S3: control GET_DESCRIPTOR
#[tokio::test]
async fn submit_control_get_descriptor() {
    let mut mock = single_device_mock();
    mock.scripts.push(MockTransferScript {
        endpoint: 0,
        direction: Direction::In,
        delay: Duration::ZERO,
        outcome: MockOutcome::InData(Bytes::from_static(&[0x12; 18])),
    });
    let server = start_server(mock, test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    write_all(&mut stream, &submit(1, 0, 1, 18, None)).await;
    let (_, bytes) = read_reply(&mut stream).await;
    assert_eq!(bytes.len(), 70);

    let reply = SubmitReply::decode(&bytes).unwrap();
    assert_eq!(reply.seqnum, 1);
    assert_eq!(reply.status, 0);
    assert_eq!(reply.actual_length, 18);
    assert_eq!(reply.data.unwrap(), Bytes::from_static(&[0x12; 18]));

    let _ = server.shutdown.send(true);
}

// S4: bulk OUT 512 bytes
#[tokio::test]
async fn submit_bulk_out() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    let payload = Bytes::from(vec![0x42u8; 512]);
    write_all(&mut stream, &submit(2, 0x02, 0, 512, Some(payload))).await;
    let (_, bytes) = read_reply(&mut stream).await;
    assert_eq!(bytes.len(), 52);

    let reply = SubmitReply::decode(&bytes).unwrap();
    assert_eq!(reply.seqnum, 2);
    assert_eq!(reply.status, 0);
    assert_eq!(reply.actual_length, 512);
    assert!(reply.data.is_none());

    let _ = server.shutdown.send(true);
}

// S5: unlink racing a long submit
#[tokio::test]
async fn unlink_cancels_pending_submit() {
    let mut mock = single_device_mock();
    mock.scripts.push(MockTransferScript {
        endpoint: 1,
        direction: Direction::In,
        delay: Duration::from_secs(30),
        outcome: MockOutcome::InData(Bytes::from_static(b"late")),
    });
    let server = start_server(mock, test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    write_all(&mut stream, &submit(3, 0x81, 1, 64, None)).await;
    // Give the dispatch task a moment to reach the backend
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_all(&mut stream, &unlink(4, 3)).await;

    // Both replies arrive; order between them is not guaranteed
    let (first_header, first_bytes) = read_reply(&mut stream).await;
    let (second_header, second_bytes) = read_reply(&mut stream).await;

    let (unlink_bytes, submit_bytes) = if first_header.command == protocol::RET_UNLINK {
        (first_bytes, second_bytes)
    } else {
        assert_eq!(second_header.command, protocol::RET_UNLINK);
        (second_bytes, first_bytes)
    };

    let unlink_reply = UnlinkReply::decode(&unlink_bytes).unwrap();
    assert_eq!(unlink_reply.seqnum, 4);
    assert_eq!(unlink_reply.status, 0);

    let submit_reply = SubmitReply::decode(&submit_bytes).unwrap();
    assert_eq!(submit_reply.seqnum, 3);
    assert_eq!(submit_reply.status, -2);
    assert!(submit_reply.data.is_none());

    assert!(server.backend_state.cancelled.lock().unwrap().contains(&3));

    let _ = server.shutdown.send(true);
}

// S5, other interleaving: the submit already completed
#[tokio::test]
async fn unlink_after_completion_reports_enoent() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    write_all(&mut stream, &submit(5, 0x02, 0, 4, Some(Bytes::from_static(&[0u8; 4])))).await;
    let (_, bytes) = read_reply(&mut stream).await;
    assert_eq!(SubmitReply::decode(&bytes).unwrap().status, 0);

    write_all(&mut stream, &unlink(6, 5)).await;
    let (_, bytes) = read_reply(&mut stream).await;
    let reply = UnlinkReply::decode(&bytes).unwrap();
    assert_eq!(reply.seqnum, 6);
    assert_eq!(reply.status, -2);

    let _ = server.shutdown.send(true);
}

// S6: the 65th concurrent submit is refused with -EAGAIN
#[tokio::test]
async fn concurrent_limit_enforced() {
    let mut mock = single_device_mock();
    mock.scripts.push(MockTransferScript {
        endpoint: 1,
        direction: Direction::In,
        delay: Duration::from_secs(30),
        outcome: MockOutcome::InData(Bytes::from_static(b"slow")),
    });
    let server = start_server(mock, test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    for seqnum in 1..=64u32 {
        write_all(&mut stream, &submit(seqnum, 0x81, 1, 8, None)).await;
    }
    write_all(&mut stream, &submit(65, 0x81, 1, 8, None)).await;

    // The 64 in-flight transfers hang on the mock; the only reply that can
    // arrive is the rejection of the 65th
    let (_, bytes) = read_reply(&mut stream).await;
    let reply = SubmitReply::decode(&bytes).unwrap();
    assert_eq!(reply.seqnum, 65);
    assert_eq!(reply.status, -11);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn disconnect_releases_claim_and_cancels_urbs() {
    let mut mock = single_device_mock();
    mock.scripts.push(MockTransferScript {
        endpoint: 1,
        direction: Direction::In,
        delay: Duration::from_secs(30),
        outcome: MockOutcome::InData(Bytes::from_static(b"never")),
    });
    let server = start_server(mock, test_config()).await;

    {
        let mut stream = connect(&server).await;
        import_device(&mut stream, "1-1").await;
        write_all(&mut stream, &submit(7, 0x81, 1, 8, None)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Drop the connection with the URB still in flight
    }

    // Teardown cascades: claim released, URB cancelled, counters clean
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    loop {
        let released = server
            .backend_state
            .released
            .lock()
            .unwrap()
            .contains(&"1-1".to_string());
        if released {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "claim was not released after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(!server.claims.is_claimed("1-1-1-4").await);
    assert!(server.backend_state.cancelled.lock().unwrap().contains(&7));
    assert_eq!(server.counters.in_flight_urbs.load(Ordering::SeqCst), 0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn connection_limit_closes_excess_connections() {
    let config = ServerConfig {
        max_connections: 1,
        ..test_config()
    };
    let server = start_server(single_device_mock(), config).await;

    let mut first = connect(&server).await;
    write_all(&mut first, &devlist_request()).await;
    let _ = read_reply(&mut first).await;

    // The second connection is accepted and then immediately closed
    let mut second = connect(&server).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(IO_TIMEOUT, second.read(&mut buf))
        .await
        .expect("expected the server to close the connection");
    assert_eq!(read.unwrap(), 0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn submit_in_op_phase_closes_connection() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &submit(1, 0, 1, 18, None)).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("expected the server to close the connection");
    assert_eq!(read.unwrap(), 0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn bad_version_closes_connection() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;

    write_all(&mut stream, &[0x02, 0x22, 0x80, 0x05, 0, 0, 0, 0]).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("expected the server to close the connection");
    assert_eq!(read.unwrap(), 0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let config = ServerConfig {
        connection_timeout: 1,
        ..test_config()
    };
    let server = start_server(single_device_mock(), config).await;
    let mut stream = connect(&server).await;

    // Say nothing and wait out the idle timeout
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(4), stream.read(&mut buf))
        .await
        .expect("expected the idle timeout to close the connection");
    assert_eq!(read.unwrap(), 0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn shutdown_closes_sessions_and_releases_claims() {
    let server = start_server(single_device_mock(), test_config()).await;
    let mut stream = connect(&server).await;
    import_device(&mut stream, "1-1").await;

    let _ = server.shutdown.send(true);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("expected shutdown to close the session");
    assert_eq!(read.unwrap(), 0);

    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while server.claims.is_claimed("1-1-1-4").await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "claim survived shutdown"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
