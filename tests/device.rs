mod common;

use bytes::Bytes;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use common::{drain, wait_for};
use rover_link::device::{
    DeviceChannel, DeviceEndpoint, DeviceEvent, DeviceOptions, DeviceState, EndpointConfig,
    StdBlockingSocket,
};
use rover_link::protocol::{DeviceHeader, DeviceMessageKind};

const WAIT: Duration = Duration::from_secs(3);

/// A port nothing is bound to right now
fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn host_options(device_id: u8, device_port: u16) -> DeviceOptions {
    DeviceOptions::new(device_id, "127.0.0.1:0".parse().unwrap())
        .with_device_port(device_port)
        .with_idle_timeout(Duration::from_millis(300))
}

#[tokio::test]
async fn test_endpoint_session() {
    let device_port = free_port();
    let (host, mut events) = DeviceChannel::open(host_options(7, device_port));
    let host_addr = host.local_addr().unwrap();

    let endpoint = tokio::task::spawn_blocking(move || {
        let mut config = EndpointConfig::new(7, device_port, host_addr);
        config.idle_timeout = Duration::from_millis(300);
        config.heartbeat_after = Duration::from_millis(100);
        config.max_handshakes = Some(20);
        let mut endpoint = DeviceEndpoint::new(StdBlockingSocket::new(), config);
        endpoint.connect().unwrap();
        endpoint.send(b"hello").unwrap();
        endpoint.send_log("booted").unwrap();

        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Some(len) = endpoint.poll(&mut buf).unwrap() {
                return buf[..len].to_vec();
            }
        }
        Vec::new()
    });

    assert!(wait_for(&mut events, WAIT, |e| {
        *e == DeviceEvent::StateChanged(DeviceState::Connected)
    })
    .await
    .is_some());
    assert_eq!(
        wait_for(&mut events, WAIT, |e| matches!(e, DeviceEvent::Message(_))).await,
        Some(DeviceEvent::Message(Bytes::from_static(b"hello")))
    );
    assert_eq!(
        wait_for(&mut events, WAIT, |e| matches!(e, DeviceEvent::Log(_))).await,
        Some(DeviceEvent::Log("booted".to_string()))
    );

    host.send_message(&b"go"[..]).unwrap();
    assert_eq!(endpoint.await.unwrap(), b"go".to_vec());
}

#[tokio::test]
async fn test_silence_resets_to_connecting() {
    let board = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = board.local_addr().unwrap().port();
    let (host, mut events) = DeviceChannel::open(host_options(3, port));
    let host_addr = host.local_addr().unwrap();

    let heartbeat = DeviceHeader::new(3, DeviceMessageKind::Heartbeat, 0).to_bytes();
    board.send_to(&heartbeat, host_addr).unwrap();

    assert!(wait_for(&mut events, WAIT, |e| {
        *e == DeviceEvent::StateChanged(DeviceState::Connected)
    })
    .await
    .is_some());
    assert!(wait_for(&mut events, Duration::from_secs(2), |e| {
        *e == DeviceEvent::StateChanged(DeviceState::Connecting)
    })
    .await
    .is_some());
    assert_eq!(host.state(), DeviceState::Connecting);
    // The rebind keeps the same address
    assert_eq!(host.local_addr(), Some(host_addr));
}

#[tokio::test]
async fn test_wrong_port_and_id_ignored() {
    let board = UdpSocket::bind("127.0.0.1:0").unwrap();
    let intruder = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = board.local_addr().unwrap().port();
    let (host, mut events) = DeviceChannel::open(host_options(3, port));
    let host_addr = host.local_addr().unwrap();

    let right_id = DeviceHeader::new(3, DeviceMessageKind::Heartbeat, 0).to_bytes();
    let wrong_id = DeviceHeader::new(4, DeviceMessageKind::Heartbeat, 0).to_bytes();
    intruder.send_to(&right_id, host_addr).unwrap();
    board.send_to(&wrong_id, host_addr).unwrap();

    assert!(drain(&mut events, Duration::from_millis(200)).await.is_empty());
    assert_eq!(host.state(), DeviceState::Connecting);
    assert!(host.send_message(&b"nobody"[..]).is_err());
}

#[tokio::test]
async fn test_broadcast_answered_with_token() {
    let board = UdpSocket::bind("127.0.0.1:0").unwrap();
    board
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let port = board.local_addr().unwrap().port();
    let (host, _events) = DeviceChannel::open(host_options(9, port));
    let host_addr = host.local_addr().unwrap();

    let header = DeviceHeader::new(9, DeviceMessageKind::Broadcast, 0).to_bytes();
    let mut datagram = header.to_vec();
    datagram.extend_from_slice(b"DeviceChannel\0");
    board.send_to(&datagram, host_addr).unwrap();

    let reply = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 64];
        let (len, from) = board.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), from)
    })
    .await
    .unwrap();
    assert_eq!(reply.0, b"DeviceChannel\0".to_vec());
    assert_eq!(reply.1, host_addr);
}
