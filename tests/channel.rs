mod common;

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

use common::{drain, fast_timing, wait_for};
use rover_link::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions, ChannelState};
use rover_link::protocol::Packet;

const WAIT: Duration = Duration::from_secs(3);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn connected(events: &mut ChannelEvents) -> bool {
    wait_for(events, WAIT, |e| {
        *e == ChannelEvent::StateChanged(ChannelState::Connected)
    })
    .await
    .is_some()
}

async fn message(events: &mut ChannelEvents) -> Option<Bytes> {
    match wait_for(events, WAIT, |e| matches!(e, ChannelEvent::MessageReceived(_))).await {
        Some(ChannelEvent::MessageReceived(bytes)) => Some(bytes),
        _ => None,
    }
}

async fn pair(udp: bool, name: &str) -> (Channel, ChannelEvents, Channel, ChannelEvents) {
    let server_options = if udp {
        ChannelOptions::udp_server(name, loopback())
    } else {
        ChannelOptions::tcp_server(name, loopback())
    };
    let (mut server, server_events) = Channel::new(server_options.with_timing(fast_timing()));
    server.open().unwrap();
    let addr = server.local_addr().unwrap();

    let client_options = if udp {
        ChannelOptions::udp_client(name, addr)
    } else {
        ChannelOptions::tcp_client(name, addr)
    };
    let (mut client, client_events) = Channel::new(client_options.with_timing(fast_timing()));
    client.open().unwrap();
    (server, server_events, client, client_events)
}

#[tokio::test]
async fn test_tcp_exchange() {
    let (server, mut server_events, client, mut client_events) = pair(false, "shared").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);
    assert!(server.peer_addr().is_some());

    assert!(client.send_message(&b"ping"[..]));
    assert_eq!(message(&mut server_events).await.unwrap(), &b"ping"[..]);

    assert!(server.send_message(&b"pong"[..]));
    assert_eq!(message(&mut client_events).await.unwrap(), &b"pong"[..]);
}

#[tokio::test]
async fn test_udp_exchange_in_order() {
    let (_server, mut server_events, client, mut client_events) = pair(true, "drive").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);

    for i in 0u8..20 {
        assert!(client.send_message(vec![i]));
    }
    for i in 0u8..20 {
        assert_eq!(message(&mut server_events).await.unwrap(), vec![i]);
    }
}

#[tokio::test]
async fn test_idle_timeout_drops_to_connecting_once() {
    let (server, mut server_events, mut client, mut client_events) = pair(true, "drive").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);

    // Silence the client; the server's watchdog must fire
    client.close();
    let seen = drain(&mut server_events, Duration::from_millis(1000)).await;
    let drops = seen
        .iter()
        .filter(|e| **e == ChannelEvent::StateChanged(ChannelState::Connecting))
        .count();
    assert_eq!(drops, 1);
    assert_eq!(server.state(), ChannelState::Connecting);
}

#[tokio::test]
async fn test_tcp_reconnects_after_peer_loss() {
    let (server, mut server_events, client, mut client_events) = pair(false, "shared").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);

    let addr = server.local_addr().unwrap();
    drop(client);
    assert!(
        wait_for(&mut server_events, WAIT, |e| {
            *e == ChannelEvent::StateChanged(ChannelState::Connecting)
        })
        .await
        .is_some()
    );

    // The listener survives; a new client gets through
    let (mut again, mut again_events) =
        Channel::new(ChannelOptions::tcp_client("shared", addr).with_timing(fast_timing()));
    again.open().unwrap();
    assert!(connected(&mut again_events).await);
    assert!(connected(&mut server_events).await);
}

#[tokio::test]
async fn test_name_mismatch_never_connects() {
    let (mut server, mut server_events) =
        Channel::new(ChannelOptions::tcp_server("shared", loopback()).with_timing(fast_timing()));
    server.open().unwrap();
    let addr = server.local_addr().unwrap();

    let (mut client, mut client_events) =
        Channel::new(ChannelOptions::tcp_client("imposter", addr).with_timing(fast_timing()));
    client.open().unwrap();

    let seen = drain(&mut server_events, Duration::from_millis(500)).await;
    assert!(!seen.contains(&ChannelEvent::StateChanged(ChannelState::Connected)));
    assert_eq!(client.state(), ChannelState::Connecting);
    assert!(!drain(&mut client_events, Duration::from_millis(50))
        .await
        .contains(&ChannelEvent::StateChanged(ChannelState::Connected)));
}

#[tokio::test]
async fn test_statistics_report_rtt() {
    let (_server, mut server_events, client, mut client_events) = pair(false, "shared").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);
    assert!(client.send_message(&b"counted"[..]));

    let stats = wait_for(&mut client_events, WAIT, |e| match e {
        ChannelEvent::Statistics(stats) => stats.rtt_ms.is_some() && stats.messages_up >= 1,
        _ => false,
    })
    .await;
    assert!(stats.is_some());
}

#[tokio::test]
async fn test_simulated_delay_holds_messages() {
    let (_server, mut server_events, mut client, mut client_events) = pair(true, "drive").await;
    assert!(connected(&mut client_events).await);
    assert!(connected(&mut server_events).await);

    client.set_simulated_delay(Duration::from_millis(250));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let sent = tokio::time::Instant::now();
    assert!(client.send_message(&b"late"[..]));
    assert_eq!(message(&mut server_events).await.unwrap(), &b"late"[..]);
    assert!(sent.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_stale_udp_packets_do_not_keep_link_alive() {
    let (mut server, mut server_events) =
        Channel::new(ChannelOptions::udp_server("drive", loopback()).with_timing(fast_timing()));
    server.open().unwrap();
    let addr = server.local_addr().unwrap();

    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(&Packet::handshake(0, "drive").to_bytes(), addr)
        .await
        .unwrap();
    assert!(connected(&mut server_events).await);

    // One fresh heartbeat sets the baseline, then only replays of it
    let heartbeat = Packet::heartbeat(5, 0).to_bytes();
    peer.send_to(&heartbeat, addr).await.unwrap();
    let replay = async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = peer.send_to(&heartbeat, addr).await;
        }
    };
    let dropped = tokio::select! {
        event = wait_for(&mut server_events, Duration::from_millis(1500), |e| {
            *e == ChannelEvent::StateChanged(ChannelState::Connecting)
        }) => event,
        _ = replay => None,
    };
    assert!(dropped.is_some());
    assert_eq!(server.state(), ChannelState::Connecting);
}
