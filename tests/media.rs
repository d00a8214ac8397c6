#![cfg(unix)]

mod common;

use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

use common::{drain, fast_timing, wait_for};
use rover_link::channel::{Channel, ChannelEvent, ChannelOptions, ChannelState};
use rover_link::error::MediaError;
use rover_link::media::{
    ClientState, EncoderLauncher, MediaClientEvent, MediaClientTiming, MediaServerEvent,
    MediaServerTiming, MediaState, StreamFormat, VideoClient, VideoServer,
};

const WAIT: Duration = Duration::from_secs(5);

/// Runs a shell snippet instead of an encoder and remembers the arguments
#[derive(Clone)]
struct ScriptLauncher {
    script: &'static str,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    pids: Arc<Mutex<Vec<u32>>>,
}

impl ScriptLauncher {
    fn new(script: &'static str) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
            pids: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl EncoderLauncher for ScriptLauncher {
    fn launch(&mut self, args: &[String]) -> io::Result<Child> {
        self.calls.lock().push(args.to_vec());
        let child = Command::new("sh")
            .arg("-c")
            .arg(self.script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().push(pid);
        }
        Ok(child)
    }
}

fn server_timing() -> MediaServerTiming {
    MediaServerTiming {
        handshake_retry: Duration::from_millis(500),
        bind_retry: Duration::from_millis(50),
        channel: fast_timing(),
    }
}

fn client_timing() -> MediaClientTiming {
    MediaClientTiming {
        punch_interval: Duration::from_millis(50),
        bitrate_window: Duration::from_millis(200),
        channel: fast_timing(),
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Whether a process with this pid still exists
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_start_punch_stream() {
    let launcher = ScriptLauncher::new("sleep 30");
    let calls = launcher.calls.clone();
    let (server, mut server_events) =
        VideoServer::new("mono", loopback(), Box::new(launcher), server_timing()).unwrap();
    let (client, mut client_events) =
        VideoClient::new("mono", server.address(), localhost(), client_timing()).unwrap();

    assert!(wait_for(&mut client_events, WAIT, |e| {
        *e == MediaClientEvent::StateChanged(ClientState::Connected)
    })
    .await
    .is_some());

    let format = StreamFormat::mjpeg(640, 480, 30, 50);
    server.start("dev0", format.clone());

    assert_eq!(
        server_events.recv().await,
        Some(MediaServerEvent::StateChanged(MediaState::Waiting))
    );
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| matches!(e, MediaServerEvent::StateChanged(_))).await,
        Some(MediaServerEvent::StateChanged(MediaState::Streaming))
    );
    assert_eq!(
        wait_for(&mut client_events, WAIT, |e| matches!(e, MediaClientEvent::Streaming(_))).await,
        Some(MediaClientEvent::Streaming(format.clone()))
    );
    assert_eq!(client.state(), ClientState::Streaming);
    assert_eq!(client.format(), Some(format));

    let calls = calls.lock().clone();
    assert_eq!(calls.len(), 1);
    let args = &calls[0];
    assert_eq!(args.len(), 10);
    assert_eq!(args[0], "dev0");
    assert_eq!(&args[1..5], &["1", "640", "480", "30"]);
    assert_eq!(args[5], "50");
    assert_eq!(args[6], "127.0.0.1");
    assert_eq!(args[7], client.media_address().unwrap().port().to_string());
    assert_eq!(args[9], server.address().port().to_string());

    // Stopping a live stream ends it on both sides
    server.stop();
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| matches!(e, MediaServerEvent::StateChanged(_))).await,
        Some(MediaServerEvent::StateChanged(MediaState::Idle))
    );
    assert_eq!(
        wait_for(&mut client_events, WAIT, |e| *e == MediaClientEvent::Eos).await,
        Some(MediaClientEvent::Eos)
    );
}

#[tokio::test]
async fn test_stop_while_idle_is_silent() {
    let launcher = ScriptLauncher::new("sleep 30");
    let (server, mut server_events) =
        VideoServer::new("aux", loopback(), Box::new(launcher), server_timing()).unwrap();

    server.stop();
    assert!(drain(&mut server_events, Duration::from_millis(200)).await.is_empty());
    assert_eq!(server.state(), MediaState::Idle);
}

#[tokio::test]
async fn test_waits_for_client_before_announcing() {
    let launcher = ScriptLauncher::new("sleep 30");
    let calls = launcher.calls.clone();
    let (server, mut server_events) =
        VideoServer::new("stereo_left", loopback(), Box::new(launcher), server_timing()).unwrap();

    server.start("dev1", StreamFormat::mpeg2(1280, 720, 25, 4000));
    assert_eq!(
        server_events.recv().await,
        Some(MediaServerEvent::StateChanged(MediaState::Waiting))
    );

    // Nobody is connected; the server keeps waiting
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.state(), MediaState::Waiting);
    assert!(calls.lock().is_empty());

    // A late client still gets the stream
    let (_client, mut client_events) =
        VideoClient::new("stereo_left", server.address(), localhost(), client_timing()).unwrap();
    assert!(
        wait_for(&mut client_events, WAIT, |e| matches!(e, MediaClientEvent::Streaming(_)))
            .await
            .is_some()
    );
    assert_eq!(calls.lock()[0][5], "4000");
}

#[tokio::test]
async fn test_encoder_fault_reported() {
    let launcher = ScriptLauncher::new("exit 94");
    let (server, mut server_events) =
        VideoServer::new("mono", loopback(), Box::new(launcher), server_timing()).unwrap();
    let (_client, mut client_events) =
        VideoClient::new("mono", server.address(), localhost(), client_timing()).unwrap();
    assert!(wait_for(&mut client_events, WAIT, |e| {
        *e == MediaClientEvent::StateChanged(ClientState::Connected)
    })
    .await
    .is_some());

    server.start("dev0", StreamFormat::mjpeg(320, 240, 15, 80));
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| matches!(e, MediaServerEvent::Error(_))).await,
        Some(MediaServerEvent::Error(MediaError::CaptureHardware))
    );
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| matches!(e, MediaServerEvent::StateChanged(_))).await,
        Some(MediaServerEvent::StateChanged(MediaState::Idle))
    );
    assert!(
        wait_for(&mut client_events, WAIT, |e| matches!(e, MediaClientEvent::Error(MediaError::Remote(_))))
            .await
            .is_some()
    );
}

#[tokio::test]
async fn test_wrong_punch_ignored() {
    let launcher = ScriptLauncher::new("sleep 30");
    let calls = launcher.calls.clone();
    let (server, mut server_events) =
        VideoServer::new("mono", loopback(), Box::new(launcher), server_timing()).unwrap();
    let (_client, mut client_events) =
        VideoClient::new("mono", server.address(), localhost(), client_timing()).unwrap();
    assert!(wait_for(&mut client_events, WAIT, |e| {
        *e == MediaClientEvent::StateChanged(ClientState::Connected)
    })
    .await
    .is_some());

    server.start("dev0", StreamFormat::mjpeg(320, 240, 15, 80));
    assert_eq!(
        server_events.recv().await,
        Some(MediaServerEvent::StateChanged(MediaState::Waiting))
    );

    // A stranger punches with the wrong name; only the real client is accepted
    let stranger = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger.send_to(b"stereo_left", server.address()).await.unwrap();
    let streaming = wait_for(&mut server_events, WAIT, |e| {
        *e == MediaServerEvent::StateChanged(MediaState::Streaming)
    })
    .await;
    assert!(streaming.is_some());
    let calls = calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_ne!(
        calls[0][7],
        stranger.local_addr().unwrap().port().to_string()
    );
}

#[tokio::test]
async fn test_punch_rejected_while_control_down() {
    let launcher = ScriptLauncher::new("sleep 30");
    let calls = launcher.calls.clone();
    let (server, mut server_events) =
        VideoServer::new("mono", loopback(), Box::new(launcher), server_timing()).unwrap();

    // A bare control client that never punches
    let (mut control, mut control_events) = Channel::new(
        ChannelOptions::tcp_client("mono", server.address()).with_timing(fast_timing()),
    );
    control.open().unwrap();
    assert!(wait_for(&mut control_events, WAIT, |e| {
        *e == ChannelEvent::StateChanged(ChannelState::Connected)
    })
    .await
    .is_some());

    server.start("dev0", StreamFormat::mjpeg(320, 240, 15, 80));
    assert_eq!(
        server_events.recv().await,
        Some(MediaServerEvent::StateChanged(MediaState::Waiting))
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(control);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let late = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    late.send_to(b"mono", server.address()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.state(), MediaState::Waiting);
    assert!(calls.lock().is_empty());

    // The data port is bound again for the next client
    let (_client, mut client_events) =
        VideoClient::new("mono", server.address(), localhost(), client_timing()).unwrap();
    assert!(
        wait_for(&mut client_events, WAIT, |e| matches!(e, MediaClientEvent::Streaming(_)))
            .await
            .is_some()
    );
    assert_eq!(server.state(), MediaState::Streaming);
}

#[tokio::test]
async fn test_control_loss_while_streaming_stops_encoder() {
    let launcher = ScriptLauncher::new("sleep 30");
    let calls = launcher.calls.clone();
    let pids = launcher.pids.clone();
    let (server, mut server_events) =
        VideoServer::new("aux", loopback(), Box::new(launcher), server_timing()).unwrap();
    let (client, mut client_events) =
        VideoClient::new("aux", server.address(), localhost(), client_timing()).unwrap();
    assert!(wait_for(&mut client_events, WAIT, |e| {
        *e == MediaClientEvent::StateChanged(ClientState::Connected)
    })
    .await
    .is_some());

    server.start("dev2", StreamFormat::mjpeg(640, 480, 30, 70));
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| {
            *e == MediaServerEvent::StateChanged(MediaState::Streaming)
        })
        .await,
        Some(MediaServerEvent::StateChanged(MediaState::Streaming))
    );
    let pid = pids.lock()[0];
    assert!(process_alive(pid));

    drop(client);
    assert_eq!(
        wait_for(&mut server_events, WAIT, |e| matches!(e, MediaServerEvent::StateChanged(_))).await,
        Some(MediaServerEvent::StateChanged(MediaState::Idle))
    );
    assert_eq!(server.state(), MediaState::Idle);
    assert!(!process_alive(pid));
    assert_eq!(calls.lock().len(), 1);
}
