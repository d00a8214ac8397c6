//! The task behind an open channel

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::latency::LatencyQueue;
use super::stats::StatsWindow;
use super::{ChannelEvent, ChannelOptions, ChannelState, Command, Role, Status, Transport};
use crate::error::ChannelError;
use crate::network::socket::{self, FramedSocket};
use crate::protocol::channel::{Packet, PacketKind};
use crate::protocol::sequence::SequenceFilter;

/// Sockets created when the channel is opened
pub(super) enum Link {
    TcpServer(TcpListener),
    TcpClient,
    Udp(FramedSocket),
}

impl Link {
    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Link::TcpServer(listener) => listener.local_addr().ok(),
            Link::TcpClient => None,
            Link::Udp(socket) => socket.local_addr().ok(),
        }
    }
}

/// Create the sockets a channel needs before it can start connecting
pub(super) fn bind(options: &ChannelOptions) -> Result<Link, ChannelError> {
    let bind_failed = |addr: SocketAddr, e: io::Error| ChannelError::BindFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    };

    match (options.transport, options.role) {
        (Transport::Tcp, Role::Server) => socket::create_tcp_listener(options.address)
            .map(Link::TcpServer)
            .map_err(|e| bind_failed(options.address, e)),
        (Transport::Tcp, Role::Client) => Ok(Link::TcpClient),
        (Transport::Udp, Role::Server) => socket::create_udp_socket(options.address, false, false)
            .map(|udp| Link::Udp(FramedSocket::udp(udp, None)))
            .map_err(|e| bind_failed(options.address, e)),
        (Transport::Udp, Role::Client) => {
            let local = socket::unspecified_for(&options.address);
            socket::create_udp_socket(local, false, false)
                .map(|udp| Link::Udp(FramedSocket::udp(udp, Some(options.address))))
                .map_err(|e| bind_failed(local, e))
        }
    }
}

pub(super) struct ChannelTask {
    options: ChannelOptions,
    events: mpsc::UnboundedSender<ChannelEvent>,
    status: Arc<RwLock<Status>>,
    commands: mpsc::UnboundedReceiver<Command>,

    listener: Option<TcpListener>,
    conn: Option<FramedSocket>,

    state: ChannelState,
    send_seq: u32,
    recv_filter: SequenceFilter,
    started: Instant,
    last_rx: Instant,
    stats: StatsWindow,
    delayed: LatencyQueue,
    scratch: BytesMut,
}

impl ChannelTask {
    pub(super) fn new(
        options: ChannelOptions,
        link: Link,
        events: mpsc::UnboundedSender<ChannelEvent>,
        status: Arc<RwLock<Status>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (listener, conn) = match link {
            Link::TcpServer(listener) => (Some(listener), None),
            Link::TcpClient => (None, None),
            Link::Udp(socket) => (None, Some(socket)),
        };
        let now = Instant::now();
        let delayed = LatencyQueue::new(options.simulated_delay);

        Self {
            options,
            events,
            status,
            commands,
            listener,
            conn,
            state: ChannelState::Connecting,
            send_seq: 0,
            recv_filter: SequenceFilter::strict(),
            started: now,
            last_rx: now,
            stats: StatsWindow::new(now.into_std()),
            delayed,
            scratch: BytesMut::with_capacity(2048),
        }
    }

    pub(super) async fn run(mut self) {
        let timing = self.options.timing;
        let now = Instant::now();

        let mut heartbeat = time::interval_at(now + timing.heartbeat_interval, timing.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = time::interval(timing.reconnect_delay);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = time::interval_at(now + timing.stats_interval, timing.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Channel({}): {:?} {:?} on {}",
            self.options.name, self.options.transport, self.options.role, self.options.address
        );

        loop {
            let idle_deadline = self.last_rx + timing.idle_timeout;
            let watchdog_armed = self.watchdog_armed();
            let release_at = self.delayed.next_release().map(Instant::from_std);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                accepted = accept(&self.listener), if self.listener.is_some() && self.conn.is_none() => {
                    self.on_accept(accepted);
                }
                received = recv(&mut self.conn), if self.conn.is_some() => match received {
                    Ok((data, from)) => self.on_datagram(data, from).await,
                    Err(e) => self.on_recv_error(e),
                },
                _ = heartbeat.tick() => self.on_heartbeat().await,
                _ = retry.tick(), if self.state == ChannelState::Connecting => self.on_retry().await,
                _ = stats.tick() => self.on_stats(),
                _ = time::sleep_until(idle_deadline), if watchdog_armed => {
                    self.reset_link("no traffic within idle timeout");
                }
                _ = time::sleep_until(release_at.unwrap_or(idle_deadline)), if release_at.is_some() => {
                    self.release_delayed().await;
                }
            }
        }

        debug!("Channel({}): task finished", self.options.name);
    }

    fn is_tcp(&self) -> bool {
        self.options.transport == Transport::Tcp
    }

    /// The watchdog runs while connected, and while a TCP handshake is pending
    fn watchdog_armed(&self) -> bool {
        self.state == ChannelState::Connected || (self.is_tcp() && self.conn.is_some())
    }

    fn stamp_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state == state {
            return;
        }
        info!("Channel({}): {:?} -> {:?}", self.options.name, self.state, state);
        self.state = state;
        {
            let mut status = self.status.write();
            status.state = state;
            status.peer_addr = match state {
                ChannelState::Connected => self.conn.as_ref().and_then(FramedSocket::peer),
                _ => None,
            };
        }
        let _ = self.events.send(ChannelEvent::StateChanged(state));
    }

    /// Drop the current link and go back to connecting
    fn reset_link(&mut self, reason: &str) {
        if self.state == ChannelState::Connected {
            warn!("Channel({}): {}", self.options.name, reason);
        } else {
            debug!("Channel({}): {}", self.options.name, reason);
        }

        match (self.options.transport, self.options.role) {
            (Transport::Tcp, _) => self.conn = None,
            (Transport::Udp, Role::Server) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.set_peer(None);
                }
            }
            (Transport::Udp, Role::Client) => {}
        }
        self.send_seq = 0;
        self.recv_filter.reset();
        self.delayed.clear();
        self.last_rx = Instant::now();
        self.set_state(ChannelState::Connecting);
    }

    async fn send_packet(&mut self, packet: Packet) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        self.scratch.clear();
        packet.encode(&mut self.scratch);

        match conn.send(&self.scratch).await {
            Ok(()) => {
                self.stats
                    .record_sent(self.scratch.len(), packet.kind == PacketKind::Message);
                true
            }
            Err(e) if self.is_tcp() || socket::is_disconnect(&e) => {
                self.reset_link(&format!("send failed: {}", e));
                false
            }
            Err(e) => {
                warn!("Channel({}): send failed: {}", self.options.name, e);
                false
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => {
                if self.state != ChannelState::Connected {
                    trace!("Channel({}): not connected, message dropped", self.options.name);
                    return;
                }
                if self.delayed.is_enabled() {
                    self.delayed.push(message, Instant::now().into_std());
                } else {
                    let seq = self.next_seq();
                    self.send_packet(Packet::new(PacketKind::Message, seq, message))
                        .await;
                }
            }
            Command::SetDelay(delay) => {
                info!(
                    "Channel({}): simulated delay set to {} ms",
                    self.options.name,
                    delay.as_millis()
                );
                self.delayed.set_delay(delay);
            }
        }
    }

    async fn release_delayed(&mut self) {
        let now = Instant::now().into_std();
        while let Some(message) = self.delayed.pop_due(now) {
            if self.state != ChannelState::Connected {
                self.delayed.clear();
                return;
            }
            let seq = self.next_seq();
            if !self
                .send_packet(Packet::new(PacketKind::Message, seq, message))
                .await
            {
                return;
            }
        }
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted.and_then(|(stream, addr)| FramedSocket::tcp(stream).map(|s| (s, addr))) {
            Ok((conn, addr)) => {
                debug!("Channel({}): accepted {}", self.options.name, addr);
                self.conn = Some(conn);
                self.last_rx = Instant::now();
            }
            Err(e) => warn!("Channel({}): accept failed: {}", self.options.name, e),
        }
    }

    fn on_recv_error(&mut self, e: io::Error) {
        if self.is_tcp() {
            self.reset_link(&format!("connection lost: {}", e));
        } else if socket::is_disconnect(&e) {
            // ICMP port unreachable from a UDP peer that went away
            trace!("Channel({}): {}", self.options.name, e);
        } else {
            warn!("Channel({}): receive failed: {}", self.options.name, e);
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.state == ChannelState::Connected {
            let seq = self.next_seq();
            let stamp = self.stamp_ms();
            self.send_packet(Packet::heartbeat(seq, stamp)).await;
        }
    }

    async fn on_retry(&mut self) {
        match (self.options.transport, self.options.role) {
            (Transport::Tcp, Role::Client) if self.conn.is_none() => self.try_connect().await,
            (Transport::Udp, Role::Client) => {
                let seq = self.next_seq();
                let packet = Packet::handshake(seq, &self.options.name);
                self.send_packet(packet).await;
            }
            _ => {}
        }
    }

    async fn try_connect(&mut self) {
        let addr = self.options.address;
        let attempt = time::timeout(self.options.timing.idle_timeout, TcpStream::connect(addr));
        let stream = match attempt.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Channel({}): connect to {} failed: {}", self.options.name, addr, e);
                return;
            }
            Err(_) => {
                debug!("Channel({}): connect to {} timed out", self.options.name, addr);
                return;
            }
        };

        match FramedSocket::tcp(stream) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.last_rx = Instant::now();
                let seq = self.next_seq();
                let packet = Packet::handshake(seq, &self.options.name);
                self.send_packet(packet).await;
            }
            Err(e) => warn!("Channel({}): stream setup failed: {}", self.options.name, e),
        }
    }

    fn on_stats(&mut self) {
        let snapshot = self.stats.roll(Instant::now().into_std());
        if self.state == ChannelState::Connected {
            let _ = self.events.send(ChannelEvent::Statistics(snapshot));
        }
    }

    /// Whether `from` may talk to this UDP channel right now
    fn udp_source_allowed(&self, from: SocketAddr, kind: PacketKind) -> bool {
        let peer = self.conn.as_ref().and_then(FramedSocket::peer);
        match (self.state, self.options.role) {
            (ChannelState::Connected, _) => peer == Some(from),
            (_, Role::Client) => from == self.options.address,
            (_, Role::Server) => kind == PacketKind::Handshake,
        }
    }

    async fn on_datagram(&mut self, data: Bytes, from: SocketAddr) {
        let len = data.len();
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Channel({}): bad packet from {}: {}", self.options.name, from, e);
                return;
            }
        };

        if !self.is_tcp() && !self.udp_source_allowed(from, packet.kind) {
            trace!("Channel({}): ignoring {:?} from {}", self.options.name, packet.kind, from);
            return;
        }

        match packet.kind {
            PacketKind::Handshake => {
                self.mark_received(len, false);
                self.on_handshake(packet, from).await
            }
            PacketKind::HandshakeAck => {
                self.mark_received(len, false);
                self.on_handshake_ack(packet)
            }
            kind => {
                if self.state != ChannelState::Connected {
                    return;
                }
                // Stale or duplicate packets must not feed the watchdog
                if !self.is_tcp()
                    && !self
                        .recv_filter
                        .accept(packet.sequence, Instant::now().into_std())
                {
                    trace!(
                        "Channel({}): stale sequence {} dropped",
                        self.options.name,
                        packet.sequence
                    );
                    return;
                }
                self.mark_received(len, kind == PacketKind::Message);
                match kind {
                    PacketKind::Message => {
                        let _ = self.events.send(ChannelEvent::MessageReceived(packet.body));
                    }
                    PacketKind::Heartbeat => match packet.stamp() {
                        Ok(stamp) => {
                            let seq = self.next_seq();
                            self.send_packet(Packet::heartbeat_ack(seq, stamp)).await;
                        }
                        Err(e) => warn!("Channel({}): bad heartbeat: {}", self.options.name, e),
                    },
                    PacketKind::HeartbeatAck => match packet.stamp() {
                        Ok(stamp) => {
                            let rtt = self.stamp_ms().wrapping_sub(stamp);
                            self.stats.record_rtt(Duration::from_millis(rtt as u64));
                        }
                        Err(e) => warn!("Channel({}): bad heartbeat ack: {}", self.options.name, e),
                    },
                    PacketKind::Handshake | PacketKind::HandshakeAck => {}
                }
            }
        }
    }

    fn mark_received(&mut self, len: usize, message: bool) {
        self.last_rx = Instant::now();
        self.stats.record_received(len, message);
    }

    async fn on_handshake(&mut self, packet: Packet, from: SocketAddr) {
        if self.options.role != Role::Server {
            warn!("Channel({}): unexpected handshake from {}", self.options.name, from);
            return;
        }
        if !packet.names(&self.options.name) {
            warn!(
                "Channel({}): handshake from {} names another channel ({:?})",
                self.options.name,
                from,
                String::from_utf8_lossy(&packet.body)
            );
            if self.is_tcp() {
                self.conn = None;
            }
            return;
        }

        if self.state != ChannelState::Connected {
            if let Some(conn) = self.conn.as_mut() {
                conn.set_peer(Some(from));
            }
            self.send_seq = 0;
        }

        // Acknowledged again if the client missed the first ack
        let seq = self.next_seq();
        let ack = Packet::handshake_ack(seq, &self.options.name);
        if self.send_packet(ack).await && self.state != ChannelState::Connected {
            self.recv_filter.reset();
            self.set_state(ChannelState::Connected);
        }
    }

    fn on_handshake_ack(&mut self, packet: Packet) {
        if self.options.role != Role::Client || self.state != ChannelState::Connecting {
            return;
        }
        if !packet.names(&self.options.name) {
            warn!(
                "Channel({}): server answered for another channel ({:?})",
                self.options.name,
                String::from_utf8_lossy(&packet.body)
            );
            if self.is_tcp() {
                self.conn = None;
            }
            return;
        }
        self.recv_filter.reset();
        self.set_state(ChannelState::Connected);
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv(conn: &mut Option<FramedSocket>) -> io::Result<(Bytes, SocketAddr)> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}
