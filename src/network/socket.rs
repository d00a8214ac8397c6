//! Framed datagram socket
//!
//! Sends and receives whole byte buffers over either transport. UDP keeps
//! datagram boundaries as-is; TCP frames each buffer with a `u32` big-endian
//! length prefix. Receiving is cancel-safe so it can sit in a `select!` arm.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Largest TCP frame accepted from a peer
pub const MAX_TCP_FRAME: usize = 16 * 1024 * 1024;

/// Receive buffer for one UDP datagram
const UDP_RECV_BUFFER: usize = 65_536;

const LENGTH_PREFIX: usize = 4;

/// Create a non-blocking UDP socket bound to `bind`
///
/// `reuse` lets several processes on one host share a well-known port, which
/// broadcast listeners need.
pub fn create_udp_socket(bind: SocketAddr, broadcast: bool, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
    }
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SockAddr::from(bind))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Create a non-blocking TCP listener bound to `bind`
pub fn create_tcp_listener(bind: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(bind), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(bind))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Wildcard address of the same family as `addr`, port 0
pub fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

enum Inner {
    Udp {
        socket: UdpSocket,
        peer: Option<SocketAddr>,
        scratch: Box<[u8]>,
    },
    Tcp {
        stream: TcpStream,
        peer: SocketAddr,
        read_buf: BytesMut,
        write_buf: BytesMut,
    },
}

/// One socket carrying whole buffers
pub struct FramedSocket {
    inner: Inner,
}

impl FramedSocket {
    /// Wrap a bound UDP socket; sends go to `peer` once it is known
    pub fn udp(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            inner: Inner::Udp {
                socket,
                peer,
                scratch: vec![0u8; UDP_RECV_BUFFER].into_boxed_slice(),
            },
        }
    }

    /// Wrap a connected TCP stream
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            inner: Inner::Tcp {
                stream,
                peer,
                read_buf: BytesMut::with_capacity(8 * 1024),
                write_buf: BytesMut::with_capacity(8 * 1024),
            },
        })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.inner, Inner::Tcp { .. })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Udp { peer, .. } => *peer,
            Inner::Tcp { peer, .. } => Some(*peer),
        }
    }

    /// Point a UDP socket at a new peer (no-op for TCP)
    pub fn set_peer(&mut self, new_peer: Option<SocketAddr>) {
        if let Inner::Udp { peer, .. } = &mut self.inner {
            *peer = new_peer;
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Inner::Udp { socket, .. } => socket.local_addr(),
            Inner::Tcp { stream, .. } => stream.local_addr(),
        }
    }

    /// Send one buffer to the peer
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            Inner::Udp { socket, peer, .. } => {
                let target = peer.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "no UDP peer learned yet")
                })?;
                socket.send_to(frame, target).await?;
                Ok(())
            }
            Inner::Tcp {
                stream, write_buf, ..
            } => {
                if frame.len() > MAX_TCP_FRAME {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("frame of {} bytes exceeds limit", frame.len()),
                    ));
                }
                write_buf.clear();
                write_buf.reserve(LENGTH_PREFIX + frame.len());
                write_buf.put_u32(frame.len() as u32);
                write_buf.put_slice(frame);
                stream.write_all(&write_buf[..]).await
            }
        }
    }

    /// Send one datagram to an explicit address (UDP only)
    pub async fn send_to(&mut self, frame: &[u8], target: SocketAddr) -> io::Result<()> {
        match &mut self.inner {
            Inner::Udp { socket, .. } => socket.send_to(frame, target).await.map(|_| ()),
            Inner::Tcp { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "send_to on a TCP stream",
            )),
        }
    }

    /// Receive the next whole buffer and the address it came from
    ///
    /// A TCP peer closing the stream yields `UnexpectedEof`.
    pub async fn recv(&mut self) -> io::Result<(Bytes, SocketAddr)> {
        match &mut self.inner {
            Inner::Udp {
                socket, scratch, ..
            } => {
                let (len, from) = socket.recv_from(&mut scratch[..]).await?;
                Ok((Bytes::copy_from_slice(&scratch[..len]), from))
            }
            Inner::Tcp {
                stream,
                peer,
                read_buf,
                ..
            } => loop {
                if let Some(frame) = take_frame(read_buf)? {
                    return Ok((frame, *peer));
                }
                if stream.read_buf(read_buf).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    ));
                }
            },
        }
    }
}

/// Split one complete frame off the front of `buf`
fn take_frame(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_TCP_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced a {} byte frame", len),
        ));
    }
    if buf.len() < LENGTH_PREFIX + len {
        buf.reserve(LENGTH_PREFIX + len - buf.len());
        return Ok(None);
    }
    buf.advance(LENGTH_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Whether an I/O error means the peer went away rather than the socket broke
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}
