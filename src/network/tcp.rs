use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::MeshError;
use crate::{Connection, Listener, Network, RecvStatus};

const RECV_CHUNK_SIZE: usize = 4096;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// [`Network`] over real sockets: nonblocking TCP streams for traffic and a UDP socket for
/// punch-through probes. Listeners bind `0.0.0.0:<port>`.
///
/// `connect` is the one call that can block, for at most the connect timeout.
#[derive(Debug)]
pub struct TcpNetwork {
    connect_timeout: Duration,
    punch_socket: Option<UdpSocket>,
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpNetwork {
    /// Creates a network with the default two second connect timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            punch_socket: None,
        }
    }

    /// Sets how long `connect` may block.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn punch_socket(&mut self) -> Result<&UdpSocket, MeshError> {
        if self.punch_socket.is_none() {
            let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
            socket.set_nonblocking(true)?;
            self.punch_socket = Some(socket);
        }
        self.punch_socket
            .as_ref()
            .ok_or_else(|| MeshError::TransportError {
                context: "punch socket unavailable".to_owned(),
            })
    }
}

fn configure(stream: &TcpStream) -> Result<(), MeshError> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(())
}

impl Network for TcpNetwork {
    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, MeshError> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "tcp listener bound");
        Ok(Box::new(TcpListenerHandle {
            listener,
            local_addr,
        }))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn Connection>, MeshError> {
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            MeshError::TransportError {
                context: format!("connect to {addr} failed: {e}"),
            }
        })?;
        configure(&stream)?;
        trace!(%addr, "tcp connection opened");
        Ok(Box::new(TcpConnection::new(stream, addr)))
    }

    fn punch(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), MeshError> {
        let socket = self.punch_socket()?;
        match socket.send_to(payload, addr) {
            Ok(_) => Ok(()),
            // Best effort: a full send buffer just means this probe is skipped.
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug)]
struct TcpListenerHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener for TcpListenerHandle {
    fn accept(&mut self) -> Result<Option<(Box<dyn Connection>, SocketAddr)>, MeshError> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    configure(&stream)?;
                    trace!(%addr, "tcp connection accepted");
                    return Ok(Some((Box::new(TcpConnection::new(stream, addr)), addr)));
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A nonblocking stream. Bytes the kernel will not take yet stay in `pending` and are flushed on
/// the next `send` or `recv`.
#[derive(Debug)]
struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    pending: Vec<u8>,
    closed: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            pending: Vec::new(),
            closed: false,
        }
    }

    fn flush_pending(&mut self) -> Result<(), MeshError> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(MeshError::TransportError {
                        context: format!("stream to {} accepts no more data", self.peer_addr),
                    });
                },
                Ok(written) => {
                    self.pending.drain(..written);
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::TransportError {
                context: format!("stream to {} is closed", self.peer_addr),
            });
        }
        self.pending.extend_from_slice(bytes);
        self.flush_pending()
    }

    fn recv(&mut self, buf: &mut Vec<u8>) -> Result<RecvStatus, MeshError> {
        if self.closed {
            return Ok(RecvStatus::Closed);
        }
        self.flush_pending()?;
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(RecvStatus::Closed),
                Ok(read) => {
                    if let Some(data) = chunk.get(..read) {
                        buf.extend_from_slice(data);
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(RecvStatus::Open),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Best effort: the remote may already be gone.
        let _ = self.flush_pending();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Instant;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn accept_within(listener: &mut Box<dyn Listener>) -> Box<dyn Connection> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some((conn, _)) = listener.accept().unwrap() {
                return conn;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no connection accepted");
    }

    fn recv_until(conn: &mut Box<dyn Connection>, len: usize) -> (Vec<u8>, RecvStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = Vec::new();
        let mut status = RecvStatus::Open;
        while buf.len() < len && Instant::now() < deadline {
            status = conn.recv(&mut buf).unwrap();
            if status == RecvStatus::Closed {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        (buf, status)
    }

    #[test]
    #[serial]
    fn loopback_roundtrip() {
        let mut net = TcpNetwork::new();
        let mut listener = net.listen(0).unwrap();
        let port = listener.local_addr().port();
        let mut client = net.connect(loopback(port)).unwrap();
        let mut server = accept_within(&mut listener);

        client.send(b"ping").unwrap();
        let (got, _) = recv_until(&mut server, 4);
        assert_eq!(got, b"ping");

        server.send(b"pong").unwrap();
        let (got, _) = recv_until(&mut client, 4);
        assert_eq!(got, b"pong");
    }

    #[test]
    #[serial]
    fn close_is_observed_by_the_other_side() {
        let mut net = TcpNetwork::new();
        let mut listener = net.listen(0).unwrap();
        let port = listener.local_addr().port();
        let mut client = net.connect(loopback(port)).unwrap();
        let mut server = accept_within(&mut listener);

        client.send(b"bye").unwrap();
        client.close();
        client.close();
        assert!(client.send(b"more").is_err());

        let (got, status) = recv_until(&mut server, usize::MAX);
        assert_eq!(got, b"bye");
        assert_eq!(status, RecvStatus::Closed);
    }

    #[test]
    #[serial]
    fn accept_without_pending_connection_returns_none() {
        let mut net = TcpNetwork::new();
        let mut listener = net.listen(0).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn punch_to_loopback_succeeds() {
        let mut net = TcpNetwork::new();
        net.punch(loopback(9), b"PUNC").unwrap();
    }
}
