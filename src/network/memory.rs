use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::MeshError;
use crate::{Connection, Listener, Network, RecvStatus};

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// One direction of a stream.
#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Debug)]
struct Hub {
    /// Pending, not yet accepted connections per listening port.
    listeners: BTreeMap<u16, VecDeque<(MemoryConnection, SocketAddr)>>,
    next_ephemeral: u16,
    punches: Vec<(SocketAddr, Vec<u8>)>,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            listeners: BTreeMap::new(),
            next_ephemeral: FIRST_EPHEMERAL_PORT,
            punches: Vec::new(),
        }
    }
}

impl Hub {
    fn ephemeral_port(&mut self) -> Result<u16, MeshError> {
        for _ in 0..=u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.listeners.contains_key(&port) {
                return Ok(port);
            }
        }
        Err(MeshError::TransportError {
            context: "no free in-memory port".to_owned(),
        })
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// An in-process [`Network`]: every clone shares one hub, so sessions built on clones of the same
/// `MemoryNetwork` can reach each other on `127.0.0.1:<port>` without touching the OS.
///
/// Delivery is immediate and ordered. Punch-through datagrams are recorded rather than delivered,
/// which makes them observable in tests.
///
/// ```
/// use lockstep_mesh::{MemoryNetwork, Network};
///
/// let mut net = MemoryNetwork::new();
/// let mut listener = net.listen(7000).unwrap();
/// let _client = net.connect(listener.local_addr()).unwrap();
/// assert!(listener.accept().unwrap().is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Punch datagrams sent to `addr` so far, oldest first.
    #[must_use]
    pub fn punches_to(&self, addr: SocketAddr) -> Vec<Vec<u8>> {
        self.hub
            .lock()
            .punches
            .iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Whether something listens on `port`.
    #[must_use]
    pub fn is_listening(&self, port: u16) -> bool {
        self.hub.lock().listeners.contains_key(&port)
    }
}

impl Network for MemoryNetwork {
    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, MeshError> {
        let mut hub = self.hub.lock();
        let port = if port == 0 {
            hub.ephemeral_port()?
        } else if hub.listeners.contains_key(&port) {
            return Err(MeshError::TransportError {
                context: format!("in-memory port {port} already in use"),
            });
        } else {
            port
        };
        hub.listeners.insert(port, VecDeque::new());
        trace!(port, "in-memory listener bound");
        Ok(Box::new(MemoryListener {
            hub: Arc::clone(&self.hub),
            port,
        }))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn Connection>, MeshError> {
        let mut hub = self.hub.lock();
        if !hub.listeners.contains_key(&addr.port()) {
            return Err(MeshError::TransportError {
                context: format!("connection to {addr} refused"),
            });
        }
        let local = loopback(hub.ephemeral_port()?);
        let to_server = Arc::new(Mutex::new(Pipe::default()));
        let to_client = Arc::new(Mutex::new(Pipe::default()));
        let client = MemoryConnection {
            outgoing: Arc::clone(&to_server),
            incoming: Arc::clone(&to_client),
            peer_addr: loopback(addr.port()),
            closed: false,
        };
        let server = MemoryConnection {
            outgoing: to_client,
            incoming: to_server,
            peer_addr: local,
            closed: false,
        };
        if let Some(backlog) = hub.listeners.get_mut(&addr.port()) {
            backlog.push_back((server, local));
        }
        trace!(%addr, %local, "in-memory connection opened");
        Ok(Box::new(client))
    }

    fn punch(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), MeshError> {
        self.hub.lock().punches.push((addr, payload.to_vec()));
        Ok(())
    }
}

/// Listening end on one in-memory port. Dropping it frees the port and refuses pending
/// connections.
struct MemoryListener {
    hub: Arc<Mutex<Hub>>,
    port: u16,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> Result<Option<(Box<dyn Connection>, SocketAddr)>, MeshError> {
        let mut hub = self.hub.lock();
        let next = hub
            .listeners
            .get_mut(&self.port)
            .and_then(VecDeque::pop_front);
        Ok(next.map(|(conn, addr)| (Box::new(conn) as Box<dyn Connection>, addr)))
    }

    fn local_addr(&self) -> SocketAddr {
        loopback(self.port)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let pending = self.hub.lock().listeners.remove(&self.port);
        // Pending connections drop here, which closes them, outside the hub lock.
        drop(pending);
    }
}

/// One end of an in-memory stream.
#[derive(Debug)]
struct MemoryConnection {
    outgoing: Arc<Mutex<Pipe>>,
    incoming: Arc<Mutex<Pipe>>,
    peer_addr: SocketAddr,
    closed: bool,
}

impl Connection for MemoryConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), MeshError> {
        let mut pipe = self.outgoing.lock();
        if self.closed || pipe.reader_closed {
            return Err(MeshError::TransportError {
                context: format!("in-memory stream to {} is closed", self.peer_addr),
            });
        }
        pipe.data.extend(bytes);
        Ok(())
    }

    fn recv(&mut self, buf: &mut Vec<u8>) -> Result<RecvStatus, MeshError> {
        if self.closed {
            return Ok(RecvStatus::Closed);
        }
        let mut pipe = self.incoming.lock();
        if pipe.data.is_empty() {
            return Ok(if pipe.writer_closed {
                RecvStatus::Closed
            } else {
                RecvStatus::Open
            });
        }
        buf.extend(pipe.data.drain(..));
        Ok(RecvStatus::Open)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outgoing.lock().writer_closed = true;
        let mut incoming = self.incoming.lock();
        incoming.reader_closed = true;
        incoming.data.clear();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
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

    fn pair(net: &mut MemoryNetwork, port: u16) -> (Box<dyn Listener>, Box<dyn Connection>, Box<dyn Connection>) {
        let mut listener = net.listen(port).unwrap();
        let client = net.connect(loopback(port)).unwrap();
        let (server, _) = listener.accept().unwrap().unwrap();
        (listener, client, server)
    }

    #[test]
    fn bytes_flow_both_ways_in_order() {
        let mut net = MemoryNetwork::new();
        let (_listener, mut client, mut server) = pair(&mut net, 5000);
        client.send(b"ab").unwrap();
        client.send(b"c").unwrap();
        server.send(b"xyz").unwrap();

        let mut buf = Vec::new();
        assert_eq!(server.recv(&mut buf).unwrap(), RecvStatus::Open);
        assert_eq!(buf, b"abc");
        buf.clear();
        client.recv(&mut buf).unwrap();
        assert_eq!(buf, b"xyz");
    }

    #[test]
    fn close_is_seen_after_pending_data() {
        let mut net = MemoryNetwork::new();
        let (_listener, mut client, mut server) = pair(&mut net, 5001);
        client.send(b"last words").unwrap();
        client.close();
        client.close();

        let mut buf = Vec::new();
        assert_eq!(server.recv(&mut buf).unwrap(), RecvStatus::Open);
        assert_eq!(buf, b"last words");
        assert_eq!(server.recv(&mut buf).unwrap(), RecvStatus::Closed);
        assert!(server.send(b"reply").is_err());
    }

    #[test]
    fn dropping_a_connection_closes_it() {
        let mut net = MemoryNetwork::new();
        let (_listener, client, mut server) = pair(&mut net, 5002);
        drop(client);
        let mut buf = Vec::new();
        assert_eq!(server.recv(&mut buf).unwrap(), RecvStatus::Closed);
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let mut net = MemoryNetwork::new();
        assert!(matches!(
            net.connect(loopback(6000)),
            Err(MeshError::TransportError { .. })
        ));
    }

    #[test]
    fn ports_are_exclusive_and_freed_on_drop() {
        let mut net = MemoryNetwork::new();
        let listener = net.listen(5003).unwrap();
        assert!(net.listen(5003).is_err());
        assert!(net.is_listening(5003));
        drop(listener);
        assert!(!net.is_listening(5003));
        assert!(net.listen(5003).is_ok());
    }

    #[test]
    fn port_zero_picks_distinct_ephemeral_ports() {
        let mut net = MemoryNetwork::new();
        let a = net.listen(0).unwrap();
        let b = net.listen(0).unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
        assert!(a.local_addr().port() >= FIRST_EPHEMERAL_PORT);
    }

    #[test]
    fn accepted_side_reports_client_address() {
        let mut net = MemoryNetwork::new();
        let mut listener = net.listen(5004).unwrap();
        let client = net.connect(loopback(5004)).unwrap();
        let (server, addr) = listener.accept().unwrap().unwrap();
        assert_eq!(server.peer_addr(), addr);
        assert_eq!(client.peer_addr(), loopback(5004));
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn punches_are_recorded() {
        let mut net = MemoryNetwork::new();
        net.punch(loopback(7), b"PUNC").unwrap();
        net.punch(loopback(8), b"other").unwrap();
        assert_eq!(net.punches_to(loopback(7)), vec![b"PUNC".to_vec()]);
    }
}
