//! One remote participant: its transport, its identity, and where it is in the handshake.

pub mod state;

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::error::MeshError;
use crate::network::codec::{decode_frame, encode_frame, CodecResult, Decoded, PayloadWriter};
use crate::network::messages::{Message, MessageKind, Payload, PeerRecord};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Connection, PeerHandle, RecvStatus};

use self::state::PeerState;

/// Magic prefix of a punch-through datagram ("PUNC").
pub const PUNCH_MAGIC: [u8; 4] = *b"PUNC";

/// Builds the punch-through datagram announcing `sender`.
pub(crate) fn punch_datagram(sender: &str) -> CodecResult<Vec<u8>> {
    let mut writer = PayloadWriter::new();
    writer.write_rest(&PUNCH_MAGIC);
    writer.write_short_str(sender)?;
    Ok(writer.into_bytes())
}

/// A connection endpoint for one remote participant.
///
/// A peer may exist before its transport does: an outbound peer created from a roster starts in
/// [`PeerState::AwaitingPunchThrough`] and queues anything sent to it until a connection is
/// attached. A peer never removes itself; when a send or receive fails, the owner decides what to
/// do with it.
pub struct Peer {
    handle: PeerHandle,
    name: Option<String>,
    /// Address of the transport, or the connect target for outbound peers.
    addr: SocketAddr,
    /// Port the participant listens on for direct connections, once known.
    listen_port: Option<u16>,
    state: PeerState,
    /// Whether the host has announced this participant (roster-visible).
    announced: bool,
    connection: Option<Box<dyn Connection>>,
    recv_buffer: Vec<u8>,
    inbox: VecDeque<Message>,
    outbox: Vec<Vec<u8>>,
    remote_closed: bool,
    max_frame_size: usize,
    malformed_frames: u64,
    last_attempt: Option<Instant>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl Peer {
    /// A peer for a connection we accepted. Nothing about it is known yet.
    pub fn accepted(
        handle: PeerHandle,
        connection: Box<dyn Connection>,
        addr: SocketAddr,
        max_frame_size: usize,
    ) -> Self {
        Self::new(handle, None, addr, PeerState::Pending, Some(connection), max_frame_size)
    }

    /// A peer we are about to reach out to at `addr`.
    pub fn outbound(handle: PeerHandle, name: String, addr: SocketAddr, max_frame_size: usize) -> Self {
        let mut peer = Self::new(
            handle,
            Some(name),
            addr,
            PeerState::AwaitingPunchThrough,
            None,
            max_frame_size,
        );
        peer.listen_port = Some(addr.port());
        peer
    }

    /// A peer we already dialed but whose identity is not confirmed yet, such as the host before
    /// it answers a join request.
    pub fn dialed(
        handle: PeerHandle,
        connection: Box<dyn Connection>,
        addr: SocketAddr,
        max_frame_size: usize,
    ) -> Self {
        Self::new(
            handle,
            None,
            addr,
            PeerState::AwaitingPunchThrough,
            Some(connection),
            max_frame_size,
        )
    }

    /// A participant the host announced, who is expected to dial us. It has no transport until
    /// its own connection arrives.
    pub fn expected(handle: PeerHandle, name: String, listen_addr: SocketAddr, max_frame_size: usize) -> Self {
        let mut peer = Self::new(handle, Some(name), listen_addr, PeerState::Pending, None, max_frame_size);
        peer.listen_port = Some(listen_addr.port());
        peer.announced = true;
        peer
    }

    fn new(
        handle: PeerHandle,
        name: Option<String>,
        addr: SocketAddr,
        state: PeerState,
        connection: Option<Box<dyn Connection>>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            handle,
            name,
            addr,
            listen_port: None,
            state,
            announced: false,
            connection,
            recv_buffer: Vec::new(),
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            remote_closed: false,
            max_frame_size,
            malformed_frames: 0,
            last_attempt: None,
            violation_observer: None,
        }
    }

    /// Routes this peer's violations to `observer` instead of `tracing`.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.violation_observer = observer;
        self
    }

    /// The registry handle.
    #[must_use]
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// The participant's name, once it has introduced itself.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Transport address (or connect target).
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether the host announced this participant.
    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub(crate) fn set_announced(&mut self) {
        self.announced = true;
    }

    pub(crate) fn set_listen_port(&mut self, port: u16) {
        self.listen_port = Some(port);
    }

    /// Whether a transport is attached.
    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Number of frames dropped as malformed so far.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// The roster record for this peer: its name and the address others can reach it on.
    ///
    /// Returns `None` for a peer that has not introduced itself.
    #[must_use]
    pub fn record(&self) -> Option<PeerRecord> {
        let name = self.name.clone()?;
        let ip = match self.addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let port = self.listen_port.unwrap_or_else(|| self.addr.port());
        Some(PeerRecord {
            name,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    /// Moves to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: PeerState) -> Result<(), MeshError> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "peer {} cannot move from {} to {}",
                    self.handle, self.state, next
                ),
            });
        }
        trace!(peer = %self.handle, from = %self.state, to = %next, "peer state change");
        self.state = next;
        Ok(())
    }

    /// Walks a `Pending` or `AwaitingPunchThrough` peer through `Connected` to `LoggedIn`.
    pub fn log_in(&mut self) -> Result<(), MeshError> {
        if self.state.is_logged_in() {
            return Ok(());
        }
        if self.state != PeerState::Connected {
            self.transition(PeerState::Connected)?;
        }
        self.transition(PeerState::LoggedIn)
    }

    /// Attaches a transport and flushes anything queued while there was none.
    pub fn attach(&mut self, connection: Box<dyn Connection>) -> Result<(), MeshError> {
        self.connection = Some(connection);
        self.remote_closed = false;
        let queued = std::mem::take(&mut self.outbox);
        if let Some(conn) = self.connection.as_mut() {
            for frame in &queued {
                conn.send(frame)?;
            }
        }
        debug!(peer = %self.handle, flushed = queued.len(), "transport attached");
        Ok(())
    }

    /// Takes over `donor`'s transport along with everything it has buffered, then flushes this
    /// peer's queued frames. The donor is left without a transport.
    pub(crate) fn adopt_transport(&mut self, donor: &mut Peer) -> Result<(), MeshError> {
        let Some(connection) = donor.connection.take() else {
            return Ok(());
        };
        self.addr = donor.addr;
        self.recv_buffer = std::mem::take(&mut donor.recv_buffer);
        self.inbox.append(&mut donor.inbox);
        self.malformed_frames += donor.malformed_frames;
        let remote_closed = donor.remote_closed;
        self.attach(connection)?;
        self.remote_closed = remote_closed;
        Ok(())
    }

    /// Frames `payload` as `kind` and writes it to the transport.
    ///
    /// Without a transport yet, the frame is queued until [`Peer::attach`].
    ///
    /// # Errors
    ///
    /// [`MeshError::TransportError`] if the peer is removed, the remote side closed, or the write
    /// fails.
    pub fn send(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), MeshError> {
        if self.state.is_removed() || self.remote_closed {
            return Err(MeshError::TransportError {
                context: format!("peer {} is closed", self.handle),
            });
        }
        let frame = encode_frame(kind, payload)?;
        match self.connection.as_mut() {
            Some(conn) => conn.send(&frame),
            None => {
                self.outbox.push(frame);
                Ok(())
            },
        }
    }

    /// Encodes and sends a typed payload.
    pub fn send_payload<P: Payload>(&mut self, payload: &P) -> Result<(), MeshError> {
        let message = Message::from_payload(payload)?;
        self.send(message.kind, &message.payload)
    }

    /// Returns the next complete message, or `None` if nothing complete has arrived.
    ///
    /// Reads whatever the transport has and peels every complete frame off the buffer, then hands
    /// them out one per call. Malformed frames are dropped and reported; the connection is kept.
    ///
    /// # Errors
    ///
    /// [`MeshError::TransportError`] when the transport fails, or once the remote side has closed
    /// and every message it sent has been handed out.
    pub fn try_receive(&mut self) -> Result<Option<Message>, MeshError> {
        if self.state.is_removed() {
            return Ok(None);
        }
        if self.inbox.is_empty() {
            self.fill()?;
        }
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }
        if self.remote_closed {
            return Err(MeshError::TransportError {
                context: format!("connection to {} closed by remote", self.addr),
            });
        }
        Ok(None)
    }

    fn fill(&mut self) -> Result<(), MeshError> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        if !self.remote_closed && conn.recv(&mut self.recv_buffer)? == RecvStatus::Closed {
            self.remote_closed = true;
        }

        loop {
            match decode_frame(&self.recv_buffer, self.max_frame_size) {
                Decoded::Frame {
                    mut message,
                    consumed,
                } => {
                    message.sender = Some(self.addr);
                    self.inbox.push_back(message);
                    self.recv_buffer.drain(..consumed);
                },
                Decoded::NeedMoreData => break,
                Decoded::Malformed { error, consumed } => {
                    self.malformed_frames += 1;
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "dropped malformed frame from {}: {}",
                        self.addr,
                        error
                    );
                    let consumed = consumed.clamp(1, self.recv_buffer.len());
                    self.recv_buffer.drain(..consumed);
                    if self.recv_buffer.is_empty() {
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Whether an outbound attempt is due: never tried, or last tried at least `interval` ago.
    #[must_use]
    pub fn due_for_retry(&self, now: Instant, interval: Duration) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        }
    }

    pub(crate) fn mark_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Closes the transport and marks the peer [`PeerState::Removed`]. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.outbox.clear();
        self.inbox.clear();
        self.recv_buffer.clear();
        if !self.state.is_removed() {
            debug!(peer = %self.handle, name = ?self.name, "peer disconnected");
            self.state = PeerState::Removed;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("listen_port", &self.listen_port)
            .field("state", &self.state)
            .field("announced", &self.announced)
            .field("connected", &self.connection.is_some())
            .field("buffered", &self.recv_buffer.len())
            .field("inbox", &self.inbox.len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
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
    use crate::network::memory::MemoryNetwork;
    use crate::network::messages::{ClientChat, StartGame};
    use crate::telemetry::CollectingObserver;
    use crate::Network;

    const MAX: usize = 64 * 1024;

    /// An accepted peer plus the raw client-side connection feeding it.
    fn accepted_pair() -> (Peer, Box<dyn Connection>) {
        let mut net = MemoryNetwork::new();
        let mut listener = net.listen(9000).unwrap();
        let client = net.connect(listener.local_addr()).unwrap();
        let (server_side, addr) = listener.accept().unwrap().unwrap();
        let peer = Peer::accepted(PeerHandle::new(1), server_side, addr, MAX);
        (peer, client)
    }

    #[test]
    fn punch_datagram_layout() {
        let bytes = punch_datagram("bob").unwrap();
        assert_eq!(&bytes[..4], b"PUNC");
        assert_eq!(bytes[4], 3);
        assert_eq!(&bytes[5..], b"bob");
    }

    #[test]
    fn receives_frames_split_across_reads() {
        let (mut peer, mut client) = accepted_pair();
        let frame = encode_frame(MessageKind::ClientChat, b"hello").unwrap();
        client.send(&frame[..3]).unwrap();
        assert!(peer.try_receive().unwrap().is_none());
        client.send(&frame[3..]).unwrap();
        let message = peer.try_receive().unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::ClientChat);
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.sender, Some(peer.addr()));
    }

    #[test]
    fn hands_out_consecutive_frames_one_per_call() {
        let (mut peer, mut client) = accepted_pair();
        let mut bytes = encode_frame(MessageKind::ClientChat, b"a").unwrap();
        bytes.extend(encode_frame(MessageKind::ClientChat, b"b").unwrap());
        client.send(&bytes).unwrap();

        assert_eq!(peer.try_receive().unwrap().unwrap().payload, b"a");
        assert_eq!(peer.try_receive().unwrap().unwrap().payload, b"b");
        assert!(peer.try_receive().unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_dropped_and_connection_kept() {
        let (peer, mut client) = accepted_pair();
        let observer = Arc::new(CollectingObserver::new());
        let mut peer = peer.with_violation_observer(Some(observer.clone()));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99u16.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.push(0);
        bytes.extend(encode_frame(MessageKind::ClientChat, b"ok").unwrap());
        client.send(&bytes).unwrap();

        assert_eq!(peer.try_receive().unwrap().unwrap().payload, b"ok");
        assert_eq!(peer.malformed_frames(), 1);
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    }

    #[test]
    fn remote_close_delivers_buffered_messages_first() {
        let (mut peer, mut client) = accepted_pair();
        let msg = Message::from_payload(&StartGame { seed: 3 }).unwrap();
        client
            .send(&encode_frame(msg.kind, &msg.payload).unwrap())
            .unwrap();
        client.close();

        assert!(peer.try_receive().unwrap().is_some());
        assert!(matches!(
            peer.try_receive(),
            Err(MeshError::TransportError { .. })
        ));
        assert!(matches!(
            peer.send(MessageKind::ClientChat, b"x"),
            Err(MeshError::TransportError { .. })
        ));
    }

    #[test]
    fn outbound_peer_queues_until_attached() {
        let mut net = MemoryNetwork::new();
        let mut listener = net.listen(9100).unwrap();
        let addr = listener.local_addr();
        let mut peer = Peer::outbound(PeerHandle::new(2), "carol".to_owned(), addr, MAX);
        assert_eq!(peer.state(), PeerState::AwaitingPunchThrough);

        peer.send_payload(&ClientChat {
            text: "queued".to_owned(),
        })
        .unwrap();
        assert!(!peer.has_connection());

        peer.attach(net.connect(addr).unwrap()).unwrap();
        let (server_side, remote) = listener.accept().unwrap().unwrap();
        let mut receiver = Peer::accepted(PeerHandle::new(3), server_side, remote, MAX);
        let message = receiver.try_receive().unwrap().unwrap();
        assert_eq!(message.parse::<ClientChat>().unwrap().text, "queued");
    }

    #[test]
    fn log_in_walks_through_connected() {
        let (mut peer, _client) = accepted_pair();
        assert!(peer.transition(PeerState::LoggedIn).is_err());
        peer.log_in().unwrap();
        assert_eq!(peer.state(), PeerState::LoggedIn);
        peer.log_in().unwrap();
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut peer, mut client) = accepted_pair();
        peer.disconnect();
        peer.disconnect();
        assert_eq!(peer.state(), PeerState::Removed);
        assert!(peer.try_receive().unwrap().is_none());
        let mut buf = Vec::new();
        assert_eq!(client.recv(&mut buf).unwrap(), RecvStatus::Closed);
    }

    #[test]
    fn record_uses_listen_port() {
        let (mut peer, _client) = accepted_pair();
        assert!(peer.record().is_none());
        peer.set_name("dave".to_owned());
        peer.set_listen_port(4321);
        let record = peer.record().unwrap();
        assert_eq!(record.name, "dave");
        assert_eq!(record.addr.port(), 4321);
    }

    #[test]
    fn retry_interval() {
        let (mut peer, _client) = accepted_pair();
        let now = Instant::now();
        assert!(peer.due_for_retry(now, Duration::from_millis(500)));
        peer.mark_attempt(now);
        assert!(!peer.due_for_retry(now, Duration::from_millis(500)));
        assert!(peer.due_for_retry(now + Duration::from_millis(500), Duration::from_millis(500)));
    }
}
