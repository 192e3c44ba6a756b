//! # lockstep-mesh
//!
//! A peer-to-peer session layer with a deterministic lockstep synchronization engine.
//!
//! One participant hosts: it listens for joiners, owns the authoritative roster and relays chat.
//! Every joiner connects to the host and then directly to every other participant, forming a full
//! mesh. Once the host starts the game, every participant contributes exactly one batch of events
//! per frame and nobody advances a frame until every batch for it has arrived. Each batch carries
//! the sender's state, so a participant whose state diverges is detected and evicted.
//!
//! The callback style of classic networking libraries is replaced by an event queue: calling
//! [`P2PSession::poll_once`] performs all pending network work and hands back the
//! [`SessionEvent`]s it produced.
//!
//! ```no_run
//! use lockstep_mesh::{FrameAdvance, SessionBuilder, SessionEvent, TcpNetwork};
//!
//! # fn main() -> Result<(), lockstep_mesh::MeshError> {
//! let mut host = SessionBuilder::new("host").start_hosting(TcpNetwork::new(), 7777)?;
//! loop {
//!     let events: Vec<SessionEvent> = host.poll_once().collect();
//!     for event in events {
//!         if let SessionEvent::PlayerJoined { name } = event {
//!             println!("{name} joined");
//!             host.start_game(42)?;
//!         }
//!     }
//!     host.tick(&[1])?;
//!     if let FrameAdvance::Advanced { state, .. } = host.advance_frame() {
//!         println!("state is now {state}");
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::net::SocketAddr;

pub use error::MeshError;
pub use frame_info::{EventBatch, GameEvent, GameEventKind};
pub use network::memory::MemoryNetwork;
pub use network::messages::{Message, MessageKind, PeerRecord};
pub use network::peer::state::PeerState;
pub use network::tcp::TcpNetwork;
pub use sessions::builder::{Admission, SessionBuilder};
pub use sessions::config::{ProtocolConfig, SyncConfig};
pub use sessions::event_drain::EventDrain;
pub use sessions::p2p_session::P2PSession;

// Internal modules - made pub for re-export in __internal, but doc(hidden) for API cleanliness
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
/// Deterministic random number generation, seeded from the game seed.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod p2p_session;
    #[doc(hidden)]
    pub mod peer_registry;
}
#[doc(hidden)]
pub mod network {
    /// Wire framing and payload encoding.
    pub mod codec;
    /// In-process transport for tests and local simulation.
    pub mod memory;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod peer;
    /// TCP transport with UDP punch-through probes.
    pub mod tcp;
}

/// Internal module exposing implementation details for testing.
///
/// **This module is NOT part of the public API.** Everything here may change without notice.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::codec::{decode_frame, encode_frame, Decoded, HEADER_SIZE};
    pub use crate::network::peer::Peer;
    pub use crate::sessions::peer_registry::PeerRegistry;
    pub use crate::sync_layer::{Divergence, PeerFrameState, SyncLayer, SyncOutcome};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single lockstep step of the shared simulation.
///
/// Frame numbers start at 0 when the game starts and increase by one every time the frame barrier
/// opens. The special value [`NULL_FRAME`] (-1) represents "no frame".
///
/// # Examples
///
/// ```
/// use lockstep_mesh::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

/// Stable identifier of one peer record inside a session.
///
/// Handles are never reused within a session, so a stale handle can only miss, never alias a
/// different peer. Names are looked up through an index that maps onto handles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerHandle(u64);

impl PeerHandle {
    /// Creates a handle from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        PeerHandle(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of asking the engine to advance one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAdvance {
    /// Every participant had a batch queued; the frame was consumed.
    Advanced {
        /// The frame number after advancing.
        frame: Frame,
        /// The accumulated simulation state after advancing.
        state: i32,
    },
    /// At least one participant has not delivered its batch for the current frame. Nothing was
    /// mutated.
    Stalled {
        /// The participants the barrier is waiting on. Contains the local name when the local
        /// side has not ticked yet.
        waiting_on: Vec<String>,
    },
    /// No game is running.
    NotStarted,
}

/// Notifications produced by a session. Handling them is up to the application.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The host admitted a new participant (also announced to everyone else).
    PlayerJoined {
        /// The new participant's name.
        name: String,
    },
    /// A direct connection to a participant completed its handshake.
    PeerConnected {
        /// The participant's record.
        peer: PeerRecord,
    },
    /// This joiner was admitted and received the current roster.
    JoinedGame {
        /// Everyone else in the session, host first.
        roster: Vec<PeerRecord>,
    },
    /// A chat line relayed through the host.
    Chat {
        /// Author of the line.
        username: String,
        /// The text.
        text: String,
    },
    /// A chat line sent directly to this participant.
    DirectChat {
        /// Author of the line.
        from: String,
        /// The text.
        text: String,
    },
    /// A participant was kicked by the host. When `name` is the local name, this session was
    /// kicked and its roster is now empty.
    PlayerKicked {
        /// The kicked participant.
        name: String,
    },
    /// The host started the game.
    GameStarted {
        /// The shared seed.
        seed: i32,
    },
    /// A `PeerGameData` payload arrived.
    GameDataArrived {
        /// The sending participant.
        peer: String,
        /// The raw payload.
        bytes: Vec<u8>,
    },
    /// The host refused this joiner.
    ConnectionRejected {
        /// The host's reason.
        reason: String,
    },
    /// A participant reported a state that disagrees with ours and was evicted.
    PeerDiverged {
        /// The evicted participant.
        name: String,
        /// The frame at which the disagreement was found.
        frame: Frame,
        /// Our expected state.
        expected: i32,
        /// The state the participant reported.
        reported: i32,
    },
    /// A participant stalled the frame barrier past the configured timeout and was evicted.
    PeerTimedOut {
        /// The evicted participant.
        name: String,
    },
    /// A participant's transport closed.
    Disconnected {
        /// The participant that went away.
        name: String,
    },
}

/// Whether a connection is still open after a receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvStatus {
    /// The remote side may still send.
    Open,
    /// The remote side closed the stream. Anything it sent before closing was already delivered.
    Closed,
}

// #############
// #  TRAITS   #
// #############

/// One reliable, ordered byte stream to a remote participant.
///
/// All operations are nonblocking.
#[cfg(feature = "sync-send")]
pub trait Connection: Send + Sync {
    /// Queues `bytes` for delivery.
    fn send(&mut self, bytes: &[u8]) -> Result<(), MeshError>;

    /// Appends whatever has arrived to `buf` without blocking.
    fn recv(&mut self, buf: &mut Vec<u8>) -> Result<RecvStatus, MeshError>;

    /// Address of the remote end.
    fn peer_addr(&self) -> SocketAddr;

    /// Closes the stream. Safe to call more than once.
    fn close(&mut self);
}

/// Accepts inbound [`Connection`]s.
#[cfg(feature = "sync-send")]
pub trait Listener: Send + Sync {
    /// Returns one pending connection, or `None` without blocking.
    fn accept(&mut self) -> Result<Option<(Box<dyn Connection>, SocketAddr)>, MeshError>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// Factory for listeners, outbound connections and punch-through probes.
#[cfg(feature = "sync-send")]
pub trait Network: Send + Sync {
    /// Binds a listener on `port`. Port 0 picks an ephemeral port.
    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, MeshError>;

    /// Opens a stream to `addr`.
    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn Connection>, MeshError>;

    /// Sends one best-effort datagram to `addr`.
    fn punch(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), MeshError>;
}

/// One reliable, ordered byte stream to a remote participant.
///
/// All operations are nonblocking.
#[cfg(not(feature = "sync-send"))]
pub trait Connection {
    /// Queues `bytes` for delivery.
    fn send(&mut self, bytes: &[u8]) -> Result<(), MeshError>;

    /// Appends whatever has arrived to `buf` without blocking.
    fn recv(&mut self, buf: &mut Vec<u8>) -> Result<RecvStatus, MeshError>;

    /// Address of the remote end.
    fn peer_addr(&self) -> SocketAddr;

    /// Closes the stream. Safe to call more than once.
    fn close(&mut self);
}

/// Accepts inbound [`Connection`]s.
#[cfg(not(feature = "sync-send"))]
pub trait Listener {
    /// Returns one pending connection, or `None` without blocking.
    fn accept(&mut self) -> Result<Option<(Box<dyn Connection>, SocketAddr)>, MeshError>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// Factory for listeners, outbound connections and punch-through probes.
#[cfg(not(feature = "sync-send"))]
pub trait Network {
    /// Binds a listener on `port`. Port 0 picks an ephemeral port.
    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, MeshError>;

    /// Opens a stream to `addr`.
    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn Connection>, MeshError>;

    /// Sends one best-effort datagram to `addr`.
    fn punch(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), MeshError>;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn frame_null_and_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert!(Frame::new(0).is_valid());
        assert!(!Frame::new(-5).is_valid());
        assert!(!Frame::new(-5).is_null());
    }

    #[test]
    fn frame_arithmetic() {
        let mut frame = Frame::new(3);
        frame += 2;
        assert_eq!(frame, 5);
        assert_eq!(frame + 1, Frame::new(6));
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::new(12).to_string(), "12");
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn peer_handle_roundtrip_and_order() {
        let a = PeerHandle::new(1);
        let b = PeerHandle::new(2);
        assert_eq!(a.as_u64(), 1);
        assert!(a < b);
        assert_eq!(b.to_string(), "#2");
    }

    #[test]
    fn frame_advance_equality() {
        let stalled = FrameAdvance::Stalled {
            waiting_on: vec!["bob".to_owned()],
        };
        assert_ne!(stalled, FrameAdvance::NotStarted);
        assert_eq!(
            FrameAdvance::Advanced {
                frame: Frame::new(1),
                state: 45
            },
            FrameAdvance::Advanced {
                frame: Frame::new(1),
                state: 45
            }
        );
    }

    #[cfg(feature = "sync-send")]
    #[test]
    fn transport_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn Connection>();
        assert_send_sync::<dyn Listener>();
        assert_send_sync::<dyn Network>();
    }
}
