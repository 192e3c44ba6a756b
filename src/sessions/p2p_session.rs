//! The peer-to-peer session: handshake, roster, chat and the lockstep game on top of the mesh.
//!
//! A session is driven entirely by [`P2PSession::poll_once`]. Every call accepts new
//! connections, reads and dispatches whatever each peer has sent, and retries direct connections
//! that have not come up yet. Everything the application should know about comes back as
//! [`SessionEvent`]s.
//!
//! ## Joining
//!
//! ```text
//! joiner                    host                      other participant
//!   │ ClientJoinRequest ──►  │                            │
//!   │ ◄── ServerGameInformation                            │
//!   │                        │ ServerPlayerJoined ──────► │
//!   │ PeerConnect ───────────────────────────────────────►│
//!   │ ◄──────────────────────────────────────── PeerConnect│
//! ```
//!
//! The host admits or denies. An admitted joiner dials every participant from the roster it
//! received; everyone else learns about the joiner from the host and waits for that connection.
//! The two can arrive in either order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::Instant;

use crate::error::MeshError;
use crate::frame_info::EventBatch;
use crate::network::messages::{
    ChatLine, ClientChat, ConnectionDenied, GameData, GameInformation, JoinRequest, Message,
    MessageKind, PeerChat, PeerConnect, PeerRecord, PlayerJoined, PlayerKicked, ServerChat,
    StartGame,
};
use crate::network::peer::state::PeerState;
use crate::network::peer::{punch_datagram, Peer};
use crate::rng::Pcg32;
use crate::sessions::builder::Admission;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::peer_registry::PeerRegistry;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{
    InvariantChecker, InvariantViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{
    debug_check_invariants, report_violation_to, Frame, FrameAdvance, Listener, Network,
    PeerHandle, SessionEvent,
};

/// Which side of the session this is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Host,
    Joiner,
}

/// A [`P2PSession`] is one participant of a mesh: either the host or a joiner.
///
/// Create it through [`SessionBuilder`](crate::SessionBuilder). Nothing happens in the
/// background; call [`poll_once`](Self::poll_once) regularly and handle the events it returns.
pub struct P2PSession {
    local_name: String,
    role: Role,
    network: Box<dyn Network>,
    listener: Box<dyn Listener>,
    registry: PeerRegistry,
    /// The connection to the host. Always `None` on the host itself.
    host_peer: Option<PeerHandle>,
    admission: Option<Admission>,
    config: ProtocolConfig,
    sync_config: SyncConfig,
    sync: SyncLayer,
    event_queue: VecDeque<SessionEvent>,
    /// Batches that arrived before this side saw the game start.
    early_batches: Vec<(String, EventBatch)>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for P2PSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("local_name", &self.local_name)
            .field("role", &self.role)
            .field("local_addr", &self.listener.local_addr())
            .field("registry", &self.registry)
            .field("host_peer", &self.host_peer)
            .field("config", &self.config)
            .field("sync", &self.sync)
            .field("queued_events", &self.event_queue.len())
            .field("early_batches", &self.early_batches.len())
            .finish_non_exhaustive()
    }
}

impl P2PSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_name: String,
        role: Role,
        network: Box<dyn Network>,
        listener: Box<dyn Listener>,
        config: ProtocolConfig,
        sync_config: SyncConfig,
        admission: Option<Admission>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let sync = SyncLayer::new(local_name.clone(), sync_config)
            .with_violation_observer(violation_observer.clone());
        Self {
            local_name,
            role,
            network,
            listener,
            registry: PeerRegistry::new(),
            host_peer: None,
            admission,
            config,
            sync_config,
            sync,
            event_queue: VecDeque::new(),
            early_batches: Vec::new(),
            violation_observer,
        }
    }

    /// Registers the connection to the host, built by `make` from a fresh handle.
    pub(crate) fn register_host(
        &mut self,
        make: impl FnOnce(PeerHandle) -> Peer,
    ) -> Result<&mut Peer, MeshError> {
        let handle = self.registry.allocate_handle();
        let peer = make(handle).with_violation_observer(self.violation_observer.clone());
        self.registry.insert(peer)?;
        self.host_peer = Some(handle);
        self.registry
            .get_mut(handle)
            .ok_or_else(|| MeshError::UnknownPeer {
                name: handle.to_string(),
            })
    }

    // #############
    // #  POLLING  #
    // #############

    /// Performs all pending network work and returns the events it produced, oldest first.
    ///
    /// Accepts new connections, reads and dispatches every complete message from every peer,
    /// then retries direct connections and punch-through probes for participants that are not
    /// connected yet. Never blocks.
    pub fn poll_once(&mut self) -> EventDrain<'_> {
        self.accept_connections();
        for handle in self.registry.handles() {
            self.drain_peer(handle);
        }
        self.retry_outbound(Instant::now());
        debug_check_invariants!(self, "P2PSession::poll_once");
        self.events()
    }

    /// Drains queued events without doing any network work.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.config.event_queue_size {
            if let Some(dropped) = self.event_queue.pop_front() {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::EventQueue,
                    "event queue is full ({} entries), dropped oldest event {:?}",
                    self.config.event_queue_size,
                    dropped
                );
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some((connection, addr))) => {
                    let handle = self.registry.allocate_handle();
                    let peer = Peer::accepted(handle, connection, addr, self.config.max_frame_size)
                        .with_violation_observer(self.violation_observer.clone());
                    match self.registry.insert(peer) {
                        Ok(_) => debug!(peer = %handle, %addr, "accepted connection"),
                        Err(err) => report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Error,
                            ViolationKind::InternalError,
                            "could not register connection from {}: {}",
                            addr,
                            err
                        ),
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Transport,
                        "accept failed: {}",
                        err
                    );
                    break;
                },
            }
        }
    }

    fn drain_peer(&mut self, handle: PeerHandle) {
        loop {
            let Some(peer) = self.registry.get_mut(handle) else {
                return;
            };
            match peer.try_receive() {
                Ok(Some(message)) => self.dispatch(handle, message),
                Ok(None) => return,
                Err(err) => {
                    debug!(peer = %handle, error = %err, "transport closed");
                    self.drop_peer(handle);
                    return;
                },
            }
        }
    }

    fn retry_outbound(&mut self, now: Instant) {
        let interval = self.config.punch_retry_interval;
        let due: Vec<PeerHandle> = self
            .registry
            .iter()
            .filter(|peer| {
                peer.state() == PeerState::AwaitingPunchThrough
                    && peer.due_for_retry(now, interval)
            })
            .map(Peer::handle)
            .collect();
        for handle in due {
            self.reach_out(handle, now);
        }
    }

    /// Sends a punch-through probe to the peer and, if it has no transport yet, tries to connect.
    fn reach_out(&mut self, handle: PeerHandle, now: Instant) {
        let Some(peer) = self.registry.get_mut(handle) else {
            return;
        };
        peer.mark_attempt(now);
        let addr = peer.addr();
        let needs_transport = !peer.has_connection();

        match punch_datagram(&self.local_name) {
            Ok(datagram) => {
                if let Err(err) = self.network.punch(addr, &datagram) {
                    trace!(peer = %handle, %addr, error = %err, "punch-through probe failed");
                }
            },
            Err(err) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                "could not build punch-through probe: {}",
                err
            ),
        }
        if !needs_transport {
            return;
        }

        let connection = match self.network.connect(addr) {
            Ok(connection) => connection,
            Err(err) => {
                debug!(peer = %handle, %addr, error = %err, "direct connection failed, will retry");
                return;
            },
        };
        let attached = match self.registry.get_mut(handle) {
            Some(peer) => peer.attach(connection),
            None => return,
        };
        match attached {
            Ok(()) => debug!(peer = %handle, %addr, "direct connection established"),
            Err(err) => {
                debug!(peer = %handle, %addr, error = %err, "flushing queued frames failed");
                self.drop_peer(handle);
            },
        }
    }

    // ##############
    // #  DISPATCH  #
    // ##############

    fn dispatch(&mut self, from: PeerHandle, message: Message) {
        trace!(
            peer = %from,
            kind = %message.kind,
            len = message.payload.len(),
            "message received"
        );
        let kind = message.kind;
        if kind.is_server_message() && (self.role == Role::Host || self.host_peer != Some(from)) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Handshake,
                "{} from {} ignored: only the host sends it",
                kind,
                from
            );
            return;
        }

        let result = match kind {
            MessageKind::ClientJoinRequest => self.on_join_request(from, &message),
            MessageKind::ClientChat => self.on_client_chat(from, &message),
            MessageKind::ServerGameInformation => self.on_game_information(&message),
            MessageKind::ServerConnectionDenied => self.on_connection_denied(&message),
            MessageKind::ServerChat => self.on_server_chat(&message),
            MessageKind::ServerPlayerJoined => self.on_player_joined(&message),
            MessageKind::ServerPlayerKicked => self.on_player_kicked(&message),
            MessageKind::ServerStartGame => self.on_start_game(&message),
            MessageKind::PeerConnect => self.on_peer_connect(from, &message),
            MessageKind::PeerChat => self.on_peer_chat(from, &message),
            MessageKind::PeerGameData => self.on_game_data(from, message),
        };

        if let Err(err) = result {
            let violation_kind = match err {
                MeshError::MalformedFrame { .. } | MeshError::SerializationError { .. } => {
                    ViolationKind::NetworkProtocol
                },
                MeshError::TransportError { .. } => ViolationKind::Transport,
                _ => ViolationKind::Handshake,
            };
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                violation_kind,
                "dropped {} from {}: {}",
                kind,
                from,
                err
            );
        }
    }

    fn on_join_request(&mut self, from: PeerHandle, message: &Message) -> Result<(), MeshError> {
        if self.role != Role::Host {
            return Err(MeshError::NotHosting);
        }
        let peer = self.peer(from)?;
        if peer.name().is_some() || peer.state() != PeerState::Pending {
            return Err(MeshError::InvalidRequest {
                info: "join request on a connection that already joined".to_owned(),
            });
        }
        let addr = peer.addr();
        let request: JoinRequest = message.parse()?;

        if request.protocol_version != self.config.protocol_version {
            let mismatch = MeshError::ProtocolVersionMismatch {
                local: self.config.protocol_version,
                remote: request.protocol_version,
            };
            return self.deny(from, mismatch.to_string());
        }
        if self.sync.is_running() {
            return self.deny(from, "game already in progress".to_owned());
        }
        if request.username.is_empty() {
            return self.deny(from, "username must not be empty".to_owned());
        }
        if request.username == self.local_name || self.registry.contains_name(&request.username) {
            return self.deny(from, format!("name {} is already in use", request.username));
        }
        if let Some(admission) = self.admission.as_mut() {
            if !admission(&request.username, &request.client_tag, addr) {
                let denied = MeshError::AdmissionDenied {
                    username: request.username,
                };
                info!(%addr, "{}", denied);
                self.registry.remove(from);
                return Ok(());
            }
        }

        self.registry.rename(from, &request.username)?;
        let record = {
            let peer = self.peer_mut(from)?;
            peer.set_listen_port(request.callback_port);
            peer.set_announced();
            peer.log_in()?;
            peer.record().ok_or_else(|| MeshError::UnknownPeer {
                name: request.username.clone(),
            })?
        };
        info!(
            username = %request.username,
            tag = %request.client_tag,
            addr = %record.addr,
            "player joined"
        );

        let joined = Message::from_payload(&PlayerJoined {
            record: record.clone(),
        })?;
        for handle in self.registry.logged_in_handles(Some(from)) {
            self.send_message(handle, &joined);
        }
        let roster: Vec<PeerRecord> = self
            .registry
            .roster()
            .into_iter()
            .filter(|r| r.name != request.username)
            .collect();
        let information = Message::from_payload(&GameInformation {
            host_name: self.local_name.clone(),
            roster,
        })?;
        if self.send_message(from, &information) {
            self.push_event(SessionEvent::PlayerJoined {
                name: request.username,
            });
            self.push_event(SessionEvent::PeerConnected { peer: record });
        }
        Ok(())
    }

    fn deny(&mut self, handle: PeerHandle, reason: String) -> Result<(), MeshError> {
        info!(peer = %handle, %reason, "join request denied");
        let denial = Message::from_payload(&ConnectionDenied { reason })?;
        if let Some(peer) = self.registry.get_mut(handle) {
            if let Err(err) = peer.send(denial.kind, &denial.payload) {
                debug!(peer = %handle, error = %err, "could not deliver denial");
            }
        }
        self.registry.remove(handle);
        Ok(())
    }

    fn on_client_chat(&mut self, from: PeerHandle, message: &Message) -> Result<(), MeshError> {
        if self.role != Role::Host {
            return Err(MeshError::NotHosting);
        }
        let username = self.logged_in_name(from)?;
        let ClientChat { text } = message.parse()?;
        self.relay_chat(username, text)
    }

    fn relay_chat(&mut self, username: String, text: String) -> Result<(), MeshError> {
        let line = Message::from_payload(&ServerChat(ChatLine {
            username: username.clone(),
            text: text.clone(),
        }))?;
        for handle in self.registry.logged_in_handles(None) {
            self.send_message(handle, &line);
        }
        self.push_event(SessionEvent::Chat { username, text });
        Ok(())
    }

    fn on_game_information(&mut self, message: &Message) -> Result<(), MeshError> {
        let information: GameInformation = message.parse()?;
        let host = self.host_peer.ok_or(MeshError::NotHosting)?;
        if self.peer(host)?.state().is_logged_in() {
            return Err(MeshError::InvalidRequest {
                info: "game information received twice".to_owned(),
            });
        }

        self.registry.rename(host, &information.host_name)?;
        let host_record = {
            let peer = self.peer_mut(host)?;
            peer.set_announced();
            peer.log_in()?;
            peer.record().ok_or_else(|| MeshError::UnknownPeer {
                name: information.host_name.clone(),
            })?
        };

        let mut roster = vec![host_record];
        for record in information.roster {
            if record.name == self.local_name {
                continue;
            }
            if !self.registry.contains_name(&record.name) {
                self.add_outbound(&record)?;
            }
            roster.push(record);
        }
        info!(
            host = %information.host_name,
            participants = roster.len(),
            "joined game"
        );
        self.push_event(SessionEvent::JoinedGame { roster });
        Ok(())
    }

    /// Creates the record for a roster participant and starts dialing it.
    fn add_outbound(&mut self, record: &PeerRecord) -> Result<(), MeshError> {
        let handle = self.registry.allocate_handle();
        let mut peer = Peer::outbound(
            handle,
            record.name.clone(),
            SocketAddr::V4(record.addr),
            self.config.max_frame_size,
        )
        .with_violation_observer(self.violation_observer.clone());
        peer.set_announced();
        peer.send_payload(&PeerConnect {
            username: self.local_name.clone(),
            listen_port: self.listen_port(),
        })?;
        self.registry.insert(peer)?;
        debug!(peer = %handle, name = %record.name, addr = %record.addr, "dialing participant");
        self.reach_out(handle, Instant::now());
        Ok(())
    }

    fn on_connection_denied(&mut self, message: &Message) -> Result<(), MeshError> {
        let ConnectionDenied { reason } = message.parse()?;
        info!(%reason, "host denied the join request");
        self.reset();
        self.push_event(SessionEvent::ConnectionRejected { reason });
        Ok(())
    }

    fn on_server_chat(&mut self, message: &Message) -> Result<(), MeshError> {
        let ServerChat(line) = message.parse()?;
        self.push_event(SessionEvent::Chat {
            username: line.username,
            text: line.text,
        });
        Ok(())
    }

    fn on_player_joined(&mut self, message: &Message) -> Result<(), MeshError> {
        let PlayerJoined { record } = message.parse()?;
        if record.name == self.local_name {
            return Ok(());
        }
        match self.registry.by_name(&record.name) {
            Some(handle) => {
                let peer = self.peer_mut(handle)?;
                peer.set_announced();
                if peer.state() == PeerState::Pending && peer.has_connection() {
                    self.complete_inbound(handle)?;
                }
            },
            None => {
                let handle = self.registry.allocate_handle();
                let peer = Peer::expected(
                    handle,
                    record.name.clone(),
                    SocketAddr::V4(record.addr),
                    self.config.max_frame_size,
                )
                .with_violation_observer(self.violation_observer.clone());
                self.registry.insert(peer)?;
                debug!(peer = %handle, name = %record.name, "expecting connection");
            },
        }
        info!(name = %record.name, "player joined");
        self.push_event(SessionEvent::PlayerJoined { name: record.name });
        Ok(())
    }

    fn on_player_kicked(&mut self, message: &Message) -> Result<(), MeshError> {
        let PlayerKicked { username } = message.parse()?;
        if username == self.local_name {
            info!("kicked by the host");
            self.reset();
        } else if let Some(handle) = self.registry.by_name(&username) {
            info!(name = %username, "player kicked");
            self.evict(handle);
        }
        self.push_event(SessionEvent::PlayerKicked { name: username });
        Ok(())
    }

    fn on_start_game(&mut self, message: &Message) -> Result<(), MeshError> {
        let StartGame { seed } = message.parse()?;
        if self.sync.is_running() {
            return Err(MeshError::InvalidRequest {
                info: "game already started".to_owned(),
            });
        }
        self.begin_game(seed);
        Ok(())
    }

    fn on_peer_connect(&mut self, from: PeerHandle, message: &Message) -> Result<(), MeshError> {
        let PeerConnect {
            username,
            listen_port,
        } = message.parse()?;
        if username == self.local_name {
            return Err(MeshError::InvalidRequest {
                info: format!("peer {from} claims our own name"),
            });
        }
        let peer = self.peer(from)?;
        let state = peer.state();
        let known_as = peer.name().map(str::to_owned);

        match state {
            PeerState::AwaitingPunchThrough if self.host_peer != Some(from) => {
                if known_as.as_deref() != Some(username.as_str()) {
                    return Err(MeshError::InvalidRequest {
                        info: format!(
                            "dialed {} but {} answered",
                            known_as.unwrap_or_default(),
                            username
                        ),
                    });
                }
                let record = {
                    let peer = self.peer_mut(from)?;
                    peer.log_in()?;
                    peer.record()
                };
                if let Some(record) = record {
                    info!(name = %username, addr = %record.addr, "peer connected");
                    self.push_event(SessionEvent::PeerConnected { peer: record });
                }
                Ok(())
            },
            PeerState::Pending if known_as.is_none() => match self.registry.by_name(&username) {
                Some(existing) => {
                    let expected = self
                        .registry
                        .get(existing)
                        .is_some_and(|p| p.state() == PeerState::Pending && !p.has_connection());
                    if !expected {
                        self.registry.remove(from);
                        return Err(MeshError::InvalidRequest {
                            info: format!("second connection claiming to be {username}"),
                        });
                    }
                    self.registry.absorb(existing, from)?;
                    self.complete_inbound(existing)
                },
                None if self.role == Role::Host => {
                    self.registry.remove(from);
                    Err(MeshError::UnknownPeer { name: username })
                },
                None => {
                    self.registry.rename(from, &username)?;
                    self.peer_mut(from)?.set_listen_port(listen_port);
                    debug!(peer = %from, name = %username, "holding connection until the host announces it");
                    Ok(())
                },
            },
            _ => Err(MeshError::InvalidRequest {
                info: format!("unexpected PeerConnect from {username} in state {state}"),
            }),
        }
    }

    /// Finishes the handshake of an inbound participant the host has announced: logs it in and
    /// answers with our own `PeerConnect`.
    fn complete_inbound(&mut self, handle: PeerHandle) -> Result<(), MeshError> {
        let reply = Message::from_payload(&PeerConnect {
            username: self.local_name.clone(),
            listen_port: self.listen_port(),
        })?;
        let record = {
            let peer = self.peer_mut(handle)?;
            peer.log_in()?;
            peer.record()
        };
        if self.send_message(handle, &reply) {
            if let Some(record) = record {
                info!(name = %record.name, addr = %record.addr, "peer connected");
                self.push_event(SessionEvent::PeerConnected { peer: record });
            }
        }
        Ok(())
    }

    fn on_peer_chat(&mut self, from: PeerHandle, message: &Message) -> Result<(), MeshError> {
        let sender = self.logged_in_name(from)?;
        let PeerChat(line) = message.parse()?;
        self.push_event(SessionEvent::DirectChat {
            from: sender,
            text: line.text,
        });
        Ok(())
    }

    fn on_game_data(&mut self, from: PeerHandle, message: Message) -> Result<(), MeshError> {
        let sender = self.logged_in_name(from)?;
        let parsed = message.parse::<GameData>();
        self.push_event(SessionEvent::GameDataArrived {
            peer: sender.clone(),
            bytes: message.payload,
        });
        let GameData { events } = parsed?;

        if !self.sync.is_running() {
            let held = self.early_batches.iter().filter(|(s, _)| *s == sender).count();
            if held >= self.sync_config.max_pending_frames {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Synchronization,
                    "early batch from {} dropped: {} already held before the game started",
                    sender,
                    held
                );
            } else {
                trace!(peer = %sender, "holding batch until the game starts");
                self.early_batches.push((sender, events));
            }
        } else if !self.sync.enqueue(&sender, events) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "batch from {} dropped: not part of the running game",
                sender
            );
        }
        Ok(())
    }

    // #################
    // #  PUBLIC API   #
    // #################

    /// Sends a chat line to everyone, relayed by the host.
    ///
    /// On the host the line goes out immediately and a [`SessionEvent::Chat`] is queued locally.
    /// A joiner only sees its own line once the host relays it back.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidRequest`] if a joiner has not been admitted yet,
    /// [`MeshError::TransportError`] if the host connection is gone.
    pub fn send_chat(&mut self, text: &str) -> Result<(), MeshError> {
        if self.role == Role::Host {
            return self.relay_chat(self.local_name.clone(), text.to_owned());
        }
        let host = self
            .host_peer
            .filter(|h| self.registry.get(*h).is_some_and(|p| p.state().is_logged_in()))
            .ok_or_else(|| MeshError::InvalidRequest {
                info: "not admitted by a host".to_owned(),
            })?;
        let message = Message::from_payload(&ClientChat {
            text: text.to_owned(),
        })?;
        if self.send_message(host, &message) {
            Ok(())
        } else {
            Err(MeshError::TransportError {
                context: "connection to the host is closed".to_owned(),
            })
        }
    }

    /// Sends a chat line directly to the participant called `to`.
    ///
    /// # Errors
    ///
    /// [`MeshError::UnknownPeer`] if nobody by that name is connected,
    /// [`MeshError::TransportError`] if the connection is gone.
    pub fn whisper(&mut self, to: &str, text: &str) -> Result<(), MeshError> {
        let handle = self.logged_in_handle(to)?;
        let message = Message::from_payload(&PeerChat(ChatLine {
            username: self.local_name.clone(),
            text: text.to_owned(),
        }))?;
        if self.send_message(handle, &message) {
            Ok(())
        } else {
            Err(MeshError::TransportError {
                context: format!("connection to {to} is closed"),
            })
        }
    }

    /// Removes `name` from the session. Host only.
    ///
    /// Every participant, including the kicked one, is told first; then the connection is
    /// closed and the participant leaves the game.
    ///
    /// # Errors
    ///
    /// [`MeshError::NotHosting`] on a joiner, [`MeshError::UnknownPeer`] if nobody by that name
    /// has joined.
    pub fn kick(&mut self, name: &str) -> Result<(), MeshError> {
        if self.role != Role::Host {
            return Err(MeshError::NotHosting);
        }
        let target = self.logged_in_handle(name)?;
        let kicked = Message::from_payload(&PlayerKicked {
            username: name.to_owned(),
        })?;
        for handle in self.registry.logged_in_handles(None) {
            self.send_message(handle, &kicked);
        }
        info!(name, "player kicked");
        self.evict(target);
        self.push_event(SessionEvent::PlayerKicked {
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Starts the game with `seed`. Host only.
    ///
    /// Every participant that has joined so far becomes part of the lockstep set; later join
    /// requests are denied.
    ///
    /// # Errors
    ///
    /// [`MeshError::NotHosting`] on a joiner, [`MeshError::InvalidRequest`] if a game is already
    /// running.
    pub fn start_game(&mut self, seed: i32) -> Result<(), MeshError> {
        if self.role != Role::Host {
            return Err(MeshError::NotHosting);
        }
        if self.sync.is_running() {
            return Err(MeshError::InvalidRequest {
                info: "game already started".to_owned(),
            });
        }
        let start = Message::from_payload(&StartGame { seed })?;
        for handle in self.registry.logged_in_handles(None) {
            self.send_message(handle, &start);
        }
        self.begin_game(seed);
        Ok(())
    }

    fn begin_game(&mut self, seed: i32) {
        let participants: Vec<String> = self.registry.roster().into_iter().map(|r| r.name).collect();
        info!(seed, participants = participants.len(), "game started");
        self.sync.start(seed, participants);
        self.push_event(SessionEvent::GameStarted { seed });
        for (sender, batch) in std::mem::take(&mut self.early_batches) {
            if !self.sync.enqueue(&sender, batch) {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Synchronization,
                    "early batch from {} dropped: not part of the game",
                    sender
                );
            }
        }
    }

    /// Sends a prebuilt frame batch to every participant of the game.
    ///
    /// `bytes` must be exactly one encoded batch opening with a `GameState` entry. It is this
    /// participant's contribution to the current frame, the same as a [`tick`](Self::tick), and is
    /// archived locally before it goes out. Receivers report it through
    /// [`SessionEvent::GameDataArrived`] and feed it to their lockstep engine.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidRequest`] if the payload exceeds the configured frame size, if no game
    /// is running, if [`SyncConfig::max_pending_frames`] local batches are already waiting on the
    /// barrier, or if the payload is not a batch that opens with a `GameState` entry.
    /// [`MeshError::MalformedFrame`] if the payload does not decode at all.
    pub fn send_game_data(&mut self, bytes: &[u8]) -> Result<(), MeshError> {
        if bytes.len() > self.config.max_frame_size {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "payload of {} bytes exceeds max_frame_size {}",
                    bytes.len(),
                    self.config.max_frame_size
                ),
            });
        }
        if !self.sync.is_running() {
            return Err(MeshError::InvalidRequest {
                info: "no game is running".to_owned(),
            });
        }
        if self.sync.pending_local() >= self.sync_config.max_pending_frames {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "{} local batches already wait on frame {}",
                    self.sync.pending_local(),
                    self.sync.current_frame()
                ),
            });
        }
        let message = Message::new(MessageKind::PeerGameData, bytes.to_vec());
        let GameData { events } = message.parse()?;
        if !self.sync.submit_batch(events) {
            return Err(MeshError::InvalidRequest {
                info: "batch does not open with a GameState entry".to_owned(),
            });
        }
        self.send_to_game(&message);
        Ok(())
    }

    /// Submits this frame's local deltas and sends the batch to every participant of the game.
    ///
    /// Returns `Ok(false)` without doing anything when no game is running or when
    /// [`SyncConfig::max_pending_frames`] local batches are already waiting on the barrier.
    ///
    /// # Errors
    ///
    /// [`MeshError::MalformedFrame`] if the batch cannot be encoded.
    pub fn tick(&mut self, deltas: &[i32]) -> Result<bool, MeshError> {
        if !self.sync.is_running() || self.sync.pending_local() >= self.sync_config.max_pending_frames {
            return Ok(false);
        }
        let batch = self.sync.submit_local(deltas);
        let message = Message::from_payload(&GameData { events: batch })?;
        self.send_to_game(&message);
        Ok(true)
    }

    fn send_to_game(&mut self, message: &Message) {
        let targets: Vec<PeerHandle> = self
            .sync
            .other_peers()
            .filter_map(|name| self.registry.by_name(name))
            .collect();
        for handle in targets {
            self.send_message(handle, message);
        }
    }

    /// Consumes one frame if every batch for it has arrived.
    ///
    /// Divergent participants and participants that stalled past
    /// [`SyncConfig::stall_timeout`] are evicted here and reported as events.
    ///
    /// A joiner that evicts its host has lost the session: it forgets every peer, leaves the game
    /// and reports [`SessionEvent::Disconnected`] for the host, as if the host connection had
    /// closed.
    pub fn advance_frame(&mut self) -> FrameAdvance {
        let outcome = self.sync.try_advance(Instant::now());
        for divergence in outcome.diverged {
            self.push_event(SessionEvent::PeerDiverged {
                name: divergence.peer.clone(),
                frame: divergence.frame,
                expected: divergence.expected,
                reported: divergence.reported,
            });
            self.evict_from_game(&divergence.peer);
        }
        for name in outcome.timed_out {
            self.push_event(SessionEvent::PeerTimedOut { name: name.clone() });
            self.evict_from_game(&name);
        }
        outcome.advance
    }

    // #############
    // #  QUERIES  #
    // #############

    /// This participant's name.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Whether this session is the host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    /// Whether a game is running.
    #[must_use]
    pub fn is_in_game(&self) -> bool {
        self.sync.is_running()
    }

    /// The accumulated simulation state.
    #[must_use]
    pub fn current_state(&self) -> i32 {
        self.sync.current_state()
    }

    /// The next frame to be consumed, or [`Frame::NULL`] outside a game.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync.current_frame()
    }

    /// Local batches submitted but not yet consumed.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.sync.pending_local()
    }

    /// Address the session listens on for incoming connections.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Every other participant the host has announced, in the order they became known.
    #[must_use]
    pub fn roster(&self) -> Vec<PeerRecord> {
        self.registry.roster()
    }

    /// Participants of the running game, by name.
    #[must_use]
    pub fn sync_peers(&self) -> Vec<String> {
        self.sync.other_peers().map(str::to_owned).collect()
    }

    /// Connection state of the participant called `name`.
    #[must_use]
    pub fn peer_state(&self, name: &str) -> Option<PeerState> {
        self.registry
            .by_name(name)
            .and_then(|handle| self.registry.get(handle))
            .map(Peer::state)
    }

    /// The generator seeded from the game seed. Draws from it stay in step across participants as
    /// long as every participant draws the same amount per frame.
    pub fn rng(&mut self) -> &mut Pcg32 {
        self.sync.rng()
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    // #############
    // #  HELPERS  #
    // #############

    fn listen_port(&self) -> u16 {
        self.listener.local_addr().port()
    }

    fn peer(&self, handle: PeerHandle) -> Result<&Peer, MeshError> {
        self.registry.get(handle).ok_or_else(|| MeshError::UnknownPeer {
            name: handle.to_string(),
        })
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> Result<&mut Peer, MeshError> {
        self.registry
            .get_mut(handle)
            .ok_or_else(|| MeshError::UnknownPeer {
                name: handle.to_string(),
            })
    }

    fn logged_in_name(&self, handle: PeerHandle) -> Result<String, MeshError> {
        let peer = self.peer(handle)?;
        match peer.name() {
            Some(name) if peer.state().is_logged_in() => Ok(name.to_owned()),
            _ => Err(MeshError::InvalidRequest {
                info: format!("peer {handle} has not completed its handshake"),
            }),
        }
    }

    fn logged_in_handle(&self, name: &str) -> Result<PeerHandle, MeshError> {
        self.registry
            .by_name(name)
            .filter(|h| self.registry.get(*h).is_some_and(|p| p.state().is_logged_in()))
            .ok_or_else(|| MeshError::UnknownPeer {
                name: name.to_owned(),
            })
    }

    /// Sends `message` to one peer. A peer whose transport fails is dropped; returns whether the
    /// send went through.
    fn send_message(&mut self, handle: PeerHandle, message: &Message) -> bool {
        let Some(peer) = self.registry.get_mut(handle) else {
            return false;
        };
        match peer.send(message.kind, &message.payload) {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = %handle, kind = %message.kind, error = %err, "send failed");
                self.drop_peer(handle);
                false
            },
        }
    }

    /// Removes a peer from the registry and the game without any event. Returns its name.
    fn evict(&mut self, handle: PeerHandle) -> Option<String> {
        let peer = self.registry.remove(handle)?;
        let name = peer.name()?.to_owned();
        self.sync.remove_peer(&name);
        self.early_batches.retain(|(sender, _)| *sender != name);
        Some(name)
    }

    /// Evicts a participant the lockstep engine gave up on.
    fn evict_from_game(&mut self, name: &str) {
        match self.registry.by_name(name) {
            Some(handle) if self.host_peer == Some(handle) => self.lose_host(),
            Some(handle) => {
                self.evict(handle);
            },
            None => {},
        }
    }

    /// Handles a peer whose transport went away.
    fn drop_peer(&mut self, handle: PeerHandle) {
        if self.host_peer == Some(handle) {
            self.lose_host();
            return;
        }
        let announced = self.registry.get(handle).is_some_and(Peer::is_announced);
        if let Some(name) = self.evict(handle) {
            if announced {
                info!(name = %name, "peer disconnected");
                self.push_event(SessionEvent::Disconnected { name });
            }
        }
    }

    fn lose_host(&mut self) {
        let host_name = self
            .host_peer
            .and_then(|handle| self.registry.get(handle))
            .and_then(Peer::name)
            .map(str::to_owned);
        self.reset();
        match host_name {
            Some(name) => {
                info!(host = %name, "connection to the host lost");
                self.push_event(SessionEvent::Disconnected { name });
            },
            None => {
                info!("host closed the connection before admitting us");
                self.push_event(SessionEvent::ConnectionRejected {
                    reason: "host closed the connection".to_owned(),
                });
            },
        }
    }

    /// Forgets every peer and stops the game.
    fn reset(&mut self) {
        self.registry.clear();
        self.host_peer = None;
        self.sync.stop();
        self.early_batches.clear();
    }
}

impl InvariantChecker for P2PSession {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.role == Role::Host && self.host_peer.is_some() {
            return Err(InvariantViolation::new(
                "P2PSession",
                "host session has a host connection",
            ));
        }
        if let Some(handle) = self.host_peer {
            if self.registry.get(handle).is_none() {
                return Err(InvariantViolation::new(
                    "P2PSession",
                    "host connection is not registered",
                )
                .with_details(format!("handle {handle}")));
            }
        }
        for name in self.sync.other_peers() {
            if !self.registry.contains_name(name) {
                return Err(InvariantViolation::new(
                    "P2PSession",
                    "game participant has no peer record",
                )
                .with_details(format!("participant {name}")));
            }
        }
        if self.event_queue.len() > self.config.event_queue_size {
            return Err(InvariantViolation::new(
                "P2PSession",
                "event queue exceeds its configured size",
            ));
        }
        self.registry.check_invariants()?;
        self.sync.check_invariants()
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
    use crate::frame_info::GameEvent;
    use crate::network::memory::MemoryNetwork;
    use crate::sessions::builder::SessionBuilder;
    use crate::telemetry::CollectingObserver;
    use smallvec::smallvec;

    fn host(network: &MemoryNetwork, port: u16) -> P2PSession {
        SessionBuilder::new("host")
            .start_hosting(network.clone(), port)
            .unwrap()
    }

    fn join(network: &MemoryNetwork, name: &str, host: &P2PSession) -> P2PSession {
        SessionBuilder::new(name)
            .connect(network.clone(), host.local_addr())
            .unwrap()
    }

    fn pump(sessions: &mut [&mut P2PSession], rounds: usize) -> Vec<Vec<SessionEvent>> {
        let mut events = vec![Vec::new(); sessions.len()];
        for _ in 0..rounds {
            for (i, session) in sessions.iter_mut().enumerate() {
                events[i].extend(session.poll_once());
            }
        }
        events
    }

    #[test]
    fn joiner_is_admitted() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7000);
        let mut alice = join(&network, "alice", &host);
        let events = pump(&mut [&mut host, &mut alice], 2);

        assert!(events[0].contains(&SessionEvent::PlayerJoined {
            name: "alice".to_owned()
        }));
        let joined = events[1]
            .iter()
            .find_map(|e| match e {
                SessionEvent::JoinedGame { roster } => Some(roster.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].name, "host");
        assert_eq!(joined[0].addr.port(), 7000);
        assert_eq!(host.peer_state("alice"), Some(PeerState::LoggedIn));
        assert_eq!(alice.peer_state("host"), Some(PeerState::LoggedIn));
        host.check_invariants().unwrap();
        alice.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_name_is_denied() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7001);
        let mut first = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut first], 2);

        let mut second = join(&network, "alice", &host);
        let events = pump(&mut [&mut host, &mut second], 2);
        assert!(events[1].iter().any(|e| matches!(
            e,
            SessionEvent::ConnectionRejected { reason } if reason.contains("already in use")
        )));
        assert_eq!(host.roster().len(), 1);
        assert!(second.roster().is_empty());
    }

    #[test]
    fn host_name_is_reserved() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7002);
        let mut imposter = join(&network, "host", &host);
        let events = pump(&mut [&mut host, &mut imposter], 2);
        assert!(events[1]
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionRejected { .. })));
        assert!(host.roster().is_empty());
    }

    #[test]
    fn admission_predicate_drops_silently() {
        let network = MemoryNetwork::new();
        let mut host = SessionBuilder::new("host")
            .with_admission(Box::new(|name: &str, _tag: &str, _addr: SocketAddr| {
                name != "mallory"
            }))
            .start_hosting(network.clone(), 7003)
            .unwrap();
        let mut mallory = join(&network, "mallory", &host);
        let events = pump(&mut [&mut host, &mut mallory], 2);
        assert!(events[0].is_empty());
        assert!(host.roster().is_empty());
        // Dropped without a reason: the joiner only sees the connection close.
        assert!(events[1].iter().any(|e| matches!(
            e,
            SessionEvent::ConnectionRejected { reason } if reason == "host closed the connection"
        )));
    }

    #[test]
    fn joiner_cannot_host_operations() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7004);
        let mut alice = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);
        assert_eq!(alice.start_game(1), Err(MeshError::NotHosting));
        assert_eq!(alice.kick("host"), Err(MeshError::NotHosting));
        assert!(matches!(
            host.kick("nobody"),
            Err(MeshError::UnknownPeer { .. })
        ));
    }

    #[test]
    fn tick_before_start_does_nothing() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7005);
        assert!(!host.tick(&[1]).unwrap());
        assert_eq!(host.advance_frame(), FrameAdvance::NotStarted);
        assert_eq!(host.current_frame(), Frame::NULL);
    }

    #[test]
    fn tick_respects_pending_limit() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7006);
        let mut alice = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);
        host.start_game(5).unwrap();

        assert!(host.tick(&[1]).unwrap());
        assert!(!host.tick(&[1]).unwrap());
        assert_eq!(host.pending_frames(), 1);
        assert_eq!(
            host.advance_frame(),
            FrameAdvance::Stalled {
                waiting_on: vec!["alice".to_owned()]
            }
        );
        assert!(matches!(
            host.start_game(5),
            Err(MeshError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn oversized_game_data_is_refused() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7007);
        host.start_game(1).unwrap();
        let bytes = vec![0u8; ProtocolConfig::default().max_frame_size + 1];
        assert!(matches!(
            host.send_game_data(&bytes),
            Err(MeshError::InvalidRequest { info }) if info.contains("max_frame_size")
        ));
    }

    #[test]
    fn event_queue_drops_oldest_when_full() {
        let network = MemoryNetwork::new();
        let observer = Arc::new(CollectingObserver::new());
        let config = ProtocolConfig {
            event_queue_size: 2,
            ..ProtocolConfig::default()
        };
        let mut host = SessionBuilder::new("host")
            .with_protocol_config(config)
            .with_violation_observer(observer.clone())
            .start_hosting(network, 7008)
            .unwrap();
        for text in ["a", "b", "c"] {
            host.send_chat(text).unwrap();
        }
        let texts: Vec<String> = host
            .events()
            .filter_map(|e| match e {
                SessionEvent::Chat { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert!(observer.has_violation(ViolationKind::EventQueue));
    }

    #[test]
    fn server_message_from_a_joiner_is_ignored() {
        let network = MemoryNetwork::new();
        let observer = Arc::new(CollectingObserver::new());
        let mut host = SessionBuilder::new("host")
            .with_violation_observer(observer.clone())
            .start_hosting(network.clone(), 7009)
            .unwrap();
        let mut alice = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);

        let handle = alice.host_peer.unwrap();
        let start = Message::from_payload(&StartGame { seed: 9 }).unwrap();
        assert!(alice.send_message(handle, &start));
        pump(&mut [&mut host], 1);
        assert!(!host.is_in_game());
        assert!(observer.has_violation(ViolationKind::Handshake));
    }

    fn batch_bytes(events: EventBatch) -> Vec<u8> {
        Message::from_payload(&GameData { events }).unwrap().payload
    }

    /// Host, alice and bob, all connected to each other.
    fn trio(network: &MemoryNetwork, port: u16) -> (P2PSession, P2PSession, P2PSession) {
        let mut host = host(network, port);
        let mut alice = join(network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);
        let mut bob = join(network, "bob", &host);
        pump(&mut [&mut host, &mut alice, &mut bob], 3);
        for session in [&host, &alice, &bob] {
            assert_eq!(session.roster().len(), 2, "{}", session.local_name());
        }
        (host, alice, bob)
    }

    #[test]
    fn peer_connect_ahead_of_the_announcement_is_held() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7010);
        let mut alice = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);

        // The host admits bob and bob dials alice, all before alice reads anything.
        let mut bob = join(&network, "bob", &host);
        pump(&mut [&mut host, &mut bob], 1);

        // Alice reads bob's connection ahead of the host's announcement.
        alice.accept_connections();
        let inbound = *alice.registry.handles().last().unwrap();
        assert_ne!(Some(inbound), alice.host_peer);
        alice.drain_peer(inbound);
        assert_eq!(alice.peer_state("bob"), Some(PeerState::Pending));
        assert!(alice.roster().iter().all(|r| r.name != "bob"));
        assert_eq!(alice.events().count(), 0);
        alice.check_invariants().unwrap();

        let events: Vec<_> = alice.poll_once().collect();
        assert!(events.contains(&SessionEvent::PlayerJoined {
            name: "bob".to_owned()
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerConnected { peer } if peer.name == "bob")));
        assert_eq!(alice.peer_state("bob"), Some(PeerState::LoggedIn));
        assert_eq!(alice.registry.len(), 2);

        pump(&mut [&mut bob], 1);
        assert_eq!(bob.peer_state("alice"), Some(PeerState::LoggedIn));
        alice.check_invariants().unwrap();
        bob.check_invariants().unwrap();
    }

    #[test]
    fn batch_ahead_of_the_start_is_consumed_at_frame_zero() {
        let network = MemoryNetwork::new();
        let (mut host, mut alice, mut bob) = trio(&network, 7011);
        host.start_game(5).unwrap();
        pump(&mut [&mut alice], 1);
        assert!(alice.tick(&[2]).unwrap());

        // Bob reads alice's batch before the host's start message.
        let from_alice = bob.registry.by_name("alice").unwrap();
        bob.drain_peer(from_alice);
        assert!(!bob.is_in_game());
        assert_eq!(bob.early_batches.len(), 1);

        pump(&mut [&mut bob], 1);
        assert!(bob.is_in_game());
        assert!(bob.early_batches.is_empty());
        assert_eq!(bob.sync.peer_frames("alice").map(|f| f.len()), Some(1));

        assert!(host.tick(&[1]).unwrap());
        assert!(bob.tick(&[3]).unwrap());
        pump(&mut [&mut host, &mut alice, &mut bob], 2);
        for session in [&mut host, &mut alice, &mut bob] {
            assert_eq!(
                session.advance_frame(),
                FrameAdvance::Advanced {
                    frame: Frame::new(1),
                    state: 11
                },
                "{}",
                session.local_name()
            );
        }
    }

    #[test]
    fn early_batches_are_capped_per_sender() {
        let network = MemoryNetwork::new();
        let observer = Arc::new(CollectingObserver::new());
        let mut host = host(&network, 7012);
        let mut alice = SessionBuilder::new("alice")
            .with_violation_observer(observer.clone())
            .connect(network.clone(), host.local_addr())
            .unwrap();
        pump(&mut [&mut host, &mut alice], 2);

        let from_host = alice.host_peer.unwrap();
        for _ in 0..3 {
            let message = Message::from_payload(&GameData {
                events: smallvec![GameEvent::state(0)],
            })
            .unwrap();
            alice.on_game_data(from_host, message).unwrap();
        }
        assert_eq!(
            alice.early_batches.len(),
            SyncConfig::default().max_pending_frames
        );
        assert_eq!(
            observer
                .violations_of_kind(ViolationKind::Synchronization)
                .len(),
            2
        );
    }

    #[test]
    fn game_data_is_the_frame_contribution() {
        let network = MemoryNetwork::new();
        let mut host = host(&network, 7013);
        let mut alice = join(&network, "alice", &host);
        pump(&mut [&mut host, &mut alice], 2);

        let valid = batch_bytes(smallvec![GameEvent::state(4), GameEvent::delta(6)]);
        assert_eq!(
            host.send_game_data(&valid),
            Err(MeshError::InvalidRequest {
                info: "no game is running".to_owned()
            })
        );

        host.start_game(4).unwrap();
        pump(&mut [&mut alice], 1);
        assert!(matches!(
            host.send_game_data(&batch_bytes(smallvec![GameEvent::delta(6)])),
            Err(MeshError::InvalidRequest { .. })
        ));
        assert_eq!(host.pending_frames(), 0);

        host.send_game_data(&valid).unwrap();
        assert_eq!(host.pending_frames(), 1);
        assert!(!host.tick(&[100]).unwrap());
        assert!(matches!(
            host.send_game_data(&valid),
            Err(MeshError::InvalidRequest { .. })
        ));

        assert!(alice.tick(&[1]).unwrap());
        let events = pump(&mut [&mut host, &mut alice], 2);
        assert_eq!(
            count_game_data(&events[1]),
            1,
            "alice sees exactly one batch from the host"
        );
        for session in [&mut host, &mut alice] {
            assert_eq!(
                session.advance_frame(),
                FrameAdvance::Advanced {
                    frame: Frame::new(1),
                    state: 11
                }
            );
        }
    }

    fn count_game_data(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::GameDataArrived { .. }))
            .count()
    }
}
