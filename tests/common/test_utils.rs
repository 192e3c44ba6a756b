//! Shared test utilities for integration tests.
//!
//! Most session tests run on a [`MemoryNetwork`]: every [`Mesh`] owns its own hub, so fixed
//! ports never collide between tests running in parallel.

use lockstep_mesh::{
    FrameAdvance, MemoryNetwork, P2PSession, PeerState, ProtocolConfig, SessionBuilder,
    SessionEvent, SyncConfig,
};
use std::thread;
use std::time::Duration;

/// Maximum poll rounds to wait for a condition before giving up.
pub const MAX_POLL_ROUNDS: usize = 200;

/// Sleep between poll rounds on real sockets.
#[allow(dead_code)]
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Routes `tracing` output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A host plus any number of joiners on one in-memory network.
///
/// `sessions[0]` is always the host. Events produced while pumping are collected per session in
/// `events` until a test takes them.
#[allow(dead_code)]
pub struct Mesh {
    pub network: MemoryNetwork,
    pub sessions: Vec<P2PSession>,
    pub events: Vec<Vec<SessionEvent>>,
}

#[allow(dead_code)]
impl Mesh {
    /// Starts a host named `host` on `port`.
    pub fn host(port: u16) -> Self {
        Self::host_with(SessionBuilder::new("host"), port)
    }

    /// Starts a host from a prepared builder.
    pub fn host_with(builder: SessionBuilder, port: u16) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let host = builder
            .start_hosting(network.clone(), port)
            .expect("host should start");
        Self {
            network,
            sessions: vec![host],
            events: vec![Vec::new()],
        }
    }

    /// Builds a host and lets every name in `joiners` join, then waits for a full mesh.
    pub fn connected(port: u16, joiners: &[&str]) -> Self {
        Self::connected_with(port, joiners, SyncConfig::default())
    }

    /// Like [`Mesh::connected`], with a sync configuration for every participant.
    pub fn connected_with(port: u16, joiners: &[&str], sync: SyncConfig) -> Self {
        let mut mesh = Self::host_with(SessionBuilder::new("host").with_sync_config(sync), port);
        for name in joiners {
            mesh.join_with(SessionBuilder::new(*name).with_sync_config(sync));
        }
        mesh.pump_until(Mesh::fully_connected)
            .expect("mesh should connect");
        mesh
    }

    /// Adds a joiner named `name` with default configuration. Returns its index.
    pub fn join(&mut self, name: &str) -> usize {
        self.join_with(SessionBuilder::new(name))
    }

    /// Adds a joiner with a custom protocol configuration. Returns its index.
    pub fn join_with_protocol(&mut self, name: &str, config: ProtocolConfig) -> usize {
        self.join_with(SessionBuilder::new(name).with_protocol_config(config))
    }

    /// Adds a joiner from a prepared builder. Returns its index.
    pub fn join_with(&mut self, builder: SessionBuilder) -> usize {
        let host_addr = self.sessions[0].local_addr();
        let joiner = builder
            .connect(self.network.clone(), host_addr)
            .expect("joiner should reach the host");
        self.sessions.push(joiner);
        self.events.push(Vec::new());
        self.sessions.len() - 1
    }

    /// Polls every session `rounds` times, in index order.
    pub fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for (session, events) in self.sessions.iter_mut().zip(self.events.iter_mut()) {
                events.extend(session.poll_once());
            }
        }
    }

    /// Pumps until `condition` holds. Returns the rounds it took.
    pub fn pump_until(&mut self, condition: impl Fn(&Mesh) -> bool) -> Result<usize, String> {
        for round in 0..MAX_POLL_ROUNDS {
            if condition(self) {
                return Ok(round);
            }
            self.pump(1);
        }
        Err(format!(
            "condition not reached after {MAX_POLL_ROUNDS} rounds; rosters: {:?}",
            self.sessions
                .iter()
                .map(|s| (s.local_name().to_owned(), s.roster()))
                .collect::<Vec<_>>()
        ))
    }

    /// Whether every session knows every other one and has logged in with all of them.
    pub fn fully_connected(&self) -> bool {
        let expected = self.sessions.len() - 1;
        self.sessions.iter().all(|session| {
            let roster = session.roster();
            roster.len() == expected
                && roster
                    .iter()
                    .all(|record| session.peer_state(&record.name) == Some(PeerState::LoggedIn))
        })
    }

    /// Starts the game on the host and waits until every session runs it.
    pub fn start_game(&mut self, seed: i32) {
        self.sessions[0].start_game(seed).expect("host starts the game");
        self.pump_until(|mesh| mesh.sessions.iter().all(P2PSession::is_in_game))
            .expect("every participant should start");
    }

    /// Runs one lockstep frame: session `i` ticks `deltas[i]`, then everyone pumps and advances
    /// until the frame is consumed everywhere.
    pub fn run_frame(&mut self, deltas: &[&[i32]]) -> Result<(), String> {
        for (session, ticked) in self.sessions.iter_mut().zip(deltas) {
            let submitted = session.tick(ticked).map_err(|e| e.to_string())?;
            if !submitted {
                return Err(format!("{} refused to tick", session.local_name()));
            }
        }
        let mut advanced = vec![false; self.sessions.len()];
        for _ in 0..MAX_POLL_ROUNDS {
            self.pump(1);
            for (done, session) in advanced.iter_mut().zip(self.sessions.iter_mut()) {
                if !*done {
                    *done = matches!(session.advance_frame(), FrameAdvance::Advanced { .. });
                }
            }
            if advanced.iter().all(|done| *done) {
                return Ok(());
            }
        }
        Err(format!("frame not consumed everywhere: {advanced:?}"))
    }

    /// Takes the events collected for session `index`.
    pub fn take_events(&mut self, index: usize) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events[index])
    }

    /// Sorted names a session sees, itself included.
    pub fn known_names(&self, index: usize) -> Vec<String> {
        let session = &self.sessions[index];
        let mut names: Vec<String> = session.roster().into_iter().map(|r| r.name).collect();
        names.push(session.local_name().to_owned());
        names.sort();
        names
    }
}

/// Number of events satisfying `predicate`.
#[allow(dead_code)]
pub fn count_matching(events: &[SessionEvent], predicate: impl Fn(&SessionEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}

/// `(username, text)` of every relayed chat line, in order.
#[allow(dead_code)]
pub fn chat_lines(events: &[SessionEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Chat { username, text } => Some((username.clone(), text.clone())),
            _ => None,
        })
        .collect()
}

/// Polls `sessions` with a short sleep between rounds until `condition` holds. For real sockets.
#[allow(dead_code)]
pub fn poll_with_sleep(
    sessions: &mut [&mut P2PSession],
    events: &mut [Vec<SessionEvent>],
    condition: impl Fn(&[&mut P2PSession]) -> bool,
) -> Result<usize, String> {
    for round in 0..MAX_POLL_ROUNDS * 5 {
        if condition(sessions) {
            return Ok(round);
        }
        for (session, collected) in sessions.iter_mut().zip(events.iter_mut()) {
            collected.extend(session.poll_once());
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err("condition not reached on real sockets".to_owned())
}
