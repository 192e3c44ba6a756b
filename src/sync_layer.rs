//! # Sync Layer - Lockstep Core
//!
//! Keeps every participant's simulation advancing through the same frames with the same
//! accumulated state, and finds the participants that disagree.
//!
//! ## One Frame
//!
//! 1. **Submit**: the local side turns its pending deltas into one batch: a `GameState` entry
//!    carrying the current state, then the deltas. The batch is sent to every participant in the
//!    sync set and archived locally together with the state it was built from.
//! 2. **Collect**: batches from remote participants land in their [`PeerFrameState`] inbox.
//! 3. **Barrier**: the frame may only be consumed once the local archive and every inbox hold at
//!    least one batch. Otherwise the engine reports who it is waiting on and changes nothing.
//! 4. **Consume**: the local batch is replayed first (its `GameState` must match the archived
//!    state), then one batch per participant. A `GameState` entry that disagrees with the
//!    archived state marks that participant divergent. It is dropped from the sync set, but the
//!    deltas in the batch that exposed it are still applied.
//!
//! ```text
//! ┌────────────┐ submit   ┌─────────────────┐
//! │ local tick │ ───────► │ local archive   │──┐
//! └────────────┘          └─────────────────┘  │   every queue non-empty?
//! ┌────────────┐ enqueue  ┌─────────────────┐  ├──► consume one batch each
//! │ PeerGameData│ ──────► │ PeerFrameState  │──┘    compare GameState
//! └────────────┘          └─────────────────┘       fold GameEvent deltas
//! ```
//!
//! All arithmetic on the state wraps, so every participant computes the same value no matter how
//! large the deltas get.

mod peer_frames;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::Instant;

pub use peer_frames::PeerFrameState;

use crate::frame_info::{EventBatch, GameEvent, GameEventKind};
use crate::rng::Pcg32;
use crate::sessions::config::SyncConfig;
use crate::telemetry::{
    report_to_observer, InvariantChecker, InvariantViolation, SpecViolation, ViolationKind,
    ViolationObserver, ViolationSeverity,
};
use crate::{debug_check_invariants, report_violation_to, Frame, FrameAdvance};

/// A participant whose reported state disagreed with ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// The participant.
    pub peer: String,
    /// The frame being consumed when the disagreement was found.
    pub frame: Frame,
    /// The state we archived for that frame.
    pub expected: i32,
    /// The state the participant reported.
    pub reported: i32,
}

/// Everything one call to [`SyncLayer::try_advance`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Whether the frame advanced.
    pub advance: FrameAdvance,
    /// Participants dropped from the sync set for disagreeing. The session must evict them.
    pub diverged: Vec<Divergence>,
    /// Participants dropped for stalling past the configured timeout.
    pub timed_out: Vec<String>,
}

/// The lockstep engine for one local participant.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct SyncLayer {
    local_name: String,
    config: SyncConfig,
    running: bool,
    rng: Pcg32,
    current_state: i32,
    current_frame: Frame,
    /// The sync set. Keying the inboxes by name keeps exactly one inbox per participant.
    other_peers: BTreeMap<String, PeerFrameState>,
    local_pending_events: EventBatch,
    local_frame_events: VecDeque<EventBatch>,
    local_states: VecDeque<i32>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("local_name", &self.local_name)
            .field("running", &self.running)
            .field("current_state", &self.current_state)
            .field("current_frame", &self.current_frame)
            .field("other_peers", &self.other_peers)
            .field("local_pending_events", &self.local_pending_events)
            .field("local_frame_events", &self.local_frame_events.len())
            .finish_non_exhaustive()
    }
}

impl SyncLayer {
    /// Creates a stopped engine.
    #[must_use]
    pub fn new(local_name: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            local_name: local_name.into(),
            config,
            running: false,
            rng: Pcg32::from_game_seed(0),
            current_state: 0,
            current_frame: Frame::NULL,
            other_peers: BTreeMap::new(),
            local_pending_events: EventBatch::new(),
            local_frame_events: VecDeque::new(),
            local_states: VecDeque::new(),
            violation_observer: None,
        }
    }

    /// Routes the engine's violations to `observer` instead of `tracing`.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.violation_observer = observer;
        self
    }

    /// Starts lockstep accounting: state and generator are seeded with `seed`, the frame counter
    /// restarts at zero and the sync set becomes `peers` (the local name is skipped).
    pub fn start(&mut self, seed: i32, peers: impl IntoIterator<Item = String>) {
        self.running = true;
        self.rng = Pcg32::from_game_seed(seed);
        self.current_state = seed;
        self.current_frame = Frame::new(0);
        self.local_pending_events.clear();
        self.local_frame_events.clear();
        self.local_states.clear();
        self.other_peers.clear();
        for name in peers {
            self.add_peer(name);
        }
        info!(
            seed,
            peers = self.other_peers.len(),
            "lockstep started"
        );
        debug_check_invariants!(self, "SyncLayer::start");
    }

    /// Stops accounting and drops every queue.
    pub fn stop(&mut self) {
        self.running = false;
        self.current_frame = Frame::NULL;
        self.other_peers.clear();
        self.local_pending_events.clear();
        self.local_frame_events.clear();
        self.local_states.clear();
    }

    /// Adds a participant to the sync set with an empty inbox. Returns `false` for the local
    /// name or a participant already present.
    pub fn add_peer(&mut self, name: String) -> bool {
        if name == self.local_name || self.other_peers.contains_key(&name) {
            return false;
        }
        self.other_peers.insert(name, PeerFrameState::new());
        true
    }

    /// Drops a participant and its inbox. Returns whether it was present.
    pub fn remove_peer(&mut self, name: &str) -> bool {
        let removed = self.other_peers.remove(name).is_some();
        if removed {
            debug!(peer = name, "removed from sync set");
        }
        removed
    }

    /// Whether a game is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The accumulated state.
    #[must_use]
    pub fn current_state(&self) -> i32 {
        self.current_state
    }

    /// The frame about to be consumed, or [`Frame::NULL`] when stopped.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The generator seeded from the game seed.
    pub fn rng(&mut self) -> &mut Pcg32 {
        &mut self.rng
    }

    /// Names in the sync set, ordered.
    pub fn other_peers(&self) -> impl Iterator<Item = &str> + '_ {
        self.other_peers.keys().map(String::as_str)
    }

    /// Whether `name` is in the sync set.
    #[must_use]
    pub fn contains_peer(&self, name: &str) -> bool {
        self.other_peers.contains_key(name)
    }

    /// The inbox of `name`.
    #[must_use]
    pub fn peer_frames(&self, name: &str) -> Option<&PeerFrameState> {
        self.other_peers.get(name)
    }

    /// Local batches submitted but not yet consumed.
    #[must_use]
    pub fn pending_local(&self) -> usize {
        self.local_frame_events.len()
    }

    /// Queues a delta for the next local batch.
    pub fn push_local_event(&mut self, delta: i32) {
        self.local_pending_events.push(GameEvent::delta(delta));
    }

    /// Builds the next local batch from the queued deltas plus `deltas`, archives it along with
    /// the current state, and returns it for sending.
    pub fn submit_local(&mut self, deltas: &[i32]) -> EventBatch {
        for delta in deltas {
            self.push_local_event(*delta);
        }
        let mut batch = EventBatch::with_capacity(self.local_pending_events.len() + 1);
        batch.push(GameEvent::state(self.current_state));
        batch.extend(self.local_pending_events.drain(..));
        self.local_frame_events.push_back(batch.clone());
        self.local_states.push_back(self.current_state);
        trace!(
            frame = %self.current_frame,
            events = batch.len(),
            "local batch submitted"
        );
        batch
    }

    /// Archives `batch`, built by the caller, as the next local contribution. Returns `false` and
    /// archives nothing unless the batch opens with a `GameState` entry.
    pub fn submit_batch(&mut self, batch: EventBatch) -> bool {
        if batch.first().map(|event| event.kind) != Some(GameEventKind::GameState) {
            return false;
        }
        trace!(
            frame = %self.current_frame,
            events = batch.len(),
            "prebuilt local batch submitted"
        );
        self.local_frame_events.push_back(batch);
        self.local_states.push_back(self.current_state);
        true
    }

    /// Appends `batch` to the inbox of `name`. Returns `false`, leaving the batch unused, when
    /// `name` is not in the sync set.
    pub fn enqueue(&mut self, name: &str, batch: EventBatch) -> bool {
        match self.other_peers.get_mut(name) {
            Some(state) => {
                state.enqueue(batch);
                true
            },
            None => false,
        }
    }

    /// Tries to consume one frame.
    ///
    /// `now` is only used for the stall timeout.
    pub fn try_advance(&mut self, now: Instant) -> SyncOutcome {
        let mut outcome = SyncOutcome {
            advance: FrameAdvance::NotStarted,
            diverged: Vec::new(),
            timed_out: Vec::new(),
        };
        if !self.running {
            return outcome;
        }

        if let Some(timeout) = self.config.stall_timeout {
            let mut expired = Vec::new();
            for (name, state) in &mut self.other_peers {
                if state.is_empty() {
                    let since = state.note_waiting(now);
                    if now.saturating_duration_since(since) >= timeout {
                        expired.push(name.clone());
                    }
                } else {
                    state.clear_waiting();
                }
            }
            for name in expired {
                self.other_peers.remove(&name);
                self.report_sync_error(
                    self.current_frame,
                    format!(
                        "{} stalled frame {} past {:?} and was evicted",
                        name, self.current_frame, timeout
                    ),
                );
                outcome.timed_out.push(name);
            }
        }

        let mut waiting_on: Vec<String> = self
            .other_peers
            .iter()
            .filter(|(_, state)| state.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if self.local_frame_events.is_empty() {
            waiting_on.insert(0, self.local_name.clone());
        }
        if !waiting_on.is_empty() {
            trace!(frame = %self.current_frame, ?waiting_on, "frame stalled");
            outcome.advance = FrameAdvance::Stalled { waiting_on };
            return outcome;
        }

        let (Some(expected), Some(local_batch)) =
            (self.local_states.pop_front(), self.local_frame_events.pop_front())
        else {
            // Both queues are pushed together, so this is bookkeeping gone wrong.
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "local archive and local states are out of step at frame {}",
                self.current_frame
            );
            outcome.advance = FrameAdvance::Stalled {
                waiting_on: vec![self.local_name.clone()],
            };
            return outcome;
        };

        let frame = self.current_frame;
        let mut state = self.current_state;

        for event in &local_batch {
            match event.kind {
                GameEventKind::GameState if event.value != expected => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Synchronization,
                        "local batch for frame {} carries state {} but the engine was at {}",
                        frame,
                        event.value,
                        expected
                    );
                },
                GameEventKind::GameState => {},
                GameEventKind::GameEvent => state = state.wrapping_add(event.value),
            }
        }

        for (name, inbox) in &mut self.other_peers {
            inbox.clear_waiting();
            let Some(batch) = inbox.pop() else {
                continue;
            };
            let mut reported_mismatch = false;
            for event in &batch {
                match event.kind {
                    GameEventKind::GameState => {
                        if event.value != expected && !reported_mismatch {
                            reported_mismatch = true;
                            outcome.diverged.push(Divergence {
                                peer: name.clone(),
                                frame,
                                expected,
                                reported: event.value,
                            });
                        }
                    },
                    GameEventKind::GameEvent => state = state.wrapping_add(event.value),
                }
            }
        }

        for divergence in &outcome.diverged {
            self.other_peers.remove(&divergence.peer);
            self.report_sync_error(
                divergence.frame,
                format!(
                    "{} reported state {} at frame {}, expected {}",
                    divergence.peer, divergence.reported, divergence.frame, divergence.expected
                ),
            );
        }

        self.current_state = state;
        self.current_frame += 1;
        outcome.advance = FrameAdvance::Advanced {
            frame: self.current_frame,
            state,
        };
        debug_check_invariants!(self, "SyncLayer::try_advance");
        outcome
    }

    /// Reports an eviction, tagged with the frame it happened at.
    fn report_sync_error(&self, frame: Frame, message: String) {
        let violation = SpecViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Synchronization,
            message,
            concat!(file!(), ":", line!()),
        )
        .with_frame(frame);
        report_to_observer(self.violation_observer.as_ref(), &violation);
    }
}

impl InvariantChecker for SyncLayer {
    /// # Invariants
    ///
    /// 1. The local archive and the archived states have the same length.
    /// 2. The local name is never in the sync set.
    /// 3. While running, `current_frame` is non-negative.
    /// 4. While stopped, nothing is queued.
    /// 5. Every archived local batch starts with a `GameState` entry.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.local_frame_events.len() != self.local_states.len() {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "local archive and local states differ in length",
            )
            .with_details(format!(
                "local_frame_events.len()={}, local_states.len()={}",
                self.local_frame_events.len(),
                self.local_states.len()
            )));
        }

        if self.other_peers.contains_key(&self.local_name) {
            return Err(
                InvariantViolation::new("SyncLayer", "local name is in the sync set")
                    .with_details(self.local_name.clone()),
            );
        }

        if self.running && !self.current_frame.is_valid() {
            return Err(
                InvariantViolation::new("SyncLayer", "current_frame must be non-negative")
                    .with_details(format!("current_frame={}", self.current_frame)),
            );
        }

        if !self.running && (!self.local_frame_events.is_empty() || !self.other_peers.is_empty()) {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "stopped engine still holds queued frames",
            ));
        }

        if let Some(index) = self
            .local_frame_events
            .iter()
            .position(|batch| batch.first().map(|e| e.kind) != Some(GameEventKind::GameState))
        {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "archived local batch does not start with a GameState",
            )
            .with_details(format!("index={index}")));
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod sync_layer_tests {
    use super::*;
    use crate::telemetry::CollectingObserver;
    use smallvec::smallvec;
    use web_time::Duration;

    fn started(local: &str, seed: i32, peers: &[&str]) -> SyncLayer {
        let mut layer = SyncLayer::new(local, SyncConfig::default());
        layer.start(seed, peers.iter().map(|p| (*p).to_owned()));
        layer
    }

    fn batch(state: i32, deltas: &[i32]) -> EventBatch {
        let mut batch: EventBatch = smallvec![GameEvent::state(state)];
        batch.extend(deltas.iter().map(|d| GameEvent::delta(*d)));
        batch
    }

    fn advanced_state(outcome: &SyncOutcome) -> i32 {
        match outcome.advance {
            FrameAdvance::Advanced { state, .. } => state,
            ref other => panic!("expected advance, got {other:?}"),
        }
    }

    #[test]
    fn not_started_reports_not_started() {
        let mut layer = SyncLayer::new("me", SyncConfig::default());
        assert_eq!(layer.try_advance(Instant::now()).advance, FrameAdvance::NotStarted);
        assert_eq!(layer.current_frame(), Frame::NULL);
    }

    #[test]
    fn start_seeds_state_and_skips_self() {
        let layer = started("me", 42, &["me", "bob", "alice"]);
        assert_eq!(layer.current_state(), 42);
        assert_eq!(layer.current_frame(), Frame::new(0));
        assert_eq!(layer.other_peers().collect::<Vec<_>>(), vec!["alice", "bob"]);
        layer.check_invariants().unwrap();
    }

    #[test]
    fn submitted_batch_starts_with_current_state() {
        let mut layer = started("me", 10, &[]);
        layer.push_local_event(4);
        let sent = layer.submit_local(&[1, 2]);
        assert_eq!(
            sent.as_slice(),
            &[
                GameEvent::state(10),
                GameEvent::delta(4),
                GameEvent::delta(1),
                GameEvent::delta(2)
            ]
        );
        assert_eq!(layer.pending_local(), 1);
    }

    #[test]
    fn prebuilt_batch_counts_as_the_local_contribution() {
        let mut layer = started("me", 10, &["bob"]);
        assert!(!layer.submit_batch(smallvec![GameEvent::delta(1)]));
        assert_eq!(layer.pending_local(), 0);

        assert!(layer.submit_batch(batch(10, &[3])));
        assert_eq!(layer.pending_local(), 1);
        layer.enqueue("bob", batch(10, &[1]));
        assert_eq!(advanced_state(&layer.try_advance(Instant::now())), 14);
        layer.check_invariants().unwrap();
    }

    #[test]
    fn advances_once_per_round_of_batches() {
        let mut layer = started("me", 0, &["a", "b"]);
        for round in 0..5 {
            let state = layer.current_state();
            layer.submit_local(&[1]);
            assert!(layer.enqueue("a", batch(state, &[2])));
            assert!(layer.enqueue("b", batch(state, &[3])));

            let outcome = layer.try_advance(Instant::now());
            assert_eq!(advanced_state(&outcome), state + 6);
            assert_eq!(layer.current_frame(), Frame::new(round + 1));

            let again = layer.try_advance(Instant::now());
            assert!(matches!(again.advance, FrameAdvance::Stalled { .. }));
        }
        assert_eq!(layer.current_state(), 30);
    }

    #[test]
    fn missing_batch_stalls_without_mutation() {
        let mut layer = started("me", 7, &["a", "b"]);
        layer.submit_local(&[1]);
        layer.enqueue("a", batch(7, &[1]));

        let outcome = layer.try_advance(Instant::now());
        assert_eq!(
            outcome.advance,
            FrameAdvance::Stalled {
                waiting_on: vec!["b".to_owned()]
            }
        );
        assert_eq!(layer.current_state(), 7);
        assert_eq!(layer.current_frame(), Frame::new(0));
        assert_eq!(layer.peer_frames("a").unwrap().len(), 1);
        assert_eq!(layer.pending_local(), 1);
    }

    #[test]
    fn local_side_is_waited_on_too() {
        let mut layer = started("me", 0, &["a"]);
        layer.enqueue("a", batch(0, &[]));
        assert_eq!(
            layer.try_advance(Instant::now()).advance,
            FrameAdvance::Stalled {
                waiting_on: vec!["me".to_owned()]
            }
        );
    }

    #[test]
    fn divergent_peer_is_evicted_but_its_deltas_apply() {
        let observer = Arc::new(CollectingObserver::new());
        let mut layer = started("me", 100, &["good", "liar"])
            .with_violation_observer(Some(observer.clone()));
        layer.submit_local(&[]);
        layer.enqueue("good", batch(100, &[1]));
        layer.enqueue("liar", batch(999, &[10]));

        let outcome = layer.try_advance(Instant::now());
        assert_eq!(advanced_state(&outcome), 111);
        assert_eq!(
            outcome.diverged,
            vec![Divergence {
                peer: "liar".to_owned(),
                frame: Frame::new(0),
                expected: 100,
                reported: 999,
            }]
        );
        assert!(!layer.contains_peer("liar"));
        assert!(observer.has_violation(ViolationKind::Synchronization));

        // Nothing from the evicted participant is consumed again.
        assert!(!layer.enqueue("liar", batch(111, &[50])));
        layer.submit_local(&[]);
        layer.enqueue("good", batch(111, &[]));
        assert_eq!(advanced_state(&layer.try_advance(Instant::now())), 111);
    }

    #[test]
    fn state_wraps_instead_of_overflowing() {
        let mut layer = started("me", i32::MAX, &[]);
        layer.submit_local(&[1]);
        assert_eq!(advanced_state(&layer.try_advance(Instant::now())), i32::MIN);
    }

    #[test]
    fn stall_timeout_evicts_the_silent_peer() {
        let mut layer = SyncLayer::new(
            "me",
            SyncConfig {
                stall_timeout: Some(Duration::from_secs(5)),
                ..SyncConfig::default()
            },
        );
        layer.start(0, ["quiet".to_owned(), "chatty".to_owned()]);
        let t0 = Instant::now();
        layer.submit_local(&[1]);
        layer.enqueue("chatty", batch(0, &[2]));

        let first = layer.try_advance(t0);
        assert!(matches!(first.advance, FrameAdvance::Stalled { .. }));
        assert!(first.timed_out.is_empty());

        let later = layer.try_advance(t0 + Duration::from_secs(5));
        assert_eq!(later.timed_out, vec!["quiet".to_owned()]);
        assert_eq!(advanced_state(&later), 3);
        assert!(!layer.contains_peer("quiet"));
    }

    #[test]
    fn evictions_are_reported_with_their_frame() {
        let observer = Arc::new(CollectingObserver::new());
        let mut layer = SyncLayer::new(
            "me",
            SyncConfig {
                stall_timeout: Some(Duration::from_secs(1)),
                ..SyncConfig::default()
            },
        )
        .with_violation_observer(Some(observer.clone()));
        layer.start(7, ["liar".to_owned(), "quiet".to_owned()]);
        let t0 = Instant::now();

        layer.submit_local(&[]);
        layer.enqueue("liar", batch(8, &[]));
        layer.enqueue("quiet", batch(7, &[]));
        assert_eq!(layer.try_advance(t0).diverged.len(), 1);

        layer.submit_local(&[]);
        assert!(matches!(layer.try_advance(t0).advance, FrameAdvance::Stalled { .. }));
        let later = layer.try_advance(t0 + Duration::from_secs(1));
        assert_eq!(later.timed_out, vec!["quiet".to_owned()]);

        let frames: Vec<_> = observer
            .violations_of_kind(ViolationKind::Synchronization)
            .iter()
            .map(|v| v.frame)
            .collect();
        assert_eq!(frames, vec![Some(Frame::new(0)), Some(Frame::new(1))]);
    }

    #[test]
    fn without_timeout_a_silent_peer_stalls_forever() {
        let mut layer = started("me", 0, &["quiet"]);
        layer.submit_local(&[]);
        let t0 = Instant::now();
        let outcome = layer.try_advance(t0 + Duration::from_secs(3600));
        assert!(outcome.timed_out.is_empty());
        assert!(matches!(outcome.advance, FrameAdvance::Stalled { .. }));
    }

    #[test]
    fn removing_a_peer_releases_the_barrier() {
        let mut layer = started("me", 0, &["gone"]);
        layer.submit_local(&[5]);
        assert!(matches!(
            layer.try_advance(Instant::now()).advance,
            FrameAdvance::Stalled { .. }
        ));
        assert!(layer.remove_peer("gone"));
        assert!(!layer.remove_peer("gone"));
        assert_eq!(advanced_state(&layer.try_advance(Instant::now())), 5);
    }

    #[test]
    fn three_engines_converge() {
        let names = ["host", "p1", "p2"];
        let mut engines: Vec<SyncLayer> = names
            .iter()
            .map(|me| started(me, 42, &names))
            .collect();

        for _ in 0..3 {
            let batches: Vec<(usize, EventBatch)> = engines
                .iter_mut()
                .enumerate()
                .map(|(i, e)| {
                    let deltas: &[i32] = if i == 0 { &[1, 2] } else { &[] };
                    (i, e.submit_local(deltas))
                })
                .collect();
            for (from, sent) in &batches {
                for (to, engine) in engines.iter_mut().enumerate() {
                    if to != *from {
                        assert!(engine.enqueue(names[*from], sent.clone()));
                    }
                }
            }
            for engine in &mut engines {
                let outcome = engine.try_advance(Instant::now());
                assert!(outcome.diverged.is_empty());
            }
        }

        for engine in &engines {
            assert_eq!(engine.current_state(), 51);
            assert_eq!(engine.current_frame(), Frame::new(3));
        }
    }

    #[test]
    fn rng_is_seeded_from_the_game_seed() {
        let mut a = started("a", 9, &[]);
        let mut b = started("b", 9, &[]);
        assert_eq!(a.rng().next_u32(), b.rng().next_u32());
    }

    #[test]
    fn stop_clears_everything() {
        let mut layer = started("me", 1, &["a"]);
        layer.submit_local(&[1]);
        layer.stop();
        assert!(!layer.is_running());
        assert_eq!(layer.pending_local(), 0);
        assert_eq!(layer.other_peers().count(), 0);
        layer.check_invariants().unwrap();
    }
}
