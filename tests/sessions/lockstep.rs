//! Lockstep integration tests.

use crate::common::{count_matching, Mesh};
use lockstep_mesh::telemetry::InvariantChecker;
use lockstep_mesh::{Frame, FrameAdvance, MeshError, SessionEvent, SyncConfig};
use std::time::Duration;

/// A `PeerGameData` payload carrying only a state entry of `state`.
fn bogus_batch(state: i32) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1i32.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&state.to_le_bytes());
    bytes
}

#[test]
fn three_participants_reach_the_same_state() {
    let mut mesh = Mesh::connected(7200, &["alice", "bob"]);
    mesh.start_game(42);
    for _ in 0..3 {
        mesh.run_frame(&[&[1, 2], &[], &[]]).unwrap();
    }
    for session in &mesh.sessions {
        assert_eq!(session.current_state(), 51, "{}", session.local_name());
        assert_eq!(session.current_frame(), Frame::new(3));
    }
}

#[test]
fn everyone_contributes_deltas() {
    let mut mesh = Mesh::connected(7210, &["alice", "bob"]);
    mesh.start_game(-10);
    mesh.run_frame(&[&[5], &[-3], &[100]]).unwrap();
    mesh.run_frame(&[&[], &[7], &[]]).unwrap();
    for session in &mesh.sessions {
        assert_eq!(session.current_state(), -10 + 5 - 3 + 100 + 7);
    }
}

#[test]
fn state_wraps_identically_everywhere() {
    let mut mesh = Mesh::connected(7220, &["alice"]);
    mesh.start_game(i32::MAX);
    mesh.run_frame(&[&[1], &[1]]).unwrap();
    for session in &mesh.sessions {
        assert_eq!(session.current_state(), i32::MIN.wrapping_add(1));
    }
}

#[test]
fn barrier_waits_for_every_participant() {
    let mut mesh = Mesh::connected(7230, &["alice", "bob"]);
    mesh.start_game(1);
    assert!(mesh.sessions[0].tick(&[1]).unwrap());
    assert!(mesh.sessions[1].tick(&[]).unwrap());
    mesh.pump(3);

    match mesh.sessions[0].advance_frame() {
        FrameAdvance::Stalled { waiting_on } => assert_eq!(waiting_on, vec!["bob"]),
        other => panic!("expected a stall, got {other:?}"),
    }
    match mesh.sessions[2].advance_frame() {
        FrameAdvance::Stalled { waiting_on } => assert_eq!(waiting_on[0], "bob"),
        other => panic!("expected a stall, got {other:?}"),
    }
    assert_eq!(mesh.sessions[0].current_frame(), Frame::new(0));
    assert_eq!(mesh.sessions[0].current_state(), 1);

    assert!(mesh.sessions[2].tick(&[]).unwrap());
    mesh.pump(3);
    assert_eq!(
        mesh.sessions[0].advance_frame(),
        FrameAdvance::Advanced {
            frame: Frame::new(1),
            state: 2
        }
    );
}

#[test]
fn divergent_participant_is_evicted() {
    let mut mesh = Mesh::connected(7240, &["alice", "bob"]);
    mesh.start_game(7);
    assert!(mesh.sessions[0].tick(&[1]).unwrap());
    assert!(mesh.sessions[1].tick(&[2]).unwrap());
    mesh.sessions[2].send_game_data(&bogus_batch(999)).unwrap();
    mesh.pump(3);

    for index in [0, 1] {
        let advance = mesh.sessions[index].advance_frame();
        assert_eq!(
            advance,
            FrameAdvance::Advanced {
                frame: Frame::new(1),
                state: 10
            }
        );
        let mut events = mesh.take_events(index);
        events.extend(mesh.sessions[index].events());
        assert!(events.contains(&SessionEvent::PeerDiverged {
            name: "bob".to_owned(),
            frame: Frame::new(0),
            expected: 7,
            reported: 999,
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::GameDataArrived { peer, .. } if peer == "bob")));
        assert!(!mesh.sessions[index].sync_peers().contains(&"bob".to_owned()));
        assert!(mesh.sessions[index].peer_state("bob").is_none());
    }

    // The two that agree keep going without bob.
    mesh.sessions.truncate(2);
    mesh.events.truncate(2);
    mesh.run_frame(&[&[1], &[1]]).unwrap();
    assert_eq!(mesh.sessions[0].current_state(), 12);
    assert_eq!(mesh.sessions[1].current_state(), 12);
}

#[test]
fn divergent_host_ends_the_session() {
    let mut mesh = Mesh::connected(7280, &["alice", "bob"]);
    mesh.start_game(7);
    mesh.sessions[0].send_game_data(&bogus_batch(999)).unwrap();
    assert!(mesh.sessions[1].tick(&[1]).unwrap());
    assert!(mesh.sessions[2].tick(&[2]).unwrap());
    mesh.pump(3);

    let alice = &mut mesh.sessions[1];
    assert_eq!(
        alice.advance_frame(),
        FrameAdvance::Advanced {
            frame: Frame::new(1),
            state: 10
        }
    );
    let mut events = mesh.take_events(1);
    events.extend(mesh.sessions[1].events());
    assert!(events.contains(&SessionEvent::PeerDiverged {
        name: "host".to_owned(),
        frame: Frame::new(0),
        expected: 7,
        reported: 999,
    }));
    assert!(events.contains(&SessionEvent::Disconnected {
        name: "host".to_owned()
    }));

    let alice = &mut mesh.sessions[1];
    alice.check_invariants().unwrap();
    assert!(!alice.is_in_game());
    assert!(alice.roster().is_empty());
    assert!(alice.peer_state("bob").is_none());
    assert_eq!(
        alice.send_chat("anyone there?"),
        Err(MeshError::InvalidRequest {
            info: "not admitted by a host".to_owned()
        })
    );
}

#[test]
fn stalled_participant_times_out() {
    let sync = SyncConfig {
        stall_timeout: Some(Duration::from_millis(20)),
        ..SyncConfig::default()
    };
    let mut mesh = Mesh::connected_with(7250, &["alice", "bob"], sync);
    mesh.start_game(3);
    assert!(mesh.sessions[0].tick(&[]).unwrap());
    assert!(mesh.sessions[1].tick(&[]).unwrap());
    mesh.pump(3);

    assert!(matches!(
        mesh.sessions[0].advance_frame(),
        FrameAdvance::Stalled { .. }
    ));
    std::thread::sleep(Duration::from_millis(40));
    mesh.sessions[0].advance_frame();

    let events: Vec<_> = mesh.sessions[0].events().collect();
    assert_eq!(
        count_matching(&events, |e| *e
            == SessionEvent::PeerTimedOut {
                name: "bob".to_owned()
            }),
        1
    );
    assert_eq!(mesh.sessions[0].sync_peers(), vec!["alice"]);
}

#[test]
fn tick_is_refused_until_the_frame_is_consumed() {
    let mut mesh = Mesh::connected(7260, &["alice"]);
    assert!(!mesh.sessions[0].tick(&[1]).unwrap());
    mesh.start_game(0);
    assert!(mesh.sessions[0].tick(&[1]).unwrap());
    assert!(!mesh.sessions[0].tick(&[1]).unwrap());
    assert_eq!(mesh.sessions[0].pending_frames(), 1);
}

#[test]
fn seeded_generators_agree() {
    let mut mesh = Mesh::connected(7270, &["alice", "bob"]);
    mesh.start_game(1234);
    let draws: Vec<Vec<u32>> = mesh
        .sessions
        .iter_mut()
        .map(|s| (0..4).map(|_| s.rng().next_u32()).collect())
        .collect();
    assert_eq!(draws[0], draws[1]);
    assert_eq!(draws[1], draws[2]);
}
