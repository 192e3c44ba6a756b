//! Sessions over [`TcpNetwork`] on loopback.

use crate::common::{init_tracing, poll_with_sleep};
use lockstep_mesh::{
    FrameAdvance, P2PSession, PeerState, SessionBuilder, SessionEvent, TcpNetwork,
};
use serial_test::serial;
use std::net::{Ipv4Addr, SocketAddr};

fn loopback(session: &P2PSession) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, session.local_addr().port()))
}

fn fully_connected(sessions: &[&mut P2PSession]) -> bool {
    sessions.iter().all(|session| {
        let roster = session.roster();
        roster.len() == sessions.len() - 1
            && roster
                .iter()
                .all(|record| session.peer_state(&record.name) == Some(PeerState::LoggedIn))
    })
}

fn start_mesh() -> (P2PSession, P2PSession, P2PSession) {
    init_tracing();
    let host = SessionBuilder::new("host")
        .start_hosting(TcpNetwork::new(), 0)
        .unwrap();
    let alice = SessionBuilder::new("alice")
        .connect(TcpNetwork::new(), loopback(&host))
        .unwrap();
    let bob = SessionBuilder::new("bob")
        .connect(TcpNetwork::new(), loopback(&host))
        .unwrap();
    (host, alice, bob)
}

#[test]
#[serial]
fn mesh_forms_over_tcp() {
    let (mut host, mut alice, mut bob) = start_mesh();
    let mut events = vec![Vec::new(), Vec::new(), Vec::new()];
    let mut sessions = [&mut host, &mut alice, &mut bob];
    poll_with_sleep(&mut sessions, &mut events, fully_connected).unwrap();

    assert!(events[1]
        .iter()
        .any(|e| matches!(e, SessionEvent::JoinedGame { roster } if roster[0].name == "host")));
    let bob_seen_by_alice = alice
        .roster()
        .into_iter()
        .find(|r| r.name == "bob")
        .unwrap();
    assert_eq!(bob_seen_by_alice.addr.port(), bob.local_addr().port());
}

#[test]
#[serial]
fn lockstep_game_over_tcp() {
    let (mut host, mut alice, mut bob) = start_mesh();
    let mut events = vec![Vec::new(), Vec::new(), Vec::new()];
    {
        let mut sessions = [&mut host, &mut alice, &mut bob];
        poll_with_sleep(&mut sessions, &mut events, fully_connected).unwrap();
    }

    host.start_game(42).unwrap();
    {
        let mut sessions = [&mut host, &mut alice, &mut bob];
        poll_with_sleep(&mut sessions, &mut events, |s| {
            s.iter().all(|session| session.is_in_game())
        })
        .unwrap();
    }

    for _ in 0..3 {
        assert!(host.tick(&[1, 2]).unwrap());
        assert!(alice.tick(&[]).unwrap());
        assert!(bob.tick(&[]).unwrap());
        let mut advanced = [false; 3];
        let mut sessions = [&mut host, &mut alice, &mut bob];
        for _ in 0..1000 {
            for (done, session) in advanced.iter_mut().zip(sessions.iter_mut()) {
                let _ = session.poll_once();
                if !*done {
                    *done = matches!(session.advance_frame(), FrameAdvance::Advanced { .. });
                }
            }
            if advanced.iter().all(|done| *done) {
                break;
            }
            std::thread::sleep(crate::common::POLL_INTERVAL);
        }
        assert_eq!(advanced, [true; 3]);
    }

    for session in [&host, &alice, &bob] {
        assert_eq!(session.current_state(), 51, "{}", session.local_name());
    }
}
