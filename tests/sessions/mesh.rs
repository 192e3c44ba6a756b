//! Mesh formation and roster propagation tests.

use crate::common::{count_matching, Mesh};
use lockstep_mesh::{PeerState, SessionEvent};

#[test]
fn every_participant_sees_the_same_roster() {
    let mesh = Mesh::connected(7100, &["alice", "bob", "carol"]);
    let expected = vec!["alice", "bob", "carol", "host"];
    for index in 0..mesh.sessions.len() {
        assert_eq!(mesh.known_names(index), expected, "session {index}");
    }
}

#[test]
fn host_roster_keeps_join_order() {
    let mesh = Mesh::connected(7110, &["zed", "amy", "kim"]);
    let names: Vec<_> = mesh.sessions[0]
        .roster()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["zed", "amy", "kim"]);
}

#[test]
fn roster_addresses_point_at_listeners() {
    let mesh = Mesh::connected(7120, &["alice", "bob"]);
    let alice_listen = mesh.sessions[1].local_addr().port();
    for index in [0, 2] {
        let record = mesh.sessions[index]
            .roster()
            .into_iter()
            .find(|r| r.name == "alice")
            .unwrap();
        assert_eq!(record.addr.port(), alice_listen, "seen from session {index}");
        assert!(record.addr.ip().is_loopback());
    }
}

#[test]
fn joiners_connect_to_each_other_directly() {
    let mut mesh = Mesh::connected(7130, &["alice", "bob"]);
    let alice = mesh.take_events(1);
    let bob = mesh.take_events(2);

    // alice learns about bob from the host, then bob dials in.
    assert!(alice.contains(&SessionEvent::PlayerJoined {
        name: "bob".to_owned()
    }));
    assert!(alice
        .iter()
        .any(|e| matches!(e, SessionEvent::PeerConnected { peer } if peer.name == "bob")));
    // bob finds alice in the roster it was sent.
    assert!(bob.iter().any(|e| matches!(
        e,
        SessionEvent::JoinedGame { roster } if roster.iter().any(|r| r.name == "alice")
    )));
    assert!(bob
        .iter()
        .any(|e| matches!(e, SessionEvent::PeerConnected { peer } if peer.name == "alice")));
    assert_eq!(mesh.sessions[1].peer_state("bob"), Some(PeerState::LoggedIn));
    assert_eq!(mesh.sessions[2].peer_state("alice"), Some(PeerState::LoggedIn));
}

#[test]
fn dialing_sends_punch_probes() {
    let mesh = Mesh::connected(7140, &["alice", "bob"]);
    let alice_addr = mesh.sessions[1].local_addr();
    let probes = mesh.network.punches_to(alice_addr);
    assert!(!probes.is_empty());
    assert_eq!(&probes[0][..4], b"PUNC");
    assert_eq!(&probes[0][5..], b"bob");
}

#[test]
fn departure_is_seen_by_everyone() {
    let mut mesh = Mesh::connected(7150, &["alice", "bob", "carol"]);
    for index in 0..mesh.sessions.len() {
        mesh.take_events(index);
    }
    let carol = mesh.sessions.pop().unwrap();
    mesh.events.pop();
    drop(carol);
    mesh.pump(2);

    for index in 0..mesh.sessions.len() {
        let events = mesh.take_events(index);
        assert_eq!(
            count_matching(&events, |e| *e
                == SessionEvent::Disconnected {
                    name: "carol".to_owned()
                }),
            1,
            "session {index}"
        );
        assert!(mesh.sessions[index].peer_state("carol").is_none());
    }
}

#[test]
fn late_joiner_meets_everyone() {
    let mut mesh = Mesh::connected(7160, &["alice"]);
    mesh.join("bob");
    mesh.pump_until(Mesh::fully_connected).unwrap();
    mesh.join("carol");
    mesh.pump_until(Mesh::fully_connected).unwrap();
    assert_eq!(mesh.known_names(3), vec!["alice", "bob", "carol", "host"]);
}
