//! Join handshake integration tests.

use crate::common::{count_matching, Mesh};
use lockstep_mesh::telemetry::CollectingObserver;
use lockstep_mesh::{MeshError, PeerState, ProtocolConfig, SessionBuilder, SessionEvent};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

#[test]
fn joiner_receives_roster_and_host_announces_it() {
    let mut mesh = Mesh::host(7000);
    let alice = mesh.join("alice");
    mesh.pump_until(Mesh::fully_connected).unwrap();

    let host_events = mesh.take_events(0);
    assert!(host_events.contains(&SessionEvent::PlayerJoined {
        name: "alice".to_owned()
    }));
    assert_eq!(
        count_matching(&host_events, |e| matches!(e, SessionEvent::PeerConnected { .. })),
        1
    );

    let joined: Vec<_> = mesh
        .take_events(alice)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::JoinedGame { roster } => Some(roster),
            _ => None,
        })
        .collect();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0][0].name, "host");
    assert_eq!(mesh.sessions[alice].peer_state("host"), Some(PeerState::LoggedIn));
}

#[test]
fn version_mismatch_is_denied_and_not_listed() {
    let mut mesh = Mesh::host(7010);
    let config = ProtocolConfig {
        protocol_version: 2,
        ..ProtocolConfig::default()
    };
    let old = mesh.join_with_protocol("old-client", config);
    mesh.pump(3);

    let rejected: Vec<String> = mesh
        .take_events(old)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionRejected { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].contains("version"), "reason was {}", rejected[0]);
    assert!(mesh.sessions[0].roster().is_empty());
    assert!(mesh.sessions[old].roster().is_empty());
    assert!(!mesh
        .take_events(0)
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerJoined { .. })));
}

#[test]
fn join_after_start_is_denied() {
    let mut mesh = Mesh::connected(7020, &["alice"]);
    mesh.start_game(1);
    let late = mesh.join("late");
    mesh.pump(3);

    assert!(mesh.take_events(late).iter().any(|e| matches!(
        e,
        SessionEvent::ConnectionRejected { reason } if reason.contains("in progress")
    )));
    assert_eq!(mesh.sessions[0].roster().len(), 1);
}

#[test]
fn admission_sees_name_tag_and_address() {
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let builder = SessionBuilder::new("host").with_admission(Box::new(
        move |name: &str, tag: &str, addr: SocketAddr| {
            recorder.lock().push((name.to_owned(), tag.to_owned()));
            addr.ip().is_loopback() && name != "mallory"
        },
    ));
    let mut mesh = Mesh::host_with(builder, 7030);
    mesh.join("alice");
    let mallory = mesh.join("mallory");
    mesh.pump(4);

    assert_eq!(
        *seen.lock(),
        vec![
            ("alice".to_owned(), "lockstep-mesh".to_owned()),
            ("mallory".to_owned(), "lockstep-mesh".to_owned()),
        ]
    );
    let names: Vec<_> = mesh.sessions[0].roster().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["alice"]);
    assert!(mesh.sessions[mallory].roster().is_empty());
    // alice never hears about mallory
    assert!(mesh.sessions[1].roster().iter().all(|r| r.name != "mallory"));
}

#[test]
fn host_loss_clears_the_roster() {
    let mut mesh = Mesh::connected(7040, &["alice", "bob"]);
    mesh.take_events(1);
    let host = mesh.sessions.remove(0);
    mesh.events.remove(0);
    drop(host);
    mesh.pump(2);

    let events = mesh.take_events(0);
    assert!(events.contains(&SessionEvent::Disconnected {
        name: "host".to_owned()
    }));
    assert!(mesh.sessions[0].roster().is_empty());
    assert!(mesh.sessions[0].peer_state("bob").is_none());
}

#[test]
fn clean_handshake_reports_no_violations() {
    let observer = Arc::new(CollectingObserver::new());
    let builder = SessionBuilder::new("host").with_violation_observer(observer.clone());
    let mut mesh = Mesh::host_with(builder, 7050);
    mesh.join("alice");
    mesh.join("bob");
    mesh.pump_until(Mesh::fully_connected).unwrap();

    mesh.sessions[1].send_chat("hello").unwrap();
    mesh.pump(2);
    assert!(mesh.take_events(0).contains(&SessionEvent::Chat {
        username: "alice".to_owned(),
        text: "hello".to_owned(),
    }));
    assert!(observer.is_empty(), "{:?}", observer.violations());
    assert_eq!(mesh.sessions[1].start_game(3), Err(MeshError::NotHosting));
}
