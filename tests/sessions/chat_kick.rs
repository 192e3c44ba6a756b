//! Chat relay, direct messages and kicks.

use crate::common::{chat_lines, count_matching, Mesh};
use lockstep_mesh::{MeshError, SessionEvent};

#[test]
fn chat_is_relayed_to_everyone_including_the_author() {
    let mut mesh = Mesh::connected(7300, &["alice", "bob"]);
    for index in 0..mesh.sessions.len() {
        mesh.take_events(index);
    }
    mesh.sessions[1].send_chat("gl hf").unwrap();
    mesh.pump(3);

    let expected = vec![("alice".to_owned(), "gl hf".to_owned())];
    for index in 0..mesh.sessions.len() {
        assert_eq!(chat_lines(&mesh.take_events(index)), expected, "session {index}");
    }
}

#[test]
fn host_chat_is_seen_locally_at_once() {
    let mut mesh = Mesh::connected(7310, &["alice"]);
    mesh.take_events(0);
    mesh.take_events(1);
    mesh.sessions[0].send_chat("welcome").unwrap();

    let local: Vec<_> = mesh.sessions[0].events().collect();
    assert_eq!(
        chat_lines(&local),
        vec![("host".to_owned(), "welcome".to_owned())]
    );
    mesh.pump(2);
    assert_eq!(
        chat_lines(&mesh.take_events(1)),
        vec![("host".to_owned(), "welcome".to_owned())]
    );
}

#[test]
fn chat_keeps_its_order() {
    let mut mesh = Mesh::connected(7320, &["alice"]);
    mesh.take_events(0);
    for line in ["one", "two", "three"] {
        mesh.sessions[1].send_chat(line).unwrap();
    }
    mesh.pump(3);
    let texts: Vec<_> = chat_lines(&mesh.take_events(0))
        .into_iter()
        .map(|(_, text)| text)
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
}

#[test]
fn whisper_reaches_only_its_target() {
    let mut mesh = Mesh::connected(7330, &["alice", "bob"]);
    for index in 0..mesh.sessions.len() {
        mesh.take_events(index);
    }
    mesh.sessions[1].whisper("bob", "psst").unwrap();
    mesh.pump(3);

    assert!(mesh.take_events(2).contains(&SessionEvent::DirectChat {
        from: "alice".to_owned(),
        text: "psst".to_owned(),
    }));
    for index in [0, 1] {
        assert_eq!(
            count_matching(&mesh.take_events(index), |e| matches!(
                e,
                SessionEvent::DirectChat { .. } | SessionEvent::Chat { .. }
            )),
            0,
            "session {index}"
        );
    }
}

#[test]
fn whisper_to_a_stranger_fails() {
    let mut mesh = Mesh::connected(7340, &["alice"]);
    assert_eq!(
        mesh.sessions[1].whisper("nobody", "hello?"),
        Err(MeshError::UnknownPeer {
            name: "nobody".to_owned()
        })
    );
}

#[test]
fn kicked_participant_is_told_and_forgotten() {
    let mut mesh = Mesh::connected(7350, &["alice", "bob"]);
    for index in 0..mesh.sessions.len() {
        mesh.take_events(index);
    }
    mesh.sessions[0].kick("bob").unwrap();
    mesh.pump(3);

    let kicked = SessionEvent::PlayerKicked {
        name: "bob".to_owned(),
    };
    for index in 0..mesh.sessions.len() {
        assert_eq!(
            count_matching(&mesh.take_events(index), |e| *e == kicked),
            1,
            "session {index}"
        );
    }
    assert!(mesh.sessions[2].roster().is_empty());
    for index in [0, 1] {
        assert!(mesh.sessions[index].peer_state("bob").is_none());
        assert!(mesh.sessions[index].roster().iter().all(|r| r.name != "bob"));
    }
    assert_eq!(
        mesh.sessions[2].send_chat("let me back in"),
        Err(MeshError::InvalidRequest {
            info: "not admitted by a host".to_owned()
        })
    );
}

#[test]
fn only_the_host_kicks() {
    let mut mesh = Mesh::connected(7360, &["alice", "bob"]);
    assert_eq!(mesh.sessions[1].kick("bob"), Err(MeshError::NotHosting));
    assert_eq!(
        mesh.sessions[0].kick("carol"),
        Err(MeshError::UnknownPeer {
            name: "carol".to_owned()
        })
    );
}

#[test]
fn game_goes_on_after_a_kick() {
    let mut mesh = Mesh::connected(7370, &["alice", "bob"]);
    mesh.start_game(5);
    mesh.run_frame(&[&[1], &[1], &[1]]).unwrap();

    mesh.sessions[0].kick("bob").unwrap();
    mesh.pump(3);
    mesh.sessions.truncate(2);
    mesh.events.truncate(2);
    assert_eq!(mesh.sessions[0].sync_peers(), vec!["alice"]);
    assert_eq!(mesh.sessions[1].sync_peers(), vec!["host"]);

    mesh.run_frame(&[&[2], &[2]]).unwrap();
    for session in &mesh.sessions {
        assert_eq!(session.current_state(), 12);
        assert_eq!(session.current_frame(), lockstep_mesh::Frame::new(2));
    }
}
