//! Connection state machine for a single peer.
//!
//! # State Machine Diagram
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                       Peer Connection State Machine                      │
//! │                                                                          │
//! │  accepted inbound                         outbound connect attempt       │
//! │        │                                            │                    │
//! │        ▼                                            ▼                    │
//! │   ┌─────────┐                           ┌──────────────────────┐         │
//! │   │ Pending │                           │ AwaitingPunchThrough │         │
//! │   └────┬────┘                           └──────────┬───────────┘         │
//! │        │ valid join request                        │ handshake reply     │
//! │        │ or announced PeerConnect                  │ or server info      │
//! │        ▼                                            ▼                    │
//! │   ┌───────────────────────────────────────────────────────┐              │
//! │   │                       Connected                       │              │
//! │   └───────────────────────────┬───────────────────────────┘              │
//! │                               │ join accepted                            │
//! │                               ▼                                          │
//! │                          ┌──────────┐                                    │
//! │                          │ LoggedIn │                                    │
//! │                          └────┬─────┘                                    │
//! │                               │ kick, version mismatch, divergence,      │
//! │                               │ transport close (from any state)         │
//! │                               ▼                                          │
//! │                          ┌─────────┐                                     │
//! │                          │ Removed │                                     │
//! │                          └─────────┘                                     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## State Transitions
//!
//! | From                 | To        | Trigger                                       |
//! |----------------------|-----------|-----------------------------------------------|
//! | Pending              | Connected | valid `ClientJoinRequest` or `PeerConnect`    |
//! | AwaitingPunchThrough | Connected | `PeerConnect` reply or `ServerGameInformation` |
//! | Connected            | LoggedIn  | join accepted / handshake completed           |
//! | any                  | Removed   | kick, mismatch, divergence, transport close   |

/// Where a peer is in its connection lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// A transport was accepted but nothing about the remote side is verified yet.
    ///
    /// **Transition**: valid join request or announced `PeerConnect` → `Connected`
    Pending,

    /// An outbound attempt was made; reachability is not confirmed.
    ///
    /// The session keeps retrying the connection and the punch-through probe while a peer sits
    /// here.
    ///
    /// **Transition**: handshake reply → `Connected`
    AwaitingPunchThrough,

    /// Bidirectional transport verified, login not yet granted.
    ///
    /// **Transition**: join accepted → `LoggedIn`
    Connected,

    /// Roster-visible and eligible for game traffic.
    LoggedIn,

    /// Terminal. No further I/O is attempted.
    ///
    /// **Transition**: None (terminal state)
    Removed,
}

impl PeerState {
    /// Whether `self → next` is a legal edge of the machine.
    #[must_use]
    pub const fn can_transition_to(self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Pending, PeerState::Connected)
                | (PeerState::AwaitingPunchThrough, PeerState::Connected)
                | (PeerState::Connected, PeerState::LoggedIn)
                | (
                    PeerState::Pending
                        | PeerState::AwaitingPunchThrough
                        | PeerState::Connected
                        | PeerState::LoggedIn,
                    PeerState::Removed
                )
        )
    }

    /// Whether the peer has finished its handshake.
    #[must_use]
    pub const fn is_logged_in(self) -> bool {
        matches!(self, PeerState::LoggedIn)
    }

    /// Whether the peer is terminal.
    #[must_use]
    pub const fn is_removed(self) -> bool {
        matches!(self, PeerState::Removed)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Pending => "pending",
            PeerState::AwaitingPunchThrough => "awaiting punch-through",
            PeerState::Connected => "connected",
            PeerState::LoggedIn => "logged in",
            PeerState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PeerState; 5] = [
        PeerState::Pending,
        PeerState::AwaitingPunchThrough,
        PeerState::Connected,
        PeerState::LoggedIn,
        PeerState::Removed,
    ];

    #[test]
    fn forward_edges_are_legal() {
        assert!(PeerState::Pending.can_transition_to(PeerState::Connected));
        assert!(PeerState::AwaitingPunchThrough.can_transition_to(PeerState::Connected));
        assert!(PeerState::Connected.can_transition_to(PeerState::LoggedIn));
    }

    #[test]
    fn every_live_state_can_be_removed() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(PeerState::Removed),
                state != PeerState::Removed,
                "{state}"
            );
        }
    }

    #[test]
    fn removed_is_terminal() {
        for next in ALL {
            assert!(!PeerState::Removed.can_transition_to(next));
        }
    }

    #[test]
    fn login_cannot_skip_connected() {
        assert!(!PeerState::Pending.can_transition_to(PeerState::LoggedIn));
        assert!(!PeerState::AwaitingPunchThrough.can_transition_to(PeerState::LoggedIn));
        assert!(!PeerState::LoggedIn.can_transition_to(PeerState::Pending));
    }

    #[test]
    fn predicates() {
        assert!(PeerState::LoggedIn.is_logged_in());
        assert!(!PeerState::Connected.is_logged_in());
        assert!(PeerState::Removed.is_removed());
        assert!(!PeerState::Pending.is_removed());
    }
}
