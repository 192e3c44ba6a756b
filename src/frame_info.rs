use smallvec::SmallVec;

use crate::network::codec::CodecError;

/// What a [`GameEvent`] carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum GameEventKind {
    /// The sender's simulation state at the time the batch was produced.
    GameState,
    /// A delta to fold into the simulation state.
    GameEvent,
}

impl GameEventKind {
    /// The `i32` written on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            GameEventKind::GameState => 0,
            GameEventKind::GameEvent => 1,
        }
    }
}

impl TryFrom<i32> for GameEventKind {
    type Error = CodecError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(GameEventKind::GameState),
            1 => Ok(GameEventKind::GameEvent),
            _ => Err(CodecError::UnknownEventKind { code }),
        }
    }
}

/// One simulation input: either a state snapshot or a delta.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GameEvent {
    /// Snapshot or delta.
    pub kind: GameEventKind,
    /// The integer payload.
    pub value: i32,
}

impl GameEvent {
    /// A `GameState` snapshot of `value`.
    #[must_use]
    pub const fn state(value: i32) -> Self {
        Self {
            kind: GameEventKind::GameState,
            value,
        }
    }

    /// A `GameEvent` delta of `value`.
    #[must_use]
    pub const fn delta(value: i32) -> Self {
        Self {
            kind: GameEventKind::GameEvent,
            value,
        }
    }
}

/// All events one participant contributed to one frame, in the order they were produced.
///
/// A batch is normally one state snapshot plus a handful of deltas, so it lives on the stack.
pub type EventBatch = SmallVec<[GameEvent; 4]>;

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
    fn kind_codes_roundtrip() {
        for kind in [GameEventKind::GameState, GameEventKind::GameEvent] {
            assert_eq!(GameEventKind::try_from(kind.code()).unwrap(), kind);
        }
        assert_eq!(
            GameEventKind::try_from(-1),
            Err(CodecError::UnknownEventKind { code: -1 })
        );
    }

    #[test]
    fn constructors_set_the_kind() {
        assert_eq!(GameEvent::state(7).kind, GameEventKind::GameState);
        assert_eq!(GameEvent::delta(-3).kind, GameEventKind::GameEvent);
        assert_eq!(GameEvent::delta(-3).value, -3);
    }

    #[test]
    fn small_batches_stay_inline() {
        let batch: EventBatch = [GameEvent::state(1), GameEvent::delta(2)]
            .into_iter()
            .collect();
        assert!(!batch.spilled());
    }
}
