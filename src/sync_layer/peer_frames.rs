use std::collections::VecDeque;

use web_time::Instant;

use crate::frame_info::EventBatch;

/// Inbox of one remote participant's batches, one per frame, strictly FIFO.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, Default)]
pub struct PeerFrameState {
    frame_events: VecDeque<EventBatch>,
    /// When the barrier first found this inbox empty, if it still is.
    waiting_since: Option<Instant>,
    batches_received: u64,
}

impl PeerFrameState {
    /// Creates an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the batch for the next frame.
    pub fn enqueue(&mut self, batch: EventBatch) {
        self.frame_events.push_back(batch);
        self.batches_received += 1;
    }

    /// Takes the oldest batch.
    pub fn pop(&mut self) -> Option<EventBatch> {
        self.frame_events.pop_front()
    }

    /// Number of queued batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame_events.len()
    }

    /// Whether the barrier would have to wait on this participant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame_events.is_empty()
    }

    /// Total batches ever enqueued.
    #[must_use]
    pub fn batches_received(&self) -> u64 {
        self.batches_received
    }

    /// Records that the barrier is waiting on this participant and returns since when.
    pub(crate) fn note_waiting(&mut self, now: Instant) -> Instant {
        *self.waiting_since.get_or_insert(now)
    }

    pub(crate) fn clear_waiting(&mut self) {
        self.waiting_since = None;
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
    use smallvec::smallvec;
    use web_time::Duration;

    #[test]
    fn batches_come_out_in_order() {
        let mut state = PeerFrameState::new();
        state.enqueue(smallvec![GameEvent::state(1)]);
        state.enqueue(smallvec![GameEvent::state(2), GameEvent::delta(5)]);
        assert_eq!(state.len(), 2);
        assert_eq!(state.pop().unwrap()[0], GameEvent::state(1));
        assert_eq!(state.pop().unwrap().len(), 2);
        assert!(state.pop().is_none());
        assert!(state.is_empty());
        assert_eq!(state.batches_received(), 2);
    }

    #[test]
    fn waiting_keeps_the_first_instant() {
        let mut state = PeerFrameState::new();
        let start = Instant::now();
        assert_eq!(state.note_waiting(start), start);
        assert_eq!(state.note_waiting(start + Duration::from_secs(1)), start);
        state.clear_waiting();
        let later = start + Duration::from_secs(2);
        assert_eq!(state.note_waiting(later), later);
    }
}
