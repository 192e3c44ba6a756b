use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::SessionEvent;

/// Iterator over the events a session has queued, oldest first.
///
/// Returned by [`P2PSession::poll_once`] and [`P2PSession::events`]. Events not consumed before
/// the drain is dropped are discarded, like any `VecDeque` drain.
///
/// ```ignore
/// for event in session.poll_once() {
///     if let SessionEvent::Chat { username, text } = event {
///         println!("<{username}> {text}");
///     }
/// }
/// ```
///
/// [`P2PSession::poll_once`]: crate::P2PSession::poll_once
/// [`P2PSession::events`]: crate::P2PSession::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, SessionEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(inner: Drain<'a, SessionEvent>) -> Self {
        Self { inner }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
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
    use std::collections::VecDeque;

    fn joined(name: &str) -> SessionEvent {
        SessionEvent::PlayerJoined {
            name: name.to_owned(),
        }
    }

    fn queue() -> VecDeque<SessionEvent> {
        ["a", "b", "c"].into_iter().map(joined).collect()
    }

    #[test]
    fn yields_in_queue_order_and_empties_the_queue() {
        let mut queue = queue();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![joined("a"), joined("b"), joined("c")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn double_ended_and_exact_size() {
        let mut queue = queue();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.next_back(), Some(joined("c")));
        assert_eq!(drain.next(), Some(joined("a")));
        assert_eq!(drain.size_hint(), (1, Some(1)));
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 1 }");
        assert_eq!(drain.next(), Some(joined("b")));
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }
}
