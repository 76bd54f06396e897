use std::sync::atomic::{AtomicU8, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Lifecycle state of a [crate::channel::Channel], and aggregate state of a
///  [crate::connection::Connection].
///
/// The numeric order is significant: everything below [State::Closing] is usable, and
///  transitions only ever move 'up'.
///
/// ```ascii
/// Opening -> Open                        (server role)
/// Opening -> Connecting -> Connected     (client role)
/// any of the above -> Closing -> Closed
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum State {
    Opening,
    Open,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl State {
    pub fn is_usable(self) -> bool {
        self < State::Closing
    }
}

/// A [State] that can be read and updated without locking
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: State) -> AtomicState {
        AtomicState(AtomicU8::new(state.into()))
    }

    pub fn load(&self) -> State {
        State::try_from(self.0.load(Ordering::Acquire))
            .unwrap_or(State::Closed)
    }

    /// Moves from `from` to `to` if the current state is `from`, returning whether the
    ///  transition took place
    pub fn transition(&self, from: State, to: State) -> bool {
        self.0.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to [State::Closing] unless the state is already closing or closed. Returns `true`
    ///  if this call performed the transition.
    pub fn begin_closing(&self) -> bool {
        self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            if raw < u8::from(State::Closing) {
                Some(State::Closing.into())
            }
            else {
                None
            }
        }).is_ok()
    }

    /// Moves to [State::Closed], returning `true` unless the state was closed already
    pub fn finish_closing(&self) -> bool {
        self.0.swap(State::Closed.into(), Ordering::AcqRel) != u8::from(State::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::opening(State::Opening, true)]
    #[case::open(State::Open, true)]
    #[case::connecting(State::Connecting, true)]
    #[case::connected(State::Connected, true)]
    #[case::closing(State::Closing, false)]
    #[case::closed(State::Closed, false)]
    fn test_is_usable(#[case] state: State, #[case] expected: bool) {
        assert_eq!(state.is_usable(), expected);
    }

    #[test]
    fn test_transition() {
        let state = AtomicState::new(State::Opening);
        assert!(!state.transition(State::Connecting, State::Connected));
        assert_eq!(state.load(), State::Opening);

        assert!(state.transition(State::Opening, State::Connecting));
        assert_eq!(state.load(), State::Connecting);
    }

    #[rstest]
    #[case::opening(State::Opening, true, State::Closing)]
    #[case::connected(State::Connected, true, State::Closing)]
    #[case::closing(State::Closing, false, State::Closing)]
    #[case::closed(State::Closed, false, State::Closed)]
    fn test_begin_closing(#[case] initial: State, #[case] expected_result: bool, #[case] expected_state: State) {
        let state = AtomicState::new(initial);
        assert_eq!(state.begin_closing(), expected_result);
        assert_eq!(state.load(), expected_state);
    }

    #[test]
    fn test_finish_closing() {
        let state = AtomicState::new(State::Closing);
        assert!(state.finish_closing());
        assert!(!state.finish_closing());
        assert_eq!(state.load(), State::Closed);
    }
}
