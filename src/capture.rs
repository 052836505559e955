//! Body capture state machine shared by request and response views.
//!
//! Each exchange owns one [`StateCell`] per message. Policy (`with_body` / `without_body`)
//! and mechanics (`expose`, the first access to the body) are independent triggers; the
//! first body access decides, once, whether the exchange is buffered or passed through.
//!
//! | Phase      | with_body  | without_body | expose    |
//! |------------|------------|--------------|-----------|
//! | Unbuffered | Offering   | -            | Passing   |
//! | Offering   | -          | Unbuffered   | Buffering |
//! | Passing    | -          | -            | -         |
//! | Buffering  | -          | Ignoring     | -         |
//! | Ignoring   | Buffering  | -            | -         |

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// Capture phase of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// No policy decision and no body access yet
    Unbuffered = 0,
    /// Policy asked for the body; nothing has been exposed yet
    Offering = 1,
    /// The raw stream was handed out before anyone asked for the body
    Passing = 2,
    /// Body bytes go through the buffer and are reported as the logged body
    Buffering = 3,
    /// Body bytes still go through the buffer but are not reported
    Ignoring = 4,
}

impl Phase {
    pub fn with_body(self) -> Self {
        match self {
            Phase::Unbuffered => Phase::Offering,
            Phase::Ignoring => Phase::Buffering,
            other => other,
        }
    }

    pub fn without_body(self) -> Self {
        match self {
            Phase::Offering => Phase::Unbuffered,
            Phase::Buffering => Phase::Ignoring,
            other => other,
        }
    }

    pub fn expose(self) -> Self {
        match self {
            Phase::Unbuffered => Phase::Passing,
            Phase::Offering => Phase::Buffering,
            other => other,
        }
    }

    /// A buffering read failed; nothing may claim a successful capture afterwards.
    pub(crate) fn abandon(self) -> Self {
        match self {
            Phase::Buffering | Phase::Ignoring => Phase::Passing,
            other => other,
        }
    }

    /// True once the buffer for this exchange exists.
    pub fn is_buffered(self) -> bool {
        matches!(self, Phase::Buffering | Phase::Ignoring)
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Phase::Unbuffered,
            1 => Phase::Offering,
            2 => Phase::Passing,
            3 => Phase::Buffering,
            _ => Phase::Ignoring,
        }
    }
}

/// Point-in-time view of a [`StateCell`], carrying the buffer where one exists.
#[derive(Debug)]
pub enum CaptureState<'a, T> {
    Unbuffered,
    Offering,
    Passing,
    Buffering(&'a T),
    Ignoring(&'a T),
}

impl<'a, T> CaptureState<'a, T> {
    pub fn phase(&self) -> Phase {
        match self {
            CaptureState::Unbuffered => Phase::Unbuffered,
            CaptureState::Offering => Phase::Offering,
            CaptureState::Passing => Phase::Passing,
            CaptureState::Buffering(_) => Phase::Buffering,
            CaptureState::Ignoring(_) => Phase::Ignoring,
        }
    }

    /// The buffer, whether or not it is currently reported as the body.
    pub fn buffer(&self) -> Option<&'a T> {
        match self {
            CaptureState::Buffering(buffer) | CaptureState::Ignoring(buffer) => Some(*buffer),
            _ => None,
        }
    }
}

/// Atomically updated capture phase plus the lazily allocated buffer it guards.
///
/// Every transition is a compare-and-swap over [`Phase`] using the pure transition
/// functions above, so concurrent callers on the same exchange each observe a complete
/// transition. The buffer is allocated at most once, by whichever caller first needs it
/// after the phase reached `Buffering`.
#[derive(Debug)]
pub struct StateCell<T> {
    phase: AtomicU8,
    buffer: OnceLock<T>,
}

impl<T: Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> StateCell<T> {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Unbuffered as u8),
            buffer: OnceLock::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Current state without triggering any transition.
    pub fn load(&self) -> CaptureState<'_, T> {
        self.snapshot(self.phase())
    }

    pub fn with_body(&self) -> Phase {
        self.transition(Phase::with_body)
    }

    pub fn without_body(&self) -> Phase {
        self.transition(Phase::without_body)
    }

    /// Records a body access. Idempotent: only the first call can move the cell out of
    /// `Unbuffered`/`Offering`, later calls return whatever that decided.
    pub fn expose(&self) -> CaptureState<'_, T> {
        let phase = self.transition(Phase::expose);
        self.snapshot(phase)
    }

    pub(crate) fn abandon(&self) -> Phase {
        self.transition(Phase::abandon)
    }

    fn transition(&self, step: fn(Phase) -> Phase) -> Phase {
        let previous = match self.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            Some(step(Phase::from_raw(raw)) as u8)
        }) {
            Ok(raw) | Err(raw) => raw,
        };
        step(Phase::from_raw(previous))
    }

    fn snapshot(&self, phase: Phase) -> CaptureState<'_, T> {
        match phase {
            Phase::Unbuffered => CaptureState::Unbuffered,
            Phase::Offering => CaptureState::Offering,
            Phase::Passing => CaptureState::Passing,
            Phase::Buffering => CaptureState::Buffering(self.buffer.get_or_init(T::default)),
            Phase::Ignoring => CaptureState::Ignoring(self.buffer.get_or_init(T::default)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const ALL: [Phase; 5] = [
        Phase::Unbuffered,
        Phase::Offering,
        Phase::Passing,
        Phase::Buffering,
        Phase::Ignoring,
    ];

    #[test]
    fn test_transition_table() {
        use Phase::*;
        let expected = [
            (Unbuffered, Offering, Unbuffered, Passing),
            (Offering, Offering, Unbuffered, Buffering),
            (Passing, Passing, Passing, Passing),
            (Buffering, Buffering, Ignoring, Buffering),
            (Ignoring, Buffering, Ignoring, Ignoring),
        ];
        for (from, with, without, expose) in expected {
            assert_eq!(from.with_body(), with, "with_body from {from:?}");
            assert_eq!(from.without_body(), without, "without_body from {from:?}");
            assert_eq!(from.expose(), expose, "expose from {from:?}");
        }
    }

    #[test]
    fn test_only_last_policy_call_matters() {
        let sequences: Vec<Vec<bool>> = vec![
            vec![],
            vec![true],
            vec![false],
            vec![true, false],
            vec![false, true],
            vec![true, true, false, true],
            vec![true, false, false],
            vec![false, false, true, true],
        ];
        for calls in sequences {
            let cell: StateCell<Vec<u8>> = StateCell::new();
            for &with in &calls {
                if with {
                    cell.with_body();
                } else {
                    cell.without_body();
                }
            }
            let expected = if calls.last().copied().unwrap_or(false) {
                Phase::Buffering
            } else {
                Phase::Passing
            };
            assert_eq!(cell.expose().phase(), expected, "calls {calls:?}");
        }
    }

    #[test]
    fn test_expose_before_policy_freezes_passing() {
        let cell: StateCell<Vec<u8>> = StateCell::new();
        assert_eq!(cell.expose().phase(), Phase::Passing);
        cell.with_body();
        assert_eq!(cell.expose().phase(), Phase::Passing);
        assert!(cell.load().buffer().is_none());
    }

    #[test]
    fn test_buffer_survives_toggling() {
        let cell: StateCell<Arc<()>> = StateCell::new();
        cell.with_body();
        let first = cell.expose().buffer().cloned().unwrap();

        assert_eq!(cell.without_body(), Phase::Ignoring);
        let ignoring = cell.expose().buffer().cloned().unwrap();
        assert_eq!(cell.with_body(), Phase::Buffering);
        let buffering = cell.expose().buffer().cloned().unwrap();

        assert!(Arc::ptr_eq(&first, &ignoring));
        assert!(Arc::ptr_eq(&first, &buffering));
    }

    #[test]
    fn test_transitions_are_total() {
        for phase in ALL {
            for step in [Phase::with_body, Phase::without_body, Phase::expose] {
                assert!(ALL.contains(&step(phase)));
            }
        }
        assert_eq!(Phase::Buffering.abandon(), Phase::Passing);
        assert_eq!(Phase::Offering.abandon(), Phase::Offering);
    }

    static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct Tracked;

    impl Default for Tracked {
        fn default() -> Self {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
            Tracked
        }
    }

    #[test]
    fn test_concurrent_expose_allocates_once() {
        let cell: Arc<StateCell<Tracked>> = Arc::new(StateCell::new());
        cell.with_body();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.expose().phase())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Phase::Buffering);
        }
        assert_eq!(ALLOCATIONS.load(Ordering::SeqCst), 1);
    }
}
