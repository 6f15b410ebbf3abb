/// Discrete-event simulation context
///
/// The context owns the logical clock and the pending event queue. Every
/// component receives a handle to it at construction instead of reaching
/// for shared global state. The simulation is single-threaded, so the
/// handle is an `Rc<RefCell<_>>`: cloning it shares the same clock.
///
/// Events are ordered by (time, priority, insertion sequence). At equal
/// timestamps scheduler events run before power transitions, so a
/// checkpoint write that lands at the exact instant the power drops is
/// treated as having landed.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;

use tracing::trace;

use crate::power::PowerState;

/// Simulated time in arbitrary units
pub type SimTime = f64;

/// What a pending event does when it fires
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EventKind {
    /// The power source switches to the given state
    PowerTransition(PowerState),
    /// The butterfly computation of a tessera has finished
    TesseraComputed { tessera: u32, epoch: u64 },
    /// The checkpoint write of a tessera lands in NVM
    CheckpointLanded { tessera: u32, epoch: u64 },
}

impl EventKind {
    fn priority(&self) -> u8 {
        match self {
            EventKind::TesseraComputed { .. } | EventKind::CheckpointLanded { .. } => 0,
            EventKind::PowerTransition(_) => 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub at: SimTime,
    pub sequence: u64,
    pub kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .total_cmp(&other.at)
            .then_with(|| self.kind.priority().cmp(&other.kind.priority()))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Default)]
struct ContextState {
    now: SimTime,
    next_sequence: u64,
    queue: BinaryHeap<Reverse<Event>>,
}

/// Shared handle to the simulation clock and event queue
#[derive(Clone, Debug, Default)]
pub struct SimContext {
    inner: Rc<RefCell<ContextState>>,
}

impl SimContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.inner.borrow().now
    }

    /// Schedules `kind` to fire at `at`, never earlier than the current time
    pub fn schedule_at(&self, at: SimTime, kind: EventKind) -> u64 {
        let mut state = self.inner.borrow_mut();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let at = at.max(state.now);
        trace!(at, sequence, ?kind, "schedule event");
        state.queue.push(Reverse(Event { at, sequence, kind }));
        sequence
    }

    /// Schedules `kind` to fire `delay` time units from now
    pub fn schedule_in(&self, delay: SimTime, kind: EventKind) -> u64 {
        let at = self.now() + delay;
        self.schedule_at(at, kind)
    }

    /// Time of the earliest pending event
    pub fn peek_time(&self) -> Option<SimTime> {
        self.inner.borrow().queue.peek().map(|Reverse(event)| event.at)
    }

    /// Removes the earliest pending event and advances the clock to it
    pub fn pop_next(&self) -> Option<Event> {
        let mut state = self.inner.borrow_mut();
        let Reverse(event) = state.queue.pop()?;
        state.now = state.now.max(event.at);
        Some(event)
    }

    /// Moves the clock forward without dispatching anything
    pub fn advance_to(&self, at: SimTime) {
        let mut state = self.inner.borrow_mut();
        state.now = state.now.max(at);
    }

    pub fn pending_events(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Drops every pending event, keeping the clock where it is
    pub fn clear_events(&self) {
        self.inner.borrow_mut().queue.clear();
    }
}
