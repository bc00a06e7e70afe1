//! Per-flow timers on the packet clock
//!
//! Timer identifiers are dense small integers handed out once per process;
//! the idle and active timers are registered by convention. Each flow
//! carries its own entry array indexed by `TimerID`, with a zero scheduled
//! time meaning "no timer". Expiry is driven exclusively by packet time so
//! replaying a capture reproduces identical output.

use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::core::Timestamp;

use super::flow::Flow;

/// Identifier of a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerID(pub(crate) usize);

impl TimerID {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Idle expiry, rescheduled on every packet of the flow
pub const TIMER_IDLE: TimerID = TimerID(0);
/// Active expiry, scheduled once at flow creation
pub const TIMER_ACTIVE: TimerID = TimerID(1);

static NEXT_TIMER_ID: AtomicUsize = AtomicUsize::new(2);

/// Register a new timer and return its id. Registration happens at
/// process start, before any flow exists; flows created afterwards size
/// their entry arrays to cover every registered id.
pub fn register_timer() -> TimerID {
    TimerID(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Number of timer ids registered so far
pub fn registered_timers() -> usize {
    NEXT_TIMER_ID.load(Ordering::Relaxed)
}

/// Fired when a timer's scheduled time is reached; receives the flow the
/// timer belongs to and the current packet time.
pub type TimerCallback = fn(&mut Flow, Timestamp);

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    pub callback: Option<TimerCallback>,
    pub when: Timestamp,
}

impl TimerEntry {
    const UNSET: TimerEntry = TimerEntry {
        callback: None,
        when: 0,
    };
}

/// A flow's timer entries, indexed by `TimerID`. Inline capacity covers
/// the two conventional timers; later registrations spill to the heap.
#[derive(Debug)]
pub(crate) struct Timers {
    entries: SmallVec<[TimerEntry; 2]>,
}

impl Timers {
    pub fn new() -> Self {
        let mut entries = SmallVec::new();
        entries.resize(registered_timers(), TimerEntry::UNSET);
        Self { entries }
    }

    /// Schedule `callback` at `when`, replacing any previous schedule for
    /// the same id.
    pub fn add(&mut self, id: TimerID, callback: TimerCallback, when: Timestamp) {
        if id.0 >= self.entries.len() {
            self.entries.resize(id.0 + 1, TimerEntry::UNSET);
        }
        self.entries[id.0] = TimerEntry {
            callback: Some(callback),
            when,
        };
    }

    pub fn has(&self, id: TimerID) -> bool {
        self.entries.get(id.0).map_or(false, |e| e.when != 0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> TimerEntry {
        self.entries[index]
    }

    pub fn clear(&mut self, index: usize) {
        self.entries[index].when = 0;
    }

    /// Earliest pending expiry, zero when nothing is scheduled
    pub fn next(&self) -> Timestamp {
        let mut next = 0;
        for entry in &self.entries {
            if entry.when != 0 && (next == 0 || entry.when < next) {
                next = entry.when;
            }
        }
        next
    }
}
