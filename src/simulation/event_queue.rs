//! Time-ordered event queue with deterministic tie-breaking.
//!
//! Entries are ordered by `(time, insertion sequence)`, so events scheduled
//! for the same simulated time fire in the order they were scheduled. The
//! sequence number makes the ordering a total order; FIFO fairness among
//! same-time events is a correctness requirement for reproducible runs, not
//! an optimization.
//!
//! Cancellation is lazy: `TimeEvent::cancel` only clears the `scheduled`
//! flag, and `pop_next` discards stale heap entries transparently. The one
//! exception is rescheduling an event whose stale entry is still queued, in
//! which case the old entry is removed eagerly so that an event never has
//! two live entries at once.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use super::kernel::Simulation;
use super::{MoteId, SimTime};

/// Work executed when an event fires. Runs on the kernel thread with the
/// clock already advanced to the event's time.
pub type EventAction = Box<dyn FnMut(&mut Simulation, SimTime) -> anyhow::Result<()>>;

/// Shared handle to a schedulable event. The queue holds clones of this
/// while the event is queued; the owner keeps one for rescheduling.
pub type EventRef = Rc<TimeEvent>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("event '{0}' is already scheduled")]
    AlreadyScheduled(&'static str),
}

/// A schedulable unit of work.
///
/// `queued` tracks whether a heap entry for this event exists; `scheduled`
/// tracks whether that entry is still live. Both are owned by the queue and
/// only read elsewhere.
pub struct TimeEvent {
    name: &'static str,
    mote: Option<MoteId>,
    queued: Cell<bool>,
    scheduled: Cell<bool>,
    action: RefCell<EventAction>,
}

impl TimeEvent {
    pub fn new(name: &'static str, action: EventAction) -> EventRef {
        Rc::new(TimeEvent {
            name,
            mote: None,
            queued: Cell::new(false),
            scheduled: Cell::new(false),
            action: RefCell::new(action),
        })
    }

    /// An event owned by a mote. Used by `EventQueue::remove_if` to purge a
    /// destroyed mote's outstanding events.
    pub fn for_mote(name: &'static str, mote: MoteId, action: EventAction) -> EventRef {
        Rc::new(TimeEvent {
            name,
            mote: Some(mote),
            queued: Cell::new(false),
            scheduled: Cell::new(false),
            action: RefCell::new(action),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mote(&self) -> Option<MoteId> {
        self.mote
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    pub fn is_queued(&self) -> bool {
        self.queued.get()
    }

    /// Cancel a pending firing. Idempotent; the stale queue entry is
    /// discarded the next time it surfaces.
    pub fn cancel(&self) {
        self.scheduled.set(false);
    }

    pub(crate) fn execute(&self, sim: &mut Simulation, now: SimTime) -> anyhow::Result<()> {
        (self.action.borrow_mut())(sim, now)
    }
}

impl fmt::Debug for TimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeEvent")
            .field("name", &self.name)
            .field("mote", &self.mote)
            .field("queued", &self.queued.get())
            .field("scheduled", &self.scheduled.get())
            .finish()
    }
}

struct Entry {
    time: SimTime,
    seq: u64,
    event: EventRef,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the smallest (time, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct EventQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Insert an event at the given time.
    ///
    /// Fails if the event is already scheduled; an event may only have one
    /// pending firing. A stale queued entry left behind by `cancel` is
    /// removed first.
    pub fn schedule(&mut self, event: &EventRef, time: SimTime) -> Result<(), ScheduleError> {
        if event.scheduled.get() {
            return Err(ScheduleError::AlreadyScheduled(event.name));
        }
        if event.queued.get() {
            self.purge(event);
        }
        self.heap.push(Entry {
            time,
            seq: self.next_seq,
            event: Rc::clone(event),
        });
        self.next_seq += 1;
        event.queued.set(true);
        event.scheduled.set(true);
        Ok(())
    }

    /// Remove and return the lowest `(time, seq)` entry whose event is still
    /// scheduled, discarding stale entries of cancelled events on the way.
    pub fn pop_next(&mut self) -> Option<(EventRef, SimTime)> {
        while let Some(entry) = self.heap.pop() {
            entry.event.queued.set(false);
            if entry.event.scheduled.get() {
                entry.event.scheduled.set(false);
                return Some((entry.event, entry.time));
            }
        }
        None
    }

    /// Bulk-cancel all entries matching the predicate. O(n); used when a
    /// mote is destroyed.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&TimeEvent) -> bool) {
        self.heap.retain(|entry| {
            if predicate(&entry.event) {
                entry.event.queued.set(false);
                entry.event.scheduled.set(false);
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn purge(&mut self, event: &EventRef) {
        self.heap.retain(|entry| {
            if Rc::ptr_eq(&entry.event, event) {
                entry.event.queued.set(false);
                false
            } else {
                true
            }
        });
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &'static str) -> EventRef {
        TimeEvent::new(name, Box::new(|_sim: &mut Simulation, _now: SimTime| Ok(())))
    }

    fn mote_noop(name: &'static str, mote: MoteId) -> EventRef {
        TimeEvent::for_mote(name, mote, Box::new(|_sim: &mut Simulation, _now: SimTime| Ok(())))
    }

    #[test]
    fn same_time_events_fire_in_insertion_order() {
        let mut queue = EventQueue::new();
        let first = noop("first");
        let second = noop("second");
        queue.schedule(&first, 100).unwrap();
        queue.schedule(&second, 100).unwrap();

        let (popped, time) = queue.pop_next().unwrap();
        assert_eq!(time, 100);
        assert!(Rc::ptr_eq(&popped, &first));
        let (popped, _) = queue.pop_next().unwrap();
        assert!(Rc::ptr_eq(&popped, &second));
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn popped_times_are_non_decreasing() {
        let mut queue = EventQueue::new();
        let times = [500u64, 3, 250, 3, 999, 0, 250];
        let events: Vec<EventRef> = times.iter().map(|_| noop("shuffled")).collect();
        for (event, time) in events.iter().zip(times) {
            queue.schedule(event, time).unwrap();
        }

        let mut previous = 0;
        let mut popped = 0;
        while let Some((_, time)) = queue.pop_next() {
            assert!(time >= previous);
            previous = time;
            popped += 1;
        }
        assert_eq!(popped, times.len());
    }

    #[test]
    fn cancel_then_reschedule_fires_once_at_new_time() {
        let mut queue = EventQueue::new();
        let event = noop("rescheduled");
        queue.schedule(&event, 10).unwrap();
        event.cancel();
        queue.schedule(&event, 20).unwrap();

        let (popped, time) = queue.pop_next().unwrap();
        assert!(Rc::ptr_eq(&popped, &event));
        assert_eq!(time, 20);
        assert!(queue.pop_next().is_none());
        assert!(!event.is_scheduled());
        assert!(!event.is_queued());
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut queue = EventQueue::new();
        let doomed = noop("doomed");
        let survivor = noop("survivor");
        queue.schedule(&doomed, 5).unwrap();
        queue.schedule(&survivor, 10).unwrap();
        doomed.cancel();

        let (popped, time) = queue.pop_next().unwrap();
        assert!(Rc::ptr_eq(&popped, &survivor));
        assert_eq!(time, 10);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn double_schedule_is_rejected() {
        let mut queue = EventQueue::new();
        let event = noop("dup");
        queue.schedule(&event, 1).unwrap();
        assert_eq!(
            queue.schedule(&event, 2),
            Err(ScheduleError::AlreadyScheduled("dup"))
        );
        // The original entry is untouched.
        let (_, time) = queue.pop_next().unwrap();
        assert_eq!(time, 1);
    }

    #[test]
    fn remove_if_purges_a_motes_events() {
        let mut queue = EventQueue::new();
        let kept = mote_noop("kept", MoteId(1));
        let purged_a = mote_noop("purged-a", MoteId(2));
        let purged_b = mote_noop("purged-b", MoteId(2));
        queue.schedule(&kept, 10).unwrap();
        queue.schedule(&purged_a, 5).unwrap();
        queue.schedule(&purged_b, 15).unwrap();

        queue.remove_if(|event| event.mote() == Some(MoteId(2)));

        assert!(!purged_a.is_scheduled());
        assert!(!purged_b.is_scheduled());
        let (popped, _) = queue.pop_next().unwrap();
        assert!(Rc::ptr_eq(&popped, &kept));
        assert!(queue.pop_next().is_none());
    }
}
