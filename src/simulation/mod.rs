//! Discrete-event simulation core.
//!
//! The core is split in two:
//! - `event_queue`: the time-ordered ready queue with deterministic
//!   tie-breaking and lazy cancellation.
//! - `kernel`: the simulation state machine that owns the clock, executes
//!   events on a single dedicated thread and accepts commands submitted
//!   from any other thread.
//!
//! All simulated time is expressed in microseconds (`SimTime`).

pub mod event_queue;
pub mod kernel;

pub use event_queue::{EventQueue, EventRef, ScheduleError, TimeEvent};
pub use kernel::{Command, KernelHandle, SimControl, Simulation};

use std::fmt;

use serde::Serialize;

/// Simulated time in microseconds.
pub type SimTime = u64;

pub const MICROSECOND: SimTime = 1;
pub const MILLISECOND: SimTime = 1_000;
pub const SECOND: SimTime = 1_000_000;

/// Identity of a mote within one simulation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct MoteId(pub u32);

impl fmt::Display for MoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
