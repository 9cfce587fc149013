//! Motes: simulated network nodes.
//!
//! A mote pairs a radio with a behavioral backend. Backends form a small
//! closed set (application model or firmware-backed) expressed as a tagged
//! enum; the `Tickable` and `MemoryAddressable` traits are the capability
//! seams the kernel programs against. Backends never touch the kernel
//! directly: a tick returns a list of `MoteAction`s the kernel applies, so
//! mote code cannot reorder scheduling behind the kernel's back.

pub mod firmware;

pub use firmware::{FirmwareMote, FirmwareMoteType};

use std::fmt;

use crate::radio::Radio;
use crate::simulation::{EventRef, MoteId, SimTime};

/// One quantum of behavioral progress.
pub trait Tickable {
    fn tick(&mut self, now: SimTime) -> anyhow::Result<Vec<MoteAction>>;
}

/// Relative-addressed access to a mote's backing memory.
pub trait MemoryAddressable {
    fn read_memory(&self, offset: usize, length: usize) -> anyhow::Result<Vec<u8>>;
    fn write_memory(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()>;
}

/// Effects a backend requests from the kernel.
pub enum MoteAction {
    /// Put a packet in the air for `duration` microseconds.
    Transmit { payload: Vec<u8>, duration: SimTime },
    /// Emit a line of log output (observable by control scripts).
    Log(String),
    /// Ask for the next tick at the given simulated time.
    NextTick { at: SimTime },
}

impl fmt::Debug for MoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoteAction::Transmit { payload, duration } => f
                .debug_struct("Transmit")
                .field("bytes", &payload.len())
                .field("duration", duration)
                .finish(),
            MoteAction::Log(message) => f.debug_tuple("Log").field(message).finish(),
            MoteAction::NextTick { at } => f.debug_struct("NextTick").field("at", at).finish(),
        }
    }
}

pub enum MoteBackend {
    Application(ApplicationMote),
    Firmware(FirmwareMote),
}

pub struct Mote {
    id: MoteId,
    type_name: String,
    backend: MoteBackend,
    pub radio: Radio,
    tick_event: EventRef,
}

impl Mote {
    pub fn new(id: MoteId, type_name: &str, backend: MoteBackend, tick_event: EventRef) -> Self {
        Mote {
            id,
            type_name: type_name.to_string(),
            backend,
            radio: Radio::new(),
            tick_event,
        }
    }

    pub fn id(&self) -> MoteId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn backend_mut(&mut self) -> &mut MoteBackend {
        &mut self.backend
    }

    pub fn tick_event(&self) -> &EventRef {
        &self.tick_event
    }

    pub fn tick(&mut self, now: SimTime) -> anyhow::Result<Vec<MoteAction>> {
        match &mut self.backend {
            MoteBackend::Application(mote) => mote.tick(now),
            MoteBackend::Firmware(mote) => mote.tick(now),
        }
    }

    pub fn on_packet_received(&mut self, payload: &[u8]) -> Vec<MoteAction> {
        match &mut self.backend {
            MoteBackend::Application(mote) => mote.on_packet_received(payload),
            MoteBackend::Firmware(mote) => mote.on_packet_received(payload),
        }
    }

    /// The backend's memory capability, if it has one.
    pub fn memory(&mut self) -> Option<&mut dyn MemoryAddressable> {
        match &mut self.backend {
            MoteBackend::Application(_) => None,
            MoteBackend::Firmware(mote) => Some(mote),
        }
    }
}

struct PlannedTransmission {
    at: SimTime,
    payload: Vec<u8>,
    duration: SimTime,
}

/// Abstract behavioral mote driven by a plan of timed transmissions.
/// Received packets are announced as log output, which is what control
/// scripts key on.
#[derive(Default)]
pub struct ApplicationMote {
    planned: Vec<PlannedTransmission>,
}

impl ApplicationMote {
    pub fn new() -> Self {
        ApplicationMote::default()
    }

    pub fn plan_transmission(&mut self, at: SimTime, payload: Vec<u8>, duration: SimTime) {
        self.planned.push(PlannedTransmission {
            at,
            payload,
            duration,
        });
    }

    pub fn on_packet_received(&mut self, payload: &[u8]) -> Vec<MoteAction> {
        vec![MoteAction::Log(format!(
            "received: {}",
            String::from_utf8_lossy(payload)
        ))]
    }
}

impl Tickable for ApplicationMote {
    fn tick(&mut self, now: SimTime) -> anyhow::Result<Vec<MoteAction>> {
        let mut actions = Vec::new();
        let mut pending = Vec::new();
        for plan in self.planned.drain(..) {
            if plan.at <= now {
                actions.push(MoteAction::Transmit {
                    payload: plan.payload,
                    duration: plan.duration,
                });
            } else {
                pending.push(plan);
            }
        }
        if let Some(next) = pending.iter().map(|p| p.at).min() {
            actions.push(MoteAction::NextTick { at: next });
        }
        self.planned = pending;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_transmissions_fire_and_the_rest_wait() {
        let mut mote = ApplicationMote::new();
        mote.plan_transmission(100, b"early".to_vec(), 10);
        mote.plan_transmission(500, b"late".to_vec(), 10);

        let actions = mote.tick(100).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[0],
            MoteAction::Transmit { payload, .. } if payload == b"early"
        ));
        assert!(matches!(&actions[1], MoteAction::NextTick { at: 500 }));

        let actions = mote.tick(500).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            MoteAction::Transmit { payload, .. } if payload == b"late"
        ));

        assert!(mote.tick(1000).unwrap().is_empty());
    }

    #[test]
    fn received_packets_are_announced() {
        let mut mote = ApplicationMote::new();
        let actions = mote.on_packet_received(b"hello");
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            MoteAction::Log(line) if line == "received: hello"
        ));
    }
}
