//! Radio medium bookkeeping and the propagation policy seam.
//!
//! The medium tracks which radios are registered, which connections are in
//! the air and the transmission counters. Deciding who hears a transmission
//! is delegated to a `PropagationPolicy`; the medium itself stays agnostic
//! of loss formulas. The kernel orchestrates the actual radio state
//! transitions since it owns the motes.

use serde::Serialize;

use crate::simulation::{MoteId, SimTime};

use super::RadioPacket;

/// The receiver sets a policy picked for one transmission.
pub struct PropagationOutcome {
    /// Radios that should start a clean reception.
    pub destinations: Vec<MoteId>,
    /// Radios close enough to be disturbed but not to receive.
    pub interfered: Vec<MoteId>,
}

impl PropagationOutcome {
    pub fn empty() -> Self {
        PropagationOutcome {
            destinations: Vec::new(),
            interfered: Vec::new(),
        }
    }
}

/// Pluggable algorithm deciding which radios hear a transmission.
///
/// Policies run on the kernel thread; `Send` is required only so a policy
/// can be handed to the kernel thread at construction.
pub trait PropagationPolicy: Send {
    fn name(&self) -> &'static str;

    fn mote_added(&mut self, _id: MoteId) {}

    fn mote_removed(&mut self, _id: MoteId) {}

    /// Pick receivers among `candidates` (all registered radios except the
    /// source).
    fn select_receivers(&mut self, source: MoteId, candidates: &[MoteId]) -> PropagationOutcome;

    /// Opaque policy configuration included in simulation snapshots.
    fn config(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Trivial policy: every registered radio hears every transmission.
pub struct FullCoverage;

impl PropagationPolicy for FullCoverage {
    fn name(&self) -> &'static str {
        "full-coverage"
    }

    fn select_receivers(&mut self, _source: MoteId, candidates: &[MoteId]) -> PropagationOutcome {
        PropagationOutcome {
            destinations: candidates.to_vec(),
            interfered: Vec::new(),
        }
    }
}

/// One transmission currently in the air.
pub struct ActiveConnection {
    pub source: MoteId,
    pub packet: RadioPacket,
    pub start: SimTime,
    pub destinations: Vec<MoteId>,
    pub interfered: Vec<MoteId>,
}

impl ActiveConnection {
    pub fn new(source: MoteId, packet: RadioPacket, start: SimTime) -> Self {
        ActiveConnection {
            source,
            packet,
            start,
            destinations: Vec::new(),
            interfered: Vec::new(),
        }
    }

    pub fn is_destination(&self, id: MoteId) -> bool {
        self.destinations.contains(&id)
    }

    pub fn mark_interfered(&mut self, id: MoteId) {
        if !self.interfered.contains(&id) {
            self.interfered.push(id);
        }
    }
}

#[derive(Clone, Default, Serialize)]
pub struct MediumStats {
    pub transmissions: u64,
    pub receptions: u64,
    pub interfered: u64,
}

pub struct RadioMedium {
    policy: Option<Box<dyn PropagationPolicy>>,
    registered: Vec<MoteId>,
    active: Vec<ActiveConnection>,
    stats: MediumStats,
}

impl RadioMedium {
    pub fn new(policy: Box<dyn PropagationPolicy>) -> Self {
        log::info!("radio medium using policy '{}'", policy.name());
        RadioMedium {
            policy: Some(policy),
            registered: Vec::new(),
            active: Vec::new(),
            stats: MediumStats::default(),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.as_ref().map_or("detached", |p| p.name())
    }

    pub fn policy_config(&self) -> serde_json::Value {
        self.policy
            .as_ref()
            .map_or(serde_json::Value::Null, |p| p.config())
    }

    pub fn register(&mut self, id: MoteId) {
        if !self.registered.contains(&id) {
            self.registered.push(id);
            if let Some(policy) = self.policy.as_mut() {
                policy.mote_added(id);
            }
        }
    }

    pub fn unregister(&mut self, id: MoteId) {
        self.registered.retain(|m| *m != id);
        for connection in &mut self.active {
            connection.destinations.retain(|m| *m != id);
            connection.interfered.retain(|m| *m != id);
        }
        self.active.retain(|c| c.source != id);
        if let Some(policy) = self.policy.as_mut() {
            policy.mote_removed(id);
        }
    }

    pub fn registered(&self) -> &[MoteId] {
        &self.registered
    }

    /// All registered radios except the source.
    pub fn candidates(&self, source: MoteId) -> Vec<MoteId> {
        self.registered
            .iter()
            .copied()
            .filter(|m| *m != source)
            .collect()
    }

    pub fn select(&mut self, source: MoteId, candidates: &[MoteId]) -> PropagationOutcome {
        match self.policy.as_mut() {
            Some(policy) => policy.select_receivers(source, candidates),
            None => PropagationOutcome::empty(),
        }
    }

    /// Drop the policy on shutdown. Further transmissions reach nobody.
    pub fn detach_policy(&mut self) {
        if let Some(policy) = self.policy.take() {
            log::debug!("propagation policy '{}' detached", policy.name());
        }
    }

    pub fn push_connection(&mut self, connection: ActiveConnection) {
        self.active.push(connection);
    }

    pub fn take_connection(&mut self, source: MoteId) -> Option<ActiveConnection> {
        let index = self.active.iter().position(|c| c.source == source)?;
        Some(self.active.remove(index))
    }

    pub fn active(&self) -> &[ActiveConnection] {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut [ActiveConnection] {
        &mut self.active
    }

    pub fn stats(&self) -> &MediumStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut MediumStats {
        &mut self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_coverage_reaches_everyone_but_the_source() {
        let mut medium = RadioMedium::new(Box::new(FullCoverage));
        for id in 1..=3 {
            medium.register(MoteId(id));
        }
        let candidates = medium.candidates(MoteId(2));
        assert_eq!(candidates, vec![MoteId(1), MoteId(3)]);

        let outcome = medium.select(MoteId(2), &candidates);
        assert_eq!(outcome.destinations, vec![MoteId(1), MoteId(3)]);
        assert!(outcome.interfered.is_empty());
    }

    #[test]
    fn unregister_scrubs_active_connections() {
        let mut medium = RadioMedium::new(Box::new(FullCoverage));
        medium.register(MoteId(1));
        medium.register(MoteId(2));

        let mut connection = ActiveConnection::new(MoteId(1), RadioPacket::new(vec![0]), 0);
        connection.destinations.push(MoteId(2));
        medium.push_connection(connection);

        medium.unregister(MoteId(2));
        assert!(medium.active()[0].destinations.is_empty());

        medium.unregister(MoteId(1));
        assert!(medium.active().is_empty());
        assert!(medium.registered().is_empty());
    }

    #[test]
    fn detached_policy_selects_nobody() {
        let mut medium = RadioMedium::new(Box::new(FullCoverage));
        medium.register(MoteId(1));
        medium.register(MoteId(2));
        medium.detach_policy();

        let candidates = medium.candidates(MoteId(1));
        let outcome = medium.select(MoteId(1), &candidates);
        assert!(outcome.destinations.is_empty());
        assert_eq!(medium.policy_name(), "detached");
    }
}
