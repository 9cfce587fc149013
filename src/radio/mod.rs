//! Per-radio transmit/receive/interference state machine.
//!
//! Transitions are driven by the radio medium, never self-initiated.
//! Overlapping receptions collapse into reference-counted interference:
//! every interferer must end before the radio clears again. Signal strength
//! is sampled once per mote tick into an 8-entry window; the firmware-visible
//! value is the simple moving average over that window, decoupling raw
//! propagation-policy output from what the simulated hardware observes.

pub mod medium;

pub use medium::{FullCoverage, PropagationOutcome, PropagationPolicy, RadioMedium};

use crate::simulation::SimTime;

/// Background signal level when nothing is transmitting nearby (dBm).
pub const SS_NOTHING: f64 = -100.0;
/// Signal level at radios participating in an active connection (dBm).
pub const SS_STRONG: f64 = -10.0;
/// Signal level at the edge of reception (dBm). Reserved for policies that
/// model marginal links.
pub const SS_WEAK: f64 = -95.0;

const SIGNAL_WINDOW: usize = 8;

/// Channel wildcard: the radio listens on all channels.
pub const CHANNEL_ANY: i32 = -1;

pub fn channels_compatible(a: i32, b: i32) -> bool {
    a == CHANNEL_ANY || b == CHANNEL_ANY || a == b
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RadioEvent {
    Unknown,
    ReceptionStarted,
    ReceptionInterfered,
    ReceptionFinished,
    TransmissionStarted,
    PacketTransmitted,
    TransmissionFinished,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RadioState {
    Idle,
    Transmitting,
    Receiving,
    ReceivingInterfered,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RadioPacket {
    pub payload: Vec<u8>,
}

impl RadioPacket {
    pub fn new(payload: Vec<u8>) -> Self {
        RadioPacket { payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

pub struct Radio {
    transmitting: bool,
    receiving: bool,
    interfered: bool,
    interference_count: i32,
    incoming: Option<RadioPacket>,
    outgoing: Option<RadioPacket>,
    channel: i32,
    last_event: RadioEvent,
    last_event_time: SimTime,
    current_signal: f64,
    signal_window: [f64; SIGNAL_WINDOW],
}

impl Radio {
    pub fn new() -> Self {
        Radio {
            transmitting: false,
            receiving: false,
            interfered: false,
            interference_count: 0,
            incoming: None,
            outgoing: None,
            channel: CHANNEL_ANY,
            last_event: RadioEvent::Unknown,
            last_event_time: 0,
            current_signal: SS_NOTHING,
            signal_window: [SS_NOTHING; SIGNAL_WINDOW],
        }
    }

    pub fn state(&self) -> RadioState {
        if self.transmitting {
            RadioState::Transmitting
        } else if self.interfered {
            RadioState::ReceivingInterfered
        } else if self.receiving {
            RadioState::Receiving
        } else {
            RadioState::Idle
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn is_interfered(&self) -> bool {
        self.interfered
    }

    pub fn interference_count(&self) -> i32 {
        self.interference_count
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: i32) {
        self.channel = channel;
    }

    pub fn last_event(&self) -> (RadioEvent, SimTime) {
        (self.last_event, self.last_event_time)
    }

    /// Start receiving `packet`. If the radio is already busy the reception
    /// collapses into interference (a collision).
    pub fn begin_reception(&mut self, packet: RadioPacket, now: SimTime) -> Option<RadioEvent> {
        if self.interfered || self.receiving || self.transmitting {
            return self.interfere(now);
        }
        self.receiving = true;
        self.incoming = Some(packet);
        Some(self.record(RadioEvent::ReceptionStarted, now))
    }

    /// Add one interferer. The buffered packet is lost. Only the first
    /// interferer (0 -> 1) produces a notification.
    pub fn interfere(&mut self, now: SimTime) -> Option<RadioEvent> {
        self.interference_count += 1;
        self.incoming = None;
        if self.interfered {
            None
        } else {
            self.interfered = true;
            Some(self.record(RadioEvent::ReceptionInterfered, now))
        }
    }

    /// End one overlapping reception. Delivers the buffered packet only when
    /// the reception was never interfered; otherwise one interferer is
    /// released and the radio stays interfered until the count reaches zero.
    ///
    /// Some propagation policies have historically driven the count below
    /// zero; the excursion is clamped and logged rather than corrected.
    pub fn end_reception(&mut self, now: SimTime) -> (Option<RadioEvent>, Option<RadioPacket>) {
        if self.interfered || self.incoming.is_none() {
            self.interference_count -= 1;
            if self.interference_count < 0 {
                log::warn!("interference count went negative, clamping to zero");
                self.interference_count = 0;
            }
            if self.interference_count == 0 {
                self.interfered = false;
            }
            self.incoming = None;
            if self.interference_count > 0 {
                return (None, None);
            }
        }
        self.receiving = false;
        let delivered = self.incoming.take();
        (Some(self.record(RadioEvent::ReceptionFinished, now)), delivered)
    }

    /// Start transmitting. Returns false (and logs) on a re-entrant call;
    /// emits the started and packet-ready notifications in that order.
    pub fn begin_transmission(&mut self, packet: RadioPacket, now: SimTime) -> bool {
        if self.transmitting {
            log::warn!("already transmitting, rejecting new transmission");
            return false;
        }
        self.transmitting = true;
        self.record(RadioEvent::TransmissionStarted, now);
        self.outgoing = Some(packet);
        self.record(RadioEvent::PacketTransmitted, now);
        true
    }

    pub fn end_transmission(&mut self, now: SimTime) -> Option<RadioPacket> {
        if !self.transmitting {
            return None;
        }
        self.transmitting = false;
        self.record(RadioEvent::TransmissionFinished, now);
        self.outgoing.take()
    }

    /// Raw signal strength as set by the propagation policy.
    pub fn set_current_signal(&mut self, dbm: f64) {
        self.current_signal = dbm;
    }

    pub fn current_signal(&self) -> f64 {
        self.current_signal
    }

    /// Push the current raw signal into the smoothing window. Called once
    /// per mote tick.
    pub fn sample_signal(&mut self) {
        self.signal_window.copy_within(1.., 0);
        self.signal_window[SIGNAL_WINDOW - 1] = self.current_signal;
    }

    /// The smoothed value surfaced to firmware-visible registers.
    pub fn observed_signal_strength(&self) -> f64 {
        self.signal_window.iter().sum::<f64>() / SIGNAL_WINDOW as f64
    }

    fn record(&mut self, event: RadioEvent, now: SimTime) -> RadioEvent {
        self.last_event = event;
        self.last_event_time = now;
        event
    }
}

impl Default for Radio {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(bytes: &[u8]) -> RadioPacket {
        RadioPacket::new(bytes.to_vec())
    }

    #[test]
    fn clean_reception_delivers_the_packet() {
        let mut radio = Radio::new();
        assert_eq!(
            radio.begin_reception(packet(b"data"), 10),
            Some(RadioEvent::ReceptionStarted)
        );
        assert_eq!(radio.state(), RadioState::Receiving);

        let (event, delivered) = radio.end_reception(20);
        assert_eq!(event, Some(RadioEvent::ReceptionFinished));
        assert_eq!(delivered, Some(packet(b"data")));
        assert_eq!(radio.state(), RadioState::Idle);
    }

    #[test]
    fn overlapping_reception_becomes_interference() {
        let mut radio = Radio::new();
        radio.begin_reception(packet(b"one"), 0);
        // Second carrier collides: buffered packet is lost.
        assert_eq!(
            radio.begin_reception(packet(b"two"), 1),
            Some(RadioEvent::ReceptionInterfered)
        );
        assert_eq!(radio.state(), RadioState::ReceivingInterfered);

        let (event, delivered) = radio.end_reception(5);
        assert_eq!(event, Some(RadioEvent::ReceptionFinished));
        assert!(delivered.is_none());
        assert_eq!(radio.state(), RadioState::Idle);
    }

    #[test]
    fn interference_refcount_balances() {
        let k = 4;
        let mut radio = Radio::new();
        for i in 0..k {
            let event = radio.interfere(i);
            if i == 0 {
                assert_eq!(event, Some(RadioEvent::ReceptionInterfered));
            } else {
                assert!(event.is_none());
            }
        }
        assert_eq!(radio.interference_count(), k as i32);

        // One fewer end than interferers leaves the radio interfered.
        for i in 0..k - 1 {
            radio.end_reception(100 + i);
            assert!(radio.is_interfered());
        }
        radio.end_reception(200);
        assert_eq!(radio.state(), RadioState::Idle);
        assert_eq!(radio.interference_count(), 0);
    }

    #[test]
    fn excess_end_reception_is_clamped() {
        let mut radio = Radio::new();
        radio.interfere(0);
        radio.end_reception(1);
        radio.end_reception(2);
        assert_eq!(radio.interference_count(), 0);
        assert_eq!(radio.state(), RadioState::Idle);
    }

    #[test]
    fn reentrant_transmission_is_rejected() {
        let mut radio = Radio::new();
        assert!(radio.begin_transmission(packet(b"a"), 0));
        assert!(!radio.begin_transmission(packet(b"b"), 1));
        assert_eq!(radio.last_event().0, RadioEvent::PacketTransmitted);

        let sent = radio.end_transmission(10);
        assert_eq!(sent, Some(packet(b"a")));
        assert_eq!(radio.last_event().0, RadioEvent::TransmissionFinished);
        assert_eq!(radio.state(), RadioState::Idle);
    }

    #[test]
    fn reception_while_transmitting_interferes() {
        let mut radio = Radio::new();
        radio.begin_transmission(packet(b"out"), 0);
        assert_eq!(
            radio.begin_reception(packet(b"in"), 1),
            Some(RadioEvent::ReceptionInterfered)
        );
        assert_eq!(radio.state(), RadioState::Transmitting);
    }

    #[test]
    fn signal_strength_is_averaged_over_the_window() {
        let mut radio = Radio::new();
        radio.set_current_signal(SS_STRONG);
        for _ in 0..SIGNAL_WINDOW {
            radio.sample_signal();
        }
        assert!((radio.observed_signal_strength() - SS_STRONG).abs() < 1e-9);

        radio.set_current_signal(SS_NOTHING);
        for _ in 0..SIGNAL_WINDOW / 2 {
            radio.sample_signal();
        }
        let expected = (SS_STRONG + SS_NOTHING) / 2.0;
        assert!((radio.observed_signal_strength() - expected).abs() < 1e-9);
    }

    #[test]
    fn channel_wildcard_matches_everything() {
        assert!(channels_compatible(CHANNEL_ANY, 7));
        assert!(channels_compatible(3, CHANNEL_ANY));
        assert!(channels_compatible(5, 5));
        assert!(!channels_compatible(5, 6));
    }
}
