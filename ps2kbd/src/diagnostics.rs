//! Event sink for everything the driver notices but does not return.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::codes::KeyboardOutput;

/// Receives protocol events as they happen.
///
/// Methods are called from both the clock interrupt and the foreground, so
/// implementations must never block and must be safe to enter from either
/// context. Every method has an empty default body; implement the ones you
/// care about.
pub trait Diagnostics {
    /// The start bit of a received frame sampled high. Usually means a
    /// clock edge was missed while another interrupt ran.
    fn packet_did_not_start_with_zero(&self) {}
    fn parity_error(&self) {}
    fn packet_did_not_end_with_one(&self) {}
    /// The device did not pulse the ack slot of a host transmission.
    fn send_frame_error(&self) {}
    /// The queue was full; the oldest byte was dropped.
    fn buffer_overflow(&self) {}
    /// A framing error was written off as noise after `bits_received`
    /// edges instead of triggering a resend.
    fn clock_line_glitch(&self, bits_received: u8) {
        let _ = bits_received;
    }
    fn incorrect_response(&self, got: KeyboardOutput, expected: KeyboardOutput) {
        let _ = (got, expected);
    }
    fn no_response(&self, expected: KeyboardOutput) {
        let _ = expected;
    }
    /// For translators layered on the driver: a scan code with no mapping.
    fn no_translation_for_key(&self, is_extended: bool, code: u8) {
        let _ = (is_extended, code);
    }
    /// The keyboard reported a failed power-on self-test.
    fn startup_failure(&self) {}
    fn sent_byte(&self, byte: u8) {
        let _ = byte;
    }
    fn received_byte(&self, byte: u8) {
        let _ = byte;
    }
}

/// Drops every event on the floor.
#[derive(Copy, Clone, Default, Debug)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {}

/// One recorded diagnostic event.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    PacketDidNotStartWithZero,
    ParityError,
    PacketDidNotEndWithOne,
    SendFrameError,
    BufferOverflow,
    ClockLineGlitch { bits_received: u8 },
    IncorrectResponse { got: KeyboardOutput, expected: KeyboardOutput },
    NoResponse { expected: KeyboardOutput },
    NoTranslationForKey { is_extended: bool, code: u8 },
    StartupFailure,
    SentByte(u8),
    ReceivedByte(u8),
}

impl Event {
    /// True for events that report a fault rather than ordinary traffic.
    pub fn is_error(self) -> bool {
        !matches!(self, Event::SentByte(_) | Event::ReceivedByte(_))
    }
}

struct EventRing<const N: usize> {
    events: [Option<Event>; N],
    next: usize,
    saw_error: bool,
}

impl<const N: usize> EventRing<N> {
    const fn new() -> EventRing<N> {
        EventRing {
            events: [None; N],
            next: 0,
            saw_error: false,
        }
    }

    fn push(&mut self, event: Event) {
        self.events[self.next] = Some(event);
        self.next = (self.next + 1) % N;
        if event.is_error() {
            self.saw_error = true;
        }
    }
}

/// Keeps the last `N` events in a ring for offline inspection.
///
/// Recording is brief and callable from both contexts; reading is meant
/// for the foreground, after the fact.
pub struct EventRecorder<const N: usize> {
    ring: Mutex<RefCell<EventRing<N>>>,
}

impl<const N: usize> EventRecorder<N> {
    pub const fn new() -> EventRecorder<N> {
        EventRecorder {
            ring: Mutex::new(RefCell::new(EventRing::new())),
        }
    }

    fn record(&self, event: Event) {
        critical_section::with(|cs| {
            self.ring.borrow(cs).borrow_mut().push(event);
        });
    }

    /// Whether any fault event was recorded since the last `clear`, even
    /// one the ring has since overwritten.
    pub fn any_errors(&self) -> bool {
        critical_section::with(|cs| self.ring.borrow(cs).borrow().saw_error)
    }

    pub fn clear(&self) {
        critical_section::with(|cs| {
            let mut ring = self.ring.borrow(cs).borrow_mut();
            ring.events = [None; N];
            ring.next = 0;
            ring.saw_error = false;
        });
    }

    /// Visits the retained events, oldest first.
    pub fn visit<F: FnMut(Event)>(&self, mut visitor: F) {
        let (events, next) = critical_section::with(|cs| {
            let ring = self.ring.borrow(cs).borrow();
            (ring.events, ring.next)
        });
        for offset in 0..N {
            if let Some(event) = events[(next + offset) % N] {
                visitor(event);
            }
        }
    }
}

impl<const N: usize> Default for EventRecorder<N> {
    fn default() -> EventRecorder<N> {
        EventRecorder::new()
    }
}

impl<const N: usize> Diagnostics for EventRecorder<N> {
    fn packet_did_not_start_with_zero(&self) {
        self.record(Event::PacketDidNotStartWithZero);
    }
    fn parity_error(&self) {
        self.record(Event::ParityError);
    }
    fn packet_did_not_end_with_one(&self) {
        self.record(Event::PacketDidNotEndWithOne);
    }
    fn send_frame_error(&self) {
        self.record(Event::SendFrameError);
    }
    fn buffer_overflow(&self) {
        self.record(Event::BufferOverflow);
    }
    fn clock_line_glitch(&self, bits_received: u8) {
        self.record(Event::ClockLineGlitch { bits_received });
    }
    fn incorrect_response(&self, got: KeyboardOutput, expected: KeyboardOutput) {
        self.record(Event::IncorrectResponse { got, expected });
    }
    fn no_response(&self, expected: KeyboardOutput) {
        self.record(Event::NoResponse { expected });
    }
    fn no_translation_for_key(&self, is_extended: bool, code: u8) {
        self.record(Event::NoTranslationForKey { is_extended, code });
    }
    fn startup_failure(&self) {
        self.record(Event::StartupFailure);
    }
    fn sent_byte(&self, byte: u8) {
        self.record(Event::SentByte(byte));
    }
    fn received_byte(&self, byte: u8) {
        self.record(Event::ReceivedByte(byte));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn records_in_order_and_tracks_errors() {
        let recorder = EventRecorder::<8>::new();
        assert!(!recorder.any_errors());

        recorder.sent_byte(0xED);
        recorder.received_byte(0xFA);
        assert!(!recorder.any_errors());

        recorder.parity_error();
        assert!(recorder.any_errors());

        let mut seen = Vec::new();
        recorder.visit(|event| seen.push(event));
        assert_eq!(
            seen,
            [
                Event::SentByte(0xED),
                Event::ReceivedByte(0xFA),
                Event::ParityError,
            ]
        );
    }

    #[test]
    fn ring_overwrites_oldest_but_remembers_the_fault() {
        let recorder = EventRecorder::<2>::new();
        recorder.buffer_overflow();
        recorder.sent_byte(1);
        recorder.sent_byte(2);

        let mut seen = Vec::new();
        recorder.visit(|event| seen.push(event));
        assert_eq!(seen, [Event::SentByte(1), Event::SentByte(2)]);
        assert!(recorder.any_errors());
    }

    #[test]
    fn clear_forgets_everything() {
        let recorder = EventRecorder::<4>::new();
        recorder.startup_failure();
        recorder.clear();
        assert!(!recorder.any_errors());
        let mut count = 0;
        recorder.visit(|_| count += 1);
        assert_eq!(count, 0);
    }
}
