//! The driver proper: interrupt entry, direction switching, the command
//! sequencer and the public surface.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;

use crate::codes::{
    HostCommand, KeyboardLeds, KeyboardOutput, ScanCodeSet, TypematicDelay, TypematicRate,
};
use crate::diagnostics::Diagnostics;
use crate::dispatch::{self, EdgeHandler};
use crate::frame::{FrameReceiver, FrameTransmitter, RxEdge, TxEdge};
use crate::output_buffer::OutputBuffer;
use crate::platform::Platform;

/// How long a command gets to produce its ACK.
const IMMEDIATE_RESPONSE_MS: u32 = 10;
/// How long a freshly powered keyboard gets to report its self-test.
const STARTUP_TIMEOUT_MS: u32 = 750;
/// Reset runs the self-test again and gets the longer budget.
const RESET_TIMEOUT_MS: u32 = 1000;
/// A resend right after a failed frame would catch the device mid-frame
/// and garble a second byte; at 10–17 kHz the tail of a frame is gone
/// after a couple hundred microseconds.
const RESEND_SETTLE_US: u32 = 200;
/// A failed frame that got no further than this many edges was a stray
/// clock pulse, not a byte worth asking for again.
const GLITCH_BIT_THRESHOLD: u8 = 3;
/// Clock-low time that inhibits keyboard transmission. The protocol floor
/// is 100 µs.
const INHIBIT_US: u32 = 120;
/// Bound on waiting out an in-flight received frame before inhibiting.
const LINE_IDLE_WAIT_MS: u32 = 2;
/// Gap after which a half-received frame counts as abandoned: two bit
/// times at the slowest clock the protocol allows.
const LINE_IDLE_GAP_US: u32 = 300;

/// Which engine the next falling clock edge feeds.
enum Direction {
    DeviceToHost,
    HostToDevice,
}

/// Everything the interrupt handler owns, packed under one mutex so the
/// foreground sees it consistently.
struct Engine<const N: usize> {
    direction: Direction,
    receiver: FrameReceiver,
    transmitter: FrameTransmitter,
    buffer: OutputBuffer<N>,
    last_edge_us: u32,
    failure_us: u32,
    /// Bits the frame had accumulated when it failed. The stop edge resets
    /// the live counter before the foreground ever polls, so the recovery
    /// decision reads this snapshot instead.
    failure_bits: u8,
}

/// Wrap-safe "now has not yet reached stop" for the millisecond clock.
fn still_within(start: u32, stop: u32, now: u32) -> bool {
    now < stop || (stop < start && start <= now)
}

/// PS/2 keyboard host driver over two open-collector pins.
///
/// `P` supplies the hardware (see [`Platform`]), `D` hears about everything
/// the driver notices (see [`Diagnostics`]), and `N` is the receive queue
/// capacity in bytes.
///
/// The instance must live in a `static`: [`Keyboard::begin`] hands a
/// reference to the interrupt dispatch table, which keeps it for as long as
/// the registration stands. All methods other than the interrupt entry are
/// foreground-only, and the driver is single-outstanding: never start a
/// command while another one is still waiting on its reply.
pub struct Keyboard<P, D, const N: usize = 16> {
    platform: P,
    diagnostics: D,
    clock_pin: u8,
    data_pin: u8,
    engine: Mutex<RefCell<Engine<N>>>,
    /// Framing-error latch. Set only by the interrupt, cleared only by the
    /// foreground (or by a clean start bit); a set racing a clear simply
    /// re-latches and the foreground re-checks on its next poll.
    framing_error: AtomicBool,
}

impl<P, D, const N: usize> Keyboard<P, D, N> {
    pub const fn new(platform: P, clock_pin: u8, data_pin: u8, diagnostics: D) -> Keyboard<P, D, N> {
        Keyboard {
            platform,
            diagnostics,
            clock_pin,
            data_pin,
            engine: Mutex::new(RefCell::new(Engine {
                direction: Direction::DeviceToHost,
                receiver: FrameReceiver::new(),
                transmitter: FrameTransmitter::new(),
                buffer: OutputBuffer::new(),
                last_edge_us: 0,
                failure_us: 0,
                failure_bits: 0,
            })),
            framing_error: AtomicBool::new(false),
        }
    }

    /// The diagnostics sink this driver reports into.
    pub fn diagnostics(&self) -> &D {
        &self.diagnostics
    }
}

impl<P, D, const N: usize> Keyboard<P, D, N>
where
    P: Platform + Sync + 'static,
    D: Diagnostics + Sync + 'static,
{
    /// Claims the clock pin's interrupt and starts listening.
    ///
    /// Returns `false` when another instance already owns the clock pin.
    pub fn begin(&'static self) -> bool {
        if !dispatch::register(self.clock_pin, self) {
            return false;
        }
        self.platform.release(self.clock_pin);
        self.platform.release(self.data_pin);
        self.arm_receiver();
        #[cfg(feature = "defmt")]
        defmt::debug!("ps2kbd: listening, clock pin {=u8}", self.clock_pin);
        true
    }

    /// Detaches from the interrupt and releases the dispatch slot.
    pub fn end(&'static self) {
        self.platform.detach_falling_edge(self.clock_pin);
        dispatch::unregister(self.clock_pin);
    }

    /// The application's entry point: the oldest byte the keyboard sent,
    /// or `Empty`, or `Garbled` when a framing error is being recovered.
    ///
    /// Self-test reports are consumed here rather than returned; a
    /// keyboard power-cycled behind the host's back announces itself with
    /// one, and clients polling for keystrokes should not have to know.
    pub fn read_scan_code(&self) -> KeyboardOutput {
        loop {
            let Some(byte) = self.pop_byte() else {
                if !self.framing_error.load(Ordering::SeqCst) {
                    return KeyboardOutput::Empty;
                }
                return self.recover_from_framing_error();
            };
            self.diagnostics.received_byte(byte);
            match KeyboardOutput::from_wire(byte) {
                KeyboardOutput::BatSuccess => continue,
                KeyboardOutput::BatFailure => {
                    self.diagnostics.startup_failure();
                    continue;
                }
                code => return code,
            }
        }
    }

    /// Waits for the power-on self-test report, up to 750 ms.
    ///
    /// `false` means the keyboard stayed silent or reported a failed test;
    /// the diagnostics sink says which.
    pub fn await_startup(&self) -> bool {
        self.await_self_test(STARTUP_TIMEOUT_MS)
    }

    /// Commands a full keyboard reset and waits out the self-test, up to
    /// a second.
    pub fn reset(&self) -> bool {
        critical_section::with(|cs| {
            self.engine.borrow(cs).borrow_mut().buffer.clear();
        });
        if !self.send_command(HostCommand::Reset) {
            return false;
        }
        self.await_self_test(RESET_TIMEOUT_MS)
    }

    /// Lights the lock LEDs per `leds`.
    pub fn send_led_status(&self, leds: KeyboardLeds) -> bool {
        self.send_command_with(HostCommand::SetLeds, leds.mask())
    }

    /// Reads the two-byte device id, 0xAB83 for a keyboard. Returns
    /// 0xFFFF when any reply byte goes missing.
    pub fn read_id(&self) -> u16 {
        if !self.send_command(HostCommand::ReadId) {
            return 0xFFFF;
        }
        let msb = match self.read_reply_byte() {
            Some(byte) => byte,
            None => return 0xFFFF,
        };
        let lsb = match self.read_reply_byte() {
            Some(byte) => byte,
            None => return 0xFFFF,
        };
        u16::from(msb) << 8 | u16::from(lsb)
    }

    /// Asks which scan-code set the keyboard is using.
    pub fn get_scan_code_set(&self) -> Option<ScanCodeSet> {
        if !self.send_command_with(HostCommand::SetScanCodeSet, 0) {
            return None;
        }
        self.read_reply_byte().and_then(ScanCodeSet::from_reply)
    }

    pub fn set_scan_code_set(&self, set: ScanCodeSet) -> bool {
        self.send_command_with(HostCommand::SetScanCodeSet, set as u8)
    }

    /// Sends the echo command. No ACK here: the keyboard answers with the
    /// echo byte itself. A `true` proves the wire works both ways.
    pub fn echo(&self) -> bool {
        self.send_byte(HostCommand::Echo as u8);
        self.expect(KeyboardOutput::Echo, IMMEDIATE_RESPONSE_MS)
    }

    pub fn set_typematic_rate_and_delay(
        &self,
        rate: TypematicRate,
        delay: TypematicDelay,
    ) -> bool {
        let encoded = rate.raw() | (delay as u8) << 5;
        self.send_command_with(HostCommand::SetTypematicRate, encoded)
    }

    /// Restores scan-code set, typematic rate and typematic delay.
    pub fn reset_to_defaults(&self) -> bool {
        self.send_command(HostCommand::UseDefaultSettings)
    }

    pub fn enable(&self) -> bool {
        self.send_command(HostCommand::Enable)
    }

    pub fn disable(&self) -> bool {
        self.send_command(HostCommand::Disable)
    }

    /// Scan-code-set-3 only; keyboards in other sets accept and ignore it.
    pub fn enable_break_and_typematic(&self) -> bool {
        self.send_command(HostCommand::EnableBreakAndTypematicAll)
    }

    /// Scan-code-set-3 only; keyboards in other sets accept and ignore it.
    pub fn disable_break_and_typematic(&self) -> bool {
        self.send_command(HostCommand::DisableBreakAndTypematicAll)
    }

    /// Scan-code-set-3 only; keyboards in other sets accept and ignore it.
    pub fn disable_break_codes(&self) -> bool {
        self.send_command(HostCommand::DisableBreakAll)
    }

    /// Scan-code-set-3 only; keyboards in other sets accept and ignore it.
    pub fn disable_typematic(&self) -> bool {
        self.send_command(HostCommand::DisableTypematicAll)
    }

    /// Stops break codes for the listed set-3 scan codes. The keyboard is
    /// left disabled afterwards; call [`Keyboard::enable`] to resume.
    pub fn disable_break_codes_for(&self, keys: &[u8]) -> bool {
        self.send_command_all(HostCommand::DisableBreakForKeys, keys)
    }

    /// Stops typematic repeat for the listed set-3 scan codes. The keyboard
    /// is left disabled afterwards; call [`Keyboard::enable`] to resume.
    pub fn disable_typematic_for(&self, keys: &[u8]) -> bool {
        self.send_command_all(HostCommand::DisableTypematicForKeys, keys)
    }

    /// Stops both break codes and typematic repeat for the listed set-3
    /// scan codes. The keyboard is left disabled afterwards; call
    /// [`Keyboard::enable`] to resume.
    pub fn disable_break_and_typematic_for(&self, keys: &[u8]) -> bool {
        self.send_command_all(HostCommand::DisableBreakAndTypematicForKeys, keys)
    }

    // ---- command sequencer ----

    /// Sends one byte and insists on the device's ACK. Re-arms the
    /// receiver on failure so the line is never left in limbo.
    fn send_data(&self, byte: u8) -> bool {
        self.send_byte(byte);
        let acked = self.expect(KeyboardOutput::Ack, IMMEDIATE_RESPONSE_MS);
        if !acked {
            #[cfg(feature = "defmt")]
            defmt::warn!("ps2kbd: no ack for {=u8:x}", byte);
            self.arm_receiver();
        }
        acked
    }

    fn send_command(&self, command: HostCommand) -> bool {
        self.send_data(command as u8)
    }

    fn send_command_with(&self, command: HostCommand, arg: u8) -> bool {
        self.send_command(command) && self.send_data(arg)
    }

    fn send_command_all(&self, command: HostCommand, args: &[u8]) -> bool {
        if !self.send_command(command) {
            return false;
        }
        for &arg in args {
            if !self.send_data(arg) {
                return false;
            }
        }
        true
    }

    /// Waits for the next byte from the device without consuming it.
    ///
    /// `Garbled` reports a framing error and clears the latch; `Empty`
    /// means the timeout ran out. Anything else is still at the head of
    /// the queue when this returns.
    fn expect_response(&self, timeout_ms: u32) -> KeyboardOutput {
        let start = self.platform.millis();
        let stop = start.wrapping_add(timeout_ms);
        loop {
            let peeked =
                critical_section::with(|cs| self.engine.borrow(cs).borrow().buffer.peek());
            if let Some(byte) = peeked {
                return KeyboardOutput::from_wire(byte);
            }
            if self.framing_error.swap(false, Ordering::SeqCst) {
                return KeyboardOutput::Garbled;
            }
            if !still_within(start, stop, self.platform.millis()) {
                return KeyboardOutput::Empty;
            }
        }
    }

    /// Waits for `expected`; consumes it only on a match, so a mismatched
    /// reply stays queued for whoever does want it.
    fn expect(&self, expected: KeyboardOutput, timeout_ms: u32) -> bool {
        let actual = self.expect_response(timeout_ms);
        if actual == expected {
            self.pop_byte();
            return true;
        }
        match actual {
            KeyboardOutput::Empty => self.diagnostics.no_response(expected),
            other => self.diagnostics.incorrect_response(other, expected),
        }
        false
    }

    /// Next reply byte within the immediate-response window, consumed.
    fn read_reply_byte(&self) -> Option<u8> {
        match self.expect_response(IMMEDIATE_RESPONSE_MS) {
            KeyboardOutput::Empty | KeyboardOutput::Garbled => None,
            code => {
                self.pop_byte();
                code.as_byte()
            }
        }
    }

    fn await_self_test(&self, timeout_ms: u32) -> bool {
        match self.expect_response(timeout_ms) {
            KeyboardOutput::BatSuccess => {
                self.pop_byte();
                true
            }
            KeyboardOutput::BatFailure => {
                self.pop_byte();
                self.diagnostics.startup_failure();
                false
            }
            KeyboardOutput::Empty => {
                self.diagnostics.no_response(KeyboardOutput::BatSuccess);
                false
            }
            other => {
                self.diagnostics.incorrect_response(other, KeyboardOutput::BatSuccess);
                false
            }
        }
    }

    fn pop_byte(&self) -> Option<u8> {
        critical_section::with(|cs| self.engine.borrow(cs).borrow_mut().buffer.pop())
    }

    // ---- error recovery ----

    fn recover_from_framing_error(&self) -> KeyboardOutput {
        let (failure_us, failure_bits) = critical_section::with(|cs| {
            let engine = self.engine.borrow(cs).borrow();
            (engine.failure_us, engine.failure_bits)
        });
        // A resend lands on whatever the device considers its last byte,
        // so let the failed frame finish dying first.
        if self.platform.micros().wrapping_sub(failure_us) < RESEND_SETTLE_US {
            return KeyboardOutput::Empty;
        }
        if failure_bits > GLITCH_BIT_THRESHOLD {
            self.send_byte(HostCommand::Resend as u8);
        } else {
            critical_section::with(|cs| {
                self.engine.borrow(cs).borrow_mut().receiver.reset();
            });
            self.framing_error.store(false, Ordering::SeqCst);
            self.diagnostics.clock_line_glitch(failure_bits);
        }
        KeyboardOutput::Garbled
    }

    // ---- direction switching ----

    /// Takes the line from the device and clocks one byte out to it.
    fn send_byte(&self, byte: u8) {
        self.await_line_idle();

        self.platform.detach_falling_edge(self.clock_pin);

        // Inhibit: clock held low past the 100 µs floor.
        self.platform.drive_low(self.clock_pin);
        self.platform.delay_us(INHIBIT_US);

        critical_section::with(|cs| {
            let mut engine = self.engine.borrow(cs).borrow_mut();
            engine.direction = Direction::HostToDevice;
            engine.transmitter.load(byte);
            engine.buffer.clear();
        });
        self.framing_error.store(false, Ordering::SeqCst);

        self.platform
            .attach_falling_edge(self.clock_pin, dispatch::clock_edge);

        // Request-to-send: data low, then give the clock back. The device
        // generates the edges from here.
        self.platform.drive_low(self.data_pin);
        self.platform.release(self.clock_pin);

        self.diagnostics.sent_byte(byte);
    }

    /// Holds off while the device is mid-frame and edges are still coming;
    /// breaking in would make it resend a byte already queued. Bounded so
    /// a stuck line cannot hang the foreground.
    fn await_line_idle(&self) {
        let start = self.platform.millis();
        let stop = start.wrapping_add(LINE_IDLE_WAIT_MS);
        loop {
            let (bits, last_edge_us) = critical_section::with(|cs| {
                let engine = self.engine.borrow(cs).borrow();
                (engine.receiver.bits_received(), engine.last_edge_us)
            });
            if bits == 0 {
                return;
            }
            if self.platform.micros().wrapping_sub(last_edge_us) > LINE_IDLE_GAP_US {
                return;
            }
            if !still_within(start, stop, self.platform.millis()) {
                return;
            }
        }
    }

    /// Puts the line back in listening state: receiver zeroed, queue
    /// empty, latch clear, edges flowing to the receive engine.
    fn arm_receiver(&self) {
        critical_section::with(|cs| {
            let mut engine = self.engine.borrow(cs).borrow_mut();
            engine.direction = Direction::DeviceToHost;
            engine.receiver.reset();
            engine.buffer.clear();
        });
        self.framing_error.store(false, Ordering::SeqCst);
        self.platform
            .attach_falling_edge(self.clock_pin, dispatch::clock_edge);
    }

    // ---- interrupt side ----

    fn receive_edge(&self, engine: &mut Engine<N>, level: bool, now: u32) {
        let bits_at_edge = engine.receiver.bits_received() + 1;
        match engine.receiver.clock_edge(level) {
            RxEdge::Start { ok: true } => {
                self.framing_error.store(false, Ordering::SeqCst);
            }
            RxEdge::Start { ok: false } => {
                self.diagnostics.packet_did_not_start_with_zero();
                self.latch_failure(engine, now, bits_at_edge);
            }
            RxEdge::Data => {}
            RxEdge::Parity { ok: true } => {}
            RxEdge::Parity { ok: false } => {
                self.diagnostics.parity_error();
                self.latch_failure(engine, now, bits_at_edge);
            }
            RxEdge::Stop { ok, byte } => {
                if !ok {
                    self.diagnostics.packet_did_not_end_with_one();
                    self.latch_failure(engine, now, bits_at_edge);
                }
                if !self.framing_error.load(Ordering::SeqCst) && !engine.buffer.push(byte) {
                    self.diagnostics.buffer_overflow();
                }
            }
        }
    }

    fn latch_failure(&self, engine: &mut Engine<N>, now: u32, bits_at_edge: u8) {
        self.framing_error.store(true, Ordering::SeqCst);
        engine.failure_us = now;
        engine.failure_bits = bits_at_edge;
    }

    fn transmit_edge(&self, engine: &mut Engine<N>, level: bool) {
        match engine.transmitter.clock_edge() {
            TxEdge::Hold => {}
            TxEdge::Drive(false) => self.platform.drive_low(self.data_pin),
            // Open collector: a 1 is the released line pulled high.
            TxEdge::Drive(true) => self.platform.release(self.data_pin),
            TxEdge::Release => self.platform.release(self.data_pin),
            TxEdge::AckSample => {
                if level {
                    // No automatic retry: the send path does not queue, and
                    // the command layer will notice the missing ACK.
                    self.diagnostics.send_frame_error();
                }
                engine.direction = Direction::DeviceToHost;
                engine.receiver.reset();
                engine.buffer.clear();
                self.framing_error.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl<P, D, const N: usize> EdgeHandler for Keyboard<P, D, N>
where
    P: Platform + Sync + 'static,
    D: Diagnostics + Sync + 'static,
{
    fn on_clock_edge(&self) {
        // The data line is only valid for tens of microseconds around the
        // edge: sample before anything else.
        let level = self.platform.is_high(self.data_pin);
        let now = self.platform.micros();
        critical_section::with(|cs| {
            let mut engine = self.engine.borrow(cs).borrow_mut();
            engine.last_edge_us = now;
            match engine.direction {
                Direction::DeviceToHost => self.receive_edge(&mut engine, level, now),
                Direction::HostToDevice => self.transmit_edge(&mut engine, level),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::still_within;

    #[test]
    fn deadline_comparison_survives_wraparound() {
        // Plain case.
        assert!(still_within(100, 110, 105));
        assert!(!still_within(100, 110, 110));
        // Stop wrapped past zero: still inside both before and after the
        // counter rolls over.
        let start = u32::MAX - 3;
        let stop = start.wrapping_add(10);
        assert_eq!(stop, 6);
        assert!(still_within(start, stop, u32::MAX - 1));
        assert!(still_within(start, stop, 2));
        assert!(!still_within(start, stop, 6));
        assert!(!still_within(start, stop, 7));
    }
}
