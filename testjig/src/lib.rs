//! Protocol test jig for the `ps2kbd` driver.
//!
//! Stands a simulated keyboard on the far end of a simulated two-wire bus
//! and wires the real driver to it through its [`Platform`] trait. Both
//! open-collector lines are modelled as host-drive OR device-drive pulling
//! low against a pull-up, time is a virtual microsecond counter, and the
//! device clocks frames into the driver's interrupt handler synchronously;
//! a falling edge is a plain function call here, which keeps every scenario
//! deterministic without threads.
//!
//! The model keyboard answers commands the way a real one does (ACK,
//! identify, echo, scan-code sets, resend-last-byte) and can be scripted to
//! misbehave: inverted parity or stop bits, a missing ack pulse, a wrong
//! echo, or total silence.

use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use ps2kbd::{Event, EventRecorder, Keyboard, Platform};

pub const CLOCK_PIN: u8 = 3;
pub const DATA_PIN: u8 = 4;

/// Half a bit cell at a ~12.5 kHz device clock.
const EDGE_HALF_PERIOD_US: u64 = 40;

/// Virtual time consumed by each clock read, so foreground wait loops make
/// progress against their deadlines.
const READ_TICK_US: u64 = 10;

/// Ways the model keyboard can corrupt its next outbound frame.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FrameFault {
    BadStart,
    BadParity,
    BadStop,
}

#[derive(Default)]
struct Device {
    /// Every byte the device accepted from the host, in order.
    received: Vec<u8>,
    /// Parity verdict for each accepted byte.
    parity_ok: Vec<bool>,
    last_sent: Option<u8>,
    pending_arg: Option<u8>,
    key_list: bool,
    current_set: u8,
    silent: bool,
    drop_ack_pulse: bool,
    echo_reply: Option<u8>,
    fault_next: Option<FrameFault>,
}

impl Device {
    fn new() -> Device {
        Device {
            current_set: 2,
            ..Device::default()
        }
    }

    /// The device's reply bytes for one accepted command byte.
    fn respond(&mut self, byte: u8) -> Vec<u8> {
        const ACK: u8 = 0xFA;
        if let Some(command) = self.pending_arg.take() {
            return match command {
                0xF0 if byte == 0 => vec![ACK, self.current_set],
                0xF0 => {
                    self.current_set = byte;
                    vec![ACK]
                }
                // Set-LEDs mask, typematic byte: accepted and forgotten.
                _ => vec![ACK],
            };
        }
        if self.key_list && byte < 0xED {
            return vec![ACK];
        }
        self.key_list = false;
        match byte {
            0xFF => {
                let received = std::mem::take(&mut self.received);
                let parity_ok = std::mem::take(&mut self.parity_ok);
                *self = Device::new();
                self.received = received;
                self.parity_ok = parity_ok;
                vec![ACK, 0xAA]
            }
            0xEE => vec![self.echo_reply.unwrap_or(0xEE)],
            0xF2 => vec![ACK, 0xAB, 0x83],
            0xED | 0xF3 | 0xF0 => {
                self.pending_arg = Some(byte);
                vec![ACK]
            }
            0xFB | 0xFC | 0xFD => {
                self.key_list = true;
                vec![ACK]
            }
            0xFE => match self.last_sent {
                Some(last) => vec![last],
                None => vec![ACK],
            },
            _ => vec![ACK],
        }
    }
}

struct BusState {
    host_clock_low: bool,
    host_data_low: bool,
    dev_data_low: bool,
    handler: Option<fn(u8)>,
    now_us: u64,
    ms_offset: u32,
    device: Device,
}

/// The shared wire: both sides pull against the pull-ups, and the device
/// model lives behind it.
pub struct SimBus {
    state: Mutex<BusState>,
}

impl SimBus {
    fn new() -> SimBus {
        SimBus {
            state: Mutex::new(BusState {
                host_clock_low: false,
                host_data_low: false,
                dev_data_low: false,
                handler: None,
                now_us: 0,
                ms_offset: 0,
                device: Device::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One falling clock edge into the driver. Never called with the bus
    /// lock held: the handler reads the bus back through the platform.
    fn pulse_handler(&self) {
        let handler = self.lock().handler;
        if let Some(handler) = handler {
            handler(CLOCK_PIN);
        }
    }

    /// The device clocks in the 12-bit host frame that follows a
    /// request-to-send, acks it, and responds in character.
    fn device_receive_frame(&self) {
        let mut byte = 0u8;
        let mut ones = 0u32;
        let mut parity_level = false;
        for k in 0..12u8 {
            {
                let mut state = self.lock();
                state.now_us += EDGE_HALF_PERIOD_US;
                if k == 11 && !state.device.drop_ack_pulse {
                    state.dev_data_low = true;
                }
            }
            self.pulse_handler();
            let mut state = self.lock();
            let level = !(state.host_data_low || state.dev_data_low);
            match k {
                1..=8 => {
                    if level {
                        byte |= 1 << (k - 1);
                        ones += 1;
                    }
                }
                9 => parity_level = level,
                _ => {}
            }
            state.now_us += EDGE_HALF_PERIOD_US;
        }

        let replies = {
            let mut state = self.lock();
            state.dev_data_low = false;
            if state.device.drop_ack_pulse {
                // The byte never made it; nothing to answer.
                return;
            }
            let parity_ok = (ones % 2 == 0) == parity_level;
            state.device.received.push(byte);
            state.device.parity_ok.push(parity_ok);
            if state.device.silent {
                Vec::new()
            } else {
                state.device.respond(byte)
            }
        };
        for reply in replies {
            self.device_send_byte(reply);
        }
    }

    /// The device clocks one 11-bit frame out to the host, applying any
    /// scripted fault to this frame only.
    fn device_send_byte(&self, byte: u8) {
        let fault = {
            let mut state = self.lock();
            state.device.last_sent = Some(byte);
            state.device.fault_next.take()
        };
        let mut levels = frame_levels(byte);
        match fault {
            Some(FrameFault::BadStart) => levels[0] = true,
            Some(FrameFault::BadParity) => levels[9] = !levels[9],
            Some(FrameFault::BadStop) => levels[10] = false,
            None => {}
        }
        self.clock_levels(&levels);
    }

    fn clock_levels(&self, levels: &[bool]) {
        for &level in levels {
            {
                let mut state = self.lock();
                state.dev_data_low = !level;
                state.now_us += EDGE_HALF_PERIOD_US;
            }
            self.pulse_handler();
            self.lock().now_us += EDGE_HALF_PERIOD_US;
        }
        self.lock().dev_data_low = false;
    }
}

/// The 11 levels of a well-formed device frame for `byte`.
fn frame_levels(byte: u8) -> [bool; 11] {
    let mut levels = [false; 11];
    for bit in 0..8 {
        levels[1 + bit] = byte & (1 << bit) != 0;
    }
    levels[9] = byte.count_ones() % 2 == 0;
    levels[10] = true;
    levels
}

/// Driver-facing side of the simulated bus.
pub struct SimPlatform {
    bus: Arc<SimBus>,
}

impl Platform for SimPlatform {
    fn release(&self, pin: u8) {
        let run_device = {
            let mut state = self.bus.lock();
            match pin {
                CLOCK_PIN => state.host_clock_low = false,
                DATA_PIN => state.host_data_low = false,
                _ => {}
            }
            // Clock released while data is held low: that's the host's
            // request-to-send, and the device starts clocking.
            pin == CLOCK_PIN && state.host_data_low && state.handler.is_some()
        };
        if run_device {
            self.bus.device_receive_frame();
        }
    }

    fn drive_low(&self, pin: u8) {
        let mut state = self.bus.lock();
        match pin {
            CLOCK_PIN => state.host_clock_low = true,
            DATA_PIN => state.host_data_low = true,
            _ => {}
        }
    }

    fn is_high(&self, pin: u8) -> bool {
        let state = self.bus.lock();
        match pin {
            CLOCK_PIN => !state.host_clock_low,
            DATA_PIN => !(state.host_data_low || state.dev_data_low),
            _ => true,
        }
    }

    fn attach_falling_edge(&self, _pin: u8, handler: fn(u8)) {
        self.bus.lock().handler = Some(handler);
    }

    fn detach_falling_edge(&self, _pin: u8) {
        self.bus.lock().handler = None;
    }

    fn micros(&self) -> u32 {
        let mut state = self.bus.lock();
        state.now_us += READ_TICK_US;
        state.now_us as u32
    }

    fn millis(&self) -> u32 {
        let mut state = self.bus.lock();
        state.now_us += READ_TICK_US;
        ((state.now_us / 1000) as u32).wrapping_add(state.ms_offset)
    }

    fn delay_us(&self, us: u32) {
        self.bus.lock().now_us += u64::from(us);
    }
}

/// A platform wired to a fresh, unobserved bus, for tests that need a
/// second driver instance.
pub fn rival_platform() -> SimPlatform {
    SimPlatform {
        bus: Arc::new(SimBus::new()),
    }
}

lazy_static! {
    /// The interrupt dispatch table is process-wide, so jig tests take
    /// turns.
    static ref JIG_LOCK: Mutex<()> = Mutex::new(());
}

/// One driver instance wired to one model keyboard, with exclusive use of
/// the dispatch table for its lifetime.
pub struct Jig<const N: usize = 16> {
    pub kb: &'static Keyboard<SimPlatform, EventRecorder<64>, N>,
    bus: Arc<SimBus>,
    _serial: MutexGuard<'static, ()>,
}

impl<const N: usize> Jig<N> {
    pub fn new() -> Jig<N> {
        let serial = JIG_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let bus = Arc::new(SimBus::new());
        let kb: &'static Keyboard<SimPlatform, EventRecorder<64>, N> =
            Box::leak(Box::new(Keyboard::new(
                SimPlatform { bus: bus.clone() },
                CLOCK_PIN,
                DATA_PIN,
                EventRecorder::new(),
            )));
        assert!(kb.begin(), "clock pin already claimed");
        Jig {
            kb,
            bus,
            _serial: serial,
        }
    }

    /// The device types one clean byte at the host.
    pub fn type_byte(&self, byte: u8) {
        self.bus.device_send_byte(byte);
    }

    /// Corrupts the device's next outbound frame.
    pub fn fault_next_frame(&self, fault: FrameFault) {
        self.bus.lock().device.fault_next = Some(fault);
    }

    /// A single stray falling edge with the data line floating high.
    pub fn spurious_clock_pulse(&self) {
        self.bus.clock_levels(&[true]);
    }

    /// Stops the device answering commands (the bytes still arrive and are
    /// acked on the wire).
    pub fn silence_device(&self) {
        self.bus.lock().device.silent = true;
    }

    /// The device stops pulsing the ack slot of host frames and drops the
    /// bytes.
    pub fn drop_ack_pulse(&self) {
        self.bus.lock().device.drop_ack_pulse = true;
    }

    pub fn echo_reply_with(&self, byte: u8) {
        self.bus.lock().device.echo_reply = Some(byte);
    }

    pub fn advance_us(&self, us: u64) {
        self.bus.lock().now_us += us;
    }

    /// Shifts the millisecond clock so the next reading is `target`.
    pub fn warp_millis(&self, target: u32) {
        let mut state = self.bus.lock();
        let current = (state.now_us / 1000) as u32;
        state.ms_offset = target.wrapping_sub(current);
    }

    pub fn now_us(&self) -> u64 {
        self.bus.lock().now_us
    }

    /// Bytes the device accepted from the host, in order.
    pub fn device_received(&self) -> Vec<u8> {
        self.bus.lock().device.received.clone()
    }

    /// Parity verdict for each accepted byte.
    pub fn device_parity_ok(&self) -> Vec<bool> {
        self.bus.lock().device.parity_ok.clone()
    }

    /// Everything the driver reported to its diagnostics sink.
    pub fn events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        self.kb.diagnostics().visit(|event| events.push(event));
        events
    }
}

impl<const N: usize> Default for Jig<N> {
    fn default() -> Jig<N> {
        Jig::new()
    }
}

impl<const N: usize> Drop for Jig<N> {
    fn drop(&mut self) {
        self.kb.end();
    }
}
