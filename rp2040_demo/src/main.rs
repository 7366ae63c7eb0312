//! PS/2 keyboard host on a Raspberry Pi Pico.
//!
//! Wiring: PS/2 clock on GPIO2, data on GPIO3, both through open-collector
//! level shifting to the keyboard's 5 V lines. The on-board LED blips on
//! every scan code, and the lock keys mirror onto the keyboard's own LEDs.

#![no_std]
#![no_main]

use rp_pico as bsp;

use panic_halt as _;

use bsp::{
    entry,
    hal::{
        clocks::init_clocks_and_plls,
        gpio::{
            bank0::{Gpio2, Gpio3},
            FunctionSioOutput, InOutPin, Pin, PullUp,
        },
        pac,
        pac::interrupt,
        sio::Sio,
        timer::Timer,
        watchdog::Watchdog,
    },
};
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::digital::v2::{InputPin, OutputPin};
use ps2kbd::{Keyboard, KeyboardLeds, KeyboardOutput, NullDiagnostics, Platform};

const CLOCK_PIN: u8 = 2;
const DATA_PIN: u8 = 3;

type ClockLine = InOutPin<Pin<Gpio2, FunctionSioOutput, PullUp>>;
type DataLine = InOutPin<Pin<Gpio3, FunctionSioOutput, PullUp>>;

struct Lines {
    clock: ClockLine,
    data: DataLine,
}

static LINES: Mutex<RefCell<Option<Lines>>> = Mutex::new(RefCell::new(None));
static TIMER: Mutex<RefCell<Option<Timer>>> = Mutex::new(RefCell::new(None));

static KEYBOARD: Keyboard<PicoPlatform, NullDiagnostics> =
    Keyboard::new(PicoPlatform, CLOCK_PIN, DATA_PIN, NullDiagnostics);

/// `ps2kbd::Platform` over the shared pins and the µs timer.
///
/// The lines are `InOutPin`s: set high releases to the pull-up, set low
/// actively sinks, which is exactly the open-collector contract.
pub struct PicoPlatform;

impl PicoPlatform {
    fn with_lines<R>(&self, f: impl FnOnce(&mut Lines) -> R) -> Option<R> {
        critical_section::with(|cs| LINES.borrow(cs).borrow_mut().as_mut().map(f))
    }
}

impl Platform for PicoPlatform {
    fn release(&self, pin: u8) {
        self.with_lines(|lines| {
            match pin {
                CLOCK_PIN => lines.clock.set_high().ok(),
                DATA_PIN => lines.data.set_high().ok(),
                _ => None,
            };
        });
    }

    fn drive_low(&self, pin: u8) {
        self.with_lines(|lines| {
            match pin {
                CLOCK_PIN => lines.clock.set_low().ok(),
                DATA_PIN => lines.data.set_low().ok(),
                _ => None,
            };
        });
    }

    fn is_high(&self, pin: u8) -> bool {
        self.with_lines(|lines| match pin {
            CLOCK_PIN => lines.clock.is_high().unwrap_or(true),
            DATA_PIN => lines.data.is_high().unwrap_or(true),
            _ => true,
        })
        .unwrap_or(true)
    }

    fn attach_falling_edge(&self, pin: u8, _handler: fn(u8)) {
        // The IO_IRQ_BANK0 handler below routes every enabled edge into
        // ps2kbd::clock_edge, so "attach" is just the per-pin enable.
        // INTE packs four flag bits per GPIO; EDGE_LOW is bit 2.
        let io = unsafe { &(*pac::IO_BANK0::ptr()) };
        let bit = 1u32 << ((pin % 8) * 4 + 2);
        io.proc0_inte[usize::from(pin / 8)].modify(|r, w| unsafe { w.bits(r.bits() | bit) });
    }

    fn detach_falling_edge(&self, pin: u8) {
        let io = unsafe { &(*pac::IO_BANK0::ptr()) };
        let bit = 1u32 << ((pin % 8) * 4 + 2);
        io.proc0_inte[usize::from(pin / 8)].modify(|r, w| unsafe { w.bits(r.bits() & !bit) });
    }

    fn micros(&self) -> u32 {
        critical_section::with(|cs| {
            TIMER
                .borrow(cs)
                .borrow()
                .as_ref()
                .map(|timer| timer.get_counter_low())
                .unwrap_or(0)
        })
    }

    fn millis(&self) -> u32 {
        critical_section::with(|cs| {
            TIMER
                .borrow(cs)
                .borrow()
                .as_ref()
                .map(|timer| (timer.get_counter().ticks() / 1000) as u32)
                .unwrap_or(0)
        })
    }

    fn delay_us(&self, us: u32) {
        let start = self.micros();
        while self.micros().wrapping_sub(start) < us {}
    }
}

#[interrupt]
fn IO_IRQ_BANK0() {
    // Acknowledge the edge, then hand it to the driver.
    let io = unsafe { &(*pac::IO_BANK0::ptr()) };
    let bit = 1u32 << ((CLOCK_PIN % 8) * 4 + 2);
    io.intr[usize::from(CLOCK_PIN / 8)].write(|w| unsafe { w.bits(bit) });
    ps2kbd::clock_edge(CLOCK_PIN);
}

#[entry]
fn main() -> ! {
    let mut pac = pac::Peripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);

    let clocks = init_clocks_and_plls(
        bsp::XOSC_CRYSTAL_FREQ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    let sio = Sio::new(pac.SIO);
    let pins = bsp::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    let timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let clock_line = InOutPin::new(pins.gpio2.reconfigure());
    let data_line = InOutPin::new(pins.gpio3.reconfigure());
    let mut led = pins.led.into_push_pull_output();

    critical_section::with(|cs| {
        LINES.borrow(cs).replace(Some(Lines {
            clock: clock_line,
            data: data_line,
        }));
        TIMER.borrow(cs).replace(Some(timer));
    });

    unsafe { pac::NVIC::unmask(pac::Interrupt::IO_IRQ_BANK0) };

    KEYBOARD.begin();
    if !KEYBOARD.await_startup() {
        // No power-on report: the keyboard was up before we were.
        let _ = KEYBOARD.reset();
    }

    let mut leds = KeyboardLeds::NONE;
    let mut breaking = false;
    loop {
        match KEYBOARD.read_scan_code() {
            KeyboardOutput::Empty => continue,
            KeyboardOutput::BreakPrefix => breaking = true,
            KeyboardOutput::Scan(code) => {
                let _ = led.set_high();
                if !breaking {
                    // Set-2 make codes for caps, num and scroll lock.
                    let toggled = match code {
                        0x58 => Some(KeyboardLeds::CAPS_LOCK),
                        0x77 => Some(KeyboardLeds::NUM_LOCK),
                        0x7E => Some(KeyboardLeds::SCROLL_LOCK),
                        _ => None,
                    };
                    if let Some(lock) = toggled {
                        leds = toggle(leds, lock);
                        KEYBOARD.send_led_status(leds);
                    }
                }
                breaking = false;
                let _ = led.set_low();
            }
            _ => breaking = false,
        }
    }
}

fn toggle(current: KeyboardLeds, lock: KeyboardLeds) -> KeyboardLeds {
    if current.mask() & lock.mask() != 0 {
        let mut next = KeyboardLeds::NONE;
        for candidate in [
            KeyboardLeds::SCROLL_LOCK,
            KeyboardLeds::NUM_LOCK,
            KeyboardLeds::CAPS_LOCK,
        ] {
            if current.mask() & candidate.mask() != 0 && candidate != lock {
                next |= candidate;
            }
        }
        next
    } else {
        current | lock
    }
}
