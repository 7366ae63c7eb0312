//! Host-side driver for the PS/2 keyboard wire protocol
//!
//! A PS/2 keyboard talks to its host over two open-collector lines, clock
//! and data. The keyboard owns the clock: it runs at roughly 10–17 kHz and
//! every falling edge carries one bit of an 11-bit frame (start, eight data
//! bits LSB first, odd parity, stop). The host can also talk back: it
//! inhibits the keyboard by holding clock low, asserts data as a
//! request-to-send, and then lets the keyboard clock the host's 12-bit
//! frame out bit by bit. This crate implements both directions, the
//! direction switch between them, and the command/response protocol layered
//! on top: LEDs, typematic rate, scan-code sets, echo, reset, device id.
//!
//! The driver is split between two execution contexts. A falling-edge
//! interrupt on the clock pin samples the data line and feeds the frame
//! engines; accepted bytes land in a bounded queue. The application polls
//! [`Keyboard::read_scan_code`] from its main loop and gets the queued
//! bytes back in arrival order, plus two out-of-band values: `Empty` when
//! there is nothing to read, and `Garbled` when a framing error was
//! detected and recovery (a resend request to the keyboard) is under way.
//!
//! To keep the interrupt handler portable the crate does not touch hardware
//! itself. You supply a [`Platform`] implementation that can release or
//! drive-low the two pins, sample them, route the clock pin's falling edge
//! to a handler, and read wrapping microsecond/millisecond clocks. Critical
//! sections go through the `critical-section` crate, so the target also
//! needs one of its implementations (`cortex-m` with the
//! `critical-section-single-core` feature on single-core ARM targets, the
//! `std` feature of this crate on hosted targets).
//!
//! Edge interrupts arrive without a context pointer, so driver instances
//! register themselves in a process-wide table keyed by clock pin. The
//! platform's interrupt shim calls [`clock_edge`] with the pin token and
//! the table routes it to the right instance. This is why [`Keyboard::begin`]
//! wants a `&'static self`; put the driver in a `static`:
//!
//! ```ignore
//! use ps2kbd::{Keyboard, NullDiagnostics};
//!
//! static KEYBOARD: Keyboard<MyPlatform, NullDiagnostics> =
//!     Keyboard::new(MyPlatform::new(), CLOCK_PIN, DATA_PIN, NullDiagnostics);
//!
//! // in the GPIO falling-edge ISR for CLOCK_PIN:
//! //     ps2kbd::clock_edge(CLOCK_PIN);
//!
//! fn main() -> ! {
//!     KEYBOARD.begin();
//!     KEYBOARD.await_startup();
//!     loop {
//!         match KEYBOARD.read_scan_code() {
//!             ps2kbd::KeyboardOutput::Empty => {}
//!             code => handle(code),
//!         }
//!     }
//! }
//! ```
//!
//! Poll `read_scan_code` frequently; it returns in microseconds. The queue
//! capacity is a const generic defaulting to 16 bytes. A full keystroke is
//! 2 to 5 bytes, so even a slow main loop keeps up, and a tight one can run
//! with a capacity of 1. When the queue does overflow the oldest byte is
//! dropped and the [`Diagnostics`] sink hears about it.
//!
//! The setup commands ([`Keyboard::send_led_status`],
//! [`Keyboard::set_typematic_rate_and_delay`], …) block for up to a few
//! milliseconds waiting on the keyboard's acknowledge and report success as
//! a `bool`. Don't build elaborate recovery on top of a `false`: with a
//! wired keyboard the usual cause is interrupt latency elsewhere in the
//! system, and the next attempt succeeds.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(test)]
extern crate std;

mod codes;
mod diagnostics;
mod dispatch;
mod frame;
mod keyboard;
mod output_buffer;
mod platform;

pub use codes::{KeyboardLeds, KeyboardOutput, ScanCodeSet, TypematicDelay, TypematicRate};
pub use diagnostics::{Diagnostics, Event, EventRecorder, NullDiagnostics};
pub use dispatch::clock_edge;
pub use keyboard::Keyboard;
pub use platform::Platform;
