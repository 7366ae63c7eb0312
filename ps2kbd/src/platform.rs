//! What the driver needs from the chip it runs on.

/// Capability set the driver consumes from its host environment.
///
/// Pins are named by small integer tokens whose meaning belongs to the
/// implementation: an Arduino-style pin number, a GPIO index, a slot in a
/// simulated bus. Both protocol lines are open collector, so a pin has
/// exactly two states: released (input with pull-up, line floats high) or
/// actively driven low. The driver never pushes a line high.
///
/// The clock pin must be routed to an interrupt source that can fire on a
/// falling edge. `micros` and `millis` are monotonic counters that wrap;
/// the driver only ever compares them wrap-safely.
///
/// Critical sections are not part of this trait: the driver uses the
/// `critical-section` crate, and the target must link one of its
/// implementations (for example `cortex-m` with
/// `critical-section-single-core`, or this crate's `std` feature on hosted
/// targets).
pub trait Platform {
    /// Releases the pin: input with pull-up.
    fn release(&self, pin: u8);

    /// Actively drives the pin low.
    fn drive_low(&self, pin: u8);

    /// Samples the line level. The receive path calls this from the clock
    /// interrupt with roughly 30 µs of data-valid window, so it must be a
    /// plain register read, not anything queued.
    fn is_high(&self, pin: u8) -> bool;

    /// Starts delivering falling edges on `pin` to `handler`, called from
    /// interrupt context with the pin token. Attaching while already
    /// attached replaces the handler.
    fn attach_falling_edge(&self, pin: u8, handler: fn(u8));

    /// Stops edge delivery for `pin`.
    fn detach_falling_edge(&self, pin: u8);

    /// Monotonic wrapping microsecond counter.
    fn micros(&self) -> u32;

    /// Monotonic wrapping millisecond counter.
    fn millis(&self) -> u32;

    /// Busy-waits roughly `us` microseconds. Only used from the
    /// foreground, for delays in the 100 µs range.
    fn delay_us(&self, us: u32);
}
