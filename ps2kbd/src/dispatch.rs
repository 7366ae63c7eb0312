//! Routes falling clock edges to driver instances.
//!
//! Edge interrupts deliver no context pointer, so instances register here
//! keyed by their clock pin and the platform's interrupt shim calls
//! [`clock_edge`] with the pin token. The table is process-wide and updated
//! only under a critical section; one instance per clock pin.

use core::cell::RefCell;
use critical_section::Mutex;

pub(crate) trait EdgeHandler: Sync {
    fn on_clock_edge(&self);
}

const MAX_INSTANCES: usize = 4;

static INSTANCES: Mutex<RefCell<[Option<(u8, &'static dyn EdgeHandler)>; MAX_INSTANCES]>> =
    Mutex::new(RefCell::new([None; MAX_INSTANCES]));

/// Entry point for the platform's falling-edge interrupt on a clock pin.
///
/// Call this from the interrupt shim with the pin token the edge arrived
/// on. Edges for pins with no registered driver are dropped.
pub fn clock_edge(pin: u8) {
    let handler = critical_section::with(|cs| {
        INSTANCES
            .borrow(cs)
            .borrow()
            .iter()
            .flatten()
            .find(|(p, _)| *p == pin)
            .map(|(_, handler)| *handler)
    });
    if let Some(handler) = handler {
        handler.on_clock_edge();
    }
}

/// Claims `pin` for `handler`. Fails when the pin is already claimed or
/// the table is full.
pub(crate) fn register(pin: u8, handler: &'static dyn EdgeHandler) -> bool {
    critical_section::with(|cs| {
        let mut table = INSTANCES.borrow(cs).borrow_mut();
        if table.iter().flatten().any(|(p, _)| *p == pin) {
            return false;
        }
        match table.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some((pin, handler));
                true
            }
            None => false,
        }
    })
}

pub(crate) fn unregister(pin: u8) {
    critical_section::with(|cs| {
        let mut table = INSTANCES.borrow(cs).borrow_mut();
        for slot in table.iter_mut() {
            if matches!(slot, Some((p, _)) if *p == pin) {
                *slot = None;
            }
        }
    });
}
