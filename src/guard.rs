//! Reentrancy bracket around every call crossing into module code.
//!
//! While at least one region is open, the registry must not relocate or free
//! the module record in flight; teardown of that module is deferred until the
//! outermost region closes. Regions nest arbitrarily and every enter is paired
//! with exactly one leave, enforced by RAII rather than hand-paired calls.

use std::cell::Cell;
use std::rc::Rc;

/// Depth-counting guard shared by the whole host. Single host thread by
/// design, so a plain `Cell` suffices.
#[derive(Debug, Default)]
pub struct Reentrancy {
    depth: Cell<u32>,
}

impl Reentrancy {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Open a region. The returned token closes it on drop, on every exit
    /// path including errors and panics.
    pub fn enter(self: &Rc<Self>) -> Region {
        let d = self.depth.get();
        self.depth.set(d + 1);
        if d == 0 {
            log::trace!("entering module region");
        }
        Region {
            guard: Rc::clone(self),
        }
    }

    /// Current nesting depth. Zero between top-level host calls.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// True while any call into module code is in flight.
    pub fn in_region(&self) -> bool {
        self.depth.get() > 0
    }

    fn leave(&self) {
        let d = self.depth.get();
        if d == 0 {
            // The guard's own invariant is broken; the module table can no
            // longer be trusted. Terminate instead of running torn state.
            log::error!("unbalanced leave of module region, aborting");
            std::process::abort();
        }
        self.depth.set(d - 1);
        if d == 1 {
            log::trace!("left outermost module region");
        }
    }
}

/// RAII token for one open region.
pub struct Region {
    guard: Rc<Reentrancy>,
}

impl Drop for Region {
    fn drop(&mut self) {
        self.guard.leave();
    }
}
