//! Observation handles
//!
//! Every subscription returns an [`Observation`]: a cancellation capability
//! bound to one (cell, observer) pair. Stopping is synchronous, immediate,
//! and idempotent, and may be called from inside the very callback being
//! cancelled.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct ObservationInner {
    stopped: Cell<bool>,
    /// Removes the observer from the owning cell. Holds only a weak
    /// reference to the cell, so an observation never keeps its cell alive.
    detach: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// A cancellable handle for one subscription to a cell.
///
/// Cloning yields another handle to the same subscription; stopping any
/// clone stops them all.
#[derive(Clone)]
pub struct Observation {
    inner: Rc<ObservationInner>,
}

impl Observation {
    /// A handle not yet bound to an observer slot. Used during `subscribe`
    /// so the immediate callback can already cancel itself.
    pub(crate) fn pending() -> Self {
        Self {
            inner: Rc::new(ObservationInner {
                stopped: Cell::new(false),
                detach: RefCell::new(None),
            }),
        }
    }

    /// Attach the removal action once the observer has been registered.
    pub(crate) fn bind(&self, detach: impl FnOnce() + 'static) {
        debug_assert!(!self.is_stopped(), "cannot bind a stopped observation");
        *self.inner.detach.borrow_mut() = Some(Box::new(detach));
    }

    /// Cancel the subscription. Idempotent; a second call does nothing.
    pub fn stop(&self) {
        if self.inner.stopped.replace(true) {
            return;
        }
        let detach = self.inner.detach.borrow_mut().take();
        if let Some(detach) = detach {
            detach();
        }
    }

    /// Whether `stop` has been called on this subscription.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
