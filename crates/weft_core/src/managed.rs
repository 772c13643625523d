//! Resource-scoped cells
//!
//! A managed cell binds external resources to its own subscribe/unsubscribe
//! transitions: factories run when the first observer arrives, resources are
//! released when the last observer leaves, and the cycle may repeat over the
//! cell's lifetime.

use std::cell::RefCell;

use tracing::trace;

use crate::cell::{Cell, Driver};
use crate::observe::Observation;
use crate::value::CellValue;

/// A resource whose release capability is invoked exactly once per
/// deactivation.
pub trait ManagedResource: 'static {
    fn release(self);
}

/// An ordered set of resource factories.
///
/// Implemented for tuples of factory closures up to arity four. `create`
/// runs the factories in declared order; `release` returns the resources in
/// that same order.
pub trait ResourceSet: 'static {
    type Resources: 'static;

    fn create(&self) -> Self::Resources;
    fn release(resources: Self::Resources);
}

impl ResourceSet for () {
    type Resources = ();

    fn create(&self) {}
    fn release(_: ()) {}
}

macro_rules! resource_set_tuple {
    ($(($F:ident, $R:ident, $idx:tt)),+) => {
        impl<$($F,)+ $($R,)+> ResourceSet for ($($F,)+)
        where
            $($F: Fn() -> $R + 'static,)+
            $($R: ManagedResource,)+
        {
            type Resources = ($($R,)+);

            fn create(&self) -> Self::Resources {
                ($((self.$idx)(),)+)
            }

            fn release(resources: Self::Resources) {
                $(resources.$idx.release();)+
            }
        }
    };
}

resource_set_tuple!((F1, R1, 0));
resource_set_tuple!((F1, R1, 0), (F2, R2, 1));
resource_set_tuple!((F1, R1, 0), (F2, R2, 1), (F3, R3, 2));
resource_set_tuple!((F1, R1, 0), (F2, R2, 1), (F3, R3, 2), (F4, R4, 3));

struct ManagedActive<S: ResourceSet, T: CellValue> {
    resources: S::Resources,
    /// Keeps the computed inner cell alive while active; the forwarding
    /// subscription only holds it weakly.
    inner: Cell<T>,
    subscription: Observation,
}

struct ManagedDriver<S: ResourceSet, T: CellValue> {
    factories: S,
    compute: Box<dyn Fn(&S::Resources) -> Cell<T>>,
    active: RefCell<Option<ManagedActive<S, T>>>,
}

impl<S: ResourceSet, T: CellValue> ManagedDriver<S, T> {
    fn release_active(&self) {
        let active = self.active.borrow_mut().take();
        let Some(ManagedActive {
            resources,
            inner,
            subscription,
        }) = active
        else {
            return;
        };
        // The subscription state is torn down before any release runs, so a
        // faulting release cannot leave this node stuck active.
        subscription.stop();
        drop(inner);
        trace!("managed cell releasing resources");
        S::release(resources);
    }
}

impl<S: ResourceSet, T: CellValue> Driver<T> for ManagedDriver<S, T> {
    fn peek(&self) -> T {
        // One-shot: create, read, release. Nothing is retained.
        let resources = self.factories.create();
        let inner = (self.compute)(&resources);
        let value = inner.get();
        S::release(resources);
        value
    }

    fn activate(&self, target: &Cell<T>) {
        trace!("managed cell creating resources");
        let resources = self.factories.create();
        let inner = (self.compute)(&resources);
        let weak = target.downgrade();
        let subscription = inner.subscribe(true, move |value, _| {
            if let Some(target) = weak.upgrade() {
                target.set(value.clone());
            }
        });
        *self.active.borrow_mut() = Some(ManagedActive {
            resources,
            inner,
            subscription,
        });
    }

    fn deactivate(&self) {
        self.release_active();
    }

    fn is_active(&self) -> bool {
        self.active.borrow().is_some()
    }
}

/// Dropping the last handle to an active managed cell still releases its
/// resources exactly once.
impl<S: ResourceSet, T: CellValue> Drop for ManagedDriver<S, T> {
    fn drop(&mut self) {
        self.release_active();
    }
}

/// A cell computed from managed resources.
///
/// `factories` run, in declared order, when the first observer arrives;
/// their resources are handed to `compute`, and the resulting inner cell is
/// tracked exactly like a flattened derived cell. When the last observer
/// leaves, the inner subscription stops and every resource is released in
/// declared order. Re-observing re-runs the whole cycle.
pub fn managed<S: ResourceSet, T: CellValue>(
    factories: S,
    compute: impl Fn(&S::Resources) -> Cell<T> + 'static,
) -> Cell<T> {
    Cell::driven(Box::new(ManagedDriver {
        factories,
        compute: Box::new(compute),
        active: RefCell::new(None),
    }))
}
