//! Reactive value cells
//!
//! A [`Cell`] always holds a current value and broadcasts accepted changes to
//! its observers synchronously, in registration order. Broadcasts are stamped
//! with a per-cell generation counter; a nested re-entrant `set` supersedes
//! the in-flight broadcast and the stale remainder is silently suppressed.
//!
//! Propagation is strictly single-threaded: a `set` completes its entire
//! broadcast, including any nested sets triggered by observers, before it
//! returns. There is no queue and no scheduler.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tracing::trace;

use crate::observe::Observation;
use crate::value::{CellValue, IntoCell};

new_key_type! {
    /// Slot of one registered observer within its owning cell
    pub(crate) struct ObserverKey;
}

type ObserverFn<T> = Rc<dyn Fn(&T, &Observation)>;

struct ObserverEntry<T> {
    callback: ObserverFn<T>,
    handle: Observation,
}

struct CellState<T> {
    /// Always `Some` for root cells; populated for driven cells only while
    /// their driver is active (or mid-activation).
    value: Option<T>,
    /// Increments on every accepted `set`; never resets.
    generation: u64,
    observers: SlotMap<ObserverKey, ObserverEntry<T>>,
    /// Registration order of live observers. Delivery order is a hard
    /// contract: first registered fires first.
    order: Vec<ObserverKey>,
}

/// Computes a driven cell's value from upstream sources.
///
/// Implemented by the derive, combine, and managed nodes. Inert drivers
/// evaluate one-shot through `peek`; active drivers hold upstream
/// subscriptions and push through the owning cell's `set`.
pub(crate) trait Driver<T: CellValue> {
    /// One-shot, non-subscribing evaluation while inert.
    fn peek(&self) -> T;
    /// First external observer arrived: subscribe upstream and prime `target`.
    fn activate(&self, target: &Cell<T>);
    /// Last external observer left: release every upstream subscription.
    fn deactivate(&self);
    fn is_active(&self) -> bool;
}

pub(crate) struct CellCore<T: CellValue> {
    state: RefCell<CellState<T>>,
    driver: Option<Box<dyn Driver<T>>>,
    /// Lazily-created liveness counter, see [`Cell::ref_count`].
    liveness: RefCell<Option<Cell<usize>>>,
}

/// A container that always holds a current value and can be observed for
/// changes.
///
/// `Cell` is a cheap handle; clones share the same underlying state. All
/// mutation is serialized by the call stack, which is what makes the
/// generation-guard protocol sound.
pub struct Cell<T: CellValue> {
    core: Rc<CellCore<T>>,
}

impl<T: CellValue> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// Cells compare by identity, like any shared composite.
impl<T: CellValue> CellValue for Cell<T> {
    fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

pub(crate) struct WeakCell<T: CellValue> {
    core: Weak<CellCore<T>>,
}

impl<T: CellValue> Clone for WeakCell<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: CellValue> WeakCell<T> {
    pub(crate) fn upgrade(&self) -> Option<Cell<T>> {
        self.core.upgrade().map(|core| Cell { core })
    }
}

impl<T: CellValue> Cell<T> {
    /// Create a root cell holding `value`.
    pub fn new(value: T) -> Self {
        Self::build(Some(value), None)
    }

    /// Wrap a plain value in a cell, or pass an existing cell through
    /// unchanged.
    pub fn of(value: impl IntoCell<T>) -> Self {
        value.into_cell()
    }

    /// Create a cell whose value is produced by `driver`.
    pub(crate) fn driven(driver: Box<dyn Driver<T>>) -> Self {
        Self::build(None, Some(driver))
    }

    fn build(value: Option<T>, driver: Option<Box<dyn Driver<T>>>) -> Self {
        Self {
            core: Rc::new(CellCore {
                state: RefCell::new(CellState {
                    value,
                    generation: 0,
                    observers: SlotMap::with_key(),
                    order: Vec::new(),
                }),
                driver,
                liveness: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Current value, synchronously. Creates no subscription and performs no
    /// retained work; an unobserved driven cell evaluates one-shot.
    pub fn get(&self) -> T {
        if let Some(driver) = &self.core.driver {
            if !driver.is_active() {
                return driver.peek();
            }
            if let Some(value) = self.core.state.borrow().value.clone() {
                return value;
            }
            // Activation is underway and the value is not primed yet.
            return driver.peek();
        }
        self.core
            .state
            .borrow()
            .value
            .clone()
            .expect("root cell always holds a value")
    }

    /// Broadcast stamp of the last accepted `set`.
    pub fn generation(&self) -> u64 {
        self.core.state.borrow().generation
    }

    /// Replace the value and notify observers in registration order.
    ///
    /// A value `same` as the current one is a no-op: no generation increment,
    /// no delivery. Observers that trigger a further `set` on this cell
    /// re-enter fully before control returns here; the interrupted broadcast
    /// then stops, so no observer ever receives a superseded value after a
    /// newer one was delivered.
    pub fn set(&self, value: T) {
        let generation = {
            let mut state = self.core.state.borrow_mut();
            if let Some(current) = &state.value {
                if current.same(&value) {
                    return;
                }
            }
            state.value = Some(value);
            state.generation += 1;
            state.generation
        };
        trace!(generation, "cell value updated");
        self.broadcast(generation);
    }

    /// Read-modify-write convenience over `get` and `set`.
    pub fn update(&self, apply: impl FnOnce(&T) -> T) {
        let next = apply(&self.get());
        self.set(next);
    }

    fn broadcast(&self, generation: u64) {
        let snapshot: SmallVec<[ObserverKey; 4]> = {
            let state = self.core.state.borrow();
            state.order.iter().copied().collect()
        };
        for key in snapshot {
            let slot = {
                let state = self.core.state.borrow();
                if state.generation != generation {
                    // A nested set superseded this broadcast; the remaining
                    // observers already saw the newer value.
                    trace!(
                        stale = generation,
                        current = state.generation,
                        "broadcast superseded"
                    );
                    return;
                }
                state.observers.get(key).and_then(|entry| {
                    state
                        .value
                        .clone()
                        .map(|value| (entry.callback.clone(), entry.handle.clone(), value))
                })
            };
            // Stopped mid-broadcast: skip without aborting the pass.
            let Some((callback, handle, value)) = slot else {
                continue;
            };
            callback(&value, &handle);
        }
    }

    /// Register an observer. With `immediate`, the callback first receives
    /// the current value as a direct call (outside any broadcast), then the
    /// observer is appended at the end of the registration order.
    ///
    /// The callback receives its own [`Observation`] handle, so it can cancel
    /// itself without capturing the return value.
    pub fn subscribe(
        &self,
        immediate: bool,
        callback: impl Fn(&T, &Observation) + 'static,
    ) -> Observation {
        self.activate_if_first();

        // The liveness broadcast settles before the new observer sees the
        // value, so count-reactive priming logic runs first.
        let incoming = self.core.state.borrow().order.len() + 1;
        self.note_liveness(incoming);

        let handle = Observation::pending();
        let callback: ObserverFn<T> = Rc::new(callback);

        if immediate {
            let value = self.get();
            callback(&value, &handle);
            if handle.is_stopped() {
                // Cancelled from inside its own immediate call: never append.
                let remaining = self.core.state.borrow().order.len();
                self.note_liveness(remaining);
                self.deactivate_if_unobserved();
                return handle;
            }
        }

        let key = {
            let mut state = self.core.state.borrow_mut();
            let key = state.observers.insert(ObserverEntry {
                callback,
                handle: handle.clone(),
            });
            state.order.push(key);
            key
        };

        // A re-entrant subscribe from the immediate callback read the count
        // before this observer was appended; settle on the true length. The
        // equality gate makes this a no-op in the plain path.
        let observed = self.core.state.borrow().order.len();
        self.note_liveness(observed);

        let weak = self.downgrade();
        handle.bind(move || {
            if let Some(cell) = weak.upgrade() {
                cell.remove_observer(key);
            }
        });
        handle
    }

    fn remove_observer(&self, key: ObserverKey) {
        let removed = {
            let mut state = self.core.state.borrow_mut();
            let removed = state.observers.remove(key).is_some();
            if removed {
                state.order.retain(|k| *k != key);
            }
            removed
        };
        if !removed {
            return;
        }
        let remaining = self.core.state.borrow().order.len();
        self.note_liveness(remaining);
        self.deactivate_if_unobserved();
    }

    /// The number of live observations on this cell, as a cell.
    ///
    /// Created lazily and seeded with the current count; every subsequent
    /// subscribe/stop updates it through ordinary propagation.
    pub fn ref_count(&self) -> Cell<usize> {
        if let Some(counter) = self.core.liveness.borrow().as_ref() {
            return counter.clone();
        }
        let counter = Cell::new(self.core.state.borrow().order.len());
        *self.core.liveness.borrow_mut() = Some(counter.clone());
        counter
    }

    fn note_liveness(&self, count: usize) {
        let counter = self.core.liveness.borrow().as_ref().cloned();
        if let Some(counter) = counter {
            counter.set(count);
        }
    }

    fn activate_if_first(&self) {
        let Some(driver) = &self.core.driver else {
            return;
        };
        if driver.is_active() || !self.core.state.borrow().order.is_empty() {
            return;
        }
        trace!("cell activated");
        driver.activate(self);
    }

    fn deactivate_if_unobserved(&self) {
        if !self.core.state.borrow().order.is_empty() {
            return;
        }
        if let Some(driver) = &self.core.driver {
            if driver.is_active() {
                trace!("cell deactivated");
                driver.deactivate();
            }
        }
    }
}

impl<T: CellValue + std::fmt::Debug> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("value", &self.get())
            .field("generation", &self.generation())
            .finish()
    }
}
