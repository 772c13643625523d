//! Multi-source combination
//!
//! [`all`] joins several cells into one cell of their value product. While
//! observed it subscribes to every source uniformly and recomputes the full
//! product once per incoming change. Each source change is its own broadcast
//! with its own generation; there is no notional "tick".

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::cell::{Cell, Driver};
use crate::observe::Observation;
use crate::value::CellValue;

/// A fixed set of source cells that can be read and observed as one unit.
///
/// Implemented for tuples of cells up to arity eight and for homogeneous
/// `Vec<Cell<T>>` source lists.
pub trait CellSet: Clone + 'static {
    type Values: CellValue;

    /// One-shot read of every source, in declared order.
    fn read(&self) -> Self::Values;

    /// Subscribe (non-immediate) to every source; any change calls `notify`.
    fn observe(&self, notify: Rc<dyn Fn()>) -> SmallVec<[Observation; 4]>;
}

struct CombineDriver<C: CellSet> {
    sources: C,
    /// `Some` exactly while active, even for an empty source set.
    subscriptions: RefCell<Option<SmallVec<[Observation; 4]>>>,
}

impl<C: CellSet> CombineDriver<C> {
    fn stop_subscriptions(&self) {
        let subscriptions = self.subscriptions.borrow_mut().take();
        if let Some(subscriptions) = subscriptions {
            for subscription in subscriptions {
                subscription.stop();
            }
        }
    }
}

impl<C: CellSet> Driver<C::Values> for CombineDriver<C> {
    fn peek(&self) -> C::Values {
        self.sources.read()
    }

    fn activate(&self, target: &Cell<C::Values>) {
        let weak = target.downgrade();
        let sources = self.sources.clone();
        let notify: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(target) = weak.upgrade() {
                target.set(sources.read());
            }
        });
        *self.subscriptions.borrow_mut() = Some(self.sources.observe(notify));
        target.set(self.sources.read());
    }

    fn deactivate(&self) {
        self.stop_subscriptions();
    }

    fn is_active(&self) -> bool {
        self.subscriptions.borrow().is_some()
    }
}

/// Dropping the last handle to an active combined cell must not strand dead
/// observer entries on its sources.
impl<C: CellSet> Drop for CombineDriver<C> {
    fn drop(&mut self) {
        self.stop_subscriptions();
    }
}

macro_rules! cell_set_tuple {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T: CellValue),+> CellSet for ($(Cell<$T>,)+) {
            type Values = ($($T,)+);

            fn read(&self) -> Self::Values {
                ($(self.$idx.get(),)+)
            }

            fn observe(&self, notify: Rc<dyn Fn()>) -> SmallVec<[Observation; 4]> {
                let mut subscriptions = SmallVec::new();
                $(
                    let on_change = notify.clone();
                    subscriptions.push(self.$idx.subscribe(false, move |_, _| on_change()));
                )+
                subscriptions
            }
        }
    };
}

cell_set_tuple!((A, 0));
cell_set_tuple!((A, 0), (B, 1));
cell_set_tuple!((A, 0), (B, 1), (C, 2));
cell_set_tuple!((A, 0), (B, 1), (C, 2), (D, 3));
cell_set_tuple!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4));
cell_set_tuple!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5));
cell_set_tuple!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6));
cell_set_tuple!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6), (H, 7));

impl<T: CellValue> CellSet for Vec<Cell<T>> {
    type Values = Vec<T>;

    fn read(&self) -> Vec<T> {
        self.iter().map(Cell::get).collect()
    }

    fn observe(&self, notify: Rc<dyn Fn()>) -> SmallVec<[Observation; 4]> {
        self.iter()
            .map(|cell| {
                let on_change = notify.clone();
                cell.subscribe(false, move |_, _| on_change())
            })
            .collect()
    }
}

/// A cell holding the product of every source's current value.
pub fn all<C: CellSet>(sources: C) -> Cell<C::Values> {
    Cell::driven(Box::new(CombineDriver {
        sources,
        subscriptions: RefCell::new(None),
    }))
}

/// A cell holding `map` applied to the product of the sources.
pub fn map_all<C: CellSet, U: CellValue>(
    sources: C,
    map: impl Fn(&C::Values) -> U + 'static,
) -> Cell<U> {
    all(sources).map(map)
}

/// The flattening counterpart of [`map_all`]: `map` yields a nested cell.
pub fn flat_map_all<C: CellSet, U: CellValue>(
    sources: C,
    map: impl Fn(&C::Values) -> Cell<U> + 'static,
) -> Cell<U> {
    all(sources).flat_map(map)
}

/// Curry a mapping function into a reusable combinator constructor.
pub fn lift<C: CellSet, U: CellValue>(
    map: impl Fn(&C::Values) -> U + Clone + 'static,
) -> impl Fn(C) -> Cell<U> {
    move |sources| map_all(sources, map.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(&T, &Observation)) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |value: &T, _: &Observation| {
            sink.borrow_mut().push(value.clone())
        })
    }

    #[test]
    fn test_all_inert_get_reads_every_source() {
        let a = Cell::new(1);
        let b = Cell::new("x");
        let joined = all((a.clone(), b.clone()));

        assert_eq!(joined.get(), (1, "x"));
        a.set(2);
        assert_eq!(joined.get(), (2, "x"));
        assert_eq!(a.ref_count().get(), 0);
        assert_eq!(b.ref_count().get(), 0);
    }

    #[test]
    fn test_all_recomputes_once_per_incoming_change() {
        let a = Cell::new(1);
        let b = Cell::new(10);
        let joined = all((a.clone(), b.clone()));

        let (log, push) = recorder();
        joined.subscribe(true, push);
        assert_eq!(*log.borrow(), vec![(1, 10)]);

        a.set(2);
        b.set(20);
        assert_eq!(*log.borrow(), vec![(1, 10), (2, 10), (2, 20)]);
    }

    #[test]
    fn test_all_releases_sources_on_deactivation() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let joined = all((a.clone(), b.clone()));

        let observation = joined.subscribe(false, |_: &(i32, i32), _: &Observation| {});
        assert_eq!(a.ref_count().get(), 1);
        assert_eq!(b.ref_count().get(), 1);

        observation.stop();
        assert_eq!(a.ref_count().get(), 0);
        assert_eq!(b.ref_count().get(), 0);
    }

    #[test]
    fn test_map_all() {
        let a = Cell::new(2);
        let b = Cell::new(3);
        let sum = map_all((a.clone(), b.clone()), |(a, b)| a + b);

        let (log, push) = recorder();
        sum.subscribe(true, push);
        a.set(5);
        assert_eq!(*log.borrow(), vec![5, 8]);
    }

    #[test]
    fn test_flat_map_all_switches_inner() {
        let flag = Cell::new(true);
        let yes = Cell::new(1);
        let no = Cell::new(-1);

        let picked_yes = yes.clone();
        let picked_no = no.clone();
        let derived = flat_map_all((flag.clone(),), move |(flag,)| {
            if *flag {
                picked_yes.clone()
            } else {
                picked_no.clone()
            }
        });

        let (log, push) = recorder();
        derived.subscribe(true, push);
        flag.set(false);
        no.set(-2);
        assert_eq!(*log.borrow(), vec![1, -1, -2]);
    }

    #[test]
    fn test_lift_is_reusable() {
        let sum = lift(|(a, b): &(i32, i32)| a + b);

        let first = sum((Cell::new(1), Cell::new(2)));
        let second = sum((Cell::new(10), Cell::new(20)));
        assert_eq!(first.get(), 3);
        assert_eq!(second.get(), 30);
    }

    #[test]
    fn test_drop_active_combined_releases_sources() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let joined = all((a.clone(), b.clone()));

        let observation = joined.subscribe(false, |_: &(i32, i32), _: &Observation| {});
        assert_eq!(a.ref_count().get(), 1);

        drop(joined);
        assert_eq!(a.ref_count().get(), 0);
        assert_eq!(b.ref_count().get(), 0);
        observation.stop();
    }

    #[test]
    fn test_empty_vec_source_set() {
        let joined = all(Vec::<Cell<i32>>::new());
        assert_eq!(joined.get(), Vec::<i32>::new());

        let (log, push) = recorder();
        let first = joined.subscribe(true, push);
        let second = joined.subscribe(true, |_: &Vec<i32>, _: &Observation| {});
        assert_eq!(*log.borrow(), vec![Vec::<i32>::new()]);

        first.stop();
        second.stop();
    }

    #[test]
    fn test_vec_sources() {
        let sources: Vec<Cell<i32>> = (0..3).map(Cell::new).collect();
        let joined = all(sources.clone());

        let (log, push) = recorder();
        joined.subscribe(true, push);
        sources[1].set(7);

        assert_eq!(*log.borrow(), vec![vec![0, 1, 2], vec![0, 7, 2]]);
    }
}
