//! Derived cells
//!
//! `map`, `flat_map`, and `flatten` all run through one driver holding a
//! two-case derive kind; `flatten` is `flat_map` with the identity function.
//! A derived cell subscribes to its source only while it has observers of its
//! own; unobserved, `get` evaluates one-shot and retains nothing.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::cell::{Cell, Driver};
use crate::observe::Observation;
use crate::value::CellValue;

enum DeriveKind<S: CellValue, U: CellValue> {
    /// Forward the mapped value directly.
    Map(Rc<dyn Fn(&S) -> U>),
    /// The mapping yields a nested cell; track it and forward its values.
    Flat(Rc<dyn Fn(&S) -> Cell<U>>),
}

struct DerivedState<S: CellValue, U: CellValue> {
    source: Cell<S>,
    kind: DeriveKind<S, U>,
    /// Subscription on the source, present exactly while active.
    upstream: RefCell<Option<Observation>>,
    /// Currently tracked inner cell and its subscription (`Flat` only).
    inner: RefCell<Option<(Cell<U>, Observation)>>,
}

pub(crate) struct DerivedDriver<S: CellValue, U: CellValue> {
    shared: Rc<DerivedState<S, U>>,
}

impl<S: CellValue, U: CellValue> Driver<U> for DerivedDriver<S, U> {
    fn peek(&self) -> U {
        let value = self.shared.source.get();
        match &self.shared.kind {
            DeriveKind::Map(map) => map(&value),
            DeriveKind::Flat(map) => map(&value).get(),
        }
    }

    fn activate(&self, target: &Cell<U>) {
        let shared = Rc::downgrade(&self.shared);
        let target = target.downgrade();
        let subscription = self.shared.source.subscribe(true, move |value, _| {
            let (Some(shared), Some(target)) = (shared.upgrade(), target.upgrade()) else {
                return;
            };
            match &shared.kind {
                DeriveKind::Map(map) => target.set(map(value)),
                DeriveKind::Flat(map) => retarget(&shared, map(value), &target),
            }
        });
        *self.shared.upstream.borrow_mut() = Some(subscription);
    }

    fn deactivate(&self) {
        let upstream = self.shared.upstream.borrow_mut().take();
        if let Some(subscription) = upstream {
            subscription.stop();
        }
        let inner = self.shared.inner.borrow_mut().take();
        if let Some((_, subscription)) = inner {
            subscription.stop();
        }
        trace!("derived cell released its upstream subscriptions");
    }

    fn is_active(&self) -> bool {
        self.shared.upstream.borrow().is_some()
    }
}

/// Dropping the last handle to an active derived cell must not strand dead
/// observer entries on its sources.
impl<S: CellValue, U: CellValue> Drop for DerivedState<S, U> {
    fn drop(&mut self) {
        if let Some(subscription) = self.upstream.get_mut().take() {
            subscription.stop();
        }
        if let Some((_, subscription)) = self.inner.get_mut().take() {
            subscription.stop();
        }
    }
}

/// Track a new inner cell after the source produced it.
fn retarget<S: CellValue, U: CellValue>(
    shared: &Rc<DerivedState<S, U>>,
    next: Cell<U>,
    target: &Cell<U>,
) {
    let unchanged = shared
        .inner
        .borrow()
        .as_ref()
        .is_some_and(|(tracked, _)| tracked.same(&next));
    if unchanged {
        // Same inner cell: keep its subscription, just forward the value.
        target.set(next.get());
        return;
    }

    let previous = shared.inner.borrow_mut().take();
    if let Some((_, subscription)) = previous {
        subscription.stop();
    }

    let weak = target.downgrade();
    let subscription = next.subscribe(true, move |value, _| {
        if let Some(target) = weak.upgrade() {
            target.set(value.clone());
        }
    });

    let mut slot = shared.inner.borrow_mut();
    if slot.is_some() {
        // The immediate delivery above cascaded into another retarget, which
        // already installed a newer inner subscription. Ours is stale.
        drop(slot);
        subscription.stop();
        return;
    }
    *slot = Some((next, subscription));
}

fn derived<S: CellValue, U: CellValue>(source: &Cell<S>, kind: DeriveKind<S, U>) -> Cell<U> {
    Cell::driven(Box::new(DerivedDriver {
        shared: Rc::new(DerivedState {
            source: source.clone(),
            kind,
            upstream: RefCell::new(None),
            inner: RefCell::new(None),
        }),
    }))
}

impl<T: CellValue> Cell<T> {
    /// A cell holding `map(source value)`.
    ///
    /// `map` must be pure: how often it runs is unspecified and depends on
    /// whether and when the result is observed.
    pub fn map<U: CellValue>(&self, map: impl Fn(&T) -> U + 'static) -> Cell<U> {
        derived(self, DeriveKind::Map(Rc::new(map)))
    }

    /// A cell tracking the nested cell produced by `map`, holding its value.
    pub fn flat_map<U: CellValue>(&self, map: impl Fn(&T) -> Cell<U> + 'static) -> Cell<U> {
        derived(self, DeriveKind::Flat(Rc::new(map)))
    }
}

impl<U: CellValue> Cell<Cell<U>> {
    /// Collapse a cell of cells into a cell of the inner value.
    pub fn flatten(&self) -> Cell<U> {
        self.flat_map(|inner| inner.clone())
    }
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
    fn test_map_is_lazy_until_observed() {
        let runs = Rc::new(RefCell::new(0));
        let source = Cell::new(1);
        let counted = runs.clone();
        let _doubled = source.map(move |n| {
            *counted.borrow_mut() += 1;
            n * 2
        });

        source.set(5);
        assert_eq!(*runs.borrow(), 0);
    }

    #[test]
    fn test_inert_get_is_one_shot() {
        let runs = Rc::new(RefCell::new(0));
        let source = Cell::new(2);
        let counted = runs.clone();
        let doubled = source.map(move |n| {
            *counted.borrow_mut() += 1;
            n * 2
        });

        assert_eq!(doubled.get(), 4);
        assert_eq!(*runs.borrow(), 1);
        // No subscription was retained on the source.
        assert_eq!(source.ref_count().get(), 0);
    }

    #[test]
    fn test_map_propagates_while_observed() {
        let source = Cell::new(1);
        let doubled = source.map(|n| n * 2);
        let (log, push) = recorder();
        doubled.subscribe(true, push);

        source.set(3);
        source.set(4);
        assert_eq!(*log.borrow(), vec![2, 6, 8]);
    }

    #[test]
    fn test_map_deduplicates_through_equality_gate() {
        let source = Cell::new(4);
        let halved = source.map(|n| n / 2);
        let (log, push) = recorder();
        halved.subscribe(true, push);

        // 4 -> 5 leaves the mapped value at 2.
        source.set(5);
        source.set(6);
        assert_eq!(*log.borrow(), vec![2, 3]);
    }

    #[test]
    fn test_activation_tracks_first_and_last_observer() {
        let source = Cell::new(1);
        let doubled = source.map(|n| n * 2);

        assert_eq!(source.ref_count().get(), 0);

        let first = doubled.subscribe(false, |_: &i32, _: &Observation| {});
        let second = doubled.subscribe(false, |_: &i32, _: &Observation| {});
        assert_eq!(source.ref_count().get(), 1);

        first.stop();
        assert_eq!(source.ref_count().get(), 1);
        second.stop();
        assert_eq!(source.ref_count().get(), 0);
    }

    #[test]
    fn test_chained_maps_activate_the_whole_subtree() {
        let source = Cell::new(1);
        let doubled = source.map(|n| n * 2);
        let shifted = doubled.map(|n| n + 1);
        let (log, push) = recorder();
        let observation = shifted.subscribe(true, push);

        assert_eq!(source.ref_count().get(), 1);
        source.set(10);
        assert_eq!(*log.borrow(), vec![3, 21]);

        observation.stop();
        assert_eq!(source.ref_count().get(), 0);
    }

    #[test]
    fn test_flat_map_retargets_between_inner_cells() {
        let choose = Cell::new("odds");
        let odds = Cell::new(1);
        let evens = Cell::new(2);

        let picked_odds = odds.clone();
        let picked_evens = evens.clone();
        let derived = choose.flat_map(move |which| {
            if *which == "odds" {
                picked_odds.clone()
            } else {
                picked_evens.clone()
            }
        });

        let (log, push) = recorder();
        derived.subscribe(true, push);
        assert_eq!(*log.borrow(), vec![1]);

        choose.set("evens");
        assert_eq!(*log.borrow(), vec![1, 2]);

        evens.set(4);
        assert_eq!(*log.borrow(), vec![1, 2, 4]);

        // The previously tracked cell is no longer watched.
        odds.set(3);
        assert_eq!(*log.borrow(), vec![1, 2, 4]);

        choose.set("odds");
        assert_eq!(*log.borrow(), vec![1, 2, 4, 3]);
    }

    #[test]
    fn test_flat_map_inert_get_follows_inner() {
        let choose = Cell::new(true);
        let yes = Cell::new("yes");
        let no = Cell::new("no");

        let picked_yes = yes.clone();
        let picked_no = no.clone();
        let derived = choose.flat_map(move |flag| {
            if *flag {
                picked_yes.clone()
            } else {
                picked_no.clone()
            }
        });

        assert_eq!(derived.get(), "yes");
        choose.set(false);
        assert_eq!(derived.get(), "no");
        assert_eq!(choose.ref_count().get(), 0);
        assert_eq!(yes.ref_count().get(), 0);
    }

    #[test]
    fn test_flatten() {
        let inner_a = Cell::new(1);
        let inner_b = Cell::new(10);
        let outer = Cell::new(inner_a.clone());
        let flat = outer.flatten();

        let (log, push) = recorder();
        flat.subscribe(true, push);
        assert_eq!(*log.borrow(), vec![1]);

        inner_a.set(2);
        outer.set(inner_b.clone());
        inner_b.set(11);
        assert_eq!(*log.borrow(), vec![1, 2, 10, 11]);
    }

    #[test]
    fn test_flat_map_releases_inner_on_deactivation() {
        let choose = Cell::new(());
        let inner = Cell::new(5);
        let tracked = inner.clone();
        let derived = choose.flat_map(move |_| tracked.clone());

        let observation = derived.subscribe(false, |_: &i32, _: &Observation| {});
        assert_eq!(inner.ref_count().get(), 1);

        observation.stop();
        assert_eq!(inner.ref_count().get(), 0);
        assert_eq!(choose.ref_count().get(), 0);
    }

    #[test]
    fn test_drop_active_derived_releases_source() {
        let source = Cell::new(1);
        let doubled = source.map(|n| n * 2);
        let observation = doubled.subscribe(false, |_: &i32, _: &Observation| {});
        assert_eq!(source.ref_count().get(), 1);

        drop(doubled);
        assert_eq!(source.ref_count().get(), 0);
        observation.stop();
    }

    #[test]
    fn test_drop_active_flat_map_releases_inner() {
        let choose = Cell::new(());
        let inner = Cell::new(5);
        let tracked = inner.clone();
        let derived = choose.flat_map(move |_| tracked.clone());

        let observation = derived.subscribe(false, |_: &i32, _: &Observation| {});
        assert_eq!(inner.ref_count().get(), 1);

        drop(derived);
        assert_eq!(inner.ref_count().get(), 0);
        assert_eq!(choose.ref_count().get(), 0);
        observation.stop();
    }

    #[test]
    fn test_unchanged_inner_keeps_subscription() {
        let trigger = Cell::new(0);
        let inner = Cell::new("stable");
        let tracked = inner.clone();
        let derived = trigger.flat_map(move |_| tracked.clone());

        let (log, push) = recorder();
        derived.subscribe(true, push);
        assert_eq!(inner.ref_count().get(), 1);

        trigger.set(1);
        trigger.set(2);
        // Still one inner subscription, no churn.
        assert_eq!(inner.ref_count().get(), 1);
        assert_eq!(*log.borrow(), vec!["stable"]);
    }
}
