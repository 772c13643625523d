//! Weft Core Runtime
//!
//! This crate provides the reactive value engine at the heart of Weft:
//!
//! - **Cells**: containers that always hold a current value, with
//!   generation-stamped synchronous broadcast to observers
//! - **Derived cells**: lazily-subscribing `map`/`flat_map`/`flatten` nodes
//! - **Combinators**: joining several cells into one product cell
//! - **Liveness**: the observer count of a cell, exposed as a cell
//! - **Managed cells**: resource lifecycles bound to subscribe/unsubscribe
//!
//! Building a graph of cells triggers no work on its own; only `get` and
//! `subscribe` pull or push values, activating the minimum subtree needed.
//! Propagation is strictly single-threaded and synchronous: a `set` finishes
//! its entire broadcast, including nested re-entrant sets, before returning.
//! Faults inside observer callbacks are never swallowed; they propagate to
//! whichever external call triggered the broadcast.
//!
//! # Example
//!
//! ```rust
//! use weft_core::Cell;
//!
//! let count = Cell::new(1i64);
//! let doubled = count.map(|n| n * 2);
//!
//! let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
//! let sink = log.clone();
//! let observation = doubled.subscribe(true, move |n, _| sink.borrow_mut().push(*n));
//!
//! count.set(3);
//! assert_eq!(*log.borrow(), vec![2, 6]);
//!
//! observation.stop();
//! count.set(10); // no longer observed, nothing recomputes
//! assert_eq!(doubled.get(), 20);
//! ```

pub mod cell;
pub mod combine;
pub mod managed;
pub mod observe;
pub mod value;

mod derive;

pub use cell::Cell;
pub use combine::{all, flat_map_all, lift, map_all, CellSet};
pub use managed::{managed, ManagedResource, ResourceSet};
pub use observe::Observation;
pub use value::{CellValue, IntoCell};
