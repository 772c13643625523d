//! Value traits for cell contents
//!
//! Every cell value carries an explicit equality policy: value equality for
//! primitives, identity for shared composites. The policy gates `set` so that
//! redundant writes never broadcast.

use std::rc::Rc;

use crate::cell::Cell;

/// A value a cell can hold.
///
/// `same` is the equality gate used by [`Cell::set`]: when the incoming value
/// is `same` as the current one the write is a no-op and no observer runs.
/// The policy is supplied per type, never inferred: primitives compare by
/// value, shared composites (`Rc`, cells themselves) by identity. A deep
/// structural comparison is never the right policy here.
pub trait CellValue: Clone + 'static {
    fn same(&self, other: &Self) -> bool;
}

/// Conversion into a cell.
///
/// Plain values are wrapped in a fresh root cell; an existing cell passes
/// through unchanged. This backs [`Cell::of`].
pub trait IntoCell<T: CellValue> {
    fn into_cell(self) -> Cell<T>;
}

impl<T: CellValue> IntoCell<T> for T {
    fn into_cell(self) -> Cell<T> {
        Cell::new(self)
    }
}

impl<T: CellValue> IntoCell<T> for Cell<T> {
    fn into_cell(self) -> Cell<T> {
        self
    }
}

macro_rules! value_equality {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CellValue for $ty {
                #[allow(clippy::float_cmp)]
                fn same(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

value_equality!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

/// Shared composites compare by identity, never by structure.
impl<T: ?Sized + 'static> CellValue for Rc<T> {
    fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: CellValue> CellValue for Option<T> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        }
    }
}

/// Element-wise policy for homogeneous combination products.
impl<T: CellValue> CellValue for Vec<T> {
    fn same(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.same(b))
    }
}

macro_rules! tuple_value_equality {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T: CellValue),+> CellValue for ($($T,)+) {
            fn same(&self, other: &Self) -> bool {
                $(self.$idx.same(&other.$idx))&&+
            }
        }
    };
}

tuple_value_equality!((A, 0));
tuple_value_equality!((A, 0), (B, 1));
tuple_value_equality!((A, 0), (B, 1), (C, 2));
tuple_value_equality!((A, 0), (B, 1), (C, 2), (D, 3));
tuple_value_equality!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4));
tuple_value_equality!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5));
tuple_value_equality!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6));
tuple_value_equality!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6), (H, 7));
