//! Comparison capability for ordered collections

use std::cmp::Ordering;

/// Total order over `T`, passed explicitly to ordered collections.
pub trait Comparator<T>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

/// Orders values by their `Ord` implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<T: Ord> Comparator<T> for NaturalOrder {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

impl<T, F> Comparator<T> for F
where
    F: Fn(&T, &T) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}
