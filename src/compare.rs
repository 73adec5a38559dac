//! Total orders used to arrange the keys of a map.

use std::cmp::Ordering;

/// A total order over values of type `T`.
///
/// The comparator of a map is fixed when the map is created.
/// Any closure `Fn(&T, &T) -> Ordering` is a comparator:
///
/// ```
/// use avl_multimap::AvlMultiMap;
/// let mut map = AvlMultiMap::with_comparator(|a: &i32, b: &i32| b.cmp(a));
/// map.insert(1, "one");
/// map.insert(2, "two");
/// assert_eq!(map.keys().copied().collect::<Vec<_>>(), [2, 1]);
/// ```
pub trait Compare<T: ?Sized> {
    /// Compares two values, returning their relative order.
    fn compare(&self, lhs: &T, rhs: &T) -> Ordering;
}

/// The natural order of a type, as given by its [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Natural;

impl<T: Ord + ?Sized> Compare<T> for Natural {
    #[inline]
    fn compare(&self, lhs: &T, rhs: &T) -> Ordering {
        lhs.cmp(rhs)
    }
}

impl<T: ?Sized, F> Compare<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    #[inline]
    fn compare(&self, lhs: &T, rhs: &T) -> Ordering {
        self(lhs, rhs)
    }
}
