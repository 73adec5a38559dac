//! An ordered map implemented with an AVL tree that admits duplicate keys.
//!
//! Every insertion adds a new entry, even if an entry with an equal key is
//! already present. Entries sharing a key are kept in insertion order, so
//! key based lookups and removals always address the earliest inserted
//! entry that is still in the map.
//!
//! ```
//! use avl_multimap::AvlMultiMap;
//! let mut map = AvlMultiMap::new();
//! map.insert(42, "Forty-two");
//! map.insert(42, "Duplicate");
//! assert_eq!(map.len(), 2);
//! assert_eq!(map.get(&42), Some(&"Forty-two"));
//! assert_eq!(map.pop_item(&42, &"Forty-two"), Ok((42, "Forty-two")));
//! assert_eq!(map.get(&42), Some(&"Duplicate"));
//! ```
//!
//! The map is a plain single-threaded data structure. Iterators borrow the
//! map, so it cannot be modified while an iterator is alive.

mod compare;
mod error;
pub mod map;

pub use compare::{Compare, Natural};
pub use error::Error;
pub use map::AvlMultiMap;
