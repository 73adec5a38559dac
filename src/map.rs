//! An ordered map with duplicate keys implemented with an AVL tree.

use std::borrow::Borrow;
use std::cmp::{self, Ordering};
use std::fmt;
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::ops::Index;
use std::ptr::NonNull;

use log::trace;

use crate::compare::{Compare, Natural};
use crate::error::Error;

mod iter;

pub use iter::{IntoIter, Iter, IterMut, Keys, Values, ValuesMut};

/// An ordered map with duplicate keys implemented with an AVL tree.
///
/// Inserting a key that is already present adds another entry. Entries with
/// equal keys are iterated in insertion order, and lookups or removals by
/// key address the earliest inserted of them.
///
/// ```
/// use avl_multimap::AvlMultiMap;
/// let mut map = AvlMultiMap::new();
/// map.insert(0, "zero");
/// map.insert(1, "one");
/// map.insert(1, "uno");
/// assert_eq!(map.len(), 3);
/// assert_eq!(map.get(&1), Some(&"one"));
/// assert_eq!(map.pop(&1), Ok("one"));
/// assert_eq!(map.get(&1), Some(&"uno"));
/// assert_eq!(map.min(), Ok((&0, &"zero")));
/// ```
pub struct AvlMultiMap<K, V, C = Natural> {
    root: Link<K, V>,
    num_nodes: usize,
    cmp: C,
    marker: PhantomData<Box<Node<K, V>>>,
}

struct Node<K, V> {
    key: K,
    value: V,
    left: Link<K, V>,
    right: Link<K, V>,
    parent: Link<K, V>,
    height: usize,
}

type NodePtr<K, V> = NonNull<Node<K, V>>;
type Link<K, V> = Option<NodePtr<K, V>>;
type LinkPtr<K, V> = NonNull<Link<K, V>>;

#[allow(clippy::enum_variant_names)]
enum Direction {
    FromParent,
    FromLeft,
    FromRight,
}

// The map owns its nodes exclusively, like a `Box` would.
unsafe impl<K: Send, V: Send, C: Send> Send for AvlMultiMap<K, V, C> {}
unsafe impl<K: Sync, V: Sync, C: Sync> Sync for AvlMultiMap<K, V, C> {}

impl<K: Ord, V> AvlMultiMap<K, V> {
    /// Creates an empty map ordered by the natural order of its keys.
    /// No memory is allocated until the first item is inserted.
    pub fn new() -> Self {
        Self::with_comparator(Natural)
    }
}

impl<K, V, C> AvlMultiMap<K, V, C> {
    /// Creates an empty map ordered by the given comparator.
    /// No memory is allocated until the first item is inserted.
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            root: None,
            num_nodes: 0,
            cmp,
            marker: PhantomData,
        }
    }

    /// Returns a reference to the comparator ordering the keys.
    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// Returns true if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns the number of elements in the map, counting duplicate keys.
    pub fn len(&self) -> usize {
        self.num_nodes
    }

    #[cfg(test)]
    pub fn height(&self) -> usize {
        match self.root {
            None => 0,
            Some(root_ptr) => unsafe { root_ptr.as_ref().height },
        }
    }

    /// Clears the map, deallocating all memory.
    pub fn clear(&mut self) {
        if self.num_nodes > 0 {
            trace!("clearing {} nodes", self.num_nodes);
        }
        self.postorder(|node_ptr| unsafe { Node::destroy(node_ptr) });
        self.root = None;
        self.num_nodes = 0;
    }

    /// Returns references to the entry with the smallest key.
    /// Among duplicates, this is the earliest inserted entry.
    pub fn first_key_value(&self) -> Option<(&K, &V)> {
        self.root.map(|root_ptr| unsafe {
            let node = &*Node::leftmost(root_ptr).as_ptr();
            (&node.key, &node.value)
        })
    }

    /// Returns references to the entry with the largest key.
    /// Among duplicates, this is the latest inserted entry.
    pub fn last_key_value(&self) -> Option<(&K, &V)> {
        self.root.map(|root_ptr| unsafe {
            let node = &*Node::rightmost(root_ptr).as_ptr();
            (&node.key, &node.value)
        })
    }

    /// Returns references to the entry with the smallest key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] if the map has no entries.
    pub fn min(&self) -> Result<(&K, &V), Error> {
        self.first_key_value().ok_or(Error::Empty)
    }

    /// Returns references to the entry with the largest key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] if the map has no entries.
    pub fn max(&self) -> Result<(&K, &V), Error> {
        self.last_key_value().ok_or(Error::Empty)
    }

    /// Removes and returns the entry with the smallest key.
    pub fn pop_first(&mut self) -> Option<(K, V)> {
        let root_ptr = self.root?;
        let node_ptr = unsafe { Node::leftmost(root_ptr) };
        Some(self.remove_node(node_ptr))
    }

    /// Removes and returns the entry with the largest key.
    pub fn pop_last(&mut self) -> Option<(K, V)> {
        let root_ptr = self.root?;
        let node_ptr = unsafe { Node::rightmost(root_ptr) };
        Some(self.remove_node(node_ptr))
    }

    /// Gets an iterator over the entries of the map, sorted by key.
    /// Use `iter().rev()` to iterate in descending order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self.root, self.num_nodes)
    }

    /// Gets a mutable iterator over the entries of the map, sorted by key.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut::new(self.root, self.num_nodes)
    }

    /// Gets an iterator over the keys of the map in sorted order.
    /// A key inserted several times is yielded once per entry.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self.iter())
    }

    /// Gets an iterator over the values of the map, in order by key.
    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self.iter())
    }

    /// Gets a mutable iterator over the values of the map, in order by key.
    pub fn values_mut(&mut self) -> ValuesMut<'_, K, V> {
        ValuesMut::new(self.iter_mut())
    }

    /// Returns references to the first entry matching the key.
    ///
    /// The key may be any borrowed form of the map's key type, but the
    /// comparator must order the borrowed form like the key type.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.find_first(key).map(|node_ptr| unsafe {
            let node = &*node_ptr.as_ptr();
            (&node.key, &node.value)
        })
    }

    /// Returns a reference to the value of the first entry matching the key.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.get_key_value(key).map(|(_, value)| value)
    }

    /// Returns a mutable reference to the value of the first entry matching the key.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.find_first(key)
            .map(|node_ptr| unsafe { &mut (*node_ptr.as_ptr()).value })
    }

    /// Returns a reference to the value of the first entry matching the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no entry matches.
    pub fn lookup<Q>(&self, key: &Q) -> Result<&V, Error>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.get(key).ok_or(Error::KeyNotFound)
    }

    /// Returns a reference to the value of the first entry matching the key,
    /// or `default` if there is none.
    pub fn get_or<'a, Q>(&'a self, key: &Q, default: &'a V) -> &'a V
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.get(key).unwrap_or(default)
    }

    /// Returns true if at least one entry matches the key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.find_first(key).is_some()
    }

    /// Returns the number of entries matching the key.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        let mut count = 0;
        let mut current = self.find_first(key);
        while let Some(node_ptr) = current {
            unsafe {
                if self.cmp.compare(key, node_ptr.as_ref().key.borrow()) != Ordering::Equal {
                    break;
                }
                count += 1;
                current = Node::successor(node_ptr);
            }
        }
        count
    }

    /// Removes the first entry matching the key.
    /// Returns the value of the entry if the key was in the map.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.remove_entry(key).map(|(_, value)| value)
    }

    /// Removes the first entry matching the key.
    /// Returns the stored key and value if the key was in the map.
    pub fn remove_entry<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        let node_ptr = self.find_first(key)?;
        Some(self.remove_node(node_ptr))
    }

    /// Removes the first entry matching the key and returns its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no entry matches; the map is unchanged.
    pub fn pop<Q>(&mut self, key: &Q) -> Result<V, Error>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.remove(key).ok_or(Error::KeyNotFound)
    }

    /// Removes the first entry matching the key and returns its value,
    /// or returns `default` and leaves the map unchanged if there is none.
    pub fn pop_or<Q>(&mut self, key: &Q, default: V) -> V
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        self.remove(key).unwrap_or(default)
    }

    /// Removes the first entry whose key matches `key` and whose value
    /// equals `value`, which tells apart entries sharing a key.
    ///
    /// ```
    /// use avl_multimap::{AvlMultiMap, Error};
    /// let mut map = AvlMultiMap::new();
    /// map.insert(42, "Forty-two");
    /// map.insert(42, "Duplicate");
    /// assert_eq!(map.pop_item(&42, &"Duplicate"), Ok((42, "Duplicate")));
    /// assert_eq!(map.pop_item(&42, &"Duplicate"), Err(Error::KeyNotFound));
    /// assert_eq!(map.len(), 1);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no entry matches both.
    pub fn pop_item<Q>(&mut self, key: &Q, value: &V) -> Result<(K, V), Error>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
        V: PartialEq,
    {
        let mut current = self.find_first(key);
        while let Some(node_ptr) = current {
            unsafe {
                if self.cmp.compare(key, node_ptr.as_ref().key.borrow()) != Ordering::Equal {
                    break;
                }
                if node_ptr.as_ref().value == *value {
                    return Ok(self.remove_node(node_ptr));
                }
                current = Node::successor(node_ptr);
            }
        }
        Err(Error::KeyNotFound)
    }

    // Finds the leftmost node matching the key, i.e. the earliest inserted one.
    fn find_first<Q>(&self, key: &Q) -> Link<K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Compare<Q>,
    {
        let mut found = None;
        let mut current = self.root;
        while let Some(node_ptr) = current {
            current = unsafe {
                match self.cmp.compare(key, node_ptr.as_ref().key.borrow()) {
                    Ordering::Less => node_ptr.as_ref().left,
                    Ordering::Greater => node_ptr.as_ref().right,
                    Ordering::Equal => {
                        found = Some(node_ptr);
                        node_ptr.as_ref().left
                    }
                }
            }
        }
        found
    }

    fn remove_node(&mut self, node_ptr: NodePtr<K, V>) -> (K, V) {
        debug_assert!(self.num_nodes >= 1);
        self.unlink_node(node_ptr);
        self.num_nodes -= 1;
        unsafe { Node::into_entry(node_ptr) }
    }

    fn unlink_node(&mut self, node_ptr: NodePtr<K, V>) {
        unsafe {
            let parent = node_ptr.as_ref().parent;
            match (node_ptr.as_ref().left, node_ptr.as_ref().right) {
                (Some(mut left_ptr), Some(mut right_ptr)) => {
                    // Replace node by its in-order successor, the smallest node in right sub tree
                    let mut min_child_ptr = right_ptr;
                    while let Some(min_left_ptr) = min_child_ptr.as_ref().left {
                        min_child_ptr = min_left_ptr;
                    }

                    let mut rebalance_from = min_child_ptr;
                    if min_child_ptr != right_ptr {
                        // Smallest child node is stem or leaf, unlink from its parent
                        if let Some(mut min_parent_ptr) = min_child_ptr.as_ref().parent {
                            min_parent_ptr.as_mut().left = min_child_ptr.as_ref().right;
                            if let Some(mut min_right_ptr) = min_child_ptr.as_ref().right {
                                min_right_ptr.as_mut().parent = Some(min_parent_ptr);
                            }
                            rebalance_from = min_parent_ptr;
                        }
                        min_child_ptr.as_mut().right = Some(right_ptr);
                        right_ptr.as_mut().parent = Some(min_child_ptr);
                    }

                    min_child_ptr.as_mut().left = Some(left_ptr);
                    left_ptr.as_mut().parent = Some(min_child_ptr);
                    min_child_ptr.as_mut().parent = parent;
                    self.replace_child(parent, node_ptr, Some(min_child_ptr));

                    self.rebalance(Some(rebalance_from));
                }
                (child, None) | (None, child) => {
                    // Node is stem or leaf, its only child takes its place
                    if let Some(mut child_ptr) = child {
                        child_ptr.as_mut().parent = parent;
                    }
                    self.replace_child(parent, node_ptr, child);
                    self.rebalance(parent);
                }
            }
        }
    }

    // Redirects the link from `parent` (or the root link) that points to `old_ptr`.
    fn replace_child(&mut self, parent: Link<K, V>, old_ptr: NodePtr<K, V>, new: Link<K, V>) {
        match parent {
            None => self.root = new,
            Some(mut parent_ptr) => unsafe {
                if parent_ptr.as_ref().left == Some(old_ptr) {
                    parent_ptr.as_mut().left = new;
                } else {
                    parent_ptr.as_mut().right = new;
                }
            },
        }
    }

    fn left_height(node_ptr: NodePtr<K, V>) -> usize {
        unsafe {
            match node_ptr.as_ref().left {
                None => 0,
                Some(left_ptr) => left_ptr.as_ref().height + 1,
            }
        }
    }

    fn right_height(node_ptr: NodePtr<K, V>) -> usize {
        unsafe {
            match node_ptr.as_ref().right {
                None => 0,
                Some(right_ptr) => right_ptr.as_ref().height + 1,
            }
        }
    }

    fn adjust_height(mut node_ptr: NodePtr<K, V>) {
        let height = cmp::max(Self::left_height(node_ptr), Self::right_height(node_ptr));
        unsafe { node_ptr.as_mut().height = height };
    }

    fn rotate_left(&mut self, mut node_ptr: NodePtr<K, V>) {
        unsafe {
            if let Some(mut right_ptr) = node_ptr.as_ref().right {
                node_ptr.as_mut().right = right_ptr.as_ref().left;
                if let Some(mut right_left_ptr) = right_ptr.as_ref().left {
                    right_left_ptr.as_mut().parent = Some(node_ptr);
                }

                let parent = node_ptr.as_ref().parent;
                right_ptr.as_mut().parent = parent;
                self.replace_child(parent, node_ptr, Some(right_ptr));

                right_ptr.as_mut().left = Some(node_ptr);
                node_ptr.as_mut().parent = Some(right_ptr);

                Self::adjust_height(node_ptr);
                Self::adjust_height(right_ptr);
            }
        }
    }

    fn rotate_right(&mut self, mut node_ptr: NodePtr<K, V>) {
        unsafe {
            if let Some(mut left_ptr) = node_ptr.as_ref().left {
                node_ptr.as_mut().left = left_ptr.as_ref().right;
                if let Some(mut left_right_ptr) = left_ptr.as_ref().right {
                    left_right_ptr.as_mut().parent = Some(node_ptr);
                }

                let parent = node_ptr.as_ref().parent;
                left_ptr.as_mut().parent = parent;
                self.replace_child(parent, node_ptr, Some(left_ptr));

                left_ptr.as_mut().right = Some(node_ptr);
                node_ptr.as_mut().parent = Some(left_ptr);

                Self::adjust_height(node_ptr);
                Self::adjust_height(left_ptr);
            }
        }
    }

    /// Rebalances nodes starting from given position up to the root node.
    /// A rotation during removal may lower the height of the sub tree,
    /// so every ancestor has to be visited.
    fn rebalance(&mut self, start_from: Link<K, V>) {
        let mut current = start_from;
        while let Some(node_ptr) = current {
            let parent = unsafe { node_ptr.as_ref().parent };
            self.rebalance_node(node_ptr);
            current = parent;
        }
    }

    /// Rebalances nodes starting from given position up to the root node.
    /// Stops after the first rotation or at the first node whose height is unchanged.
    /// This is enough to restore balance after a single insert operation.
    fn rebalance_after_insert(&mut self, start_from: Link<K, V>) {
        let mut current = start_from;
        while let Some(node_ptr) = current {
            let (parent, old_height) = unsafe { (node_ptr.as_ref().parent, node_ptr.as_ref().height) };
            if self.rebalance_node(node_ptr) {
                break;
            }
            if unsafe { node_ptr.as_ref().height } == old_height {
                break;
            }
            current = parent;
        }
    }

    /// Restores AVL condition (balance) at given node if necessary and adjusts height.
    /// Resulting balance will be +1, 0 or -1 height difference between left and right subtree.
    /// Initial balance must not exceed +2 or -2, which always holds after a single update.
    /// Returns whether a rotation had been necessary.
    fn rebalance_node(&mut self, node_ptr: NodePtr<K, V>) -> bool {
        let left_height = Self::left_height(node_ptr);
        let right_height = Self::right_height(node_ptr);
        debug_assert!(left_height <= right_height + 2);
        debug_assert!(right_height <= left_height + 2);
        if left_height > right_height + 1 {
            trace!("rotating right, heights {left_height}/{right_height}");
            if let Some(left_ptr) = unsafe { node_ptr.as_ref().left } {
                if Self::right_height(left_ptr) > Self::left_height(left_ptr) {
                    // Left-right case
                    self.rotate_left(left_ptr);
                }
            }
            self.rotate_right(node_ptr);
            true
        } else if right_height > left_height + 1 {
            trace!("rotating left, heights {left_height}/{right_height}");
            if let Some(right_ptr) = unsafe { node_ptr.as_ref().right } {
                if Self::left_height(right_ptr) > Self::right_height(right_ptr) {
                    // Right-left case
                    self.rotate_right(right_ptr);
                }
            }
            self.rotate_left(node_ptr);
            true
        } else {
            Self::adjust_height(node_ptr);
            false
        }
    }

    #[cfg(any(test, feature = "consistency_check"))]
    fn preorder<F: FnMut(NodePtr<K, V>)>(&self, f: F) {
        self.traverse(f, |_| {}, |_| {});
    }

    fn postorder<F: FnMut(NodePtr<K, V>)>(&self, f: F) {
        self.traverse(|_| {}, |_| {}, f);
    }

    fn traverse<Pre, In, Post>(&self, mut preorder: Pre, mut inorder: In, mut postorder: Post)
    where
        Pre: FnMut(NodePtr<K, V>),
        In: FnMut(NodePtr<K, V>),
        Post: FnMut(NodePtr<K, V>),
    {
        if let Some(mut node_ptr) = self.root {
            let mut dir = Direction::FromParent;
            loop {
                match dir {
                    Direction::FromParent => {
                        preorder(node_ptr);
                        if let Some(left_ptr) = unsafe { node_ptr.as_ref().left } {
                            node_ptr = left_ptr;
                        } else {
                            dir = Direction::FromLeft;
                        }
                    }
                    Direction::FromLeft => {
                        inorder(node_ptr);
                        if let Some(right_ptr) = unsafe { node_ptr.as_ref().right } {
                            node_ptr = right_ptr;
                            dir = Direction::FromParent;
                        } else {
                            dir = Direction::FromRight;
                        }
                    }
                    Direction::FromRight => {
                        // Post order traversal is used for node deletion,
                        // so make sure not to use node pointer after postorder call.
                        if let Some(parent_ptr) = unsafe { node_ptr.as_ref().parent } {
                            if Some(node_ptr) == unsafe { parent_ptr.as_ref().left } {
                                dir = Direction::FromLeft;
                            } else {
                                dir = Direction::FromRight;
                            }
                            postorder(node_ptr);
                            node_ptr = parent_ptr;
                        } else {
                            postorder(node_ptr);
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<K, V, C: Compare<K>> AvlMultiMap<K, V, C> {
    /// Inserts a key-value pair into the map.
    ///
    /// An entry with an equal key already in the map is kept; the new entry
    /// is ordered behind it.
    pub fn insert(&mut self, key: K, value: V) {
        self.insert_node(key, value);
    }

    /// Inserts a key with a default value, e.g. `None` for a map of `Option` values.
    pub fn insert_key(&mut self, key: K)
    where
        V: Default,
    {
        self.insert_node(key, V::default());
    }

    /// Returns a mutable reference to the value of the first entry matching
    /// the key, inserting the result of `f` if the key is not in the map.
    pub fn get_or_insert_with<F>(&mut self, key: K, f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let node_ptr = match self.find_first(&key) {
            Some(node_ptr) => node_ptr,
            None => self.insert_node(key, f()),
        };
        unsafe { &mut (*node_ptr.as_ptr()).value }
    }

    /// Asserts that the internal tree structure is consistent.
    #[cfg(any(test, feature = "consistency_check"))]
    pub fn check_consistency(&self) {
        unsafe {
            // Check root link
            if let Some(root_node_ptr) = self.root {
                assert!(root_node_ptr.as_ref().parent.is_none());
            }

            // Check tree nodes
            let mut num_nodes = 0;
            self.preorder(|node_ptr| {
                let mut height = 0;
                let mut left_height = 0;
                let mut right_height = 0;

                // Check link for left child node
                if let Some(left_ptr) = node_ptr.as_ref().left {
                    assert!(left_ptr.as_ref().parent == Some(node_ptr));
                    assert!(
                        self.cmp.compare(&left_ptr.as_ref().key, &node_ptr.as_ref().key)
                            != Ordering::Greater
                    );
                    left_height = left_ptr.as_ref().height + 1;
                    height = cmp::max(height, left_height);
                }

                // Check link for right child node
                if let Some(right_ptr) = node_ptr.as_ref().right {
                    assert!(right_ptr.as_ref().parent == Some(node_ptr));
                    assert!(
                        self.cmp.compare(&right_ptr.as_ref().key, &node_ptr.as_ref().key)
                            != Ordering::Less
                    );
                    right_height = right_ptr.as_ref().height + 1;
                    height = cmp::max(height, right_height);
                }

                // Check height
                assert_eq!(node_ptr.as_ref().height, height);

                // Check AVL condition (nearly balance)
                assert!(left_height <= right_height + 1);
                assert!(right_height <= left_height + 1);

                num_nodes += 1;
            });

            // Check number of nodes
            assert_eq!(num_nodes, self.num_nodes);
        }

        // Check in-order sequence, both directions
        let mut prev_key: Option<&K> = None;
        for key in self.keys() {
            if let Some(prev_key) = prev_key {
                assert!(self.cmp.compare(prev_key, key) != Ordering::Greater);
            }
            prev_key = Some(key);
        }
        assert_eq!(self.keys().rev().count(), self.num_nodes);
        log::debug!("consistency check passed for {} nodes", self.num_nodes);
    }

    fn find_insert_pos(&mut self, key: &K) -> (Link<K, V>, LinkPtr<K, V>) {
        let mut parent: Link<K, V> = None;
        let mut link_ptr: LinkPtr<K, V> = unsafe { LinkPtr::new_unchecked(&mut self.root) };
        unsafe {
            while let Some(mut node_ptr) = *link_ptr.as_ref() {
                parent = Some(node_ptr);
                link_ptr = match self.cmp.compare(key, &node_ptr.as_ref().key) {
                    Ordering::Less => LinkPtr::new_unchecked(&mut node_ptr.as_mut().left),
                    // Equal keys descend right, behind the entries already present
                    Ordering::Equal | Ordering::Greater => {
                        LinkPtr::new_unchecked(&mut node_ptr.as_mut().right)
                    }
                };
            }
        }
        (parent, link_ptr)
    }

    fn insert_node(&mut self, key: K, value: V) -> NodePtr<K, V> {
        let (parent, mut link_ptr) = self.find_insert_pos(&key);
        let node_ptr = Node::create(parent, key, value);
        unsafe {
            *link_ptr.as_mut() = Some(node_ptr);
        }
        self.num_nodes += 1;
        self.rebalance_after_insert(parent);
        node_ptr
    }
}

impl<K, V, C> Drop for AvlMultiMap<K, V, C> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, V, C: Default> Default for AvlMultiMap<K, V, C> {
    /// Creates an empty map.
    fn default() -> Self {
        Self::with_comparator(C::default())
    }
}

impl<K, V, C> Clone for AvlMultiMap<K, V, C>
where
    K: Clone,
    V: Clone,
    C: Compare<K> + Clone,
{
    fn clone(&self) -> Self {
        let mut map = Self::with_comparator(self.cmp.clone());
        // Inserting in order keeps duplicates in their original order
        for (key, value) in self.iter() {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

impl<K: PartialEq, V: PartialEq, C> PartialEq for AvlMultiMap<K, V, C> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<K: Eq, V: Eq, C> Eq for AvlMultiMap<K, V, C> {}

impl<K: fmt::Debug, V: fmt::Debug, C> fmt::Debug for AvlMultiMap<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, Q, V, C> Index<&Q> for AvlMultiMap<K, V, C>
where
    K: Borrow<Q>,
    Q: ?Sized,
    C: Compare<Q>,
{
    type Output = V;

    /// Returns a reference to the value of the first entry matching the key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the map.
    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for AvlMultiMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl<K, V, C: Compare<K>> Extend<(K, V)> for AvlMultiMap<K, V, C> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        iter.into_iter().for_each(move |(key, value)| {
            self.insert(key, value);
        });
    }
}

impl<'a, K, V, C> Extend<(&'a K, &'a V)> for AvlMultiMap<K, V, C>
where
    K: Copy + 'a,
    V: Copy + 'a,
    C: Compare<K>,
{
    fn extend<I: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: I) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<'a, K, V, C> IntoIterator for &'a AvlMultiMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, C> IntoIterator for &'a mut AvlMultiMap<K, V, C> {
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<K, V, C> IntoIterator for AvlMultiMap<K, V, C> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V, C>;
    fn into_iter(self) -> Self::IntoIter {
        IntoIter::new(self)
    }
}

impl<K, V> Node<K, V> {
    fn create(parent: Link<K, V>, key: K, value: V) -> NodePtr<K, V> {
        let boxed = Box::new(Node {
            key,
            value,
            parent,
            left: None,
            right: None,
            height: 0,
        });
        unsafe { NodePtr::new_unchecked(Box::into_raw(boxed)) }
    }

    unsafe fn destroy(node_ptr: NodePtr<K, V>) {
        drop(Box::from_raw(node_ptr.as_ptr()));
    }

    unsafe fn into_entry(node_ptr: NodePtr<K, V>) -> (K, V) {
        let node = *Box::from_raw(node_ptr.as_ptr());
        (node.key, node.value)
    }

    unsafe fn leftmost(mut node_ptr: NodePtr<K, V>) -> NodePtr<K, V> {
        while let Some(left_ptr) = node_ptr.as_ref().left {
            node_ptr = left_ptr;
        }
        node_ptr
    }

    unsafe fn rightmost(mut node_ptr: NodePtr<K, V>) -> NodePtr<K, V> {
        while let Some(right_ptr) = node_ptr.as_ref().right {
            node_ptr = right_ptr;
        }
        node_ptr
    }

    /// Returns the next node in in-order sequence.
    unsafe fn successor(node_ptr: NodePtr<K, V>) -> Link<K, V> {
        if let Some(right_ptr) = node_ptr.as_ref().right {
            return Some(Self::leftmost(right_ptr));
        }
        let mut current = node_ptr;
        while let Some(parent_ptr) = current.as_ref().parent {
            if parent_ptr.as_ref().left == Some(current) {
                return Some(parent_ptr);
            }
            current = parent_ptr;
        }
        None
    }

    /// Returns the previous node in in-order sequence.
    unsafe fn predecessor(node_ptr: NodePtr<K, V>) -> Link<K, V> {
        if let Some(left_ptr) = node_ptr.as_ref().left {
            return Some(Self::rightmost(left_ptr));
        }
        let mut current = node_ptr;
        while let Some(parent_ptr) = current.as_ref().parent {
            if parent_ptr.as_ref().right == Some(current) {
                return Some(parent_ptr);
            }
            current = parent_ptr;
        }
        None
    }
}
