//! Persistent (immutable) ordered map based on a path-copying Red-Black Tree.
//!
//! This module provides [`PersistentTreeMap`], an immutable ordered map
//! that uses structural sharing for efficient operations.
//!
//! # Overview
//!
//! Every mutating operation returns a new map and leaves the receiver
//! untouched. A mutation clones exactly the nodes on the path from the
//! modification point to the root; every other node is shared by reference
//! with the prior version.
//!
//! - O(log N) get
//! - O(log N) insert
//! - O(log N) erase
//! - O(1) len and `is_empty`
//! - O(1) `Clone`
//!
//! # Internal Structure
//!
//! The Red-Black Tree maintains the following invariants:
//! 1. Every node is either red or black
//! 2. The root is black
//! 3. Red nodes have only black children
//! 4. Every path from a node to a descendant nil has the same number of
//!    black nodes
//!
//! These invariants bound the tree height to `2 * log2(N + 1)`.
//!
//! Mutations work in two phases. A top-down search records every visited
//! node on a bounded [`PathStack`]; the insert or erase engine then walks
//! that path bottom-up, cloning each ancestor once and threading recolored
//! or rotated children through the fresh clones only. Nodes already
//! published into a map value are never modified.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::ReferenceCounter;
use crate::error::{StructuralViolation, TreeMapError};

// =============================================================================
// Color and Side Definitions
// =============================================================================

/// The color of a Red-Black Tree node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// A child slot of a node.
///
/// Keeping the two children side-indexed lets the fixup case analysis be
/// written once and mirrored by flipping the side.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

impl Side {
    const fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }
}

// =============================================================================
// Entry and Node Definitions
// =============================================================================

/// An immutable key-value pair, allocated once and shared by every node
/// clone that retains the same logical entry.
struct Entry<K, V> {
    key: K,
    value: V,
}

/// A shared handle to a node, or nil.
type Link<K, V> = Option<ReferenceCounter<Node<K, V>>>;

/// Internal node structure for the Red-Black Tree.
///
/// A `Node` is never mutated after being wrapped in a [`ReferenceCounter`];
/// "mutation" always means cloning the plain `Node` (three handle clones),
/// adjusting the copy, and wrapping the copy.
struct Node<K, V> {
    entry: ReferenceCounter<Entry<K, V>>,
    color: Color,
    children: [Link<K, V>; 2],
}

// Manual impl: a shallow node copy shares the entry and both subtrees, so
// no `K: Clone` / `V: Clone` bounds are involved.
impl<K, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            color: self.color,
            children: [self.children[0].clone(), self.children[1].clone()],
        }
    }
}

impl<K, V> Node<K, V> {
    const fn new(entry: ReferenceCounter<Entry<K, V>>, color: Color) -> Self {
        Self {
            entry,
            color,
            children: [None, None],
        }
    }

    fn key(&self) -> &K {
        &self.entry.key
    }

    fn child(&self, side: Side) -> Option<&ReferenceCounter<Self>> {
        self.children[side.index()].as_ref()
    }

    /// Returns a cloned handle to the child on the given side.
    fn link(&self, side: Side) -> Link<K, V> {
        self.children[side.index()].clone()
    }

    fn set_child(&mut self, side: Side, child: Link<K, V>) {
        self.children[side.index()] = child;
    }

    fn take_child(&mut self, side: Side) -> Link<K, V> {
        self.children[side.index()].take()
    }

    const fn is_red(&self) -> bool {
        matches!(self.color, Color::Red)
    }

    const fn is_black(&self) -> bool {
        matches!(self.color, Color::Black)
    }

    fn has_red_child(&self) -> bool {
        is_red(self.child(Side::Left)) || is_red(self.child(Side::Right))
    }
}

/// Helper function to check if an optional node is red.
fn is_red<K, V>(node: Option<&ReferenceCounter<Node<K, V>>>) -> bool {
    node.is_some_and(|node| node.is_red())
}

// =============================================================================
// PathStack Definition
// =============================================================================

/// Upper bound on the root-to-leaf path length.
///
/// A red-black tree over n keys has height at most `2 * log2(n + 1)`, and a
/// map can hold at most `usize::MAX` keys, so `2 * usize::BITS` levels cover
/// any representable map. The capacity is fixed so a search never allocates.
const MAX_HEIGHT: usize = 128;
const_assert!(MAX_HEIGHT >= 2 * usize::BITS as usize);

/// The root-to-target sequence of nodes recorded by a search.
///
/// This is the single handoff between the two phases of a mutation: the
/// top-down search fills it, and the bottom-up reconstruction consumes it
/// while cloning the spine above the modification point.
struct PathStack<K, V> {
    nodes: ArrayVec<ReferenceCounter<Node<K, V>>, MAX_HEIGHT>,
}

impl<K, V> PathStack<K, V> {
    fn new() -> Self {
        Self {
            nodes: ArrayVec::new(),
        }
    }

    fn push(&mut self, node: ReferenceCounter<Node<K, V>>) {
        self.nodes.push(node);
    }

    fn pop(&mut self) -> Option<ReferenceCounter<Node<K, V>>> {
        self.nodes.pop()
    }

    /// The deepest node on the path.
    fn top(&self) -> Option<&ReferenceCounter<Node<K, V>>> {
        self.nodes.last()
    }

    /// The node one level above the deepest one.
    fn parent(&self) -> Option<&ReferenceCounter<Node<K, V>>> {
        self.nodes
            .len()
            .checked_sub(2)
            .and_then(|index| self.nodes.get(index))
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

// =============================================================================
// PersistentTreeMap Definition
// =============================================================================

/// A persistent (immutable) ordered map based on a path-copying Red-Black
/// Tree.
///
/// `PersistentTreeMap` is an immutable value type: [`insert`](Self::insert)
/// and [`erase`](Self::erase) return new maps, and any number of versions
/// derived from one another stay independently usable. Versions share every
/// subtree that is not on the modified path.
///
/// Keys must implement `Ord`; entries are maintained in ascending key order.
///
/// # Time Complexity
///
/// | Operation      | Complexity |
/// |----------------|------------|
/// | `new`          | O(1)       |
/// | `get` / `at`   | O(log N)   |
/// | `insert`       | O(log N)   |
/// | `erase`        | O(log N)   |
/// | `contains`     | O(log N)   |
/// | `len`          | O(1)       |
/// | `is_empty`     | O(1)       |
/// | `Clone::clone` | O(1)       |
///
/// # Examples
///
/// ```rust
/// use persimap::PersistentTreeMap;
///
/// let map = PersistentTreeMap::new()
///     .insert(3, "three")
///     .insert(1, "one")
///     .insert(2, "two");
///
/// // Entries are always in sorted key order
/// let keys: Vec<&i32> = map.keys().collect();
/// assert_eq!(keys, vec![&1, &2, &3]);
///
/// // Mutations leave the receiver untouched
/// let smaller = map.erase(&2);
/// assert_eq!(map.len(), 3);
/// assert_eq!(smaller.len(), 2);
/// ```
pub struct PersistentTreeMap<K, V> {
    /// Root node of the tree
    root: Link<K, V>,
    /// Number of entries
    size: usize,
}

// Manual impl: copying a map is a root handle clone plus a count, O(1),
// regardless of whether K or V are Clone.
impl<K, V> Clone for PersistentTreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            size: self.size,
        }
    }
}

impl<K, V> PersistentTreeMap<K, V> {
    /// Creates a new empty map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map: PersistentTreeMap<i32, String> = PersistentTreeMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            size: 0,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1)
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Visits every entry in ascending key order.
    ///
    /// The traversal is read-only and restartable; it is safe to run
    /// concurrently with any other read of the same or a derived map
    /// version, since nodes are never mutated.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new()
    ///     .insert(2, "two")
    ///     .insert(1, "one");
    ///
    /// let mut seen = Vec::new();
    /// map.for_each(|key, value| seen.push((*key, *value)));
    /// assert_eq!(seen, vec![(1, "one"), (2, "two")]);
    /// ```
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V),
    {
        Self::visit_in_order(self.root.as_deref(), &mut visitor);
    }

    fn visit_in_order<F>(node: Option<&Node<K, V>>, visitor: &mut F)
    where
        F: FnMut(&K, &V),
    {
        if let Some(node_ref) = node {
            Self::visit_in_order(node_ref.child(Side::Left).map(|child| &**child), visitor);
            visitor(&node_ref.entry.key, &node_ref.entry.value);
            Self::visit_in_order(node_ref.child(Side::Right).map(|child| &**child), visitor);
        }
    }

    /// Returns a lazy iterator over entries in ascending key order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new()
    ///     .insert(3, "three")
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    ///
    /// let entries: Vec<(&i32, &&str)> = map.iter().collect();
    /// assert_eq!(entries, vec![(&1, &"one"), (&2, &"two"), (&3, &"three")]);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentTreeMapIterator<'_, K, V> {
        PersistentTreeMapIterator::new(self.root.as_deref(), self.size)
    }

    /// Returns an iterator over keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Checks the red-black invariants of the whole tree.
    ///
    /// Walks the tree once and reports the first breach found: a red root,
    /// a red node with a red child, or two sibling subtrees with unequal
    /// black heights. A correctly functioning map never fails validation;
    /// this is intended for internal testing, not the steady-state hot path.
    ///
    /// # Errors
    ///
    /// Returns the first [`StructuralViolation`] detected.
    pub fn validate(&self) -> Result<(), StructuralViolation> {
        if let Some(root) = &self.root {
            if root.is_red() {
                return Err(StructuralViolation::RedRoot);
            }
            Self::validate_node(root)?;
        }
        Ok(())
    }

    /// Returns the black height of the subtree, checking invariants on the
    /// way down.
    fn validate_node(node: &Node<K, V>) -> Result<usize, StructuralViolation> {
        if node.is_red() && node.has_red_child() {
            return Err(StructuralViolation::RedRedViolation);
        }
        let left_height = node
            .child(Side::Left)
            .map_or(Ok(0), |child| Self::validate_node(child))?;
        let right_height = node
            .child(Side::Right)
            .map_or(Ok(0), |child| Self::validate_node(child))?;
        if left_height != right_height {
            return Err(StructuralViolation::UnequalBlackHeight);
        }
        Ok(left_height + usize::from(node.is_black()))
    }
}

impl<K: Ord, V> PersistentTreeMap<K, V> {
    /// Creates a map containing a single key-value pair.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::singleton(42, "answer");
    /// assert_eq!(map.len(), 1);
    /// assert_eq!(map.get(&42), Some(&"answer"));
    /// ```
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but the
    /// ordering on the borrowed form must match the ordering on the key
    /// type.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new().insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        Self::lookup(self.root.as_ref(), key)
    }

    /// Returns a reference to the value corresponding to the key, failing
    /// if the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`TreeMapError::KeyNotFound`] if the map has no entry for
    /// `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::{PersistentTreeMap, TreeMapError};
    ///
    /// let map = PersistentTreeMap::new().insert(1, "one");
    /// assert_eq!(map.at(&1), Ok(&"one"));
    /// assert_eq!(map.at(&2), Err(TreeMapError::KeyNotFound));
    /// ```
    pub fn at<Q>(&self, key: &Q) -> Result<&V, TreeMapError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).ok_or(TreeMapError::KeyNotFound)
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// # Complexity
    ///
    /// O(log N)
    #[must_use]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Borrow-only top-down search, used by the read accessors.
    fn lookup<'a, Q>(mut node: Option<&'a ReferenceCounter<Node<K, V>>>, key: &Q) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        while let Some(node_ref) = node {
            match key.cmp(node_ref.key().borrow()) {
                Ordering::Less => node = node_ref.child(Side::Left),
                Ordering::Greater => node = node_ref.child(Side::Right),
                Ordering::Equal => return Some(&node_ref.entry.value),
            }
        }
        None
    }

    /// Top-down search that records every visited node on the path stack.
    ///
    /// Returns `true` when the key was found, in which case the matching
    /// node is on top of the stack; otherwise the stack holds the path to
    /// the nil where the key would be attached.
    fn search_from<Q>(
        root: Option<&ReferenceCounter<Node<K, V>>>,
        key: &Q,
        path: &mut PathStack<K, V>,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut current = root.cloned();
        while let Some(node) = current {
            let next = match key.cmp(node.key().borrow()) {
                Ordering::Equal => {
                    path.push(node);
                    return true;
                }
                Ordering::Less => node.link(Side::Left),
                Ordering::Greater => node.link(Side::Right),
            };
            path.push(node);
            current = next;
        }
        false
    }

    /// The side on which a key hangs below `parent`.
    fn side_under(parent: &Node<K, V>, key: &K) -> Side {
        if parent.key().cmp(key) == Ordering::Greater {
            Side::Left
        } else {
            Side::Right
        }
    }

    // =========================================================================
    // Spine Reconstruction
    // =========================================================================

    /// Clones every ancestor remaining on the path above `depth`, directing
    /// each clone's child pointer toward the freshly rebuilt subtree by key
    /// comparison. With `depth == 0` this rebuilds all the way to the root.
    fn rebuild_spine(
        path: &mut PathStack<K, V>,
        mut node: ReferenceCounter<Node<K, V>>,
        depth: usize,
    ) -> ReferenceCounter<Node<K, V>> {
        while path.len() > depth {
            let Some(parent) = path.pop() else { break };
            let side = Self::side_under(&parent, node.key());
            let mut new_parent = (*parent).clone();
            new_parent.set_child(side, Some(node));
            node = ReferenceCounter::new(new_parent);
        }
        node
    }

    /// Side-directed variant of [`Self::rebuild_spine`] for subtrees that
    /// may be empty: the first clone attaches `subtree` (possibly nil) on
    /// `side`, and each step above re-derives the side from the keys.
    fn rebuild_spine_detached(
        path: &mut PathStack<K, V>,
        mut subtree: Link<K, V>,
        mut side: Side,
        depth: usize,
    ) -> Link<K, V> {
        while path.len() > depth {
            let Some(parent) = path.pop() else { break };
            let mut new_parent = (*parent).clone();
            new_parent.set_child(side, subtree);
            if path.len() > depth
                && let Some(grand) = path.top()
            {
                side = Self::side_under(grand, parent.key());
            }
            subtree = Some(ReferenceCounter::new(new_parent));
        }
        subtree
    }

    // =========================================================================
    // Insert Engine
    // =========================================================================

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced and the
    /// size is unchanged; otherwise the size grows by one. The receiver is
    /// left untouched either way.
    ///
    /// # Complexity
    ///
    /// O(log N) comparisons and O(log N) node allocations.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map1 = PersistentTreeMap::new().insert(1, "one");
    /// let map2 = map1.insert(1, "ONE");
    ///
    /// assert_eq!(map1.get(&1), Some(&"one")); // Original unchanged
    /// assert_eq!(map2.get(&1), Some(&"ONE")); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let entry = ReferenceCounter::new(Entry { key, value });
        let mut path = PathStack::new();
        if Self::search_from(self.root.as_ref(), &entry.key, &mut path) {
            // Same key: swap the entry into a node clone and re-clone the
            // spine. No color or shape changes, so no fixup is needed.
            let Some(found) = path.pop() else {
                return self.clone();
            };
            let mut replaced = (*found).clone();
            replaced.entry = entry;
            let root = Self::rebuild_spine(&mut path, ReferenceCounter::new(replaced), 0);
            return Self {
                root: Some(root),
                size: self.size,
            };
        }
        if self.root.is_none() {
            let root = Node::new(entry, Color::Black);
            return Self {
                root: Some(ReferenceCounter::new(root)),
                size: 1,
            };
        }
        let root = Self::insert_fixup(&mut path, Node::new(entry, Color::Red));
        Self {
            root: Some(root),
            size: self.size + 1,
        }
    }

    /// Grafts `node` (red, not yet shared) under the deepest node on the
    /// path and restores the red-black invariants bottom-up.
    ///
    /// Recursion is bounded by the tree height: the red-uncle case moves
    /// the fixup two levels up, every other case terminates.
    fn insert_fixup(path: &mut PathStack<K, V>, mut node: Node<K, V>) -> ReferenceCounter<Node<K, V>> {
        let Some(parent) = path.top().cloned() else {
            // Reached the root, which is always black.
            node.color = Color::Black;
            return ReferenceCounter::new(node);
        };
        if parent.is_black() {
            // A red node below a black parent violates nothing: plain
            // spine copy.
            return Self::rebuild_spine(path, ReferenceCounter::new(node), 0);
        }
        let node_side = Self::side_under(&parent, node.key());
        let Some(grand) = path.parent().cloned() else {
            // Red parent at the root: recolor it black while grafting.
            let mut new_parent = (*parent).clone();
            new_parent.color = Color::Black;
            new_parent.set_child(node_side, Some(ReferenceCounter::new(node)));
            path.pop();
            return Self::rebuild_spine(path, ReferenceCounter::new(new_parent), 0);
        };
        let parent_side = Self::side_under(&grand, parent.key());

        if let Some(uncle) = grand
            .child(parent_side.opposite())
            .filter(|uncle| uncle.is_red())
        {
            // Red uncle: recolor parent and uncle black, grandparent red,
            // and continue the fixup with the grandparent as the new red
            // node. This may cascade toward the root.
            let mut new_parent = (*parent).clone();
            new_parent.color = Color::Black;
            new_parent.set_child(node_side, Some(ReferenceCounter::new(node)));
            let mut new_uncle = (**uncle).clone();
            new_uncle.color = Color::Black;
            let mut new_grand = (*grand).clone();
            new_grand.color = Color::Red;
            new_grand.set_child(parent_side, Some(ReferenceCounter::new(new_parent)));
            new_grand.set_child(parent_side.opposite(), Some(ReferenceCounter::new(new_uncle)));
            path.pop();
            path.pop();
            return Self::insert_fixup(path, new_grand);
        }

        let mut new_parent = (*parent).clone();
        let mut new_grand = (*grand).clone();
        path.pop();
        path.pop();
        if node_side == parent_side {
            // Zig-zig: single rotation, the parent becomes the black
            // subtree root with the grandparent demoted to red below it.
            new_grand.set_child(parent_side, parent.link(parent_side.opposite()));
            new_grand.color = Color::Red;
            new_parent.set_child(parent_side.opposite(), Some(ReferenceCounter::new(new_grand)));
            new_parent.set_child(parent_side, Some(ReferenceCounter::new(node)));
            new_parent.color = Color::Black;
            Self::rebuild_spine(path, ReferenceCounter::new(new_parent), 0)
        } else {
            // Zig-zag: double rotation, the new node takes the subtree
            // root, handing its former children to the parent and the
            // grandparent.
            let toward_parent = node.take_child(parent_side);
            let toward_grand = node.take_child(node_side);
            new_parent.set_child(node_side, toward_parent);
            new_grand.set_child(parent_side, toward_grand);
            new_grand.color = Color::Red;
            node.set_child(parent_side, Some(ReferenceCounter::new(new_parent)));
            node.set_child(node_side, Some(ReferenceCounter::new(new_grand)));
            node.color = Color::Black;
            Self::rebuild_spine(path, ReferenceCounter::new(node), 0)
        }
    }

    // =========================================================================
    // Erase Engine
    // =========================================================================

    /// Removes a key from the map.
    ///
    /// Returns a new map without the key. If the key is absent the result
    /// is an identity copy of the receiver sharing the same root.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimap::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new()
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    /// let removed = map.erase(&1);
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1); // New version
    /// assert_eq!(removed.get(&1), None);
    /// ```
    #[must_use]
    pub fn erase<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut path = PathStack::new();
        if !Self::search_from(self.root.as_ref(), key, &mut path) {
            return self.clone();
        }
        let root = Self::erase_found(&mut path);
        Self {
            root,
            size: self.size - 1,
        }
    }

    /// Removes the node on top of the path and returns the new root.
    fn erase_found(path: &mut PathStack<K, V>) -> Link<K, V> {
        let Some(node) = path.top().cloned() else {
            return None;
        };
        let has_left = node.child(Side::Left).is_some();
        let has_right = node.child(Side::Right).is_some();
        if has_left && has_right {
            return Self::erase_interior(path);
        }
        if has_left || has_right {
            // The lone child of a deleted node is a red leaf (anything
            // else would break black height); splice it up recolored black.
            let side = if has_left { Side::Left } else { Side::Right };
            let Some(child) = node.child(side) else {
                return None;
            };
            let mut promoted = (**child).clone();
            promoted.color = Color::Black;
            path.pop();
            return Some(Self::rebuild_spine(path, ReferenceCounter::new(promoted), 0));
        }
        if node.is_red() {
            // Detaching a red leaf cannot change any black height.
            path.pop();
            let Some(parent) = path.pop() else {
                return None;
            };
            let side = Self::side_under(&parent, node.key());
            let mut new_parent = (*parent).clone();
            new_parent.set_child(side, None);
            return Some(Self::rebuild_spine(path, ReferenceCounter::new(new_parent), 0));
        }
        if path.len() == 1 {
            // Black leaf at the root: the map becomes empty.
            return None;
        }
        // Black non-root leaf: detaching it leaves that side of the parent
        // one black node short, which the fixup has to repair.
        path.pop();
        let Some(parent) = path.pop() else {
            return None;
        };
        let side = Self::side_under(&parent, node.key());
        let mut new_parent = (*parent).clone();
        new_parent.set_child(side, None);
        Some(Self::erase_fixup(path, new_parent, side))
    }

    /// Extends the path from the node on top to its in-order predecessor:
    /// one step left, then right to the end. The predecessor never has a
    /// right child.
    fn descend_to_predecessor(path: &mut PathStack<K, V>) {
        let Some(mut current) = path.top().and_then(|node| node.link(Side::Left)) else {
            return;
        };
        loop {
            let next = current.link(Side::Right);
            path.push(current);
            match next {
                Some(node) => current = node,
                None => return,
            }
        }
    }

    /// Removes a node with two children by splicing its in-order
    /// predecessor into its position, keeping the removed position's color,
    /// then resolving the predecessor's old position one level down.
    fn erase_interior(path: &mut PathStack<K, V>) -> Link<K, V> {
        let Some(target) = path.top().cloned() else {
            return None;
        };
        let target_color = target.color;
        let depth = path.len();
        Self::descend_to_predecessor(path);
        let Some(pred) = path.top().cloned() else {
            return None;
        };
        // Side of the predecessor below its own parent: directly left of
        // the target, or at the end of a right-descending chain.
        let pred_side = if path.len() - depth > 1 {
            Side::Right
        } else {
            Side::Left
        };
        let mut spliced = (*pred).clone();
        spliced.color = target_color;
        spliced.set_child(Side::Right, target.link(Side::Right));

        if pred.is_red() {
            // A red predecessor is a leaf (a lone black child below it
            // would break black height): detach it outright.
            path.pop();
            let left = Self::rebuild_spine_detached(path, None, pred_side, depth);
            spliced.set_child(Side::Left, left);
            path.pop();
            return Some(Self::rebuild_spine(path, ReferenceCounter::new(spliced), 0));
        }
        if let Some(pred_left) = pred.child(Side::Left) {
            // Black predecessor with a left child: the child is
            // necessarily a red leaf, so promoting it recolored black
            // keeps every black height intact.
            let mut promoted = (**pred_left).clone();
            promoted.color = Color::Black;
            path.pop();
            let left = Self::rebuild_spine(path, ReferenceCounter::new(promoted), depth);
            spliced.set_child(Side::Left, Some(left));
            path.pop();
            return Some(Self::rebuild_spine(path, ReferenceCounter::new(spliced), 0));
        }
        // Black leaf predecessor: detaching it leaves a deficit at its old
        // parent. Build the spliced tree first so the fixup only ever
        // threads children through fresh clones, then re-locate the
        // deficient parent in the rebuilt tree by key.
        path.pop();
        let fixup_entry = if pred_side == Side::Left {
            // The predecessor hung directly below the target, so the
            // deficient parent is the spliced node itself.
            pred.entry.clone()
        } else {
            match path.top() {
                Some(parent) => parent.entry.clone(),
                None => pred.entry.clone(),
            }
        };
        let left = Self::rebuild_spine_detached(path, None, pred_side, depth);
        spliced.set_child(Side::Left, left);
        path.pop();
        let interim_root = Self::rebuild_spine(path, ReferenceCounter::new(spliced), 0);
        Self::search_from(Some(&interim_root), &fixup_entry.key, path);
        let Some(deficient_parent) = path.pop() else {
            return Some(interim_root);
        };
        Some(Self::erase_fixup(path, (*deficient_parent).clone(), pred_side))
    }

    /// Repairs a one-black-node deficit below `parent` on `side`.
    ///
    /// `parent` is a fresh clone not yet linked to the tree; the cases are
    /// keyed off its sibling subtree, which still belongs to the prior
    /// version and therefore is only read, never written.
    fn erase_fixup(
        path: &mut PathStack<K, V>,
        parent: Node<K, V>,
        side: Side,
    ) -> ReferenceCounter<Node<K, V>> {
        match parent.child(side.opposite()).cloned() {
            Some(sibling) if sibling.is_black() && sibling.has_red_child() => {
                // A red nephew can absorb the missing black by rotation.
                let resolved = Self::erase_fixup_rotate(&parent, side);
                Self::rebuild_spine(path, ReferenceCounter::new(resolved), 0)
            }
            Some(sibling) if sibling.is_black() => {
                // Both nephews black: recolor the sibling red. A red
                // parent turns black and fully absorbs the deficit; a
                // black parent pushes the deficit one level up.
                let parent_was_black = parent.is_black();
                let recolored = Self::erase_fixup_recolor(&parent, side);
                if parent_was_black && let Some(grand) = path.pop() {
                    let parent_side = Self::side_under(&grand, recolored.key());
                    let mut new_grand = (*grand).clone();
                    new_grand.set_child(parent_side, Some(ReferenceCounter::new(recolored)));
                    Self::erase_fixup(path, new_grand, parent_side)
                } else {
                    Self::rebuild_spine(path, ReferenceCounter::new(recolored), 0)
                }
            }
            Some(_) => {
                // Red sibling: rotate it up, then resolve at the demoted
                // parent. This never moves the deficit upward.
                let resolved = Self::erase_fixup_adjust(&parent, side);
                Self::rebuild_spine(path, ReferenceCounter::new(resolved), 0)
            }
            // A deficient side always has a sibling in a valid tree.
            None => Self::rebuild_spine(path, ReferenceCounter::new(parent), 0),
        }
    }

    /// Deficit case 1: black sibling with at least one red child. A single
    /// rotation (near nephew) or rotate-and-recolor (far nephew) restores
    /// the missing black and fully resolves the deficit.
    fn erase_fixup_rotate(parent: &Node<K, V>, side: Side) -> Node<K, V> {
        let parent_color = parent.color;
        let Some(sibling) = parent.child(side.opposite()) else {
            return parent.clone();
        };
        if let Some(near) = sibling.child(side).filter(|nephew| nephew.is_red()) {
            // Near red nephew rotates into the subtree root, taking the
            // parent's former color; parent and sibling become its black
            // flanks, inheriting the nephew's children.
            let mut new_near = (**near).clone();
            let mut new_parent = parent.clone();
            let mut new_sibling = (**sibling).clone();
            new_near.color = parent_color;
            new_parent.color = Color::Black;
            new_parent.set_child(side.opposite(), near.link(side));
            new_sibling.set_child(side, near.link(side.opposite()));
            new_near.set_child(side, Some(ReferenceCounter::new(new_parent)));
            new_near.set_child(side.opposite(), Some(ReferenceCounter::new(new_sibling)));
            new_near
        } else {
            // Far red nephew: the sibling rotates up with the parent's
            // former color, and the nephew turns black.
            let Some(far) = sibling.child(side.opposite()) else {
                return parent.clone();
            };
            let mut new_far = (**far).clone();
            let mut new_parent = parent.clone();
            let mut new_sibling = (**sibling).clone();
            new_sibling.color = parent_color;
            new_parent.color = Color::Black;
            new_parent.set_child(side.opposite(), sibling.link(side));
            new_far.color = Color::Black;
            new_sibling.set_child(side, Some(ReferenceCounter::new(new_parent)));
            new_sibling.set_child(side.opposite(), Some(ReferenceCounter::new(new_far)));
            new_sibling
        }
    }

    /// Deficit case 2: black sibling with two black children. Recolors the
    /// sibling red and the parent black, equalizing the two sides at the
    /// cost of one black level below the parent.
    fn erase_fixup_recolor(parent: &Node<K, V>, side: Side) -> Node<K, V> {
        let mut new_parent = parent.clone();
        if let Some(sibling) = parent.child(side.opposite()) {
            let mut new_sibling = (**sibling).clone();
            new_sibling.color = Color::Red;
            new_parent.set_child(side.opposite(), Some(ReferenceCounter::new(new_sibling)));
        }
        new_parent.color = Color::Black;
        new_parent
    }

    /// Deficit case 3: red sibling. Rotates the sibling up (keeping the
    /// parent's former color) and the parent down recolored red, then
    /// resolves as case 1 or 2 at the demoted parent, whose new sibling is
    /// guaranteed black.
    fn erase_fixup_adjust(parent: &Node<K, V>, side: Side) -> Node<K, V> {
        let Some(sibling) = parent.child(side.opposite()).cloned() else {
            return parent.clone();
        };
        let mut new_sibling = (*sibling).clone();
        let mut new_parent = parent.clone();
        new_sibling.color = parent.color;
        new_parent.color = Color::Red;
        new_parent.set_child(side.opposite(), sibling.link(side));
        let resolved = match new_parent.child(side.opposite()).cloned() {
            Some(next) if next.is_black() && next.has_red_child() => {
                Self::erase_fixup_rotate(&new_parent, side)
            }
            Some(next) if next.is_black() => Self::erase_fixup_recolor(&new_parent, side),
            _ => new_parent,
        };
        new_sibling.set_child(side, Some(ReferenceCounter::new(resolved)));
        new_sibling
    }
}

// =============================================================================
// Iterator Implementations
// =============================================================================

/// A lazy in-order iterator over the entries of a [`PersistentTreeMap`].
///
/// Holds the left spine of the not-yet-visited region, so producing the
/// next entry is amortized O(1) without materializing the map.
pub struct PersistentTreeMapIterator<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    remaining: usize,
}

impl<'a, K, V> PersistentTreeMapIterator<'a, K, V> {
    fn new(root: Option<&'a Node<K, V>>, remaining: usize) -> Self {
        let mut iterator = Self {
            stack: Vec::new(),
            remaining,
        };
        iterator.descend_left(root);
        iterator
    }

    fn descend_left(&mut self, mut node: Option<&'a Node<K, V>>) {
        while let Some(current) = node {
            self.stack.push(current);
            node = current.child(Side::Left).map(|child| &**child);
        }
    }
}

impl<'a, K, V> Iterator for PersistentTreeMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.remaining = self.remaining.saturating_sub(1);
        self.descend_left(node.child(Side::Right).map(|child| &**child));
        Some((&node.entry.key, &node.entry.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for PersistentTreeMapIterator<'_, K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

/// An owning iterator over the entries of a [`PersistentTreeMap`].
///
/// Entries are cloned out of the shared nodes, since other map versions may
/// still reference them.
pub struct PersistentTreeMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentTreeMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K, V> ExactSizeIterator for PersistentTreeMapIntoIterator<K, V> {
    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for PersistentTreeMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for PersistentTreeMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map = map.insert(key, value);
        }
        map
    }
}

impl<K: Clone, V: Clone> IntoIterator for PersistentTreeMap<K, V> {
    type Item = (K, V);
    type IntoIter = PersistentTreeMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentTreeMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K, V> IntoIterator for &'a PersistentTreeMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentTreeMapIterator<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for PersistentTreeMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self
                .iter()
                .zip(other.iter())
                .all(|((key_a, value_a), (key_b, value_b))| key_a == key_b && value_a == value_b)
    }
}

impl<K: Eq, V: Eq> Eq for PersistentTreeMap<K, V> {}

/// The hash covers the length and every entry in key order, so equal maps
/// hash equally regardless of the insertion order that produced them.
impl<K: Hash, V: Hash> Hash for PersistentTreeMap<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.size.hash(state);
        for (key, value) in self {
            key.hash(state);
            value.hash(state);
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentTreeMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

impl<K: fmt::Display, V: fmt::Display> fmt::Display for PersistentTreeMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{{")?;
        let mut first = true;
        for (key, value) in self {
            if first {
                first = false;
            } else {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{key}: {value}")?;
        }
        write!(formatter, "}}")
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for PersistentTreeMap<K, V>
where
    K: serde::Serialize,
    V: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
struct PersistentTreeMapVisitor<K, V> {
    key_marker: std::marker::PhantomData<K>,
    value_marker: std::marker::PhantomData<V>,
}

#[cfg(feature = "serde")]
impl<K, V> PersistentTreeMapVisitor<K, V> {
    const fn new() -> Self {
        Self {
            key_marker: std::marker::PhantomData,
            value_marker: std::marker::PhantomData,
        }
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Visitor<'de> for PersistentTreeMapVisitor<K, V>
where
    K: serde::Deserialize<'de> + Ord,
    V: serde::Deserialize<'de>,
{
    type Value = PersistentTreeMap<K, V>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut map = PersistentTreeMap::new();
        while let Some((key, value)) = access.next_entry()? {
            map = map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for PersistentTreeMap<K, V>
where
    K: serde::Deserialize<'de> + Ord,
    V: serde::Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PersistentTreeMapVisitor::new())
    }
}

// =============================================================================
// Tests
// =============================================================================
