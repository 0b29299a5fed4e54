//! # persimap
//!
//! A persistent (immutable) ordered map backed by a path-copying red-black
//! tree.
//!
//! ## Overview
//!
//! [`PersistentTreeMap`] is an immutable value type: `insert` and `erase`
//! return a *new* map and leave the receiver untouched. Versions share every
//! subtree that is not on the modified path, so a mutation allocates
//! O(log N) nodes instead of copying the map.
//!
//! - O(log N) `get` / `at` / `contains`
//! - O(log N) `insert` / `erase`
//! - O(1) `len`, `is_empty` and `Clone`
//! - In-order iteration in ascending key order
//!
//! ```rust
//! use persimap::PersistentTreeMap;
//!
//! let map = PersistentTreeMap::new()
//!     .insert(3, "three")
//!     .insert(1, "one")
//!     .insert(2, "two");
//!
//! let smaller = map.erase(&3);
//!
//! assert_eq!(map.len(), 3);     // Original unchanged
//! assert_eq!(smaller.len(), 2); // New version
//! let keys: Vec<&i32> = smaller.keys().collect();
//! assert_eq!(keys, vec![&1, &2]);
//! ```
//!
//! ## Feature Flags
//!
//! - `arc`: share nodes via `std::sync::Arc` instead of `std::rc::Rc`,
//!   making map values usable across threads
//! - `serde`: `Serialize`/`Deserialize` of map content

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

// =============================================================================
// Reference Counter Type Alias
// =============================================================================

/// Reference-counted smart pointer type used for node sharing.
///
/// When the `arc` feature is enabled, this is `std::sync::Arc`,
/// which is thread-safe but has slightly higher overhead.
///
/// When the `arc` feature is disabled (default), this is `std::rc::Rc`,
/// which is faster but not thread-safe.
#[cfg(feature = "arc")]
pub(crate) type ReferenceCounter<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub(crate) type ReferenceCounter<T> = std::rc::Rc<T>;

mod error;
mod treemap;

pub use error::StructuralViolation;
pub use error::TreeMapError;
pub use treemap::PersistentTreeMap;
pub use treemap::PersistentTreeMapIntoIterator;
pub use treemap::PersistentTreeMapIterator;
