//! Shared collection abstractions for the GRE tunnel gateway.
//!
//! - [`OrderedMap`]: ordered map that never auto-creates entries and supports
//!   exact, first and successor lookups in O(log n)
//! - [`RefCounted`] / [`HasRefCount`]: explicit counted handles whose release
//!   reports whether the last reference went away

mod ordered_map;
mod refcount;

pub use ordered_map::{OrderedMap, OrderedMapError};
pub use refcount::{HasRefCount, RefCountError, RefCounted, Release};
