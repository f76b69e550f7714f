//! Explicit reference counting.
//!
//! Routes, tunnels and similar shared resources are kept alive by the number
//! of sessions using them. Instead of ad hoc counter fields, they embed a
//! [`RefCounted`] and report through [`Release`] whether the caller just
//! dropped the last reference and must tear the resource down.

use thiserror::Error;

/// Error type for reference count operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefCountError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference count underflow")]
    Underflow,

    #[error("Reference count overflow")]
    Overflow,
}

/// Outcome of releasing one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain; the count after release is carried.
    Shared(u32),
    /// That was the last reference.
    Last,
}

impl Release {
    pub fn is_last(&self) -> bool {
        matches!(self, Release::Last)
    }
}

/// A reference counter with checked acquire/release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCounted {
    count: u32,
}

impl RefCounted {
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Takes one reference and returns true if this was the first one.
    pub fn acquire(&mut self) -> Result<bool, RefCountError> {
        self.count = self.count.checked_add(1).ok_or(RefCountError::Overflow)?;
        Ok(self.count == 1)
    }

    /// Drops one reference.
    pub fn release(&mut self) -> Result<Release, RefCountError> {
        self.count = self.count.checked_sub(1).ok_or(RefCountError::Underflow)?;
        if self.count == 0 {
            Ok(Release::Last)
        } else {
            Ok(Release::Shared(self.count))
        }
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    pub const fn is_referenced(&self) -> bool {
        self.count > 0
    }
}

/// Trait for types that embed a reference count.
pub trait HasRefCount {
    fn refs(&self) -> &RefCounted;

    fn refs_mut(&mut self) -> &mut RefCounted;

    fn ref_count(&self) -> u32 {
        self.refs().count()
    }
}

impl HasRefCount for RefCounted {
    fn refs(&self) -> &RefCounted {
        self
    }

    fn refs_mut(&mut self) -> &mut RefCounted {
        self
    }
}
