use std::{hash::Hash, marker::PhantomData};

/// Sentinel offset for handles that do not refer to any slot.
pub const NULL_INDEX: u32 = u32::MAX;

/// A versioned reference to an entry in a pool. Handles act like weak
/// references: the entry they point to may be destroyed while handles to it
/// still exist, after which version checks cause `get()` to fail and
/// `remove()` to do nothing.
///
/// The generic argument `T` provides some basic type checking to reduce the
/// risk that a handle from one pool is used with another.
#[must_use]
pub struct Handle<T> {
    offset: u32,
    version: u32,
    phantom: PhantomData<T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(offset: u32, version: u32) -> Self {
        Self {
            offset,
            version,
            phantom: PhantomData,
        }
    }

    /// The handle that refers to nothing. Its version is 0, which no pool
    /// ever issues.
    pub fn null() -> Self {
        Self {
            offset: NULL_INDEX,
            version: 0,
            phantom: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == NULL_INDEX
    }

    /// Byte offset of the referenced slot within its pool's backing buffer.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// The slot version this handle expects to find.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn as_raw(&self) -> RawHandle {
        RawHandle {
            offset: self.offset,
            version: self.version,
        }
    }

    /// # Safety
    ///
    /// The caller must ensure that the raw handle was produced by a pool
    /// storing objects of type `T`.
    pub unsafe fn from_raw(raw: RawHandle) -> Self {
        Self {
            offset: raw.offset,
            version: raw.version,
            phantom: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            offset: self.offset,
            version: self.version,
            phantom: PhantomData,
        }
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.version == other.version
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
        self.version.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(&format!("Handle<{}>", std::any::type_name::<T>()))
            .field("offset", &self.offset)
            .field("version", &self.version)
            .finish()
    }
}

/// An untyped `(offset, version)` pair for serialization boundaries, where
/// the phantom type parameter cannot be carried.
#[must_use]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub offset: u32,
    pub version: u32,
}
