use std::{
    collections::HashMap,
    fmt,
    ptr::NonNull,
    sync::{Mutex, MutexGuard},
};

use crate::{
    guid::Guid,
    handle::Handle,
    slab_pool::{self, RawSlab, TypeInfo},
};

/// Errors that may occur when working with [`ResourcePool`]s.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The handle's version does not match the slot's current version; the
    /// entry it referred to has been removed (and the slot possibly reused).
    #[error("the handle is stale or null")]
    InvalidHandle,
    #[error("guid {0} is already bound in this pool")]
    DuplicateGuid(Guid),
    /// The invalid guid sentinel cannot be bound; use `add` for unbound
    /// entries.
    #[error("cannot bind the invalid guid")]
    InvalidGuid,
    #[error(transparent)]
    Slab(#[from] slab_pool::Error),
}

struct PoolInner<T: Send + 'static> {
    slab: RawSlab,
    /// Per-slot version counters, resized in lockstep with the slab.
    /// 0 means "never issued"; removal increments, re-issue stamps.
    versions: Vec<u32>,
    ref_counts: Vec<u32>,
    guid_to_handle: HashMap<Guid, Handle<T>>,
    handle_to_guid: HashMap<u32, Guid>,
    live: usize,
}

impl<T: Send + 'static> PoolInner<T> {
    fn slot_index(&self, offset: u32) -> usize {
        offset as usize / self.slab.stride()
    }

    /// Validates `handle` and returns its slot index.
    fn check(&self, handle: Handle<T>) -> Result<usize, Error> {
        if handle.is_null()
            || handle.version() == 0
            || handle.offset() as usize % self.slab.stride() != 0
        {
            return Err(Error::InvalidHandle);
        }
        let index = self.slot_index(handle.offset());
        if self.versions.get(index) != Some(&handle.version()) {
            return Err(Error::InvalidHandle);
        }
        Ok(index)
    }

    fn add(&mut self, guid: Option<Guid>, value: T) -> Result<Handle<T>, Error> {
        if let Some(guid) = guid {
            if !guid.is_valid() {
                return Err(Error::InvalidGuid);
            }
            if self.guid_to_handle.contains_key(&guid) {
                return Err(Error::DuplicateGuid(guid));
            }
        }

        let unversioned = self.slab.create(value)?;
        let slot_count = self.slab.slot_count();
        if self.versions.len() < slot_count {
            self.versions.resize(slot_count, 0);
            self.ref_counts.resize(slot_count, 0);
        }

        let index = self.slot_index(unversioned.offset());
        if self.versions[index] == 0 {
            self.versions[index] = 1;
        }
        self.ref_counts[index] = 1;
        self.live += 1;

        let handle = Handle::new(unversioned.offset(), self.versions[index]);
        if let Some(guid) = guid {
            self.guid_to_handle.insert(guid, handle);
            self.handle_to_guid.insert(handle.offset(), guid);
        }
        Ok(handle)
    }

    /// Destroys the entry at a slot already validated by `check`. Bumps the
    /// slot version so every outstanding handle goes stale.
    fn remove_at(&mut self, index: usize, handle: Handle<T>) {
        self.slab
            .destroy(handle)
            .expect("slot validated under the pool lock");
        self.versions[index] += 1;
        self.ref_counts[index] = 0;
        self.live -= 1;
        if let Some(guid) = self.handle_to_guid.remove(&handle.offset()) {
            self.guid_to_handle.remove(&guid);
        }
    }
}

/// A versioned, reference-counted pool of `T` entries over an aligned slab.
///
/// Entries are addressed by [`Handle`]s. Removing an entry bumps its slot's
/// version, so all outstanding handles to it become stale and are rejected
/// with [`Error::InvalidHandle`] rather than observing a reused slot.
/// Reference counts start at 1 on `add`; `release` destroys the entry when
/// the count reaches zero. Entries may optionally be bound to a [`Guid`] for
/// cross-session identity.
///
/// Every operation takes the pool's lock for its entire duration, so a pool
/// shared between threads is safe; operations on pools of different types
/// never contend.
#[must_use]
pub struct ResourcePool<T: Send + 'static> {
    inner: Mutex<PoolInner<T>>,
}

impl<T: Send + 'static> ResourcePool<T> {
    /// A pool whose slots use the element's natural alignment.
    pub fn new() -> Result<Self, slab_pool::Error> {
        Self::with_alignment(std::mem::align_of::<T>())
    }

    pub fn with_alignment(alignment: usize) -> Result<Self, slab_pool::Error> {
        Ok(Self {
            inner: Mutex::new(PoolInner {
                slab: RawSlab::new(TypeInfo::of::<T>(), alignment)?,
                versions: Vec::new(),
                ref_counts: Vec::new(),
                guid_to_handle: HashMap::new(),
                handle_to_guid: HashMap::new(),
                live: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<T>> {
        self.inner.lock().expect("resource pool lock poisoned")
    }

    /// Adds an entry with no guid binding. The entry starts with a
    /// reference count of 1.
    pub fn add(&self, value: T) -> Result<Handle<T>, Error> {
        self.lock().add(None, value)
    }

    /// Adds an entry bound to `guid`. Fails with [`Error::InvalidGuid`] on
    /// the invalid sentinel and [`Error::DuplicateGuid`] when the guid is
    /// already bound; the pool is unchanged on failure.
    pub fn add_with_guid(&self, guid: Guid, value: T) -> Result<Handle<T>, Error> {
        self.lock().add(Some(guid), value)
    }

    /// Borrows the entry at `handle` after a version check. The guard holds
    /// the pool lock; drop it before calling back into this pool.
    pub fn get(&self, handle: Handle<T>) -> Result<ResourceRef<'_, T>, Error> {
        let guard = self.lock();
        guard.check(handle)?;
        let ptr = guard
            .slab
            .get_ptr(handle)
            .map_err(|_| Error::InvalidHandle)?;
        Ok(ResourceRef { _guard: guard, ptr })
    }

    /// Mutably borrows the entry at `handle` after a version check. The
    /// guard holds the pool lock; drop it before calling back into this
    /// pool.
    pub fn get_mut(&self, handle: Handle<T>) -> Result<ResourceRefMut<'_, T>, Error> {
        let guard = self.lock();
        guard.check(handle)?;
        let ptr = guard
            .slab
            .get_ptr(handle)
            .map_err(|_| Error::InvalidHandle)?;
        Ok(ResourceRefMut { _guard: guard, ptr })
    }

    /// Destroys the entry at `handle`, invalidating all outstanding handles
    /// to it and unbinding its guid. Does nothing when the handle is stale
    /// or null.
    pub fn remove(&self, handle: Handle<T>) {
        let mut inner = self.lock();
        if let Ok(index) = inner.check(handle) {
            inner.remove_at(index, handle);
        }
    }

    /// Increments the entry's reference count. No-op on a stale handle.
    pub fn retain(&self, handle: Handle<T>) {
        let mut inner = self.lock();
        if let Ok(index) = inner.check(handle) {
            debug_assert!(inner.ref_counts[index] > 0);
            inner.ref_counts[index] += 1;
        }
    }

    /// Decrements the entry's reference count, destroying the entry when it
    /// reaches zero. No-op on a stale handle.
    pub fn release(&self, handle: Handle<T>) {
        let mut inner = self.lock();
        if let Ok(index) = inner.check(handle) {
            debug_assert!(inner.ref_counts[index] > 0);
            inner.ref_counts[index] -= 1;
            if inner.ref_counts[index] == 0 {
                inner.remove_at(index, handle);
            }
        }
    }

    /// Current reference count, or 0 when the handle is stale.
    pub fn use_count(&self, handle: Handle<T>) -> u32 {
        let inner = self.lock();
        match inner.check(handle) {
            Ok(index) => inner.ref_counts[index],
            Err(_) => 0,
        }
    }

    pub fn valid(&self, handle: Handle<T>) -> bool {
        self.lock().check(handle).is_ok()
    }

    /// The guid bound to `handle`, or [`Guid::INVALID`] when none is.
    pub fn guid_of(&self, handle: Handle<T>) -> Guid {
        let inner = self.lock();
        match inner.check(handle) {
            Ok(_) => inner
                .handle_to_guid
                .get(&handle.offset())
                .copied()
                .unwrap_or(Guid::INVALID),
            Err(_) => Guid::INVALID,
        }
    }

    /// The handle bound to `guid`, or the null handle when the guid is
    /// unknown.
    pub fn find_by_guid(&self, guid: Guid) -> Handle<T> {
        self.lock()
            .guid_to_handle
            .get(&guid)
            .copied()
            .unwrap_or_else(Handle::null)
    }

    /// Visits every live entry in ascending slot order with the pool lock
    /// held; `f` must not call back into this pool.
    pub fn for_each(&self, mut f: impl FnMut(Handle<T>, &T)) {
        let mut inner = self.lock();
        let PoolInner {
            slab, versions, ..
        } = &mut *inner;
        let stride = slab.stride();
        slab.used_visitor::<T>(|offset, value| {
            let version = versions[offset as usize / stride];
            f(Handle::new(offset, version), value);
        })
        .expect("pool and slab always agree on the element type");
    }

    /// Mutable form of [`for_each`](Self::for_each).
    pub fn for_each_mut(&self, mut f: impl FnMut(Handle<T>, &mut T)) {
        let mut inner = self.lock();
        let PoolInner {
            slab, versions, ..
        } = &mut *inner;
        let stride = slab.stride();
        slab.used_visitor::<T>(|offset, value| {
            let version = versions[offset as usize / stride];
            f(Handle::new(offset, version), value);
        })
        .expect("pool and slab always agree on the element type");
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> fmt::Display for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.lock().slab, f)
    }
}

/// Lock-holding borrow of a pool entry.
pub struct ResourceRef<'a, T: Send + 'static> {
    _guard: MutexGuard<'a, PoolInner<T>>,
    ptr: NonNull<T>,
}

impl<T: Send + 'static> std::ops::Deref for ResourceRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

/// Lock-holding mutable borrow of a pool entry.
pub struct ResourceRefMut<'a, T: Send + 'static> {
    _guard: MutexGuard<'a, PoolInner<T>>,
    ptr: NonNull<T>,
}

impl<T: Send + 'static> std::ops::Deref for ResourceRefMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Send + 'static> std::ops::DerefMut for ResourceRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}
