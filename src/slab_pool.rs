use std::{
    alloc::{self, Layout},
    any::TypeId,
    fmt, mem,
    ptr::NonNull,
    sync::{Mutex, MutexGuard},
};

use crate::handle::{Handle, NULL_INDEX};

/// A free slot stores the byte offset of the next free slot in its first
/// bytes, so a slot must be at least this large.
const FREE_LINK_SIZE: usize = mem::size_of::<u32>();

/// Runtime identity of the type a slab stores. Two `TypeInfo`s compare equal
/// iff they denote the same type; the remaining fields drive slot layout and
/// teardown of the erased storage.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    type_id: TypeId,
    type_name: &'static str,
    element_size: usize,
    element_align: usize,
    drop_fn: unsafe fn(*mut u8),
}

impl TypeInfo {
    pub fn of<T: 'static>() -> Self {
        unsafe fn drop_in_slot<T>(slot: *mut u8) {
            unsafe { slot.cast::<T>().drop_in_place() }
        }

        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            element_size: mem::size_of::<T>(),
            element_align: mem::align_of::<T>(),
            drop_fn: drop_in_slot::<T>,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TypeInfo {}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_name", &self.type_name)
            .field("element_size", &self.element_size)
            .finish()
    }
}

/// Errors that may occur when working with [`SlabPool`]s.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The runtime type of a call does not match the type the pool was
    /// constructed for. A programming error: fatal in debug builds,
    /// surfaced as this error otherwise.
    #[error("the pool stores {expected}, not {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// The element type cannot host an embedded freelist link.
    #[error("{type_name} is {element_size} bytes, too small to host a freelist link")]
    SlotTooSmall {
        type_name: &'static str,
        element_size: usize,
    },
    #[error("slot alignment must be a power of two, got {alignment}")]
    BadAlignment { alignment: usize },
    /// The backing aligned allocation failed; the slab is unchanged.
    #[error("failed to allocate {capacity} bytes of slab storage")]
    AllocationFailure { capacity: usize },
    #[error("the handle is invalid")]
    InvalidHandle,
}

/// The unsynchronized slab core. `SlabPool` wraps it in a mutex for
/// standalone use; `ResourcePool` embeds it under its own lock so that
/// release-to-zero can destroy without re-acquisition.
pub(crate) struct RawSlab {
    type_info: TypeInfo,
    alignment: usize,
    /// Distance in bytes between consecutive slots. A multiple of
    /// `alignment`, so every slot address satisfies the alignment contract.
    stride: usize,
    data: *mut u8,
    /// Size of the backing buffer in bytes. Grows as a power of two times
    /// `stride`; never shrinks.
    capacity: usize,
    free_first: u32,
    free_last: u32,
}

// Values only enter through `create`, which requires `T: Send`.
unsafe impl Send for RawSlab {}

impl RawSlab {
    pub(crate) fn new(type_info: TypeInfo, alignment: usize) -> Result<Self, Error> {
        if type_info.element_size < FREE_LINK_SIZE {
            return Err(Error::SlotTooSmall {
                type_name: type_info.type_name,
                element_size: type_info.element_size,
            });
        }
        if !alignment.is_power_of_two() {
            return Err(Error::BadAlignment { alignment });
        }

        // The freelist link is read as an aligned u32, and references handed
        // out must satisfy the element's own alignment.
        let alignment = alignment
            .max(mem::align_of::<u32>())
            .max(type_info.element_align);
        let stride = type_info.element_size.next_multiple_of(alignment);

        Ok(Self {
            type_info,
            alignment,
            stride,
            data: std::ptr::null_mut(),
            capacity: 0,
            free_first: NULL_INDEX,
            free_last: NULL_INDEX,
        })
    }

    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.capacity / self.stride
    }

    fn check_type<T: 'static>(&self) -> Result<(), Error> {
        if TypeId::of::<T>() != self.type_info.type_id {
            debug_assert!(
                false,
                "the pool stores {}, not {}",
                self.type_info.type_name,
                std::any::type_name::<T>(),
            );
            return Err(Error::TypeMismatch {
                expected: self.type_info.type_name,
                actual: std::any::type_name::<T>(),
            });
        }
        Ok(())
    }

    fn checked_offset<T>(&self, handle: Handle<T>) -> Result<u32, Error> {
        let offset = handle.offset();
        if handle.is_null()
            || offset as usize >= self.capacity
            || offset as usize % self.stride != 0
        {
            return Err(Error::InvalidHandle);
        }
        Ok(offset)
    }

    /// Whether `offset` is absent from the freelist. O(free count); debug
    /// validation only.
    #[cfg(debug_assertions)]
    fn is_live(&self, offset: u32) -> bool {
        let mut current = self.free_first;
        while current != NULL_INDEX {
            if current == offset {
                return false;
            }
            current = self.read_link(current);
        }
        true
    }

    /// Raw address of the slot at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must lie within the buffer and be a multiple of `stride`.
    unsafe fn slot_ptr(&self, offset: u32) -> *mut u8 {
        unsafe { self.data.add(offset as usize) }
    }

    fn read_link(&self, offset: u32) -> u32 {
        unsafe { self.slot_ptr(offset).cast::<u32>().read() }
    }

    fn write_link(&mut self, offset: u32, next: u32) {
        unsafe { self.slot_ptr(offset).cast::<u32>().write(next) }
    }

    pub(crate) fn create<T: Send + 'static>(&mut self, value: T) -> Result<Handle<T>, Error> {
        self.check_type::<T>()?;

        if self.free_first == NULL_INDEX {
            self.grow()?;
        }

        let offset = self.free_first;
        let next = self.read_link(offset);
        self.free_first = next;
        if next == NULL_INDEX {
            self.free_last = NULL_INDEX;
        }

        unsafe { self.slot_ptr(offset).cast::<T>().write(value) };

        // The version is stamped by the wrapping resource pool, if any.
        Ok(Handle::new(offset, 0))
    }

    pub(crate) fn destroy<T: 'static>(&mut self, handle: Handle<T>) -> Result<(), Error> {
        self.check_type::<T>()?;
        let offset = self.checked_offset(handle)?;
        debug_assert!(self.is_live(offset), "slot {offset} destroyed twice");

        unsafe { self.slot_ptr(offset).cast::<T>().drop_in_place() };

        // Freed slots go to the head of the list.
        self.write_link(offset, self.free_first);
        if self.free_first == NULL_INDEX {
            self.free_last = offset;
        }
        self.free_first = offset;
        Ok(())
    }

    /// Address of the live object at `handle`, validated for bounds and
    /// alignment only. Version validity is the wrapper's job.
    pub(crate) fn get_ptr<T: 'static>(&self, handle: Handle<T>) -> Result<NonNull<T>, Error> {
        self.check_type::<T>()?;
        let offset = self.checked_offset(handle)?;
        debug_assert!(self.is_live(offset), "slot {offset} resolved after destroy");
        Ok(unsafe { NonNull::new_unchecked(self.slot_ptr(offset).cast::<T>()) })
    }

    pub(crate) fn count_free(&self) -> usize {
        let mut count = 0;
        let mut current = self.free_first;
        while current != NULL_INDEX {
            count += 1;
            current = self.read_link(current);
        }
        count
    }

    /// One flag per slot, true when the slot is on the freelist.
    fn free_slot_map(&self) -> Vec<bool> {
        let mut map = vec![false; self.slot_count()];
        let mut current = self.free_first;
        while current != NULL_INDEX {
            map[current as usize / self.stride] = true;
            current = self.read_link(current);
        }
        map
    }

    pub(crate) fn used_visitor<T: 'static>(
        &mut self,
        mut f: impl FnMut(u32, &mut T),
    ) -> Result<(), Error> {
        self.check_type::<T>()?;

        let free = self.free_slot_map();
        for (index, is_free) in free.iter().enumerate() {
            if *is_free {
                continue;
            }
            let offset = (index * self.stride) as u32;
            f(offset, unsafe { &mut *self.slot_ptr(offset).cast::<T>() });
        }
        Ok(())
    }

    /// Resizes the slab to the next power of two slot count strictly greater
    /// than the current one (1 when empty). Live slots keep their indices;
    /// moves are byte copies, so the whole old buffer migrates with a single
    /// copy that also carries freelist links verbatim.
    fn grow(&mut self) -> Result<(), Error> {
        let old_count = self.slot_count();
        let new_count = if old_count == 0 { 1 } else { old_count * 2 };
        let new_capacity = new_count
            .checked_mul(self.stride)
            .filter(|c| *c < NULL_INDEX as usize)
            .ok_or(Error::AllocationFailure {
                capacity: new_count.saturating_mul(self.stride),
            })?;

        let layout = Layout::from_size_align(new_capacity, self.alignment)
            .map_err(|_| Error::AllocationFailure {
                capacity: new_capacity,
            })?;
        let new_data = unsafe { alloc::alloc(layout) };
        let Some(new_data) = NonNull::new(new_data) else {
            return Err(Error::AllocationFailure {
                capacity: new_capacity,
            });
        };

        if !self.data.is_null() {
            unsafe {
                new_data
                    .as_ptr()
                    .copy_from_nonoverlapping(self.data, self.capacity);
                alloc::dealloc(
                    self.data,
                    Layout::from_size_align_unchecked(self.capacity, self.alignment),
                );
            }
        }
        self.data = new_data.as_ptr();
        self.capacity = new_capacity;

        // Chain the fresh tail slots in ascending order and append them at
        // the back of the freelist.
        let first_new = (old_count * self.stride) as u32;
        for index in old_count..new_count {
            let offset = (index * self.stride) as u32;
            let next = if index + 1 < new_count {
                offset + self.stride as u32
            } else {
                NULL_INDEX
            };
            self.write_link(offset, next);
        }

        if self.free_last == NULL_INDEX {
            self.free_first = first_new;
        } else {
            let free_last = self.free_last;
            self.write_link(free_last, first_new);
        }
        self.free_last = ((new_count - 1) * self.stride) as u32;

        Ok(())
    }
}

impl fmt::Display for RawSlab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slab<{}> {} bytes, {} slots, stride {}",
            self.type_info.type_name,
            self.capacity,
            self.slot_count(),
            self.stride,
        )?;

        write!(f, "freelist:")?;
        let mut current = self.free_first;
        while current != NULL_INDEX {
            write!(f, " {current}")?;
            current = self.read_link(current);
        }
        writeln!(f, " (end)")?;

        write!(f, "slots: ")?;
        for is_free in self.free_slot_map() {
            write!(f, "{}", if is_free { "[F]" } else { "[U]" })?;
        }
        Ok(())
    }
}

impl Drop for RawSlab {
    fn drop(&mut self) {
        if self.data.is_null() {
            return;
        }

        let free = self.free_slot_map();
        for (index, is_free) in free.iter().enumerate() {
            if !*is_free {
                unsafe {
                    (self.type_info.drop_fn)(self.slot_ptr((index * self.stride) as u32));
                }
            }
        }

        unsafe {
            alloc::dealloc(
                self.data,
                Layout::from_size_align_unchecked(self.capacity, self.alignment),
            );
        }
    }
}

/// A type-erased slab of equal-sized, equally-aligned slots with an embedded
/// freelist. Allocation and free are O(1); slot *indices* are stable across
/// growth while raw addresses are not, so references obtained through
/// [`get`](SlabPool::get) must not be cached across further allocation.
///
/// All operations are serialized on an internal mutex, so a pool shared
/// between threads hands out slots safely. The mutex is not recursive:
/// callbacks passed to [`used_visitor`](SlabPool::used_visitor) run with the
/// lock held and must not call back into the same pool.
#[must_use]
pub struct SlabPool {
    inner: Mutex<RawSlab>,
}

impl SlabPool {
    /// A pool for the type described by `type_info`, with slots aligned to
    /// `alignment` (a power of two; rounded up to the platform minimum for
    /// aligned allocation). No memory is allocated until the first `create`.
    pub fn new(type_info: TypeInfo, alignment: usize) -> Result<Self, Error> {
        Ok(Self {
            inner: Mutex::new(RawSlab::new(type_info, alignment)?),
        })
    }

    pub fn for_type<T: 'static>(alignment: usize) -> Result<Self, Error> {
        Self::new(TypeInfo::of::<T>(), alignment)
    }

    fn lock(&self) -> MutexGuard<'_, RawSlab> {
        self.inner.lock().expect("slab pool lock poisoned")
    }

    /// Allocates a slot (growing if the freelist is empty) and constructs
    /// `value` in place. The returned handle's version is 0; versioning is
    /// layered on by `ResourcePool`.
    pub fn create<T: Send + 'static>(&self, value: T) -> Result<Handle<T>, Error> {
        self.lock().create(value)
    }

    /// Destroys the object at `handle` and links its slot at the head of the
    /// freelist.
    pub fn destroy<T: 'static>(&self, handle: Handle<T>) -> Result<(), Error> {
        self.lock().destroy(handle)
    }

    /// Borrows the object at `handle`. The returned guard holds the pool
    /// lock, so it cannot outlive a concurrent grow.
    ///
    /// Only bounds and slot alignment are validated (liveness also, in debug
    /// builds). Resolving a handle whose slot has been destroyed is a
    /// contract violation; `ResourcePool` layers a version check on top for
    /// callers that need stale handles detected.
    pub fn get<T: 'static>(&self, handle: Handle<T>) -> Result<SlabRef<'_, T>, Error> {
        let guard = self.lock();
        let ptr = guard.get_ptr(handle)?;
        Ok(SlabRef { _guard: guard, ptr })
    }

    /// Walks the freelist. O(free count).
    pub fn count_free(&self) -> usize {
        self.lock().count_free()
    }

    /// Current slab size in bytes.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn slot_count(&self) -> usize {
        self.lock().slot_count()
    }

    /// Invokes `f` on every live slot in ascending index order, passing the
    /// slot's byte offset. The pool lock is held for the whole walk; `f`
    /// must not call back into this pool.
    pub fn used_visitor<T: 'static>(
        &self,
        f: impl FnMut(u32, &mut T),
    ) -> Result<(), Error> {
        self.lock().used_visitor(f)
    }
}

impl fmt::Display for SlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.lock(), f)
    }
}

/// Lock-holding borrow of a slab slot. Dereferences to the stored object;
/// the pool stays locked until the guard is dropped.
pub struct SlabRef<'a, T> {
    _guard: MutexGuard<'a, RawSlab>,
    ptr: NonNull<T>,
}

impl<T> std::ops::Deref for SlabRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> std::ops::DerefMut for SlabRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}
