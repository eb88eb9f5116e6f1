//! The heap buffer behind every byte string handle.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::slice;

use crate::share::ShareCount;

/// The smallest capacity a buffer is ever allocated with. All capacities are
/// multiples of it.
const BASE_CAPACITY: usize = 4;

/// The bookkeeping at the start of a buffer's allocation, directly followed
/// by the content bytes.
struct Header<C> {
    /// How many handles own the buffer, or the unshareable mark. Interior
    /// mutable, so it can be updated through shared references.
    state: C,
    /// How many content bytes the allocation has room for.
    ///
    /// May only be mutated while the buffer is uniquely owned.
    /// Invariant: a positive multiple of `BASE_CAPACITY`, with
    /// `size(capacity)` within the allocation size limit.
    capacity: usize,
    /// How many bytes of meaningful content the buffer holds.
    ///
    /// May only be mutated while the buffer is uniquely owned.
    /// Invariant: `len <= capacity`.
    len: usize,
}

/// One heap allocation holding a [`Header`] and up to `capacity` content
/// bytes.
///
/// This is a raw building block: it has no drop glue, and ownership
/// bookkeeping is the caller's job. The handle built on top pairs every
/// `share` with a later `release` and destroys the buffer when the last
/// release says so.
pub(crate) struct RawBuf<C> {
    /// Points `offset()` bytes into the allocation, at the first content
    /// byte. The header lives at the allocation's start.
    ptr: NonNull<u8>,
    /// A buffer owns its header (including the count) and its bytes.
    phantom: PhantomData<Header<C>>,
}

impl<C: ShareCount> RawBuf<C> {
    /// Allocate a fresh buffer with room for at least `required` bytes,
    /// rounded up to the capacity granularity. The new buffer is empty and
    /// has a single owner.
    pub(crate) fn with_capacity(required: usize) -> Self {
        let capacity = round_capacity(required);
        let layout = Self::layout(capacity);
        unsafe {
            // Safety: the layout has non-zero size because `capacity` is at
            // least `BASE_CAPACITY`.
            let allocation = alloc::alloc::alloc(layout);
            if allocation.is_null() {
                alloc::alloc::handle_alloc_error(layout);
            }

            // Safety: the allocation has room for the header per `size` and
            // is suitably aligned for it per `align`.
            ptr::write(
                allocation.cast::<Header<C>>(),
                Header { state: C::one(), capacity, len: 0 },
            );

            // Safety: `allocation` is non-null, so the offset pointer is too.
            Self {
                ptr: NonNull::new_unchecked(allocation.add(Self::offset())),
                phantom: PhantomData,
            }
        }
    }

    /// Allocate a fresh buffer holding a copy of the given bytes.
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len());
        buf.copy_in(bytes, 0);
        buf
    }

    /// Allocate a fresh, singly owned copy of this buffer's content with room
    /// for at least `min_capacity` bytes. Capacity never shrinks: the copy is
    /// at least as roomy as the original.
    pub(crate) fn duplicate(&self, min_capacity: usize) -> Self {
        let mut fresh = Self::with_capacity(min_capacity.max(self.capacity()));
        fresh.copy_in(self.as_slice(), 0);
        fresh
    }

    /// Grow the allocation in place so it has room for at least `required`
    /// bytes. Neither the content nor the sharing state changes.
    ///
    /// Grows by half the current capacity at a time so that repeated appends
    /// stay cheap, but at least to `required`.
    pub(crate) fn reserve(&mut self, required: usize) {
        debug_assert!(self.is_unique());

        let capacity = self.capacity();
        if required <= capacity {
            return;
        }

        // No overflow: `capacity` stays below `isize::MAX`.
        let target = round_capacity(required.max(capacity + capacity / 2));
        unsafe {
            // Safety:
            // - The existing allocation was made with `layout(capacity)`.
            // - The new size is non-zero and, rounded up to the alignment,
            //   stays within the allocation size limit per `size`.
            // - The header, including a count with state of its own (loom's
            //   atomics), is moved bytewise, which is a plain Rust move.
            let allocation = alloc::alloc::realloc(
                self.allocation_mut(),
                Self::layout(capacity),
                Self::size(target),
            );
            if allocation.is_null() {
                alloc::alloc::handle_alloc_error(Self::layout(target));
            }

            // Safety: `allocation` is non-null, so the offset pointer is too.
            self.ptr = NonNull::new_unchecked(allocation.add(Self::offset()));

            // Safety: we are the sole owner.
            self.header_mut().capacity = target;
        }
    }

    /// Copy the given bytes into the buffer, starting at position `at`.
    ///
    /// May only be called by a sole owner, with `at` at most the current
    /// length (so no gap of uninitialized bytes can form) and the end of the
    /// copy within capacity. Existing content in the way is overwritten, and
    /// the length grows to cover the copy if it reached past the old end.
    pub(crate) fn copy_in(&mut self, bytes: &[u8], at: usize) {
        debug_assert!(self.is_unique());
        debug_assert!(at <= self.len());
        debug_assert!(at + bytes.len() <= self.capacity());

        unsafe {
            // Safety:
            // - The destination is in bounds and valid for `bytes.len()`
            //   writes: `at + bytes.len() <= capacity`.
            // - Source and destination cannot overlap: the buffer is uniquely
            //   owned and mutably borrowed here, so no live slice of it can
            //   reach us as `bytes`.
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_mut().add(at), bytes.len());

            // Safety: we are the sole owner.
            let header = self.header_mut();
            header.len = header.len.max(at + bytes.len());
        }
    }

    /// Register another owner of this buffer.
    ///
    /// Returns the aliasing buffer and whether the count overflowed. After an
    /// overflow the caller must release the alias again and abort.
    pub(crate) fn share(&self) -> (Self, bool) {
        debug_assert!(!self.is_unshareable());
        let overflow = self.header().state.incr();
        (Self { ptr: self.ptr, phantom: PhantomData }, overflow)
    }

    /// Drop one owner. Returns true if the caller was the last one and must
    /// call [`dealloc`](Self::dealloc).
    pub(crate) fn release(&self) -> bool {
        self.header().state.decr()
    }

    /// Whether exactly one handle owns this buffer.
    pub(crate) fn is_unique(&self) -> bool {
        self.header().state.is_unique()
    }

    /// Whether this buffer is excluded from sharing.
    pub(crate) fn is_unshareable(&self) -> bool {
        self.header().state.is_unshareable()
    }

    /// Exclude this buffer from sharing. May only be called by a sole owner.
    pub(crate) fn mark_unshareable(&self) {
        self.header().state.mark_unshareable();
    }

    /// Allow sharing this buffer again. May only be called by a sole owner.
    pub(crate) fn reset_shareable(&self) {
        self.header().state.reset_shareable();
    }

    /// The number of content bytes.
    pub(crate) fn len(&self) -> usize {
        self.header().len
    }

    /// The number of bytes the allocation has room for.
    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// The content as a slice.
    pub(crate) fn as_slice(&self) -> &[u8] {
        // Safety:
        // - The data pointer is non-null, aligned, and valid for `len` reads.
        // - `len <= capacity` and the whole allocation fits the size limit.
        // - The bytes stay untouched for the borrow's lifetime: a write needs
        //   sole ownership plus a mutable borrow of the owning handle. This
        //   borrow blocks the handle behind it, and any other handle sees a
        //   count above one and copies instead of writing in place.
        unsafe { slice::from_raw_parts(self.data(), self.len()) }
    }

    /// The raw pointer to the first content byte.
    pub(crate) fn data(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The raw mutable pointer to the first content byte.
    ///
    /// May only be called by a sole owner.
    pub(crate) unsafe fn data_mut(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Release the backing allocation.
    ///
    /// May only be called by the buffer's last owner, exactly once; the
    /// buffer must not be used afterwards.
    pub(crate) unsafe fn dealloc(&mut self) {
        let layout = Self::layout(self.capacity());
        let allocation = self.allocation_mut();
        // Safety: the count can carry state of its own (loom's atomics do),
        // so it is dropped in place before the allocation goes away.
        ptr::drop_in_place(ptr::addr_of_mut!((*allocation.cast::<Header<C>>()).state));
        // Safety: the allocation was made with this exact layout.
        alloc::alloc::dealloc(allocation, layout);
    }

    /// The buffer's header.
    fn header(&self) -> &Header<C> {
        // Safety: a buffer always has an allocation with a live header at its
        // start, and the header is only dropped together with the buffer.
        unsafe { &*self.allocation().cast::<Header<C>>() }
    }

    /// The buffer's header, mutably.
    ///
    /// May only be called by a sole owner. The count in a shared header may
    /// only be touched through `header` and interior mutability.
    unsafe fn header_mut(&mut self) -> &mut Header<C> {
        // Safety: see `header`; exclusivity is the caller's contract.
        &mut *self.allocation_mut().cast::<Header<C>>()
    }

    /// The raw pointer to the start of the allocation.
    fn allocation(&self) -> *const u8 {
        // Safety: the data pointer always sits `offset()` bytes into the
        // allocation.
        unsafe { self.ptr.as_ptr().sub(Self::offset()) }
    }

    /// The raw mutable pointer to the start of the allocation.
    fn allocation_mut(&mut self) -> *mut u8 {
        // Safety: see `allocation`.
        unsafe { self.ptr.as_ptr().sub(Self::offset()) }
    }

    /// The alignment of the allocation. The content is plain bytes, so the
    /// header dictates it.
    const fn align() -> usize {
        mem::align_of::<Header<C>>()
    }

    /// The offset of the content within the allocation. A struct's size is a
    /// multiple of its alignment, so the first byte after the header is
    /// already suitably placed for content.
    const fn offset() -> usize {
        mem::size_of::<Header<C>>()
    }

    /// The allocation size for the given capacity. Aborts if it would
    /// overflow the limit allocations must stay under.
    fn size(capacity: usize) -> usize {
        Self::offset()
            .checked_add(capacity)
            .filter(|&size| size < isize::MAX as usize - Self::align())
            .unwrap_or_else(|| capacity_overflow())
    }

    /// The layout of the allocation for the given capacity.
    fn layout(capacity: usize) -> Layout {
        // Safety: `align` is a power of two and `size` respects the size
        // limit, including the rounding slack.
        unsafe { Layout::from_size_align_unchecked(Self::size(capacity), Self::align()) }
    }
}

/// Round a required capacity up to the granularity buffers are allocated in.
fn round_capacity(required: usize) -> usize {
    // `BASE_CAPACITY` is a power of two, so rounding is a mask away.
    required
        .max(BASE_CAPACITY)
        .checked_add(BASE_CAPACITY - 1)
        .map(|padded| padded & !(BASE_CAPACITY - 1))
        .unwrap_or_else(|| capacity_overflow())
}

#[cold]
pub(crate) fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}
