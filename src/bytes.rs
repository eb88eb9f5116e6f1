//! Clone-on-write byte string handles.

use core::borrow::Borrow;
use core::cell::Cell;
use core::cmp::Ordering;
use core::fmt::{self, Debug, Formatter};
use core::hash::{Hash, Hasher};
use core::mem;
use core::ops::Deref;
use core::slice;

use alloc::vec::Vec;

use crate::buf::{capacity_overflow, RawBuf};
use crate::share::{AtomicShareCount, ShareCount, ShareState};
use crate::sync::atomic::AtomicUsize;

/// A reference-counted, clone-on-write string of bytes.
///
/// Cloning is cheap: both handles share a single buffer until one of them
/// writes. A handle is one machine word, and `Option<CowBytes<_>>` is the
/// same size.
///
/// The type parameter decides how the buffer's sharing state is kept:
/// [`RcBytes`] uses a plain cell and stays on one thread, while [`ArcBytes`]
/// uses an atomic count and may cross threads.
///
/// # Example
/// ```
/// use cowbytes::RcBytes;
///
/// let mut first = RcBytes::from(b"copy");
/// // Cheap: `second` references the same buffer.
/// let second = first.clone();
///
/// // Copies the bytes before writing, so `second` keeps its view.
/// first.extend_from_slice(b" on write");
/// assert_eq!(first, b"copy on write");
/// assert_eq!(second, b"copy");
/// ```
pub struct CowBytes<C: ShareCount> {
    buf: RawBuf<C>,
}

/// A byte string for single-threaded sharing.
///
/// The count behind it is a plain cell, so handles stay on one thread:
///
/// ```compile_fail
/// fn sendable<T: Send>(_: T) {}
/// sendable(cowbytes::RcBytes::new()); // `RcBytes` is not `Send`
/// ```
pub type RcBytes = CowBytes<Cell<ShareState>>;

/// A byte string whose handles may be cloned and dropped from any thread.
///
/// The reference count is atomic, so concurrent handle bookkeeping can
/// neither corrupt the count nor free a buffer twice, too early, or not at
/// all. The bytes themselves are not locked: writing requires `&mut` access
/// to a handle, and a handle that is not the sole owner of its buffer copies
/// the bytes before writing, so two threads never write to the same buffer.
pub type ArcBytes = CowBytes<AtomicUsize>;

impl<C: ShareCount> CowBytes<C> {
    /// Create a new, empty byte string.
    ///
    /// A handle always owns a buffer, so this makes a small base allocation.
    pub fn new() -> Self {
        Self { buf: RawBuf::with_capacity(0) }
    }

    /// Create a new, empty byte string with room for at least `capacity`
    /// bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: RawBuf::with_capacity(capacity) }
    }

    /// The number of content bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether there are no content bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many content bytes the buffer has room for without growing.
    ///
    /// A shared buffer is copied before any write, so an append may still
    /// allocate while `len` is below `capacity`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// The content as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Whether this handle is its buffer's only owner.
    ///
    /// Takes a mutable reference because only a caller with exclusive access
    /// can make use of the answer: through a shared reference, another clone
    /// of this handle could be made on a different thread right after the
    /// count was read, invalidating a `true` before it could be acted upon.
    /// A `false` can turn stale in any case, as soon as other threads drop
    /// their handles.
    #[inline]
    pub fn is_unique(&mut self) -> bool {
        self.buf.is_unique()
    }

    /// Ensure sole ownership of the buffer, with room for `additional` more
    /// content bytes.
    ///
    /// Copies the content into a fresh buffer if it was shared. A buffer
    /// that had been withdrawn from sharing by a mutable view becomes
    /// shareable again.
    pub fn reserve(&mut self, additional: usize) {
        let required = self
            .len()
            .checked_add(additional)
            .unwrap_or_else(|| capacity_overflow());
        self.prepare_to_modify(required, false);
    }

    /// Append a single byte at the end.
    pub fn push(&mut self, byte: u8) {
        let required = self
            .len()
            .checked_add(1)
            .unwrap_or_else(|| capacity_overflow());
        self.prepare_to_modify(required, false);
        let end = self.len();
        self.buf.copy_in(&[byte], end);
    }

    /// Append the given bytes at the end.
    ///
    /// Ensures sole ownership first: if the buffer was shared, its content
    /// is copied into a fresh buffer and the other handles keep the old one.
    /// Afterwards the buffer is shareable again, even if a mutable view had
    /// previously withdrawn it from sharing.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let required = self
            .len()
            .checked_add(bytes.len())
            .unwrap_or_else(|| capacity_overflow());
        self.prepare_to_modify(required, false);
        let end = self.len();
        self.buf.copy_in(bytes, end);
    }

    /// A mutable reference to the byte at `index`, or `None` if the index is
    /// out of bounds.
    ///
    /// Ensures sole ownership first, copying the content if the buffer was
    /// shared. Because the reference points straight into the buffer, the
    /// buffer is also withdrawn from sharing: until the next append, clones
    /// of this handle copy the bytes instead of sharing them, even if
    /// nothing is ever written through the reference.
    ///
    /// An out-of-bounds index leaves the sharing state untouched.
    ///
    /// ```
    /// use cowbytes::RcBytes;
    ///
    /// let mut bytes = RcBytes::from(b"cow");
    /// *bytes.get_mut(0).unwrap() = b'n';
    /// let copy = bytes.clone(); // copies instead of sharing
    /// assert_eq!(bytes, b"now");
    /// assert_eq!(copy, b"now");
    /// ```
    pub fn get_mut(&mut self, index: usize) -> Option<&mut u8> {
        if index >= self.len() {
            return None;
        }
        self.prepare_to_modify(self.len(), true);
        unsafe {
            // Safety: sole ownership was just ensured and `index < len`.
            Some(&mut *self.buf.data_mut().add(index))
        }
    }

    /// A mutable view of all content bytes.
    ///
    /// Ensures sole ownership first, copying the content if the buffer was
    /// shared, and withdraws the buffer from sharing just like
    /// [`get_mut`](Self::get_mut) does.
    pub fn make_mut(&mut self) -> &mut [u8] {
        self.prepare_to_modify(self.len(), true);
        unsafe {
            // Safety: sole ownership was just ensured, and the pointer is
            // valid for `len` reads and writes.
            slice::from_raw_parts_mut(self.buf.data_mut(), self.buf.len())
        }
    }

    /// Write the content to the given output.
    ///
    /// An empty byte string writes nothing.
    #[cfg(feature = "std")]
    pub fn write_to<W: std::io::Write>(&self, output: &mut W) -> std::io::Result<()> {
        if !self.is_empty() {
            output.write_all(self.as_slice())?;
        }
        Ok(())
    }

    /// Make the buffer safe to mutate: sole ownership plus room for
    /// `required` content bytes.
    ///
    /// A shared buffer is traded for a private copy; a buffer this handle
    /// already owns alone grows in place when needed. Afterwards the buffer
    /// is either withdrawn from sharing (a raw view into it is about to
    /// escape) or put back into the ordinary shareable state.
    fn prepare_to_modify(&mut self, required: usize, withdraw: bool) {
        if !self.buf.is_unique() {
            let fresh = self.buf.duplicate(required);
            let mut old = mem::replace(&mut self.buf, fresh);
            // Another handle may have been dropped since the uniqueness
            // check, leaving us the old buffer's last owner after all.
            if old.release() {
                unsafe {
                    // Safety: the release said we were the last owner.
                    old.dealloc();
                }
            }
        } else {
            self.buf.reserve(required);
        }

        if withdraw {
            self.buf.mark_unshareable();
        } else {
            self.buf.reset_shareable();
        }
    }
}

impl<C: ShareCount> Clone for CowBytes<C> {
    fn clone(&self) -> Self {
        if self.buf.is_unshareable() {
            // A buffer with a possibly escaped mutable view is never shared;
            // the clone gets a private copy of the bytes.
            return Self { buf: self.buf.duplicate(self.len()) };
        }

        let (shared, overflow) = self.buf.share();
        let copy = Self { buf: shared };
        if overflow {
            // See Arc's clone impl: letting the count wrap around would
            // enable a use-after-free.
            ref_count_overflow(copy);
        }
        copy
    }
}

impl<C: ShareCount> Drop for CowBytes<C> {
    fn drop(&mut self) {
        // Whichever release observes the last-owner signal deallocates; the
        // state machine fires it exactly once per buffer.
        if self.buf.release() {
            unsafe {
                // Safety: the release said we were the last owner.
                self.buf.dealloc();
            }
        }
    }
}

// Safety: works like `Arc`. Handles only touch the buffer's bookkeeping from
// multiple threads, and a count marked by `AtomicShareCount` keeps that
// bookkeeping coherent. The bytes themselves are only written by a sole
// owner holding `&mut` access to its handle.
unsafe impl<C: AtomicShareCount> Send for CowBytes<C> {}

// Safety: see the impl of `Send` above.
unsafe impl<C: AtomicShareCount> Sync for CowBytes<C> {}

impl<C: ShareCount> Deref for CowBytes<C> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl<C: ShareCount> Borrow<[u8]> for CowBytes<C> {
    #[inline]
    fn borrow(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<C: ShareCount> AsRef<[u8]> for CowBytes<C> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<C: ShareCount> Default for CowBytes<C> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ShareCount> Debug for CowBytes<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "b\"{}\"", self.as_slice().escape_ascii())
    }
}

impl<C: ShareCount> Hash for CowBytes<C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl<C: ShareCount> Eq for CowBytes<C> {}

impl<C: ShareCount, D: ShareCount> PartialEq<CowBytes<D>> for CowBytes<C> {
    fn eq(&self, other: &CowBytes<D>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<C: ShareCount> PartialEq<[u8]> for CowBytes<C> {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl<C: ShareCount> PartialEq<&[u8]> for CowBytes<C> {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_slice() == *other
    }
}

impl<C: ShareCount, const N: usize> PartialEq<[u8; N]> for CowBytes<C> {
    fn eq(&self, other: &[u8; N]) -> bool {
        self.as_slice() == other
    }
}

impl<C: ShareCount, const N: usize> PartialEq<&[u8; N]> for CowBytes<C> {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.as_slice() == *other
    }
}

impl<C: ShareCount> PartialEq<Vec<u8>> for CowBytes<C> {
    fn eq(&self, other: &Vec<u8>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<C: ShareCount> PartialEq<str> for CowBytes<C> {
    fn eq(&self, other: &str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}

impl<C: ShareCount> PartialEq<&str> for CowBytes<C> {
    fn eq(&self, other: &&str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}

impl<C: ShareCount> PartialEq<CowBytes<C>> for [u8] {
    fn eq(&self, other: &CowBytes<C>) -> bool {
        self == other.as_slice()
    }
}

impl<C: ShareCount, const N: usize> PartialEq<CowBytes<C>> for [u8; N] {
    fn eq(&self, other: &CowBytes<C>) -> bool {
        self == other.as_slice()
    }
}

impl<C: ShareCount> PartialEq<CowBytes<C>> for Vec<u8> {
    fn eq(&self, other: &CowBytes<C>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<C: ShareCount> PartialEq<CowBytes<C>> for str {
    fn eq(&self, other: &CowBytes<C>) -> bool {
        self.as_bytes() == other.as_slice()
    }
}

impl<C: ShareCount> PartialEq<CowBytes<C>> for &str {
    fn eq(&self, other: &CowBytes<C>) -> bool {
        self.as_bytes() == other.as_slice()
    }
}

impl<C: ShareCount> Ord for CowBytes<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl<C: ShareCount> PartialOrd for CowBytes<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: ShareCount> From<&[u8]> for CowBytes<C> {
    fn from(bytes: &[u8]) -> Self {
        Self { buf: RawBuf::from_slice(bytes) }
    }
}

impl<C: ShareCount> From<&str> for CowBytes<C> {
    fn from(string: &str) -> Self {
        Self { buf: RawBuf::from_slice(string.as_bytes()) }
    }
}

impl<C: ShareCount, const N: usize> From<[u8; N]> for CowBytes<C> {
    fn from(bytes: [u8; N]) -> Self {
        Self::from(bytes.as_slice())
    }
}

impl<C: ShareCount, const N: usize> From<&[u8; N]> for CowBytes<C> {
    fn from(bytes: &[u8; N]) -> Self {
        Self::from(bytes.as_slice())
    }
}

impl<C: ShareCount> From<Vec<u8>> for CowBytes<C> {
    /// This needs to copy, as the layouts differ: a buffer keeps its
    /// bookkeeping inline, in front of the bytes.
    fn from(vec: Vec<u8>) -> Self {
        Self::from(vec.as_slice())
    }
}

impl<C: ShareCount> From<CowBytes<C>> for Vec<u8> {
    /// This needs to copy, as the layouts differ.
    fn from(bytes: CowBytes<C>) -> Self {
        bytes.as_slice().to_vec()
    }
}

impl<C: ShareCount> FromIterator<u8> for CowBytes<C> {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let capacity = iter.size_hint().0;
        let mut bytes = Self::with_capacity(capacity);
        bytes.extend(iter);
        bytes
    }
}

impl<C: ShareCount> Extend<u8> for CowBytes<C> {
    fn extend<I: IntoIterator<Item = u8>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        // An untrusted hint: reserve what it promises, but never rely on it.
        let hint = iter.size_hint().0;
        if hint > 0 {
            self.reserve(hint);
        }
        for byte in iter {
            self.push(byte);
        }
    }
}

impl<'a, C: ShareCount> IntoIterator for &'a CowBytes<C> {
    type Item = &'a u8;
    type IntoIter = slice::Iter<'a, u8>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

#[cfg(feature = "std")]
impl<C: ShareCount> std::io::Write for CowBytes<C> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cold]
fn ref_count_overflow<C: ShareCount>(copy: CowBytes<C>) -> ! {
    // Dropping the copy undoes the increment that overflowed.
    drop(copy);
    panic!("reference count overflow");
}

#[cfg(feature = "serde")]
mod serde {
    use core::fmt::{self, Formatter};
    use core::marker::PhantomData;

    use ::serde::de::{Deserialize, Deserializer, SeqAccess, Visitor};
    use ::serde::ser::{Serialize, Serializer};

    use super::CowBytes;
    use crate::share::ShareCount;

    impl<C: ShareCount> Serialize for CowBytes<C> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            self.as_slice().serialize(serializer)
        }
    }

    impl<'de, C: ShareCount> Deserialize<'de> for CowBytes<C> {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_seq(BytesVisitor(PhantomData))
        }
    }

    struct BytesVisitor<C>(PhantomData<C>);

    impl<'de, C: ShareCount> Visitor<'de> for BytesVisitor<C> {
        type Value = CowBytes<C>;

        fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
            formatter.write_str("a byte sequence")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut bytes = CowBytes::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}
