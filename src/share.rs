//! Sharing states and reference counts for clone-on-write buffers.

use core::cell::Cell;
use core::num::NonZeroUsize;

use crate::sync::atomic::{self, AtomicUsize, Ordering::*};

/// The sharing state of a buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShareState {
    /// The buffer is owned by this many handles and may gain more.
    Shared(NonZeroUsize),
    /// The buffer is owned by exactly one handle and must never be shared
    /// again, because a raw mutable view into its bytes may still be live.
    Unshareable,
}

/// A buffer's reference count together with the unshareable mark.
///
/// Two implementations exist: `Cell<ShareState>` keeps the state as a plain
/// tagged value and is the count behind [`RcBytes`](crate::RcBytes), while
/// `AtomicUsize` encodes the mark as a reserved count value and backs
/// [`ArcBytes`](crate::ArcBytes).
///
/// # Safety
/// The handle allocates and frees its buffer based on the answers given here,
/// so implementations must run the state machine exactly: [`one`](Self::one)
/// starts at a count of one, [`incr`](Self::incr) and [`decr`](Self::decr)
/// never lose an update, and `decr` reports the release of a buffer's last
/// owner exactly once.
pub unsafe trait ShareCount {
    /// The state of a freshly allocated buffer: shared, count one.
    fn one() -> Self;

    /// Whether exactly one handle owns the buffer.
    ///
    /// True for a count of one and for the unshareable mark. This is the gate
    /// every mutation checks before writing.
    fn is_unique(&self) -> bool;

    /// Whether the buffer carries the unshareable mark.
    ///
    /// The gate a clone checks before sharing.
    fn is_unshareable(&self) -> bool;

    /// Register one more owner.
    ///
    /// Returns true if the count overflowed; the caller must then back out of
    /// the share. Must not be called while the unshareable mark is set.
    fn incr(&self) -> bool;

    /// Drop one owner.
    ///
    /// Returns true if the caller was the last owner and must destroy the
    /// buffer. Releasing an unshareable buffer always signals destruction,
    /// since such a buffer has exactly one owner.
    fn decr(&self) -> bool;

    /// Exclude the buffer from all future sharing.
    ///
    /// May only be called by a sole owner.
    fn mark_unshareable(&self);

    /// Put the buffer back into the ordinary shareable state.
    ///
    /// May only be called by a sole owner.
    fn reset_shareable(&self);
}

/// Marker for share counts that tolerate updates from several threads at
/// once. Gates [`Send`] and [`Sync`] for the handles.
///
/// # Safety
/// Every [`ShareCount`] method must be atomic, with memory orderings at least
/// as strong as `Arc`'s reference count updates.
pub unsafe trait AtomicShareCount: ShareCount {}

// Safety: the count is a plain tagged value, so the state machine runs
// exactly as written. No atomicity is claimed; the handle types built on this
// count are neither `Send` nor `Sync`.
unsafe impl ShareCount for Cell<ShareState> {
    fn one() -> Self {
        Cell::new(ShareState::Shared(NonZeroUsize::MIN))
    }

    fn is_unique(&self) -> bool {
        match self.get() {
            ShareState::Shared(count) => count.get() == 1,
            ShareState::Unshareable => true,
        }
    }

    fn is_unshareable(&self) -> bool {
        self.get() == ShareState::Unshareable
    }

    fn incr(&self) -> bool {
        let ShareState::Shared(count) = self.get() else {
            debug_assert!(false, "shared an unshareable buffer");
            return false;
        };
        self.set(ShareState::Shared(count.saturating_add(1)));
        count.get() > isize::MAX as usize
    }

    fn decr(&self) -> bool {
        match self.get() {
            ShareState::Shared(count) => match NonZeroUsize::new(count.get() - 1) {
                Some(remaining) => {
                    self.set(ShareState::Shared(remaining));
                    false
                }
                // The count cannot represent zero; the buffer is destroyed
                // instead of being counted down to it.
                None => true,
            },
            ShareState::Unshareable => true,
        }
    }

    fn mark_unshareable(&self) {
        debug_assert!(self.is_unique());
        self.set(ShareState::Unshareable);
    }

    fn reset_shareable(&self) {
        debug_assert!(self.is_unique());
        self.set(ShareState::Shared(NonZeroUsize::MIN));
    }
}

/// The reserved count value that encodes [`ShareState::Unshareable`] in an
/// atomic count. Unreachable by counting: increments abort far earlier, once
/// the count passes `isize::MAX`.
const UNSHAREABLE: usize = usize::MAX;

// Safety: increments and decrements are single atomic read-modify-write
// operations with Arc's orderings, so no update is lost and the last-owner
// signal fires exactly once. The unshareable mark is only ever stored by a
// sole owner and only cleared by a sole owner, and `decr` refuses to
// decrement it, so no ordinary count update can corrupt it.
unsafe impl ShareCount for AtomicUsize {
    fn one() -> Self {
        AtomicUsize::new(1)
    }

    fn is_unique(&self) -> bool {
        // See Arc's is_unique() method.
        let refs = self.load(Acquire);
        refs == 1 || refs == UNSHAREABLE
    }

    fn is_unshareable(&self) -> bool {
        self.load(Acquire) == UNSHAREABLE
    }

    fn incr(&self) -> bool {
        debug_assert!(!self.is_unshareable(), "shared an unshareable buffer");
        // See Arc's clone impl for details about memory ordering.
        let prev = self.fetch_add(1, Relaxed);
        prev > isize::MAX as usize
    }

    fn decr(&self) -> bool {
        // An unshareable buffer has exactly one owner, so its release is
        // always the final one. Decrementing would corrupt the mark.
        if self.is_unshareable() {
            return true;
        }

        // The caller was the last owner exactly when the count it decremented
        // was one. See Arc's drop impl for details about memory ordering.
        if self.fetch_sub(1, Release) == 1 {
            // See Arc's drop impl for details.
            atomic::fence(Acquire);
            true
        } else {
            false
        }
    }

    fn mark_unshareable(&self) {
        debug_assert!(self.is_unique());
        // The sole owner publishes the mark; uniqueness checks on other
        // threads read it with `Acquire`.
        self.store(UNSHAREABLE, Release);
    }

    fn reset_shareable(&self) {
        debug_assert!(self.is_unique());
        self.store(1, Release);
    }
}

// Safety: all operations above are atomic and follow Arc's orderings.
unsafe impl AtomicShareCount for AtomicUsize {}
