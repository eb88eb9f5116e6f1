//! A blocking hand-off queue for moving values between threads.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Condvar, Mutex};

/// An unbounded first-in, first-out queue whose consumers block while it is
/// empty.
///
/// Producers never block. The queue pairs well with [`ArcBytes`]: cloned
/// handles can be pushed from producing threads and popped by consumers
/// without ever copying the bytes.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use cowbytes::{ArcBytes, BlockingQueue};
///
/// let queue = Arc::new(BlockingQueue::new());
/// let producer = Arc::clone(&queue);
/// thread::spawn(move || {
///     producer.push(ArcBytes::from(b"job"));
/// });
///
/// // Blocks until the producer has pushed.
/// assert_eq!(queue.pop(), b"job");
/// ```
///
/// [`ArcBytes`]: crate::ArcBytes
pub struct BlockingQueue<T> {
    buffer: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Create a new, empty queue.
    pub const fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Add a value at the back of the queue and wake one blocked consumer.
    pub fn push(&self, value: T) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_back(value);
        }
        // Signal outside the critical section, so the woken consumer finds
        // the lock free.
        self.not_empty.notify_one();
    }

    /// Remove and return the value at the front of the queue, blocking while
    /// the queue is empty.
    pub fn pop(&self) -> T {
        let mut buffer = self.buffer.lock().unwrap();
        loop {
            // Re-check after every wakeup; condvars may wake spuriously and
            // another consumer may have raced us to the value.
            match buffer.pop_front() {
                Some(value) => return value,
                None => buffer = self.not_empty.wait(buffer).unwrap(),
            }
        }
    }

    /// The number of queued values.
    ///
    /// A momentary snapshot: other threads may push or pop immediately after
    /// it was taken.
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Whether the queue holds no values. A momentary snapshot, like
    /// [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue").field("len", &self.len()).finish()
    }
}
