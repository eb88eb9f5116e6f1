/*!
Reference-counted, clone-on-write byte strings.

## Types
- An [`RcBytes`] is a byte string for one thread. Cloning a handle shares a
  single heap buffer, and the buffer is only really copied when a shared
  handle is mutated.

- An [`ArcBytes`] is the same byte string with an atomic reference count, so
  its handles can be cloned and dropped from any thread. It is [`Send`] and
  [`Sync`].

- Both are aliases of [`CowBytes`], which is generic over its [`ShareCount`].

- A [`BlockingQueue`] is a minimal locking FIFO for handing values, such as
  `ArcBytes` handles, from producing threads to consuming ones (`std` only).

## Example
```
use cowbytes::RcBytes;

let first = RcBytes::from(b"shared");

// This does not allocate: all three handles use one buffer.
let second = first.clone();
let mut third = second.clone();

// This allocates once, to mutate `third` without affecting the others.
third.extend_from_slice(b" no more");
assert_eq!(first, b"shared");
assert_eq!(third, b"shared no more");
```

## Sharing and mutation
Every handle owns exactly one buffer, and every buffer stores its own sharing
state inline, in front of the bytes. Cloning bumps the count; mutating first
ensures the buffer has no other owner, copying the bytes when it does. Handing
out a raw mutable view ([`CowBytes::get_mut`], [`CowBytes::make_mut`])
additionally withdraws the buffer from sharing until the next append, because
the view may outlive the bookkeeping's knowledge of it.

## Why should I use this instead of ...

| Type                 | Details |
|:---------------------|:--------|
| [`Vec<u8>`][vec]     | Great for building bytes, but three words wide and expensive to clone. A [`CowBytes`] handle is one word, and cloning just bumps a count. |
| [`Arc<Vec<u8>>`][arc] | Two allocations instead of one, and mutation needs an explicit unwrap-or-copy dance. |
| [`Arc<[u8]>`][arc]   | One allocation, but immutable and not growable. |

## Thread safety
[`ArcBytes`] guarantees the bookkeeping, not the bytes: handles may be cloned
and dropped concurrently, and the last one to let go frees the buffer exactly
once. Writing still takes `&mut` access to a handle, and a writer that is not
the sole owner of its buffer copies the bytes first, so no lock is ever taken
and no two threads ever write to the same buffer.

## Crate features
- `std` (default): [`BlockingQueue`] and the `std::io::Write` integrations.
  Disable for `no_std` use; the byte strings only need `alloc`.
- `serde`: serialization and deserialization of byte strings as sequences.

[arc]: alloc::sync::Arc
[vec]: alloc::vec::Vec
*/

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod buf;
mod bytes;
#[cfg(feature = "std")]
mod queue;
mod share;
mod sync;

pub use self::bytes::*;
#[cfg(feature = "std")]
pub use self::queue::*;
pub use self::share::*;


// Run doctests on the README too
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;
