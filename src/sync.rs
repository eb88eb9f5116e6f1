/// Loom can only model atomics that go through its own types, so the crate
/// imports the atomic module through this alias.
pub mod atomic {
    #[cfg(not(loom))]
    pub use core::sync::atomic::*;

    #[cfg(loom)]
    pub use loom::sync::atomic::*;
}
