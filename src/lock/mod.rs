//! The lock module.
//!
//! The host runtime supplies plain mutexes and condition variables; the file
//! system needs two primitives the host does not provide. [`Rwlock`] is a
//! sleeping reader/writer lock with the extra operations the buffer cache
//! depends on: a non-blocking write attempt for the clock sweep, atomic
//! demotion of a write pin to a read pin after an eviction swap, and
//! promotion in the release-reacquire style (the caller re-verifies state
//! after the gap). [`Semaphore`] is a counting semaphore used by the
//! prefetch worker and as the raw building block of locks that are acquired
//! and released on different code paths.

mod rwlock;
mod semaphore;

pub use rwlock::Rwlock;
pub use semaphore::Semaphore;
