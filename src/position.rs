//! Packed position words with futex-style wait/notify.
//!
//! Each side of the channel publishes its progress through one 32-bit
//! position word:
//!
//! ```text
//! bit 31       bit 30       bits 0..30
//! ┌──────────┬────────────┬──────────────────────────┐
//! │ drop flag│ revolution │ slot index, [0, capacity)│
//! └──────────┴────────────┴──────────────────────────┘
//! ```
//!
//! - The *revolution* flag flips each time the index wraps past the buffer
//!   capacity. It disambiguates "empty" from "full" when both masked indices
//!   are numerically equal.
//! - The *drop* flag is set once, permanently, when the owning side detaches.
//!
//! The protocol in [`crate::ring`] compares two position words by XOR over
//! the packed value, so the flag layout is load-bearing: all three cases
//! (equal, one revolution apart, peer dropped) fall out of a single XOR.
//!
//! # Blocking
//!
//! [`PositionWord::wait`] suspends the calling thread until the stored value
//! differs from `expected`, and [`PositionWord::notify_one`] wakes one such
//! waiter. On Linux this maps directly onto `FUTEX_WAIT_PRIVATE` /
//! `FUTEX_WAKE_PRIVATE` via `rustix` — the word is exactly the 32-bit futex
//! size, so no indirection is needed. Other targets fall back to a
//! mutex/condvar pair with identical semantics (but without the lock-free
//! guarantee, which only the hot path needs anyway).

use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(target_os = "linux"))]
use std::sync::{Condvar, Mutex, PoisonError};

/// Mask extracting the slot index from a packed position word.
pub(crate) const POSITION_MASK: u32 = u32::MAX >> 2;

/// Flipped each time a position wraps past the buffer capacity.
pub(crate) const REVOLUTION_FLAG: u32 = 1 << 30;

/// Set once when the owning side detaches.
pub(crate) const DROP_FLAG: u32 = 1 << 31;

// The futex path waits on the atomic directly, which requires the exact
// 32-bit futex word size.
const _: () = assert!(size_of::<AtomicU32>() == 4);

/// A 32-bit atomic position word with wait-until-changed / wake-one support.
///
/// Written only by its owning side, read by the peer. See the module docs
/// for the bit layout.
pub(crate) struct PositionWord {
    value: AtomicU32,

    #[cfg(not(target_os = "linux"))]
    lock: Mutex<()>,

    #[cfg(not(target_os = "linux"))]
    waiters: Condvar,
}

impl PositionWord {
    pub(crate) const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),

            #[cfg(not(target_os = "linux"))]
            lock: Mutex::new(()),

            #[cfg(not(target_os = "linux"))]
            waiters: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> u32 {
        self.value.load(order)
    }

    #[cfg(target_os = "linux")]
    #[inline]
    pub(crate) fn store(&self, value: u32, order: Ordering) {
        self.value.store(value, order);
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn store(&self, value: u32, order: Ordering) {
        // The store must not land between wait() reading the value and the
        // waiter going to sleep, hence the lock.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.value.store(value, order);
    }

    /// Atomically ORs `bits` into the word, returning the previous value.
    #[cfg(target_os = "linux")]
    #[inline]
    pub(crate) fn fetch_or(&self, bits: u32, order: Ordering) -> u32 {
        self.value.fetch_or(bits, order)
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn fetch_or(&self, bits: u32, order: Ordering) -> u32 {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.value.fetch_or(bits, order)
    }

    /// Blocks until the stored value differs from `expected`.
    ///
    /// Returns immediately if the value already differs. May also return
    /// spuriously; callers re-read the position and loop.
    #[cfg(target_os = "linux")]
    pub(crate) fn wait(&self, expected: u32) {
        use rustix::thread::futex;

        // All failure modes are benign: EAGAIN means the value already
        // changed, EINTR means a signal arrived. The caller re-reads the
        // position in every case.
        let _ = futex::wait(&self.value, futex::Flags::PRIVATE, expected, None);
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn wait(&self, expected: u32) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.value.load(Ordering::Relaxed) == expected {
            guard = self
                .waiters
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes at least one thread blocked in [`PositionWord::wait`].
    #[cfg(target_os = "linux")]
    pub(crate) fn notify_one(&self) {
        use rustix::thread::futex;

        let _ = futex::wake(&self.value, futex::Flags::PRIVATE, 1);
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn notify_one(&self) {
        self.waiters.notify_one();
    }
}
