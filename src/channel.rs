//! Blocking SPSC channel endpoints.
//!
//! A channel is created by [`channel`] with a fixed capacity and consists of
//! exactly one [`Sender`] and one [`Receiver`]. Transfers block instead of
//! failing: a send blocks while the buffer is full and the receiver is
//! alive, a receive blocks while the buffer is empty and the sender is
//! alive. A departed peer is not an error — it surfaces as `Err(value)` /
//! `None` / an `ok = false` flag, and the receiver always gets to drain
//! everything published before it is told the sender is gone.
//!
//! # Overview
//!
//! - [`Sender`] - Write end (single producer per channel)
//! - [`Receiver`] - Read end (single consumer per channel)
//! - Lock-free hot path: one acquire-ordered load plus one release-ordered
//!   store per transfer; the futex is only touched when a side has to block
//!
//! # Example
//!
//! ```
//! let (tx, rx) = strait::channel::<u64>(256).unwrap();
//!
//! let producer = std::thread::spawn(move || {
//!     for i in 0..1000 {
//!         tx.send(i).expect("receiver is alive");
//!     }
//! });
//!
//! let received: Vec<u64> = rx.collect();
//! producer.join().unwrap();
//! assert_eq!(received.len(), 1000);
//! ```
//!
//! # Thread Safety
//!
//! Both endpoints are [`Send`] but **not** [`Sync`]: ownership can move to
//! another thread, but a `&Sender`/`&Receiver` cannot be shared across
//! threads, so the single-producer/single-consumer precondition is enforced
//! at compile time.

use std::fmt;
use std::ptr::NonNull;

use thiserror::Error;

use crate::position::POSITION_MASK;
use crate::ring::RingCore;
use crate::trace::debug;

/// Errors reported by [`channel`] and the bulk transfer operations.
///
/// A departed peer is deliberately absent here: it is routine lifecycle,
/// reported in-band by [`Sender::send`] and [`Receiver::recv`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The requested capacity was zero.
    #[error("channel capacity must be greater than zero")]
    InvalidCapacity,

    /// A capacity or bulk count does not fit the 30-bit position encoding.
    #[error("count {0} exceeds the 30-bit position limit")]
    CountTooLarge(usize),
}

fn validate_count(count: usize) -> Result<(), ChannelError> {
    if count > POSITION_MASK as usize {
        return Err(ChannelError::CountTooLarge(count));
    }
    Ok(())
}

/// Creates a bounded SPSC channel holding at most `capacity` in-flight
/// values.
///
/// Returns the only [`Sender`]/[`Receiver`] pair ever bound to this buffer.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidCapacity`] for a capacity of zero and
/// [`ChannelError::CountTooLarge`] when the capacity does not fit the
/// 30-bit position encoding.
///
/// # Example
///
/// ```
/// let (tx, rx) = strait::channel::<String>(16).unwrap();
///
/// tx.send("hello".to_string()).unwrap();
/// assert_eq!(rx.recv(), Some("hello".to_string()));
/// ```
pub fn channel<T: Send>(capacity: u32) -> Result<(Sender<T>, Receiver<T>), ChannelError> {
    if capacity == 0 {
        return Err(ChannelError::InvalidCapacity);
    }
    validate_count(capacity as usize)?;

    debug!(capacity, "spsc channel created");

    let core = RingCore::new(capacity);
    Ok((Sender { core }, Receiver { core }))
}

/// Write end of the channel.
///
/// Move-only: exactly one `Sender` exists per channel. Dropping it (or
/// overwriting it by assignment) detaches the producer side exactly once,
/// waking a blocked receiver.
pub struct Sender<T: Send> {
    core: NonNull<RingCore<T>>,
}

// SAFETY: Sender can move between threads because the core it points at is
// Sync for T: Send and stays alive until both endpoints have detached.
// Sender is deliberately not Sync (NonNull suppresses it): a shared
// &Sender on two threads would break the single-producer precondition.
unsafe impl<T: Send> Send for Sender<T> {}

impl<T: Send> Sender<T> {
    /// Sends one value, blocking while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` if the receiver has detached; the value is
    /// handed back instead of being silently destroyed.
    pub fn send(&self, value: T) -> Result<(), T> {
        // SAFETY: the core outlives this handle.
        let core = unsafe { self.core.as_ref() };

        let Some(acquisition) = core.producer_acquire(1) else {
            return Err(value);
        };

        // SAFETY: [begin, begin + 1) was acquired and not yet released, so
        // the slot is writable and logically uninitialized.
        unsafe { core.slot(acquisition.begin).write(value) };

        core.producer_release(acquisition);
        Ok(())
    }

    /// Sends up to `count` values drawn from `values`, blocking for buffer
    /// space as needed.
    ///
    /// Stops early when the iterator runs dry; the call never waits for
    /// buffer space once the input is exhausted. On success returns the
    /// iterator and `true`; if the receiver detaches mid-transfer, returns
    /// the iterator positioned at the first untransferred element and
    /// `false`. Elements already handed over stay transferred either way.
    /// A value already peeked out of the iterator when the receiver
    /// disappears is destroyed, like the buffered values it would have
    /// joined.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CountTooLarge`] before consuming any input
    /// if `count` does not fit the position encoding.
    pub fn send_n<I>(&self, mut values: I, count: usize) -> Result<(I, bool), ChannelError>
    where
        I: Iterator<Item = T>,
    {
        validate_count(count)?;

        // SAFETY: the core outlives this handle.
        let core = unsafe { self.core.as_ref() };
        let mut remaining = count as u32;
        // One-slot lookahead, filled at acquisition boundaries so a dry
        // input is detected before blocking for more buffer space.
        let mut peeked = None;

        while remaining != 0 {
            let Some(acquisition) = core.producer_acquire(remaining) else {
                return Ok((values, false));
            };

            let mut written = 0;
            while written < acquisition.len() {
                let Some(value) = peeked.take().or_else(|| values.next()) else {
                    break;
                };
                // SAFETY: begin + written lies inside the acquired range.
                unsafe { core.slot(acquisition.begin + written).write(value) };
                written += 1;
            }

            if written < acquisition.len() {
                // Input ran dry mid-range: publish only the constructed
                // prefix and stop.
                if written != 0 {
                    core.producer_release(core.producer_truncate(acquisition, written));
                }
                break;
            }

            core.producer_release(acquisition);
            remaining -= written;

            if remaining != 0 {
                // The batch filled completely with count still unmet. Pull
                // the next value before re-acquiring: the acquire may block
                // on a full buffer, which is only allowed while there is
                // something left to send.
                peeked = values.next();
                if peeked.is_none() {
                    break;
                }
            }
        }

        Ok((values, true))
    }

    /// Maximum number of in-flight values.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        // SAFETY: the core outlives this handle.
        unsafe { self.core.as_ref() }.capacity()
    }
}

impl<T: Send> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl<T: Send> Drop for Sender<T> {
    fn drop(&mut self) {
        // SAFETY: this handle is the producer-side ownership reference and
        // is never used again.
        unsafe { RingCore::drop_producer(self.core) };
    }
}

/// Read end of the channel.
///
/// Move-only: exactly one `Receiver` exists per channel. Dropping it
/// detaches the consumer side exactly once, waking a blocked sender and
/// destroying any still-buffered values during teardown.
pub struct Receiver<T: Send> {
    core: NonNull<RingCore<T>>,
}

// SAFETY: as for Sender; not Sync to enforce the single-consumer
// precondition.
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T: Send> Receiver<T> {
    /// Receives one value, blocking while the buffer is empty and the
    /// sender is alive.
    ///
    /// Returns `None` only after the sender has detached **and** every
    /// value it published has been drained.
    #[must_use]
    pub fn recv(&self) -> Option<T> {
        // SAFETY: the core outlives this handle.
        let core = unsafe { self.core.as_ref() };

        let acquisition = core.consumer_acquire(1)?;

        // SAFETY: [begin, begin + 1) was acquired, so the slot holds a live
        // value; reading it out makes the slot logically uninitialized
        // before the release hands it back to the producer.
        let value = unsafe { core.slot(acquisition.begin).read() };

        core.consumer_release(acquisition);
        Some(value)
    }

    /// Receives up to `count` values into `out`, blocking for the first
    /// value of each acquired batch.
    ///
    /// Returns the number of values appended and `true`, or `false` if the
    /// sender detached before `count` values arrived (the appended prefix
    /// is exactly what was transferred).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CountTooLarge`] before touching the buffer
    /// if `count` does not fit the position encoding.
    pub fn recv_n(&self, out: &mut Vec<T>, count: usize) -> Result<(usize, bool), ChannelError> {
        validate_count(count)?;

        // SAFETY: the core outlives this handle.
        let core = unsafe { self.core.as_ref() };
        let mut remaining = count as u32;

        while remaining != 0 {
            let Some(acquisition) = core.consumer_acquire(remaining) else {
                return Ok((count - remaining as usize, false));
            };

            out.reserve(acquisition.len() as usize);
            for offset in 0..acquisition.len() {
                // SAFETY: begin + offset lies inside the acquired range and
                // holds a live value.
                out.push(unsafe { core.slot(acquisition.begin + offset).read() });
            }

            core.consumer_release(acquisition);
            remaining -= acquisition.len();
        }

        Ok((count, true))
    }

    /// Maximum number of in-flight values.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        // SAFETY: the core outlives this handle.
        unsafe { self.core.as_ref() }.capacity()
    }
}

impl<T: Send> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Blocking iteration over received values; ends when the sender has
/// detached and the buffer is drained.
impl<T: Send> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

impl<T: Send> Drop for Receiver<T> {
    fn drop(&mut self) {
        // SAFETY: this handle is the consumer-side ownership reference and
        // is never used again.
        unsafe { RingCore::drop_consumer(self.core) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts drops through a shared counter, for teardown accounting.
    #[derive(Debug)]
    struct Token(Arc<AtomicUsize>);

    impl Drop for Token {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn basic_send_recv() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        tx.send(42).unwrap();
        assert_eq!(rx.recv(), Some(42));
    }

    #[test]
    fn fifo_order_within_capacity() {
        let (tx, rx) = channel::<u64>(16).unwrap();

        for i in 0..10 {
            tx.send(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.recv(), Some(i));
        }
    }

    #[test]
    fn capacity_one_alternates() {
        let (tx, rx) = channel::<String>(1).unwrap();

        for i in 0..5 {
            tx.send(format!("msg-{i}")).unwrap();
            assert_eq!(rx.recv(), Some(format!("msg-{i}")));
        }
    }

    #[test]
    fn wraparound_preserves_values() {
        let (tx, rx) = channel::<u64>(4).unwrap();

        for round in 0..5 {
            for i in 0..4 {
                tx.send(round * 10 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(rx.recv(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn receiver_drains_after_sender_drop() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        for i in 0..3 {
            tx.send(i).unwrap();
        }
        drop(tx);

        assert_eq!(rx.recv(), Some(0));
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
        // Must report "sender gone" without blocking.
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn send_fails_after_receiver_drop() {
        let (tx, rx) = channel::<String>(8).unwrap();
        drop(rx);

        // The value comes back instead of being destroyed silently.
        assert_eq!(tx.send("orphan".to_string()), Err("orphan".to_string()));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            channel::<u64>(0).unwrap_err(),
            ChannelError::InvalidCapacity
        );
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        assert_eq!(
            channel::<u64>(1 << 30).unwrap_err(),
            ChannelError::CountTooLarge(1 << 30)
        );
    }

    #[test]
    fn oversized_bulk_count_is_rejected_before_any_transfer() {
        let (tx, rx) = channel::<u64>(4).unwrap();

        let mut values = 0..;
        let err = tx
            .send_n(&mut values, 1usize << 30)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, ChannelError::CountTooLarge(1usize << 30));
        // Nothing consumed, nothing buffered.
        assert_eq!(values.next(), Some(0));

        let mut out = Vec::new();
        let err = rx.recv_n(&mut out, 1usize << 30).map(|_| ()).unwrap_err();
        assert_eq!(err, ChannelError::CountTooLarge(1usize << 30));
        assert!(out.is_empty());
    }

    #[test]
    fn send_n_stops_when_iterator_runs_dry() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        let (mut leftover, ok) = tx.send_n(0..3, 5).unwrap();
        assert!(ok);
        assert_eq!(leftover.next(), None);

        drop(tx);
        assert_eq!(rx.recv(), Some(0));
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn send_n_returns_when_iterator_ends_at_acquisition_boundary() {
        let (tx, rx) = channel::<u64>(2).unwrap();

        // The input ends exactly where the first acquired range does. The
        // call must notice and return instead of waiting for buffer space
        // no remaining value needs.
        let (mut leftover, ok) = tx.send_n(0..2, 4).unwrap();
        assert!(ok);
        assert_eq!(leftover.next(), None);

        drop(tx);
        assert_eq!(rx.recv(), Some(0));
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn send_n_carries_peeked_value_across_the_wrap() {
        let (tx, rx) = channel::<u64>(4).unwrap();

        // Advance both positions so the next bulk transfer wraps.
        tx.send(90).unwrap();
        tx.send(91).unwrap();
        assert_eq!(rx.recv(), Some(90));
        assert_eq!(rx.recv(), Some(91));

        // Spans two acquisitions; the value pulled at the boundary must
        // land in the first slot of the second range.
        let (mut leftover, ok) = tx.send_n(10..14, 4).unwrap();
        assert!(ok);
        assert_eq!(leftover.next(), None);

        drop(tx);
        let values: Vec<u64> = rx.collect();
        assert_eq!(values, vec![10, 11, 12, 13]);
    }

    #[test]
    fn send_n_reports_receiver_gone_with_cursor_intact() {
        let (tx, rx) = channel::<u64>(4).unwrap();
        drop(rx);

        let (mut leftover, ok) = tx.send_n(0..10, 10).unwrap();
        assert!(!ok);
        // The producer stops the instant the consumer is gone, so the
        // cursor still sits on the first element.
        assert_eq!(leftover.next(), Some(0));
    }

    #[test]
    fn recv_n_collects_across_acquisitions() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        for i in 0..5 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        assert_eq!(rx.recv_n(&mut out, 3), Ok((3, true)));
        // Only two values remain; the sender is gone afterwards.
        assert_eq!(rx.recv_n(&mut out, 5), Ok((2, false)));
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn zero_sized_values_transfer() {
        let (tx, rx) = channel::<()>(4).unwrap();

        tx.send(()).unwrap();
        tx.send(()).unwrap();
        assert_eq!(rx.recv(), Some(()));
        assert_eq!(rx.recv(), Some(()));

        drop(tx);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn teardown_destroys_single_buffered_segment() {
        let drops = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = channel::<Token>(4).unwrap();
        for _ in 0..3 {
            tx.send(Token(Arc::clone(&drops))).unwrap();
        }

        drop(tx);
        drop(rx);

        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn teardown_destroys_both_wrapped_segments() {
        let drops = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = channel::<Token>(4).unwrap();
        for _ in 0..4 {
            tx.send(Token(Arc::clone(&drops))).unwrap();
        }
        // Consume two, refill two: the occupied region now wraps, covering
        // [0, 2) and [2, 4) with differing revolution bits.
        drop(rx.recv());
        drop(rx.recv());
        for _ in 0..2 {
            tx.send(Token(Arc::clone(&drops))).unwrap();
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);

        drop(tx);
        drop(rx);

        // The four still-buffered tokens were destroyed exactly once each.
        assert_eq!(drops.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn teardown_after_full_drain_destroys_nothing_twice() {
        let drops = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = channel::<Token>(4).unwrap();
        for _ in 0..2 {
            tx.send(Token(Arc::clone(&drops))).unwrap();
        }
        drop(rx.recv());
        drop(rx.recv());

        drop(tx);
        drop(rx);

        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn overwriting_sender_disconnects_old_channel() {
        let (tx, rx) = channel::<u64>(2).unwrap();
        let (replacement, other_rx) = channel::<u64>(2).unwrap();

        let mut tx = tx;
        // Assignment drops the old sender exactly once before the
        // replacement moves in.
        tx = replacement;

        assert_eq!(rx.recv(), None);

        tx.send(7).unwrap();
        assert_eq!(other_rx.recv(), Some(7));
    }

    #[test]
    fn receiver_iterates_until_disconnect() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        for i in 0..6 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let values: Vec<u64> = rx.collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn debug_output_shows_capacity_only() {
        let (tx, rx) = channel::<u64>(8).unwrap();

        assert_eq!(format!("{tx:?}"), "Sender { capacity: 8, .. }");
        assert_eq!(format!("{rx:?}"), "Receiver { capacity: 8, .. }");
    }
}
