//! Core ring buffer: position protocol, storage, and shared teardown.
//!
//! [`RingCore`] owns raw storage for `capacity` elements plus two packed
//! [`PositionWord`]s, one per side. Each word holds the slot index that side
//! will next write to or read from. The producer's writable range is
//! `[producer, consumer)` and the consumer's readable range is
//! `[consumer, producer)` — the acquire/release logic is the same for both
//! sides with the roles of "mine" and "theirs" swapped.
//!
//! Because the buffer is a ring, a logical range may wrap around the end of
//! storage and physically be two ranges, `[begin, capacity)` and `[0, end)`.
//! [`RingCore::acquire`] only ever hands out the contiguous run up to the
//! wrap point; the next call picks up the remainder starting at slot 0.
//!
//! Full/empty disambiguation uses the revolution flag: each position flips
//! it when wrapping past `capacity`. Two positions that are equal except for
//! the revolution flag mean the producer is a whole revolution (capacity
//! slots) ahead — the buffer is full. Positions equal including the flag
//! mean the buffer is empty. Both cases are a single XOR against the side's
//! wait mask.
//!
//! # Safety
//!
//! Slot initialization is a protocol invariant, not a type-system one: a
//! slot holds a live `T` exactly while it sits inside the logical range
//! `[consumer, producer)`. The unsafe APIs here require the caller to uphold
//! the SPSC invariant (one producer, one consumer, no concurrent access to
//! either role) and to construct/destroy slots only inside an acquired
//! range.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::position::{DROP_FLAG, POSITION_MASK, PositionWord, REVOLUTION_FLAG};
use crate::trace::{debug, trace};

/// A claimed contiguous range of slots, pending release.
///
/// `begin <= end <= capacity` always holds, and a returned acquisition spans
/// at least one slot. `next` is the packed position value published by the
/// matching release call once the range's slots have been constructed or
/// consumed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Acquisition {
    pub(crate) begin: u32,
    pub(crate) end: u32,
    pub(crate) next: u32,
}

impl Acquisition {
    /// Number of slots in the acquired range.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.end - self.begin
    }
}

/// One side's position word, padded onto its own cache line so the
/// producer's and consumer's stores don't false-share.
#[repr(C)]
#[repr(align(64))]
struct Side {
    pos: PositionWord,
}

impl Side {
    const fn new() -> Self {
        Self {
            pos: PositionWord::new(),
        }
    }
}

/// Shared core of one SPSC channel: slot storage, both position words, and
/// the one-shot teardown flag.
///
/// Exactly two references to a core exist for its whole life, one held by
/// the `Sender` and one by the `Receiver`. Whichever side detaches second
/// observes `either_side_dropped` already set and performs teardown.
pub(crate) struct RingCore<T> {
    producer: Side,
    consumer: Side,

    /// One-shot flag arbitrating which of the two detach calls frees the
    /// core. The only field both sides write.
    either_side_dropped: AtomicBool,

    capacity: u32,

    /// Raw storage for `capacity` slots. Dangling when `T` is zero-sized.
    data: *mut T,
}

// SAFETY: RingCore is Send/Sync for T: Send because all concurrent access
// is mediated by the position protocol:
// - each position word is written by one side only, with Release/Acquire
//   pairing on release()/acquire()
// - each slot is exclusively owned by one side at a time; ownership
//   transfers only through a release observed by the peer's acquire
// - either_side_dropped is a one-shot atomic exchange
unsafe impl<T: Send> Send for RingCore<T> {}
unsafe impl<T: Send> Sync for RingCore<T> {}

impl<T> RingCore<T> {
    /// Allocates a core with uninitialized storage for `capacity` slots.
    ///
    /// The caller takes over the two ownership references; the core is freed
    /// by the second of the two detach calls.
    ///
    /// # Panics
    ///
    /// Panics if the total storage size overflows `isize::MAX`; aborts via
    /// `handle_alloc_error` if the allocator fails.
    pub(crate) fn new(capacity: u32) -> NonNull<Self> {
        debug_assert!(capacity >= 1 && capacity <= POSITION_MASK);

        let data = if size_of::<T>() == 0 {
            NonNull::<T>::dangling().as_ptr()
        } else {
            let layout = Self::storage_layout(capacity);
            // SAFETY: layout has non-zero size since T is not zero-sized
            // and capacity >= 1.
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            ptr.cast::<T>()
        };

        let core = Box::new(Self {
            producer: Side::new(),
            consumer: Side::new(),
            either_side_dropped: AtomicBool::new(false),
            capacity,
            data,
        });

        NonNull::from(Box::leak(core))
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pointer to the slot at `index`.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `index` lies inside a range acquired by the calling side and not
    ///   yet released
    /// - the slot is written before a producer release, and read out before
    ///   a consumer release
    #[inline]
    pub(crate) unsafe fn slot(&self, index: u32) -> *mut T {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, within the allocation made in new().
        // For zero-sized T every offset from the dangling pointer is valid.
        unsafe { self.data.add(index as usize) }
    }

    /// Claims up to `slots` contiguous writable slots for the producer.
    ///
    /// Blocks while the buffer is full and the consumer is alive. Returns
    /// `None` once the consumer has detached.
    pub(crate) fn producer_acquire(&self, slots: u32) -> Option<Acquisition> {
        self.acquire(&self.producer.pos, &self.consumer.pos, REVOLUTION_FLAG, slots)
    }

    /// Publishes the producer's acquired range, making the constructed slots
    /// visible to the consumer.
    pub(crate) fn producer_release(&self, acquisition: Acquisition) {
        Self::release(&self.producer.pos, acquisition);
    }

    /// Claims up to `slots` contiguous readable slots for the consumer.
    ///
    /// Blocks while the buffer is empty and the producer is alive. Returns
    /// `None` once the producer has detached and every published slot has
    /// been drained.
    pub(crate) fn consumer_acquire(&self, slots: u32) -> Option<Acquisition> {
        self.acquire(&self.consumer.pos, &self.producer.pos, 0, slots)
    }

    /// Publishes the consumer's acquired range, handing the vacated slots
    /// back to the producer.
    pub(crate) fn consumer_release(&self, acquisition: Acquisition) {
        Self::release(&self.consumer.pos, acquisition);
    }

    /// Shrinks a producer acquisition to its first `written` slots.
    ///
    /// Used when a bulk send runs out of input mid-range: only the slots
    /// actually constructed may be published. `written` must be strictly
    /// less than the acquired length, so the shrunk range never reaches the
    /// wrap point and the revolution flag is unchanged.
    pub(crate) fn producer_truncate(&self, acquisition: Acquisition, written: u32) -> Acquisition {
        debug_assert!(written < acquisition.len());

        let end = acquisition.begin + written;
        let revolution = self.producer.pos.load(Ordering::Relaxed) & REVOLUTION_FLAG;

        Acquisition {
            begin: acquisition.begin,
            end,
            next: end | revolution,
        }
    }

    /// Detaches the producer side. The second of the two detach calls tears
    /// the core down.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - it holds one of the two ownership references to `core`
    /// - that reference is never used again after this call
    pub(crate) unsafe fn drop_producer(core: NonNull<Self>) {
        debug!("producer detached");
        // SAFETY: the caller's ownership reference keeps the core alive
        // until release_core below.
        let this = unsafe { core.as_ref() };
        this.detach(&this.producer.pos);
        unsafe { Self::release_core(core) };
    }

    /// Detaches the consumer side. See [`RingCore::drop_producer`].
    ///
    /// # Safety
    ///
    /// Same contract as [`RingCore::drop_producer`].
    pub(crate) unsafe fn drop_consumer(core: NonNull<Self>) {
        debug!("consumer detached");
        // SAFETY: as in drop_producer.
        let this = unsafe { core.as_ref() };
        this.detach(&this.consumer.pos);
        unsafe { Self::release_core(core) };
    }

    // NOTE: wait_mask MUST be 0 (consumer) or REVOLUTION_FLAG (producer).
    // It encodes which XOR relationship between the two positions means
    // "nothing claimable for this side": equality for the consumer (empty),
    // equality-except-revolution for the producer (full).
    fn acquire(
        &self,
        mine: &PositionWord,
        theirs: &PositionWord,
        wait_mask: u32,
        slots: u32,
    ) -> Option<Acquisition> {
        debug_assert!(wait_mask == 0 || wait_mask == REVOLUTION_FLAG);
        debug_assert!(slots >= 1);

        // Our own position is only ever written by us, so a relaxed read of
        // the value we last published is exact.
        let my_pos = mine.load(Ordering::Relaxed);
        let mut their_pos;

        loop {
            // This acquire read synchronizes with the release write in
            // release(), making the peer's slot writes (or destructions)
            // visible before we treat the range as claimable.
            their_pos = theirs.load(Ordering::Acquire);
            if (my_pos ^ their_pos) != wait_mask {
                break;
            }

            theirs.wait(their_pos);
        }

        // Peer drop handling differs per side:
        // - producer: stop the instant the consumer is gone, nothing we
        //   write would ever be read (only the producer has wait_mask != 0)
        // - consumer: drain everything already published first; drained
        //   means the positions differ by exactly the drop flag
        if (their_pos & DROP_FLAG) != 0 && (wait_mask != 0 || (my_pos ^ their_pos) == DROP_FLAG) {
            return None;
        }

        let begin = my_pos & POSITION_MASK;
        let mut end = their_pos & POSITION_MASK;

        // [begin, end) is this side's claimable range. If the masked peer
        // index is at or behind ours, the physically contiguous run extends
        // to the end of storage; a later acquire returns the wrapped
        // remainder starting at 0.
        if end <= begin {
            end = self.capacity;
        }

        end = end.min(begin + slots);

        // The value released into our own word afterwards: `end` with the
        // current revolution spliced in, or, when the range runs up to the
        // wrap point, index 0 with the revolution flipped.
        let revolution = my_pos & REVOLUTION_FLAG;
        let next = if end != self.capacity {
            end | revolution
        } else {
            revolution ^ REVOLUTION_FLAG
        };

        Some(Acquisition { begin, end, next })
    }

    fn release(mine: &PositionWord, acquisition: Acquisition) {
        // This release write synchronizes with the acquire read in
        // acquire().
        mine.store(acquisition.next, Ordering::Release);
        mine.notify_one();
    }

    fn detach(&self, mine: &PositionWord) {
        // Relaxed suffices: every transfer already went through a release
        // write, and the peer re-reads the position after waking. The
        // notify unblocks a peer waiting on our word.
        mine.fetch_or(DROP_FLAG, Ordering::Relaxed);
        mine.notify_one();
    }

    /// Gives up one of the two ownership references; the second caller
    /// frees the core.
    unsafe fn release_core(core: NonNull<Self>) {
        // SAFETY: our ownership reference is live until the swap below
        // decides who frees.
        let other_side_already_dropped = unsafe { core.as_ref() }
            .either_side_dropped
            .swap(true, Ordering::AcqRel);

        if other_side_already_dropped {
            // SAFETY: both sides have detached, nobody can reach the core
            // anymore, and it was allocated via Box in new().
            drop(unsafe { Box::from_raw(core.as_ptr()) });
        }
    }
}

impl<T> RingCore<T> {
    fn storage_layout(capacity: u32) -> Layout {
        // Capacity was validated against POSITION_MASK at construction; the
        // only remaining failure is a total byte size past isize::MAX.
        match Layout::array::<T>(capacity as usize) {
            Ok(layout) => layout,
            Err(_) => panic!("ring storage size overflows isize::MAX"),
        }
    }

    /// Destroys the live elements in `[begin, end)`.
    ///
    /// # Safety
    ///
    /// Every slot in the range must hold a live `T`, and no other reference
    /// to those slots may exist.
    unsafe fn destroy_range(&mut self, begin: u32, end: u32) {
        let len = (end - begin) as usize;
        // SAFETY: per caller contract the range is in bounds and fully
        // initialized.
        unsafe {
            let slots = ptr::slice_from_raw_parts_mut(self.data.add(begin as usize), len);
            ptr::drop_in_place(slots);
        }
    }
}

impl<T> Drop for RingCore<T> {
    fn drop(&mut self) {
        let begin = self.consumer.pos.load(Ordering::Acquire);
        let end = self.producer.pos.load(Ordering::Acquire);
        let wrapped = ((begin ^ end) & REVOLUTION_FLAG) != 0;

        let begin = begin & POSITION_MASK;
        let end = end & POSITION_MASK;

        trace!(capacity = self.capacity, begin, end, wrapped, "tearing down ring");

        // The occupied region is the ring range [consumer, producer), which
        // is one of three shapes:
        // - empty: positions identical including revolution bits
        // - one segment in the middle: producer strictly ahead when masked
        // - two segments hugging both ends: revolution bits differ, even if
        //   the masked indices are equal (exactly capacity values buffered)
        if end > begin {
            // SAFETY: [begin, end) is exactly the occupied region; both
            // sides have detached so no other access exists.
            unsafe { self.destroy_range(begin, end) };
        } else if wrapped {
            // SAFETY: as above, for the wrapped shape [0, end) + [begin,
            // capacity).
            unsafe {
                self.destroy_range(0, end);
                self.destroy_range(begin, self.capacity);
            }
        }

        if size_of::<T>() != 0 {
            // SAFETY: data was allocated in new() with this exact layout.
            unsafe { alloc::dealloc(self.data.cast(), Self::storage_layout(self.capacity)) };
        }
    }
}
