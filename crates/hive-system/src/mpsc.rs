//! Bounded multi-producer / single-consumer ring of cache lines.
//!
//! One ring per worker: every other worker's flush path is a producer, the
//! owning worker's receive path is the only consumer. The ring stores raw
//! cache lines; event framing is recovered by the consumer from each event
//! header's bucket size.
//!
//! ## Protocol
//!
//! Producers claim a slot range by CAS-advancing the write cursor, copy
//! their lines (two segments when the range wraps), then publish each slot
//! with a per-slot commit sequence. Commit stores go in *reverse* slot
//! order: the first slot of a chunk is published last, so when the consumer
//! sees a slot committed, every later slot of the same chunk already is.
//! The consumer therefore drains a contiguous committed prefix that never
//! ends in the middle of a chunk.
//!
//! Commit sequences are unbounded (`slot_index + 1` for the claim that
//! filled the slot), which distinguishes laps without ever resetting the
//! marker.
//!
//! Guarantees:
//! - a claim is all-or-nothing: `enqueue` fails when the ring cannot take
//!   the whole chunk;
//! - chunks from one producer are delivered in that producer's enqueue
//!   order; chunks from distinct producers may interleave only at chunk
//!   boundaries;
//! - the consumer sees every committed line exactly once.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::cacheline::CacheLine;

/// Default ring capacity in cache lines (64 KiB), the order of magnitude of
/// `u16::MAX / CACHE_LINE_BYTES` rounded to a power of two.
pub const DEFAULT_RING_LINES: usize = 1024;

pub struct MpscRing {
    mask: usize,
    slots: Box<[UnsafeCell<CacheLine>]>,
    /// Per-slot commit marker: `index + 1` of the claim that filled it.
    seq: Box<[AtomicUsize]>,
    /// Claim cursor, advanced by CAS across producers.
    writer: CachePadded<AtomicUsize>,
    /// Consume cursor, written only by the consumer.
    reader: CachePadded<AtomicUsize>,
    /// Set while the consumer is parked on the condvar.
    parked: AtomicBool,
    park_lock: Mutex<()>,
    park_cond: Condvar,
}

// Safety: slot contents are only written between a successful CAS claim and
// the matching commit store, and only read by the consumer after observing
// the commit with acquire ordering. The cursors and commit markers carry all
// cross-thread synchronization.
unsafe impl Send for MpscRing {}
unsafe impl Sync for MpscRing {}

impl MpscRing {
    /// Create a ring with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_LINES)
    }

    /// Create a ring holding `lines` cache lines. `lines` must be a power
    /// of two.
    pub fn with_capacity(lines: usize) -> Self {
        assert!(lines.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..lines)
            .map(|_| UnsafeCell::new(CacheLine::ZERO))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let seq = (0..lines)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MpscRing {
            mask: lines - 1,
            slots,
            seq,
            writer: CachePadded::new(AtomicUsize::new(0)),
            reader: CachePadded::new(AtomicUsize::new(0)),
            parked: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cond: Condvar::new(),
        }
    }

    /// Capacity in cache lines.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Copy `n` cache lines from `src` into the ring as one chunk.
    ///
    /// Returns `false` without side effects when the ring cannot currently
    /// accommodate the whole chunk (including when `n` exceeds capacity).
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `n` cache lines.
    pub unsafe fn enqueue(&self, src: *const CacheLine, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.capacity() {
            return false;
        }

        // Claim [w, w + n). The reader is loaded first: both cursors are
        // monotonic and reader never passes writer, so a writer value read
        // afterwards can only be >= the reader value.
        let claimed = loop {
            let r = self.reader.load(Ordering::Acquire);
            let w = self.writer.load(Ordering::Relaxed);
            if w - r + n > self.capacity() {
                return false;
            }
            match self.writer.compare_exchange_weak(
                w,
                w + n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break w,
                Err(_) => continue,
            }
        };

        // Copy, handling wrap with two segments.
        let base = self.slots.as_ptr() as *mut CacheLine;
        let start = claimed & self.mask;
        let first = n.min(self.capacity() - start);
        std::ptr::copy_nonoverlapping(src, base.add(start), first);
        if first < n {
            std::ptr::copy_nonoverlapping(src.add(first), base, n - first);
        }

        // Publish in reverse order so the consumer's contiguous committed
        // prefix can only end at a chunk boundary.
        for i in (0..n).rev() {
            let pos = claimed + i;
            self.seq[pos & self.mask].store(pos + 1, Ordering::Release);
        }

        if self.parked.load(Ordering::SeqCst) {
            let _guard = self.park_lock.lock();
            self.park_cond.notify_one();
        }
        true
    }

    /// Drain up to `max` committed cache lines into `scratch` and invoke
    /// `f(&mut scratch[..n])` exactly once when `n > 0`. Returns the number
    /// of lines drained; zero means the ring was empty (non-blocking).
    ///
    /// Must only be called from the single consumer thread. As long as
    /// `scratch.len() >= capacity()`, a drain never ends in the middle of a
    /// chunk.
    pub fn dequeue<F>(&self, scratch: &mut [CacheLine], max: usize, f: F) -> usize
    where
        F: FnOnce(&mut [CacheLine]),
    {
        let r = self.reader.load(Ordering::Relaxed);
        let limit = max.min(scratch.len());

        let mut n = 0;
        while n < limit {
            let pos = r + n;
            if self.seq[pos & self.mask].load(Ordering::Acquire) != pos + 1 {
                break;
            }
            n += 1;
        }
        if n == 0 {
            return 0;
        }

        let base = self.slots.as_ptr() as *const CacheLine;
        let start = r & self.mask;
        let first = n.min(self.capacity() - start);
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(start), scratch.as_mut_ptr(), first);
            if first < n {
                std::ptr::copy_nonoverlapping(base, scratch.as_mut_ptr().add(first), n - first);
            }
        }
        self.reader.store(r + n, Ordering::Release);

        f(&mut scratch[..n]);
        n
    }

    /// Whether at least one committed line is waiting.
    #[inline]
    pub fn has_pending(&self) -> bool {
        let r = self.reader.load(Ordering::Relaxed);
        self.seq[r & self.mask].load(Ordering::Acquire) == r + 1
    }

    /// Park the consumer until a producer commits a chunk or `timeout`
    /// elapses. The timeout bounds the residual wakeup race, so a missed
    /// notification costs at most one timeout period.
    pub fn wait(&self, timeout: Duration) {
        self.parked.store(true, Ordering::SeqCst);
        if self.has_pending() {
            self.parked.store(false, Ordering::Relaxed);
            return;
        }
        {
            let mut guard = self.park_lock.lock();
            if !self.has_pending() {
                let _ = self.park_cond.wait_for(&mut guard, timeout);
            }
        }
        self.parked.store(false, Ordering::Relaxed);
    }
}

impl Default for MpscRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MpscRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.writer.load(Ordering::Relaxed);
        let r = self.reader.load(Ordering::Relaxed);
        f.debug_struct("MpscRing")
            .field("capacity", &self.capacity())
            .field("claimed", &(w - r))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
