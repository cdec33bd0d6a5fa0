//! Cache-line units for event framing.
//!
//! Every event the runtime moves between workers is rounded up to whole
//! cache lines, and every buffer that carries events (pipes, rings, scratch)
//! is an array of `CacheLine`. Framing is recovered on the receive side by
//! reading each event header's bucket size.

use std::fmt;

/// Bytes per cache line. Events are rounded up to a multiple of this.
pub const CACHE_LINE_BYTES: usize = 64;

/// One cache line of raw event bytes.
///
/// The alignment guarantees that any event constructed at a `CacheLine`
/// boundary is correctly aligned for payloads up to 64-byte alignment.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct CacheLine([u8; CACHE_LINE_BYTES]);

impl CacheLine {
    /// An all-zero line, used to initialize buffers.
    pub const ZERO: CacheLine = CacheLine([0; CACHE_LINE_BYTES]);

    /// Raw pointer to the first byte.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Raw mutable pointer to the first byte.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

impl fmt::Debug for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheLine(..)")
    }
}

/// Number of cache lines needed to hold `bytes` bytes, never less than one.
///
/// This is the bucket size stored in every event header. The result fits in
/// a `u16` by construction: anything larger than `u16::MAX` lines could not
/// be framed on the wire in the first place.
#[inline]
pub fn ceil_cache_lines(bytes: usize) -> u16 {
    debug_assert!(
        bytes <= u16::MAX as usize * CACHE_LINE_BYTES,
        "event of {} bytes cannot be framed",
        bytes
    );
    (bytes.div_ceil(CACHE_LINE_BYTES)).max(1) as u16
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
