//! Lock-free substrate for the hive actor runtime.
//!
//! This crate holds the pieces below the actor model: the cache-line
//! framing unit, the unbounded outbound [`Pipe`], the bounded [`MpscRing`]
//! every worker exposes as its inbox, CPU pinning, and monotonic
//! timestamps. Nothing in here knows what an actor or an event is beyond
//! "a run of cache lines".
//!
//! ## Modules
//!
//! - [`cacheline`]: the 64-byte framing unit and bucket math
//! - [`pipe`]: single-producer unbounded staging buffer
//! - [`mpsc`]: bounded multi-producer/single-consumer ring with a parking
//!   protocol for idle consumers
//! - [`cpu`]: pin-current-thread affinity shim
//! - [`timestamp`]: monotonic nanoseconds

pub mod cacheline;
pub mod cpu;
pub mod mpsc;
pub mod pipe;
pub mod timestamp;

pub use cacheline::{ceil_cache_lines, CacheLine, CACHE_LINE_BYTES};
pub use mpsc::{MpscRing, DEFAULT_RING_LINES};
pub use pipe::Pipe;
