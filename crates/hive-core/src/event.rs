//! Event object model.
//!
//! Every event on the wire is a [`Packet<T>`]: a 16-byte [`EventHeader`]
//! followed by the typed payload, rounded up to whole cache lines. Events
//! are constructed in place inside a pipe, copied verbatim across the MPSC
//! ring, and destroyed exactly once after dispatch unless a handler kept
//! them alive through `reply`/`forward`.
//!
//! Payloads must be self-contained: they are relocated by raw copy between
//! buffers, so any heap data must be owned by the payload itself (its drop
//! runs exactly once, at the final location).
//!
//! Type identity is a process-stable `u16` handed out by a global registry;
//! the registry also keeps a per-type vtable (in-place payload drop, type
//! name) so a router can destroy events whose type it never subscribed to.

use std::any::TypeId;
use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use static_assertions::const_assert_eq;

use hive_system::{ceil_cache_lines, CacheLine, Pipe, CACHE_LINE_BYTES};

use crate::id::ActorId;

bitflags! {
    /// Packed event state.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EventState: u32 {
        /// Set while the event is in flight; cleared upon delivery. A
        /// handler re-sets it (via `reply`/`forward`) to signal "I captured
        /// this event, do not destroy it".
        const ALIVE = 1 << 0;
        /// Cross-worker delivery must eventually succeed.
        const QOS = 1 << 1;
    }
}

/// Routing header at the front of every event.
#[repr(C)]
pub struct EventHeader {
    type_id: u16,
    bucket_size: u16,
    state: EventState,
    pub(crate) dest: ActorId,
    pub(crate) source: ActorId,
}

const_assert_eq!(std::mem::size_of::<EventHeader>(), 16);
const_assert_eq!(std::mem::align_of::<EventHeader>(), 4);

impl EventHeader {
    /// Stable id of the concrete payload type.
    #[inline]
    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    /// Size of the whole event in cache lines.
    #[inline]
    pub fn bucket_size(&self) -> u16 {
        self.bucket_size
    }

    #[inline]
    pub fn dest(&self) -> ActorId {
        self.dest
    }

    #[inline]
    pub fn source(&self) -> ActorId {
        self.source
    }

    #[inline]
    pub fn is_qos(&self) -> bool {
        self.state.contains(EventState::QOS)
    }

    /// Opt out of the delivery contract; such an event may still be
    /// retried, the flag only records the sender's requirement.
    #[inline]
    pub fn set_qos(&mut self, qos: bool) {
        self.state.set(EventState::QOS, qos);
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.state.contains(EventState::ALIVE)
    }

    #[inline]
    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.state.set(EventState::ALIVE, alive);
    }
}

/// A framed event: header plus typed payload, constructed in place inside a
/// cache-line buffer. Dereferences to the payload.
#[repr(C)]
pub struct Packet<T> {
    pub(crate) header: EventHeader,
    pub(crate) payload: T,
}

impl<T> Packet<T> {
    #[inline]
    pub fn source(&self) -> ActorId {
        self.header.source
    }

    #[inline]
    pub fn dest(&self) -> ActorId {
        self.header.dest
    }

    /// The routing header, for qos tweaks after a push.
    #[inline]
    pub fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }

    #[inline]
    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    /// Bytes between the end of the typed payload and the end of the
    /// event's cache-line frame. Non-empty after a `push_allocated`; the
    /// event's own code gives them meaning.
    #[inline]
    pub fn trailer(&self) -> &[u8] {
        let total = self.header.bucket_size as usize * CACHE_LINE_BYTES;
        let used = std::mem::size_of::<Packet<T>>();
        unsafe {
            std::slice::from_raw_parts((self as *const Self as *const u8).add(used), total - used)
        }
    }

    #[inline]
    pub fn trailer_mut(&mut self) -> &mut [u8] {
        let total = self.header.bucket_size as usize * CACHE_LINE_BYTES;
        let used = std::mem::size_of::<Packet<T>>();
        unsafe {
            std::slice::from_raw_parts_mut((self as *mut Self as *mut u8).add(used), total - used)
        }
    }
}

impl<T> Deref for Packet<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T> DerefMut for Packet<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.payload
    }
}

/// Cache lines occupied by a `Packet<T>` without trailer.
#[inline]
pub(crate) fn buckets_of<T>() -> u16 {
    ceil_cache_lines(std::mem::size_of::<Packet<T>>())
}

/// Construct a `Packet<T>` in place at `dst` (which must be the start of at
/// least `buckets` cache lines) with the default in-flight state.
///
/// # Safety
///
/// `dst` must be valid for writes of `buckets` cache lines and cache-line
/// aligned.
pub(crate) unsafe fn emplace<T: Send + 'static>(
    dst: *mut CacheLine,
    buckets: u16,
    dest: ActorId,
    source: ActorId,
    payload: T,
) -> *mut Packet<T> {
    debug_assert!(std::mem::align_of::<Packet<T>>() <= CACHE_LINE_BYTES);
    debug_assert!(buckets >= buckets_of::<T>());
    let p = dst as *mut Packet<T>;
    std::ptr::write(
        p,
        Packet {
            header: EventHeader {
                type_id: type_id::<T>(),
                bucket_size: buckets,
                state: EventState::ALIVE | EventState::QOS,
                dest,
                source,
            },
            payload,
        },
    );
    p
}

/// Construct a `Packet<T>` (plus `extra` trailer bytes) at the back of a
/// pipe and return a pointer into the pipe's storage.
pub(crate) fn push_into_pipe<T: Send + 'static>(
    pipe: &mut Pipe,
    dest: ActorId,
    source: ActorId,
    payload: T,
    extra: usize,
) -> *mut Packet<T> {
    let buckets = ceil_cache_lines(std::mem::size_of::<Packet<T>>() + extra);
    let dst = pipe.allocate_back(buckets as usize);
    unsafe { emplace(dst, buckets, dest, source, payload) }
}

/// Run the payload destructor of an event identified only by its wire type
/// id; used on paths that never subscribed to the type (flush drops).
pub(crate) unsafe fn destroy_by_type_id(ev: *mut EventHeader) {
    if let Some(vtable) = vtable_of((*ev).type_id()) {
        if vtable.needs_drop {
            (vtable.drop_in_place)(ev);
        }
    }
}

// ---------------------------------------------------------------------------
// Type registry
// ---------------------------------------------------------------------------

/// Per-type operations the runtime needs without knowing the type.
pub(crate) struct EventVtable {
    pub(crate) type_name: &'static str,
    pub(crate) needs_drop: bool,
    /// Runs the payload destructor in place; the header is plain data.
    pub(crate) drop_in_place: unsafe fn(*mut EventHeader),
}

struct Registry {
    ids: FxHashMap<TypeId, u16>,
    /// Indexed by `type_id - 1`.
    vtables: Vec<&'static EventVtable>,
}

static REGISTRY: std::sync::OnceLock<RwLock<Registry>> = std::sync::OnceLock::new();

fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| {
        RwLock::new(Registry {
            ids: FxHashMap::default(),
            vtables: Vec::new(),
        })
    })
}

unsafe fn drop_payload_in_place<T>(ev: *mut EventHeader) {
    let packet = ev as *mut Packet<T>;
    std::ptr::drop_in_place(std::ptr::addr_of_mut!((*packet).payload));
}

/// Process-stable id of `T`, assigned on first use. Consistent across every
/// router in the process.
pub fn type_id<T: 'static>() -> u16 {
    let key = TypeId::of::<T>();
    if let Some(&id) = registry().read().ids.get(&key) {
        return id;
    }

    let mut reg = registry().write();
    if let Some(&id) = reg.ids.get(&key) {
        return id;
    }
    assert!(reg.vtables.len() < u16::MAX as usize, "event type space exhausted");
    let vtable: &'static EventVtable = Box::leak(Box::new(EventVtable {
        type_name: std::any::type_name::<T>(),
        needs_drop: std::mem::needs_drop::<T>(),
        drop_in_place: drop_payload_in_place::<T>,
    }));
    reg.vtables.push(vtable);
    let id = reg.vtables.len() as u16;
    reg.ids.insert(key, id);
    id
}

/// Whether `id` names the concrete type `T`; the discovery helper used by
/// `RequireEvent` handlers.
#[inline]
pub fn is_type<T: 'static>(id: u16) -> bool {
    type_id::<T>() == id
}

/// Vtable lookup for a type id observed on the wire.
pub(crate) fn vtable_of(id: u16) -> Option<&'static EventVtable> {
    registry()
        .read()
        .vtables
        .get(id.wrapping_sub(1) as usize)
        .copied()
}

/// Vtable of `T`, registering it if needed.
pub(crate) fn vtable_for<T: 'static>() -> &'static EventVtable {
    let id = type_id::<T>();
    vtable_of(id).expect("type just registered")
}

// ---------------------------------------------------------------------------
// Built-in control events
// ---------------------------------------------------------------------------

/// Signals an actor to die; the default handler calls `kill()`.
#[derive(Clone, Copy, Debug)]
pub struct KillEvent;

/// Sent by the engine when the process receives an OS signal.
#[derive(Clone, Copy, Debug)]
pub struct SignalEvent {
    pub signum: i32,
}

/// Self-delivered to drop a periodic callback registration.
#[derive(Clone, Copy, Debug)]
pub struct UnregisterCallbackEvent;

/// Broadcast probe used by `require::<T>()`.
#[derive(Clone, Copy, Debug)]
pub struct PingEvent {
    pub type_id: u16,
}

/// Liveness reported in a [`RequireEvent`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActorStatus {
    Alive,
    Dead,
}

/// Reply to a [`PingEvent`], carrying the discovered actor's type id.
#[derive(Clone, Copy, Debug)]
pub struct RequireEvent {
    pub type_id: u16,
    pub status: ActorStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
