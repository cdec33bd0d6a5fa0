//! The per-core worker (virtual core).
//!
//! A worker owns its actors outright: their state is never touched from any
//! other thread. Each loop iteration flushes the outbound pipes into the
//! destination inboxes, drains its own inbox and self-pipe through the
//! router, fires registered callbacks, removes killed actors, then runs the
//! idle policy. The loop ends when the actor table is empty.
//!
//! Cross-worker saturation is resolved by the flush deadlock-breaker: a
//! worker that cannot enqueue raises its own flag, and spins; if another
//! blocked worker clears that flag, the worker accepts a partial flush and
//! keeps the unsent suffix for the next iteration. No event is dropped, the
//! cost is latency while saturated.

use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};

use hive_system::{cpu, timestamp, CacheLine, Pipe};

use crate::actor::{
    queue_builtin_registrations, sigint_signum, Actor, ActorCell, CallbackEntry, Context,
};
use crate::engine::{self, SharedCores, BAD_INIT};
use crate::event::{self, EventHeader, Packet, SignalEvent};
use crate::id::{ActorId, IdPool, ServiceId, WorkerId, NB_RESERVED_SERVICE_IDS};
use crate::router::{Router, RouterOp};

/// Spin iterations before the idle policy escalates past a pause hint.
const IDLE_SPIN_LIMIT: u32 = 64;

/// How long an idle worker parks on its inbox per attempt. Bounds the
/// wakeup latency when a producer's notification races the park.
const IDLE_PARK: Duration = Duration::from_micros(200);

/// Per-worker event counters, readable through the engine after `join()`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CoreMetrics {
    /// Events handed to a destination inbox (or retried successfully).
    pub nb_event_sent: u64,
    /// Enqueue attempts, including retries against a full ring.
    pub nb_event_sent_try: u64,
    /// Cache lines successfully sent cross-worker.
    pub nb_bucket_sent: u64,
    /// Events routed on this worker (self and cross-worker).
    pub nb_event_received: u64,
    /// Cache lines routed on this worker.
    pub nb_bucket_received: u64,
    /// Times the worker parked on its inbox.
    pub nb_sleep: u64,
}

// ---------------------------------------------------------------------------
// CoreState
// ---------------------------------------------------------------------------

/// Everything a [`Context`] needs: the communication and bookkeeping state
/// of one worker, separated from the router so dispatch can borrow both
/// disjointly.
pub(crate) struct CoreState {
    pub(crate) index: WorkerId,
    pub(crate) resolved: usize,
    pub(crate) shared: Arc<SharedCores>,
    pub(crate) ids: IdPool,
    pub(crate) actors: FxHashMap<ActorId, Box<ActorCell>>,
    /// Actor ids in construction order, for deterministic `on_init`.
    pub(crate) init_order: Vec<ActorId>,
    pub(crate) callbacks: FxHashMap<ActorId, CallbackEntry>,
    pub(crate) pending_kill: FxHashSet<ActorId>,
    /// One outbound pipe per worker in dense order; the self entry stages
    /// same-worker deliveries.
    pub(crate) pipes: Vec<Pipe>,
    /// Staging area for typed `send` construction before the direct enqueue
    /// attempt.
    pub(crate) scratch_out: Pipe,
    /// Router mutations queued by handlers, applied between dispatches.
    pub(crate) router_ops: Vec<RouterOp>,
    pub(crate) metrics: CoreMetrics,
    pub(crate) time_ns: u64,
}

impl CoreState {
    /// Dense index for an event destination. An address outside the core
    /// set falls back to the self pipe so the router reports it
    /// undeliverable instead of the send path crashing.
    pub(crate) fn resolve_or_self(&self, dest: ActorId) -> usize {
        match self.shared.core_set.resolve(dest.worker()) {
            Some(idx) => idx,
            None => self.resolved,
        }
    }

    /// Construct an event in the pipe for `dest`'s worker.
    pub(crate) fn push_event<E: Send + 'static>(
        &mut self,
        dest: ActorId,
        source: ActorId,
        payload: E,
        extra: usize,
    ) -> *mut Packet<E> {
        let idx = self.resolve_or_self(dest);
        event::push_into_pipe(&mut self.pipes[idx], dest, source, payload, extra)
    }

    /// Typed fire-and-forget: construct in the staging pipe, try the
    /// destination inbox directly, fall back to the outbound pipe.
    pub(crate) fn send_event<E: Send + 'static>(
        &mut self,
        dest: ActorId,
        source: ActorId,
        payload: E,
    ) {
        self.scratch_out.reset();
        let packet = event::push_into_pipe(&mut self.scratch_out, dest, source, payload, 0);
        unsafe { self.send_raw(packet as *const EventHeader) };
    }

    /// Route an already-formed event: same-worker events go through the
    /// self pipe, cross-worker events try the inbox and fall back to the
    /// outbound pipe on a full ring.
    ///
    /// # Safety
    ///
    /// `ev` must point at a complete framed event outside this worker's
    /// outbound pipes.
    pub(crate) unsafe fn send_raw(&mut self, ev: *const EventHeader) {
        let dest = (*ev).dest();
        let buckets = (*ev).bucket_size() as usize;
        let lines = ev as *const CacheLine;
        let idx = self.resolve_or_self(dest);

        if idx == self.resolved {
            self.pipes[idx].recycle(lines, buckets);
            return;
        }
        self.metrics.nb_event_sent_try += 1;
        if self.shared.mailboxes[idx].enqueue(lines, buckets) {
            self.metrics.nb_event_sent += 1;
            self.metrics.nb_bucket_sent += buckets as u64;
        } else {
            self.pipes[idx].recycle(lines, buckets);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) struct Worker {
    state: CoreState,
    router: Router,
    /// Double buffer swapped with the self pipe each receive, so handlers
    /// can push new self events while the previous batch is routed.
    mono_pipe: Pipe,
    /// Inbox drain staging; as large as the ring so a drain never truncates
    /// an event.
    inbox_scratch: Box<[CacheLine]>,
    cb_scratch: Vec<ActorId>,
    kill_scratch: Vec<ActorId>,
    /// Whether the stop broadcast was already delivered.
    signalled: bool,
    spin: u32,
}

// Safety: the worker is moved onto its own OS thread before it runs; all
// raw cell pointers it carries target boxes owned by its own actor table
// and are never shared with another thread.
unsafe impl Send for Worker {}

impl Worker {
    pub(crate) fn new(index: WorkerId, resolved: usize, shared: Arc<SharedCores>) -> Self {
        let nb_workers = shared.core_set.len();
        let ring_lines = shared.mailboxes[resolved].capacity();
        Worker {
            state: CoreState {
                index,
                resolved,
                shared,
                ids: IdPool::new(),
                actors: FxHashMap::default(),
                init_order: Vec::new(),
                callbacks: FxHashMap::default(),
                pending_kill: FxHashSet::default(),
                pipes: (0..nb_workers).map(|_| Pipe::new()).collect(),
                scratch_out: Pipe::new(),
                router_ops: Vec::new(),
                metrics: CoreMetrics::default(),
                time_ns: 0,
            },
            router: Router::new(),
            mono_pipe: Pipe::new(),
            inbox_scratch: vec![CacheLine::ZERO; ring_lines].into_boxed_slice(),
            cb_scratch: Vec::new(),
            kill_scratch: Vec::new(),
            signalled: false,
            spin: 0,
        }
    }

    pub(crate) fn index(&self) -> WorkerId {
        self.state.index
    }

    /// Install an actor pre-start (or pre-init). `sid` fixes a reserved
    /// service slot; `None` draws from the free pool. Returns `NOT_FOUND`
    /// on pool exhaustion or a duplicate service id.
    pub(crate) fn add_actor<A: Actor>(&mut self, sid: Option<ServiceId>, actor: A) -> ActorId {
        let (sid, pooled) = match sid {
            Some(s) => (s, false),
            None => match self.state.ids.allocate() {
                Some(s) => (s, true),
                None => {
                    log::error!("VirtualCore({}) actor id pool exhausted", self.state.index);
                    return ActorId::NOT_FOUND;
                }
            },
        };
        let id = ActorId::new(sid, self.state.index);
        if self.state.actors.contains_key(&id) {
            log::error!("cannot add service actor {} multiple times", id);
            if pooled {
                self.state.ids.release(sid);
            }
            return ActorId::NOT_FOUND;
        }

        let mut cell = ActorCell::new(id, actor);
        let cell_ptr = NonNull::from(&mut *cell);
        log::info!("New Actor[{}]({})", cell.type_name, id);
        self.state.actors.insert(id, cell);
        self.state.init_order.push(id);
        queue_builtin_registrations(&mut self.state.router_ops, cell_ptr);
        self.apply_router_ops();
        id
    }

    fn apply_router_ops(&mut self) {
        if !self.state.router_ops.is_empty() {
            self.router.apply(&mut self.state.router_ops);
        }
    }

    fn remove_actor(&mut self, id: ActorId) {
        let mut ops = vec![RouterOp::UnsubscribeAll { actor: id }];
        self.router.apply(&mut ops);
        self.state.callbacks.remove(&id);
        if let Some(cell) = self.state.actors.remove(&id) {
            log::info!("Delete Actor[{}]({})", cell.type_name, id);
            drop(cell);
            self.state.ids.release(id.service_id());
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Thread entry point: pin, init, barrier, main loop, drain.
    pub(crate) fn run(mut self) {
        let shared = self.state.shared.clone();
        cpu::pin_current_thread(self.state.index as usize);
        self.state.pending_kill.reserve(self.state.actors.len());
        self.state.time_ns = timestamp::now_nanos();

        let init_ok =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.init_actors())).unwrap_or(false);

        let total = shared.core_set.len() as u64;
        if init_ok {
            shared.sync_start.fetch_add(1, Ordering::AcqRel);
        } else {
            log::error!("VirtualCore({}) init failed", self.state.index);
            shared.sync_start.fetch_add(BAD_INIT + 1, Ordering::AcqRel);
        }
        // Startup barrier: all workers reach "ready" before user code runs.
        let failed = loop {
            let s = shared.sync_start.load(Ordering::Acquire);
            if s >= BAD_INIT {
                break true;
            }
            if s >= total {
                break false;
            }
            std::thread::yield_now();
        };

        if !failed {
            log::info!(
                "VirtualCore({}) init success, {} actor(s)",
                self.state.index,
                self.state.actors.len()
            );
            self.workflow();
            log::info!("VirtualCore({}) stopped normally", self.state.index);
        }

        shared.done[self.state.resolved].store(true, Ordering::Release);
        *shared.final_metrics[self.state.resolved].lock() = self.state.metrics;
    }

    /// `on_init` every actor in construction order. An ordinary actor that
    /// fails is removed; a failing service actor fails the whole engine.
    fn init_actors(&mut self) -> bool {
        let order = std::mem::take(&mut self.state.init_order);
        for id in &order {
            let Some(cell) = self.state.actors.get_mut(id) else {
                continue;
            };
            let cell_ptr = NonNull::from(&mut **cell);
            let ok = unsafe {
                let mut ctx = Context {
                    core: &mut self.state,
                    current: *id,
                    cell: cell_ptr,
                };
                (*cell_ptr.as_ptr()).actor.init_dyn(&mut ctx)
            };
            self.apply_router_ops();
            if !ok {
                let name = unsafe { (*cell_ptr.as_ptr()).type_name };
                log::error!("Actor[{}]({}) failed to init", name, id);
                self.remove_actor(*id);
                if id.service_id() <= NB_RESERVED_SERVICE_IDS {
                    return false;
                }
            }
        }
        true
    }

    /// The main loop: time, flush, receive, kills, callbacks, kills, idle;
    /// followed by the residual drain.
    fn workflow(&mut self) {
        // A worker with nothing to run exits immediately; the loop below
        // only ends through actor removal.
        if self.state.actors.is_empty() {
            return;
        }
        let shared = self.state.shared.clone();
        loop {
            self.state.time_ns = timestamp::now_nanos();

            if !self.signalled
                && (shared.stop.load(Ordering::Relaxed) || engine::sigint_received())
            {
                self.signalled = true;
                self.state.push_event(
                    ActorId::broadcast(self.state.index),
                    ActorId::NOT_FOUND,
                    SignalEvent {
                        signum: sigint_signum(),
                    },
                    0,
                );
            }

            self.flush_all();
            let received = self.receive();

            if !self.state.pending_kill.is_empty() {
                if self.remove_dead() {
                    break;
                }
            } else {
                self.run_callbacks();
                if !self.state.pending_kill.is_empty() && self.remove_dead() {
                    break;
                }
            }

            self.idle(received);
        }

        // Drain: ship residual outbound events, swallow residual inbound
        // ones (all actors are gone, the router reports them).
        loop {
            self.receive();
            if !self.flush_all() {
                break;
            }
        }
    }

    // -- receive ------------------------------------------------------------

    /// Deliver self-pipe events, then drain the inbox. Returns the number
    /// of events routed.
    fn receive(&mut self) -> usize {
        let mut count = 0;

        // Same-worker events: swap the staged pipe out, route, reset.
        self.mono_pipe.swap(&mut self.state.pipes[self.state.resolved]);
        if !self.mono_pipe.is_empty() {
            let begin = self.mono_pipe.begin();
            let n = self.mono_pipe.len();
            let base = self.mono_pipe.at_mut(begin);
            count += route_buffer(&mut self.router, &mut self.state, base, n);
            self.mono_pipe.reset();
        }

        // Cross-worker events.
        let shared = self.state.shared.clone();
        let ring = &shared.mailboxes[self.state.resolved];
        let router = &mut self.router;
        let state = &mut self.state;
        let scratch = &mut self.inbox_scratch;
        let max = scratch.len();
        ring.dequeue(scratch, max, |buf| {
            count += route_buffer(router, state, buf.as_mut_ptr(), buf.len());
        });
        count
    }

    // -- flush / deadlock avoidance ----------------------------------------

    /// Push every outbound pipe into its destination inbox. Returns whether
    /// any pipe had events. Events are always retried on a full ring; the
    /// deadlock flags let mutually saturated workers accept a partial flush
    /// instead of spinning forever.
    fn flush_all(&mut self) -> bool {
        let shared = self.state.shared.clone();
        let own_flag = &shared.deadlock[self.state.resolved];
        let mut any = false;

        'pipes: for d in 0..self.state.pipes.len() {
            if d == self.state.resolved || self.state.pipes[d].is_empty() {
                continue;
            }
            any = true;
            let ring = &shared.mailboxes[d];

            let mut i = self.state.pipes[d].begin();
            let end = self.state.pipes[d].end();
            while i < end {
                let ev = self.state.pipes[d].at(i) as *const EventHeader;
                let buckets = unsafe { (*ev).bucket_size() } as usize;
                if buckets == 0 || i + buckets > end {
                    log::error!(
                        "VirtualCore({}) corrupt outbound frame for worker slot {}",
                        self.state.index,
                        d
                    );
                    break;
                }
                let lines = ev as *const CacheLine;

                self.state.metrics.nb_event_sent_try += 1;
                if !unsafe { ring.enqueue(lines, buckets) } {
                    if buckets > ring.capacity() {
                        log::error!(
                            "event of {} cache lines exceeds inbox capacity {}, dropped",
                            buckets,
                            ring.capacity()
                        );
                        unsafe { event::destroy_by_type_id(ev as *mut EventHeader) };
                        i += buckets;
                        continue;
                    }
                    if shared.done[d].load(Ordering::Acquire) {
                        log::warn!("destination worker slot {} has stopped, event dropped", d);
                        unsafe { event::destroy_by_type_id(ev as *mut EventHeader) };
                        i += buckets;
                        continue;
                    }

                    // Mark this worker as blocking, then retry. Another
                    // blocked worker clearing our flag means "accept a
                    // partial flush so I can make progress".
                    own_flag.store(true, Ordering::Release);
                    let blocked = loop {
                        self.state.metrics.nb_event_sent_try += 1;
                        if unsafe { ring.enqueue(lines, buckets) } {
                            break false;
                        }
                        if shared.done[d].load(Ordering::Acquire) {
                            break true;
                        }
                        if own_flag.load(Ordering::Acquire) {
                            shared.deadlock[d].store(false, Ordering::Release);
                        } else {
                            break true;
                        }
                    };
                    if blocked {
                        if shared.done[d].load(Ordering::Acquire) {
                            log::warn!(
                                "destination worker slot {} has stopped, event dropped",
                                d
                            );
                            unsafe { event::destroy_by_type_id(ev as *mut EventHeader) };
                            i += buckets;
                            continue;
                        }
                        // Partial flush: keep [i, end) for the next pass.
                        self.state.pipes[d].reset_to(i);
                        continue 'pipes;
                    }
                }

                self.state.metrics.nb_event_sent += 1;
                self.state.metrics.nb_bucket_sent += buckets as u64;
                i += buckets;
            }
            self.state.pipes[d].reset();
        }
        any
    }

    // -- callbacks / removal ------------------------------------------------

    fn run_callbacks(&mut self) {
        self.cb_scratch.clear();
        self.cb_scratch.extend(self.state.callbacks.keys().copied());
        for n in 0..self.cb_scratch.len() {
            let id = self.cb_scratch[n];
            // May have been unregistered by an earlier callback.
            let Some(entry) = self.state.callbacks.get(&id) else {
                continue;
            };
            let (cell, invoke) = (entry.cell, entry.invoke);
            let mut ctx = Context {
                core: &mut self.state,
                current: id,
                cell,
            };
            unsafe { invoke(cell, &mut ctx) };
            self.apply_router_ops();
        }
    }

    /// Remove every killed actor; true when the actor table is empty.
    fn remove_dead(&mut self) -> bool {
        self.kill_scratch.clear();
        self.kill_scratch.extend(self.state.pending_kill.drain());
        for n in 0..self.kill_scratch.len() {
            let id = self.kill_scratch[n];
            self.remove_actor(id);
        }
        self.state.actors.is_empty()
    }

    // -- idle ---------------------------------------------------------------

    /// Spin briefly, then park on the inbox when nothing local can make
    /// progress. Callback-driven actors keep the worker unparked.
    fn idle(&mut self, received: usize) {
        if received > 0 {
            self.spin = 0;
            return;
        }
        self.spin += 1;
        if self.spin < IDLE_SPIN_LIMIT {
            std::hint::spin_loop();
            return;
        }
        let outbound_pending = self.state.pipes.iter().any(|p| !p.is_empty());
        if self.state.callbacks.is_empty() && !outbound_pending {
            self.state.metrics.nb_sleep += 1;
            let shared = self.state.shared.clone();
            shared.mailboxes[self.state.resolved].wait(IDLE_PARK);
        } else {
            std::thread::yield_now();
        }
    }
}

// ---------------------------------------------------------------------------
// Event walk
// ---------------------------------------------------------------------------

/// Walk a buffer of framed events and route each one. Router mutations
/// queued by handlers apply between events, so a registration made while
/// handling event `n` can receive event `n + 1` of the same drain.
fn route_buffer(
    router: &mut Router,
    state: &mut CoreState,
    buf: *mut CacheLine,
    n_lines: usize,
) -> usize {
    let mut i = 0;
    let mut count = 0;
    while i < n_lines {
        let ev = unsafe { buf.add(i) } as *mut EventHeader;
        let buckets = unsafe { (*ev).bucket_size() } as usize;
        if buckets == 0 || i + buckets > n_lines {
            log::error!(
                "VirtualCore({}) corrupt inbound frame at line {}/{}",
                state.index,
                i,
                n_lines
            );
            break;
        }
        unsafe {
            // Cleared upon delivery; a handler re-sets it to keep the event.
            (*ev).set_alive(false);
            let mut ctx = Context {
                core: &mut *state,
                current: ActorId::NOT_FOUND,
                cell: NonNull::dangling(),
            };
            router.route(ev, &mut ctx);
        }
        router.apply(&mut state.router_ops);
        state.metrics.nb_event_received += 1;
        state.metrics.nb_bucket_received += buckets as u64;
        count += 1;
        i += buckets;
    }
    count
}
