//! Actor traits and the per-dispatch capability surface.
//!
//! An actor is any `Send + 'static` type implementing [`Actor`]; it reacts
//! to an event type `E` by implementing [`Handle<E>`] and registering for it
//! with [`Context::register_event`]. Handlers run to completion on the
//! owning worker's thread and never suspend.
//!
//! Instead of an ambient thread-local pointing at the current worker, every
//! entry point (`on_init`, `on`, `on_callback`) receives a [`Context`]: a
//! short-lived view of the owning worker used to send events, manage
//! registrations, spawn referenced actors and schedule the actor's own
//! death. References obtained through a context never outlive the call.
//!
//! ## Built-in handlers
//!
//! Every actor is born subscribed to the control events:
//! [`KillEvent`](crate::event::KillEvent) kills it,
//! [`SignalEvent`](crate::event::SignalEvent) kills it on SIGINT,
//! [`UnregisterCallbackEvent`](crate::event::UnregisterCallbackEvent) drops
//! its callback registration, and [`PingEvent`](crate::event::PingEvent)
//! makes it answer `require::<T>()` probes for its own concrete type.
//! Registering an own handler for one of these replaces the default.

use std::any::Any;
use std::ptr::NonNull;

use crate::event::{
    self, ActorStatus, EventHeader, KillEvent, Packet, PingEvent, RequireEvent, SignalEvent,
    UnregisterCallbackEvent,
};
use crate::id::{ActorId, WorkerId};
use crate::router::{Registered, RouterOp};
use crate::worker::CoreState;

/// A unit of state owned by exactly one worker.
pub trait Actor: Send + 'static {
    /// Called once on the owning worker's thread before the actor receives
    /// anything. Register events and callbacks here. Returning `false`
    /// removes the actor; for a service actor it fails the whole engine.
    fn on_init(&mut self, _ctx: &mut Context<'_>) -> bool {
        true
    }
}

/// Reaction to one event type. Register with [`Context::register_event`].
pub trait Handle<E: Send + 'static>: Actor {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<E>);
}

/// Per-iteration callback capability. Register with
/// [`Context::register_callback`]; runs once per worker loop iteration,
/// after event delivery and before the outbound flush.
pub trait Callback: Actor {
    fn on_callback(&mut self, ctx: &mut Context<'_>);
}

// ---------------------------------------------------------------------------
// ActorCell
// ---------------------------------------------------------------------------

/// Object-safe shim over a concrete actor type.
pub(crate) trait ActorObj: Any + Send {
    fn init_dyn(&mut self, ctx: &mut Context<'_>) -> bool;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: Actor> ActorObj for A {
    fn init_dyn(&mut self, ctx: &mut Context<'_>) -> bool {
        self.on_init(ctx)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-actor bookkeeping owned by the worker. Boxed so registrations can
/// hold a stable pointer across actor-table rehashes.
pub(crate) struct ActorCell {
    pub(crate) id: ActorId,
    /// Type id of the concrete actor type, answered to `PingEvent` probes.
    pub(crate) type_tag: u16,
    pub(crate) type_name: &'static str,
    /// Strictly decreasing: once false, stays false.
    pub(crate) alive: bool,
    pub(crate) actor: Box<dyn ActorObj>,
}

impl ActorCell {
    pub(crate) fn new<A: Actor>(id: ActorId, actor: A) -> Box<ActorCell> {
        Box::new(ActorCell {
            id,
            type_tag: event::type_id::<A>(),
            type_name: std::any::type_name::<A>(),
            alive: true,
            actor: Box::new(actor),
        })
    }
}

// ---------------------------------------------------------------------------
// Invoke trampolines
// ---------------------------------------------------------------------------

pub(crate) unsafe fn invoke_handler<E: Send + 'static, A: Handle<E>>(
    cell: NonNull<ActorCell>,
    ev: *mut EventHeader,
    ctx: &mut Context<'_>,
) {
    let cell = cell.as_ptr();
    let actor = (*cell)
        .actor
        .as_any_mut()
        .downcast_mut::<A>()
        .expect("registration ties the actor type");
    actor.on(ctx, &mut *(ev as *mut Packet<E>));
}

pub(crate) type CallbackFn = unsafe fn(NonNull<ActorCell>, &mut Context<'_>);

pub(crate) unsafe fn invoke_callback<A: Callback>(cell: NonNull<ActorCell>, ctx: &mut Context<'_>) {
    let cell = cell.as_ptr();
    let actor = (*cell)
        .actor
        .as_any_mut()
        .downcast_mut::<A>()
        .expect("registration ties the actor type");
    actor.on_callback(ctx);
}

/// Callback-table entry.
#[derive(Clone, Copy)]
pub(crate) struct CallbackEntry {
    pub(crate) cell: NonNull<ActorCell>,
    pub(crate) invoke: CallbackFn,
}

// Built-in handlers work on the cell alone, no concrete actor type needed.

unsafe fn builtin_kill(_cell: NonNull<ActorCell>, _ev: *mut EventHeader, ctx: &mut Context<'_>) {
    ctx.kill();
}

unsafe fn builtin_signal(_cell: NonNull<ActorCell>, ev: *mut EventHeader, ctx: &mut Context<'_>) {
    let signal = &*(ev as *mut Packet<SignalEvent>);
    if signal.signum == sigint_signum() {
        ctx.kill();
    }
}

unsafe fn builtin_unregister_callback(
    _cell: NonNull<ActorCell>,
    _ev: *mut EventHeader,
    ctx: &mut Context<'_>,
) {
    ctx.unregister_callback();
}

unsafe fn builtin_ping(cell: NonNull<ActorCell>, ev: *mut EventHeader, ctx: &mut Context<'_>) {
    let ping = &*(ev as *mut Packet<PingEvent>);
    if ping.type_id == (*cell.as_ptr()).type_tag {
        let requester = ping.source();
        let type_id = ping.type_id;
        ctx.send(
            requester,
            RequireEvent {
                type_id,
                status: ActorStatus::Alive,
            },
        );
    }
}

#[cfg(unix)]
pub(crate) fn sigint_signum() -> i32 {
    libc::SIGINT
}

#[cfg(not(unix))]
pub(crate) fn sigint_signum() -> i32 {
    2
}

/// Queue the four built-in subscriptions for a freshly created cell.
pub(crate) fn queue_builtin_registrations(ops: &mut Vec<RouterOp>, cell: NonNull<ActorCell>) {
    let id = unsafe { (*cell.as_ptr()).id };
    ops.push(RouterOp::Subscribe {
        type_id: event::type_id::<KillEvent>(),
        vtable: event::vtable_for::<KillEvent>(),
        actor: id,
        registered: Registered {
            cell,
            invoke: builtin_kill,
        },
    });
    ops.push(RouterOp::Subscribe {
        type_id: event::type_id::<SignalEvent>(),
        vtable: event::vtable_for::<SignalEvent>(),
        actor: id,
        registered: Registered {
            cell,
            invoke: builtin_signal,
        },
    });
    ops.push(RouterOp::Subscribe {
        type_id: event::type_id::<UnregisterCallbackEvent>(),
        vtable: event::vtable_for::<UnregisterCallbackEvent>(),
        actor: id,
        registered: Registered {
            cell,
            invoke: builtin_unregister_callback,
        },
    });
    ops.push(RouterOp::Subscribe {
        type_id: event::type_id::<PingEvent>(),
        vtable: event::vtable_for::<PingEvent>(),
        actor: id,
        registered: Registered {
            cell,
            invoke: builtin_ping,
        },
    });
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Capability surface handed to every actor entry point.
///
/// Lives for the duration of one `on_init`/`on`/`on_callback` call and
/// borrows the owning worker's communication state. All sends are staged in
/// per-destination pipes and flushed at the end of the worker's loop
/// iteration; pushes to the same destination within one iteration are
/// delivered in push order.
pub struct Context<'a> {
    pub(crate) core: &'a mut CoreState,
    pub(crate) current: ActorId,
    pub(crate) cell: NonNull<ActorCell>,
}

impl<'a> Context<'a> {
    /// Point the context at the actor about to be invoked.
    #[inline]
    pub(crate) fn set_current(&mut self, cell: NonNull<ActorCell>) {
        self.cell = cell;
        self.current = unsafe { (*cell.as_ptr()).id };
    }

    /// The current actor's id.
    #[inline]
    pub fn id(&self) -> ActorId {
        self.current
    }

    /// Index of the owning worker.
    #[inline]
    pub fn worker_index(&self) -> WorkerId {
        self.core.index
    }

    /// Workers the engine runs on, in dense order.
    pub fn core_set(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.core.shared.core_set.workers()
    }

    /// Monotonic nanoseconds, cached once per worker iteration.
    #[inline]
    pub fn time(&self) -> u64 {
        self.core.time_ns
    }

    /// False once `kill()` ran.
    #[inline]
    pub fn is_alive(&self) -> bool {
        unsafe { (*self.cell.as_ptr()).alive }
    }

    /// Schedule the current actor for removal at the end of this iteration.
    /// Events already routed in this iteration are still delivered.
    pub fn kill(&mut self) {
        unsafe { (*self.cell.as_ptr()).alive = false };
        self.core.pending_kill.insert(self.current);
    }

    // -- registrations ------------------------------------------------------

    /// Subscribe the current actor to `E`. The actor reference is only used
    /// to name the concrete type: `ctx.register_event::<MyEvent, _>(self)`.
    /// Takes effect once the current dispatch returns; re-registering
    /// replaces the previous handler.
    pub fn register_event<E: Send + 'static, A: Handle<E>>(&mut self, _actor: &A) {
        self.core.router_ops.push(RouterOp::Subscribe {
            type_id: event::type_id::<E>(),
            vtable: event::vtable_for::<E>(),
            actor: self.current,
            registered: Registered {
                cell: self.cell,
                invoke: invoke_handler::<E, A>,
            },
        });
    }

    /// Drop the current actor's subscription to `E`.
    pub fn unregister_event<E: Send + 'static>(&mut self) {
        self.core.router_ops.push(RouterOp::Unsubscribe {
            type_id: event::type_id::<E>(),
            actor: self.current,
        });
    }

    /// Register the current actor's [`Callback`], invoked once per worker
    /// iteration after event delivery.
    pub fn register_callback<A: Callback>(&mut self, _actor: &A) {
        self.core.callbacks.insert(
            self.current,
            CallbackEntry {
                cell: self.cell,
                invoke: invoke_callback::<A>,
            },
        );
    }

    /// Remove the current actor from the worker's callback list.
    pub fn unregister_callback(&mut self) {
        self.core.callbacks.remove(&self.current);
    }

    // -- sending ------------------------------------------------------------

    /// Append an event to the per-destination pipe and return it for field
    /// tweaks. Events pushed to the same destination in one iteration are
    /// delivered in push order.
    pub fn push<E: Send + 'static>(&mut self, dest: ActorId, payload: E) -> &mut Packet<E> {
        unsafe { &mut *self.core.push_event(dest, self.current, payload, 0) }
    }

    /// Like [`push`](Context::push) with `extra` trailer bytes appended to
    /// the event's frame; interpret them through
    /// [`Packet::trailer_mut`](crate::event::Packet::trailer_mut).
    pub fn push_allocated<E: Send + 'static>(
        &mut self,
        dest: ActorId,
        extra: usize,
        payload: E,
    ) -> &mut Packet<E> {
        unsafe { &mut *self.core.push_event(dest, self.current, payload, extra) }
    }

    /// Fire-and-forget: tries the destination inbox immediately and falls
    /// back to the pipe. No ordering promise relative to other sends.
    pub fn send<E: Send + 'static>(&mut self, dest: ActorId, payload: E) {
        self.core.send_event(dest, self.current, payload);
    }

    /// Send a received event back to its source, payload untouched. The
    /// event must not be used after this call; the router will not destroy
    /// it. Broadcast events cannot be replied to.
    pub fn reply<E: Send + 'static>(&mut self, event: &mut Packet<E>) {
        if event.dest().is_broadcast() {
            log::warn!("{} cannot reply to broadcast event", self.current);
            return;
        }
        let header = &mut event.header;
        std::mem::swap(&mut header.dest, &mut header.source);
        header.set_alive(true);
        let ev = event as *mut Packet<E> as *const EventHeader;
        unsafe { self.core.send_raw(ev) };
    }

    /// Re-target a received event to `dest`, with the current actor as the
    /// new source. Same restrictions as [`reply`](Context::reply).
    pub fn forward<E: Send + 'static>(&mut self, dest: ActorId, event: &mut Packet<E>) {
        if event.dest().is_broadcast() {
            log::warn!("{} cannot forward broadcast event", self.current);
            return;
        }
        let header = &mut event.header;
        header.dest = dest;
        header.source = self.current;
        header.set_alive(true);
        let ev = event as *mut Packet<E> as *const EventHeader;
        unsafe { self.core.send_raw(ev) };
    }

    /// Chained pushes to one destination:
    /// `ctx.to(dest).push::<A>(..).push::<B>(..)`.
    pub fn to(&mut self, dest: ActorId) -> EventBuilder<'_, 'a> {
        EventBuilder { ctx: self, dest }
    }

    /// Direct handle on the outbound pipe for `dest`, for repeated pushes
    /// or trailer-carrying events.
    pub fn pipe(&mut self, dest: ActorId) -> ProxyPipe<'_> {
        let source = self.current;
        let idx = self.core.resolve_or_self(dest);
        ProxyPipe {
            pipe: &mut self.core.pipes[idx],
            dest,
            source,
        }
    }

    /// Discover every actor of concrete type `T` in the engine: broadcasts
    /// a [`PingEvent`]; each `T` replies with a [`RequireEvent`]. Register
    /// for `RequireEvent` to collect the discovered ids.
    pub fn require<T: 'static>(&mut self) {
        let probe = event::type_id::<T>();
        let workers: Vec<WorkerId> = self.core.shared.core_set.workers().collect();
        for worker in workers {
            let dest = ActorId::broadcast(worker);
            self.core
                .push_event(dest, self.current, PingEvent { type_id: probe }, 0);
        }
    }

    // -- referenced actors --------------------------------------------------

    /// Construct another actor on the same worker, run its `on_init`, and
    /// return its id plus a direct reference for zero-copy synchronous
    /// calls. The reference lives only for the current dispatch; re-borrow
    /// later with [`actor_mut`](Context::actor_mut).
    pub fn add_ref_actor<A: Actor>(&mut self, actor: A) -> Option<(ActorId, &mut A)> {
        let sid = self.core.ids.allocate()?;
        let id = ActorId::new(sid, self.core.index);

        let mut cell = ActorCell::new(id, actor);
        let cell_ptr = NonNull::from(&mut *cell);
        self.core.actors.insert(id, cell);
        queue_builtin_registrations(&mut self.core.router_ops, cell_ptr);

        let ok = unsafe {
            let mut sub = Context {
                core: &mut *self.core,
                current: id,
                cell: cell_ptr,
            };
            (*cell_ptr.as_ptr()).actor.init_dyn(&mut sub)
        };
        if !ok {
            log::error!(
                "Actor[{}]({}) failed to init",
                unsafe { (*cell_ptr.as_ptr()).type_name },
                id
            );
            self.core.router_ops.push(RouterOp::UnsubscribeAll { actor: id });
            self.core.actors.remove(&id);
            self.core.ids.release(sid);
            return None;
        }
        log::info!(
            "New Actor[{}]({})",
            unsafe { (*cell_ptr.as_ptr()).type_name },
            id
        );
        // The cell is heap-pinned; shorten the raw borrow to 'self.
        let actor = unsafe {
            (*cell_ptr.as_ptr())
                .actor
                .as_any_mut()
                .downcast_mut::<A>()
                .expect("cell holds the type just inserted")
        };
        Some((id, unsafe { &mut *(actor as *mut A) }))
    }

    /// Direct mutable access to another actor on this worker (typically a
    /// referenced actor created earlier). The current actor itself cannot
    /// be re-borrowed this way.
    pub fn actor_mut<A: Actor>(&mut self, id: ActorId) -> Option<&mut A> {
        if id == self.current {
            return None;
        }
        self.core
            .actors
            .get_mut(&id)
            .and_then(|cell| cell.actor.as_any_mut().downcast_mut::<A>())
    }
}

// ---------------------------------------------------------------------------
// EventBuilder / ProxyPipe
// ---------------------------------------------------------------------------

/// Chained-push helper returned by [`Context::to`]. All events pushed
/// through one builder go to the same destination and arrive in push order.
pub struct EventBuilder<'c, 'a> {
    ctx: &'c mut Context<'a>,
    dest: ActorId,
}

impl<'c, 'a> EventBuilder<'c, 'a> {
    pub fn push<E: Send + 'static>(self, payload: E) -> Self {
        self.ctx
            .core
            .push_event(self.dest, self.ctx.current, payload, 0);
        self
    }

    pub fn dest(&self) -> ActorId {
        self.dest
    }
}

/// Direct handle on one outbound pipe, obtained with [`Context::pipe`].
pub struct ProxyPipe<'a> {
    pipe: &'a mut hive_system::Pipe,
    dest: ActorId,
    source: ActorId,
}

impl<'a> ProxyPipe<'a> {
    pub fn push<E: Send + 'static>(&mut self, payload: E) -> &mut Packet<E> {
        unsafe { &mut *event::push_into_pipe(self.pipe, self.dest, self.source, payload, 0) }
    }

    /// Push with `extra` trailer bytes in the event frame.
    pub fn push_allocated<E: Send + 'static>(&mut self, extra: usize, payload: E) -> &mut Packet<E> {
        unsafe { &mut *event::push_into_pipe(self.pipe, self.dest, self.source, payload, extra) }
    }

    pub fn dest(&self) -> ActorId {
        self.dest
    }

    pub fn source(&self) -> ActorId {
        self.source
    }
}

