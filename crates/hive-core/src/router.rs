//! Per-worker event dispatch.
//!
//! Two-level table: event type id, then destination actor id, mapping to a
//! type-erased handler. Each registration pairs a raw pointer to the actor's
//! cell with a monomorphic invoke function that downcasts both the actor and
//! the event to their concrete types.
//!
//! The router owns no event memory. After the handler(s) return it runs the
//! event's payload destructor in place exactly once, unless a handler set
//! the alive bit back (`reply`/`forward`) to take the event over. Broadcast
//! fan-out iterates the inner table and destroys once at the end.
//!
//! Handlers cannot mutate the table mid-dispatch: subscription changes made
//! from inside a handler are queued as [`RouterOp`]s and applied by the
//! worker between events.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::actor::{ActorCell, Context};
use crate::event::{self, EventHeader, EventVtable};
use crate::id::ActorId;

/// Monomorphic trampoline generated per `(event type, actor type)` pair.
pub(crate) type InvokeFn = unsafe fn(NonNull<ActorCell>, *mut EventHeader, &mut Context<'_>);

/// One subscription: the actor's cell and its trampoline.
#[derive(Clone, Copy)]
pub(crate) struct Registered {
    pub(crate) cell: NonNull<ActorCell>,
    pub(crate) invoke: InvokeFn,
}

struct TypeRoute {
    vtable: &'static EventVtable,
    handlers: FxHashMap<ActorId, Registered>,
}

/// Deferred table mutation, applied by the worker between dispatches.
pub(crate) enum RouterOp {
    Subscribe {
        type_id: u16,
        vtable: &'static EventVtable,
        actor: ActorId,
        registered: Registered,
    },
    Unsubscribe {
        type_id: u16,
        actor: ActorId,
    },
    UnsubscribeAll {
        actor: ActorId,
    },
}

pub(crate) struct Router {
    routes: FxHashMap<u16, TypeRoute>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Router {
            routes: FxHashMap::default(),
        }
    }

    /// Apply queued subscription changes.
    pub(crate) fn apply(&mut self, ops: &mut Vec<RouterOp>) {
        for op in ops.drain(..) {
            match op {
                RouterOp::Subscribe {
                    type_id,
                    vtable,
                    actor,
                    registered,
                } => {
                    let route = self.routes.entry(type_id).or_insert_with(|| TypeRoute {
                        vtable,
                        handlers: FxHashMap::default(),
                    });
                    // Re-subscribing replaces the previous entry.
                    route.handlers.insert(actor, registered);
                }
                RouterOp::Unsubscribe { type_id, actor } => {
                    if let Some(route) = self.routes.get_mut(&type_id) {
                        route.handlers.remove(&actor);
                    }
                }
                RouterOp::UnsubscribeAll { actor } => {
                    for route in self.routes.values_mut() {
                        route.handlers.remove(&actor);
                    }
                }
            }
        }
    }

    /// Dispatch one received event. The alive bit has already been cleared
    /// by the receive path; a handler that re-sets it keeps the event.
    ///
    /// # Safety
    ///
    /// `ev` must point at a complete, correctly framed event that stays
    /// valid for the duration of the call.
    pub(crate) unsafe fn route(&self, ev: *mut EventHeader, ctx: &mut Context<'_>) {
        let type_id = (*ev).type_id();
        let dest = (*ev).dest();

        match self.routes.get(&type_id) {
            Some(route) => {
                if dest.is_broadcast() {
                    for registered in route.handlers.values() {
                        ctx.set_current(registered.cell);
                        (registered.invoke)(registered.cell, ev, ctx);
                    }
                    // Destroyed once, never per handler.
                    if !(*ev).is_alive() {
                        destroy(route.vtable, ev);
                    }
                } else {
                    match route.handlers.get(&dest) {
                        Some(registered) => {
                            ctx.set_current(registered.cell);
                            (registered.invoke)(registered.cell, ev, ctx);
                            if !(*ev).is_alive() {
                                destroy(route.vtable, ev);
                            }
                        }
                        None => {
                            log::warn!(
                                "failed to deliver event[{}] from {} to {}",
                                route.vtable.type_name,
                                (*ev).source(),
                                dest
                            );
                            destroy(route.vtable, ev);
                        }
                    }
                }
            }
            None => {
                // No actor on this worker ever registered the type.
                if !dest.is_broadcast() {
                    log::warn!(
                        "failed to deliver event[{}] from {} to {}",
                        event::vtable_of(type_id).map(|v| v.type_name).unwrap_or("?"),
                        (*ev).source(),
                        dest
                    );
                }
                if let Some(vtable) = event::vtable_of(type_id) {
                    destroy(vtable, ev);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, type_id: u16) -> usize {
        self.routes
            .get(&type_id)
            .map(|r| r.handlers.len())
            .unwrap_or(0)
    }
}

/// Run the payload destructor in place when the type needs one.
#[inline]
unsafe fn destroy(vtable: &'static EventVtable, ev: *mut EventHeader) {
    if vtable.needs_drop {
        (vtable.drop_in_place)(ev);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
