//! Shared-nothing, per-core-pinned actor runtime.
//!
//! Application code organizes concurrent computation as actors that
//! communicate only by typed, asynchronous events. Each actor is owned by
//! exactly one worker pinned to one CPU; its state is private to that
//! worker and never touched by another thread. Cross-worker communication
//! goes through bounded lock-free rings; within a worker, handlers run to
//! completion and never suspend.
//!
//! ## Modules
//!
//! - [`id`]: actor/worker/service identifiers and the core set
//! - [`event`]: the framed event model, type registry and built-in events
//! - [`actor`]: the `Actor`/`Handle`/`Callback` traits and the [`Context`]
//!   capability surface
//! - [`engine`]: the [`Engine`] owning workers, inboxes and barriers
//!
//! ## Example
//!
//! ```no_run
//! use hive_core::{Actor, ActorId, Context, CoreSet, Engine, Handle, Packet};
//!
//! struct Msg { value: u32 }
//!
//! struct Echo;
//! impl Actor for Echo {
//!     fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
//!         ctx.register_event::<Msg, _>(self);
//!         true
//!     }
//! }
//! impl Handle<Msg> for Echo {
//!     fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Msg>) {
//!         ctx.reply(event);
//!     }
//! }
//!
//! let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
//! let echo: ActorId = engine.add_actor(1, Echo);
//! engine.start(true);
//! engine.stop();
//! engine.join();
//! # let _ = echo;
//! ```

pub mod actor;
pub mod engine;
pub mod event;
pub mod id;
mod router;
mod worker;

pub use actor::{Actor, Callback, Context, EventBuilder, Handle, ProxyPipe};
pub use engine::{CoreBuilder, Engine};
pub use event::{
    is_type, type_id, ActorStatus, EventHeader, EventState, KillEvent, Packet, PingEvent,
    RequireEvent, SignalEvent, UnregisterCallbackEvent,
};
pub use id::{
    ActorId, CoreSet, CoreSetError, ServiceId, WorkerId, BROADCAST_SID, NB_RESERVED_SERVICE_IDS,
};
pub use worker::CoreMetrics;
