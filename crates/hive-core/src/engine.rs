//! The engine: owns the workers, their inboxes, the startup/shutdown
//! barriers and signal wiring.
//!
//! Actors are installed before `start()`; after that the engine only
//! observes. `start` spawns one OS thread per worker (or runs the last one
//! inline), waits for every worker to publish "ready" on the startup
//! barrier, and installs the SIGINT handler. `join` returns once every
//! worker's actor table has emptied.
//!
//! SIGINT is ambient process state: the handler raises a process-global
//! flag that every engine observes. The barrier and stop flag themselves
//! are per-engine so engines in one process (tests, mainly) stay isolated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use hive_system::MpscRing;

use crate::actor::Actor;
use crate::id::{ActorId, CoreSet, ServiceId, WorkerId, NB_RESERVED_SERVICE_IDS};
use crate::worker::{CoreMetrics, Worker};

/// Startup-barrier failure sentinel: any `sync_start` value at or above
/// this encodes a failed worker init.
pub(crate) const BAD_INIT: u64 = 1 << 9;

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);

/// Whether the process received SIGINT since start.
pub(crate) fn sigint_received() -> bool {
    SIGINT_FLAG.load(Ordering::Relaxed)
}

#[cfg(unix)]
fn install_signal_handler() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        extern "C" fn on_sigint(_signum: libc::c_int) {
            // Only an atomic store: async-signal-safe.
            SIGINT_FLAG.store(true, Ordering::SeqCst);
        }
        let handler = on_sigint as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    });
}

#[cfg(not(unix))]
fn install_signal_handler() {}

/// State shared by every worker of one engine.
pub(crate) struct SharedCores {
    pub(crate) core_set: CoreSet,
    /// One inbox per worker, dense order.
    pub(crate) mailboxes: Vec<MpscRing>,
    /// Flush deadlock-breaker flags, one per worker.
    pub(crate) deadlock: Vec<AtomicBool>,
    /// Raised when a worker's loop has exited; flushes stop retrying
    /// against its inbox.
    pub(crate) done: Vec<AtomicBool>,
    /// Startup barrier: workers that finished local init, plus failure
    /// sentinels.
    pub(crate) sync_start: AtomicU64,
    /// Graceful-stop request for this engine.
    pub(crate) stop: AtomicBool,
    /// Final per-worker counters, written when a worker exits.
    pub(crate) final_metrics: Vec<Mutex<CoreMetrics>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The top-level runtime object.
pub struct Engine {
    shared: Arc<SharedCores>,
    /// Pre-start workers, dense order; taken when their thread spawns.
    workers: Vec<Option<Worker>>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl Engine {
    /// Build an engine over an explicit core set.
    pub fn new(core_set: CoreSet) -> Self {
        let n = core_set.len();
        let shared = Arc::new(SharedCores {
            mailboxes: (0..n).map(|_| MpscRing::new()).collect(),
            deadlock: (0..n).map(|_| AtomicBool::new(false)).collect(),
            done: (0..n).map(|_| AtomicBool::new(false)).collect(),
            sync_start: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            final_metrics: (0..n).map(|_| Mutex::new(CoreMetrics::default())).collect(),
            core_set,
        });
        let workers = shared
            .core_set
            .workers()
            .enumerate()
            .map(|(resolved, id)| Some(Worker::new(id, resolved, Arc::clone(&shared))))
            .collect();
        log::info!("[Engine] init with {} worker(s)", n);
        Engine {
            shared,
            workers,
            handles: Vec::new(),
            started: false,
        }
    }

    /// One worker per available CPU.
    pub fn auto() -> Self {
        Engine::new(CoreSet::auto())
    }

    pub fn core_set(&self) -> &CoreSet {
        &self.shared.core_set
    }

    /// Install an ordinary actor on `worker`. Pre-start only; its id comes
    /// from the worker's free pool. Returns `NOT_FOUND` on any failure.
    pub fn add_actor<A: Actor>(&mut self, worker: WorkerId, actor: A) -> ActorId {
        self.install(worker, None, actor)
    }

    /// Install a service actor: a singleton per worker with a fixed id from
    /// the reserved range. A duplicate `(service_id, worker)` or an id
    /// outside `[1, NB_RESERVED_SERVICE_IDS]` yields `NOT_FOUND`.
    pub fn add_service<A: Actor>(
        &mut self,
        worker: WorkerId,
        service_id: ServiceId,
        actor: A,
    ) -> ActorId {
        if service_id == 0 || service_id > NB_RESERVED_SERVICE_IDS {
            log::error!("service id {} outside the reserved range", service_id);
            return ActorId::NOT_FOUND;
        }
        self.install(worker, Some(service_id), actor)
    }

    fn install<A: Actor>(
        &mut self,
        worker: WorkerId,
        sid: Option<ServiceId>,
        actor: A,
    ) -> ActorId {
        if self.started {
            log::error!("actors cannot be added after start");
            return ActorId::NOT_FOUND;
        }
        let Some(idx) = self.shared.core_set.resolve(worker) else {
            log::error!("worker {} is not part of the core set", worker);
            return ActorId::NOT_FOUND;
        };
        self.workers[idx]
            .as_mut()
            .expect("pre-start worker present")
            .add_actor(sid, actor)
    }

    /// Fluent per-worker construction: `engine.core(0).add_actor(..)`.
    pub fn core(&mut self, worker: WorkerId) -> CoreBuilder<'_> {
        CoreBuilder {
            engine: self,
            worker,
            ids: Vec::new(),
            valid: true,
        }
    }

    /// Start the engine. With `asynchronous`, every worker gets its own
    /// thread and `start` returns after the startup barrier; otherwise the
    /// last worker runs inline on the caller's thread and `start` returns
    /// when that worker finishes. `join()` must be called either way.
    pub fn start(&mut self, asynchronous: bool) {
        if self.started {
            return;
        }
        self.started = true;
        install_signal_handler();

        let n = self.workers.len();
        let mut inline_worker = None;
        for idx in 0..n {
            let worker = self.workers[idx].take().expect("worker started twice");
            if !asynchronous && idx == n - 1 {
                inline_worker = Some(worker);
                continue;
            }
            let name = format!("hive-core-{}", worker.index());
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread");
            self.handles.push(handle);
        }

        match inline_worker {
            Some(worker) => worker.run(),
            None => {
                // Wait for every worker to publish ready (or fail).
                let total = n as u64;
                loop {
                    let s = self.shared.sync_start.load(Ordering::Acquire);
                    if s >= BAD_INIT {
                        log::error!("[Engine] init failed");
                        break;
                    }
                    if s >= total {
                        log::info!("[Engine] init success");
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Request a graceful stop, equivalent to the process receiving SIGINT:
    /// every actor gets a `SignalEvent` and the default handler kills it.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Wait until every worker's actor table has emptied.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// True if the startup barrier recorded an init failure.
    pub fn has_error(&self) -> bool {
        self.shared.sync_start.load(Ordering::Acquire) >= BAD_INIT
    }

    /// Final counters of a worker; meaningful after `join()`.
    pub fn metrics(&self, worker: WorkerId) -> Option<CoreMetrics> {
        let idx = self.shared.core_set.resolve(worker)?;
        Some(*self.shared.final_metrics[idx].lock())
    }
}

// ---------------------------------------------------------------------------
// CoreBuilder
// ---------------------------------------------------------------------------

/// Fluent helper for stacking actors onto one worker before start.
pub struct CoreBuilder<'e> {
    engine: &'e mut Engine,
    worker: WorkerId,
    ids: Vec<ActorId>,
    valid: bool,
}

impl<'e> CoreBuilder<'e> {
    pub fn add_actor<A: Actor>(mut self, actor: A) -> Self {
        let id = self.engine.add_actor(self.worker, actor);
        self.valid &= id.is_valid();
        self.ids.push(id);
        self
    }

    pub fn add_service<A: Actor>(mut self, service_id: ServiceId, actor: A) -> Self {
        let id = self.engine.add_service(self.worker, service_id, actor);
        self.valid &= id.is_valid();
        self.ids.push(id);
        self
    }

    /// Whether every construction so far succeeded.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Ids in construction order (`NOT_FOUND` for failed ones).
    pub fn id_list(&self) -> &[ActorId] {
        &self.ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
