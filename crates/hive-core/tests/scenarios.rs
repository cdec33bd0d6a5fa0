//! End-to-end engine scenarios: ping/pong, fan-out, broadcast, discovery,
//! saturation, and kill semantics across workers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hive_core::{
    is_type, Actor, ActorId, ActorStatus, Callback, Context, CoreSet, Engine, Handle, KillEvent,
    Packet, RequireEvent, UnregisterCallbackEvent,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// S1: ping/pong across two workers
// ---------------------------------------------------------------------------

struct Msg {
    value: u32,
    blob: [u8; 32],
}

struct Ping {
    peer: ActorId,
    seen: Arc<AtomicU32>,
    value_ok: Arc<AtomicBool>,
}

impl Actor for Ping {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Msg, _>(self);
        let mut blob = [0u8; 32];
        for (i, b) in blob.iter_mut().enumerate() {
            *b = i as u8;
        }
        ctx.push(self.peer, Msg { value: 42, blob });
        true
    }
}

impl Handle<Msg> for Ping {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Msg>) {
        // Round-trip identity: payload bytes byte-for-byte.
        let blob_ok = event.blob.iter().enumerate().all(|(i, &b)| b == i as u8);
        self.value_ok
            .store(event.value == 42 && blob_ok, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        ctx.push(self.peer, KillEvent);
        ctx.kill();
    }
}

struct Pong {
    seen: Arc<AtomicU32>,
}

impl Actor for Pong {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Msg, _>(self);
        true
    }
}

impl Handle<Msg> for Pong {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Msg>) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        ctx.reply(event);
    }
}

#[test]
fn test_ping_pong_two_workers() {
    init_logger();
    let ping_seen = Arc::new(AtomicU32::new(0));
    let pong_seen = Arc::new(AtomicU32::new(0));
    let value_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let pong = engine.add_actor(
        1,
        Pong {
            seen: Arc::clone(&pong_seen),
        },
    );
    assert!(pong.is_valid());
    let ping = engine.add_actor(
        0,
        Ping {
            peer: pong,
            seen: Arc::clone(&ping_seen),
            value_ok: Arc::clone(&value_ok),
        },
    );
    assert!(ping.is_valid());
    assert_ne!(ping, pong);

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(ping_seen.load(Ordering::SeqCst) >= 1);
    assert!(pong_seen.load(Ordering::SeqCst) >= 1);
    assert!(value_ok.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// S2: producer/consumer fan-out with per-source FIFO
// ---------------------------------------------------------------------------

struct Work {
    seq: u32,
}

struct Producer {
    consumers: Vec<ActorId>,
    total: u32,
}

impl Actor for Producer {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        for i in 0..self.total {
            let dest = self.consumers[i as usize % self.consumers.len()];
            ctx.push(dest, Work { seq: i });
        }
        ctx.kill();
        true
    }
}

struct Consumer {
    expected: u32,
    got: u32,
    last_seq: Option<u32>,
    received: Arc<AtomicU32>,
    order_violated: Arc<AtomicBool>,
}

impl Actor for Consumer {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Work, _>(self);
        true
    }
}

impl Handle<Work> for Consumer {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Work>) {
        if let Some(last) = self.last_seq {
            if event.seq <= last {
                self.order_violated.store(true, Ordering::SeqCst);
            }
        }
        self.last_seq = Some(event.seq);
        self.got += 1;
        self.received.fetch_add(1, Ordering::SeqCst);
        if self.got == self.expected {
            ctx.kill();
        }
    }
}

#[test]
fn test_producer_consumer_fan_out() {
    init_logger();
    const CONSUMERS: u32 = 100;
    const EVENTS: u32 = 1000;

    let received = Arc::new(AtomicU32::new(0));
    let order_violated = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let consumers: Vec<ActorId> = (0..CONSUMERS)
        .map(|_| {
            engine.add_actor(
                1,
                Consumer {
                    expected: EVENTS / CONSUMERS,
                    got: 0,
                    last_seq: None,
                    received: Arc::clone(&received),
                    order_violated: Arc::clone(&order_violated),
                },
            )
        })
        .collect();
    assert!(consumers.iter().all(|id| id.is_valid()));

    engine.add_actor(
        0,
        Producer {
            consumers,
            total: EVENTS,
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert_eq!(received.load(Ordering::SeqCst), EVENTS);
    assert!(!order_violated.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// S3: broadcast fan-out, event destroyed exactly once
// ---------------------------------------------------------------------------

/// Drop-counting token carried inside the broadcast payload.
struct DropToken {
    drops: Arc<AtomicUsize>,
}

impl Drop for DropToken {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Announce {
    _token: DropToken,
}

struct Announcer {
    target_worker: u16,
    kill_list: Vec<ActorId>,
    drops: Arc<AtomicUsize>,
}

impl Actor for Announcer {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.push(
            ActorId::broadcast(self.target_worker),
            Announce {
                _token: DropToken {
                    drops: Arc::clone(&self.drops),
                },
            },
        );
        for id in self.kill_list.drain(..) {
            ctx.push(id, KillEvent);
        }
        ctx.kill();
        true
    }
}

struct Listener {
    invocations: Arc<AtomicU32>,
}

impl Actor for Listener {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Announce, _>(self);
        true
    }
}

impl Handle<Announce> for Listener {
    fn on(&mut self, ctx: &mut Context<'_>, _event: &mut Packet<Announce>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ctx.kill();
    }
}

#[test]
fn test_broadcast_fan_out() {
    init_logger();
    const LISTENERS: u32 = 16;

    let invocations = Arc::new(AtomicU32::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let listeners: Vec<ActorId> = (0..LISTENERS)
        .map(|_| {
            engine.add_actor(
                1,
                Listener {
                    invocations: Arc::clone(&invocations),
                },
            )
        })
        .collect();

    engine.add_actor(
        0,
        Announcer {
            target_worker: 1,
            // The listeners kill themselves on delivery; nothing extra to kill.
            kill_list: Vec::new(),
            drops: Arc::clone(&drops),
        },
    );
    let _ = listeners;

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert_eq!(invocations.load(Ordering::SeqCst), LISTENERS);
    // Destroyed exactly once, never per handler.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_broadcast_with_zero_recipients() {
    init_logger();
    let drops = Arc::new(AtomicUsize::new(0));

    // Worker 1 hosts one actor that is *not* registered for Announce.
    struct Bystander;
    impl Actor for Bystander {}

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let bystander = engine.add_actor(1, Bystander);
    engine.add_actor(
        0,
        Announcer {
            target_worker: 1,
            kill_list: vec![bystander],
            drops: Arc::clone(&drops),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    // Nobody handled it, and it still got destroyed exactly once.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// S4: require/discovery of a service actor
// ---------------------------------------------------------------------------

struct DirectoryService;

impl Actor for DirectoryService {}

struct Finder {
    found_source: Arc<AtomicU32>,
    status_alive: Arc<AtomicBool>,
}

impl Actor for Finder {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<RequireEvent, _>(self);
        ctx.require::<DirectoryService>();
        true
    }
}

impl Handle<RequireEvent> for Finder {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<RequireEvent>) {
        if is_type::<DirectoryService>(event.type_id) {
            self.found_source
                .store(event.source().as_u32(), Ordering::SeqCst);
            self.status_alive
                .store(event.status == ActorStatus::Alive, Ordering::SeqCst);
            ctx.push(event.source(), KillEvent);
            ctx.kill();
        }
    }
}

#[test]
fn test_require_discovers_service() {
    init_logger();
    const SERVICE_SID: u16 = 100;

    let found_source = Arc::new(AtomicU32::new(0));
    let status_alive = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let service = engine.add_service(1, SERVICE_SID, DirectoryService);
    assert_eq!(service, ActorId::new(SERVICE_SID, 1));
    engine.add_actor(
        0,
        Finder {
            found_source: Arc::clone(&found_source),
            status_alive: Arc::clone(&status_alive),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert_eq!(found_source.load(Ordering::SeqCst), service.as_u32());
    assert!(status_alive.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// S5: saturation without loss
// ---------------------------------------------------------------------------

struct Bounce;

struct Bouncer {
    peer: ActorId,
    seed: u32,
    target: u64,
    count: u64,
    done: Arc<AtomicBool>,
}

impl Actor for Bouncer {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Bounce, _>(self);
        // Seeding more events than the inbox holds guarantees the ring is
        // hit full at least once.
        for _ in 0..self.seed {
            ctx.push(self.peer, Bounce);
        }
        true
    }
}

impl Handle<Bounce> for Bouncer {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Bounce>) {
        self.count += 1;
        if self.target > 0 && self.count >= self.target {
            self.done.store(true, Ordering::SeqCst);
            ctx.push(self.peer, KillEvent);
            ctx.kill();
            return;
        }
        ctx.reply(event);
    }
}

#[test]
fn test_saturation_without_loss() {
    init_logger();
    // 2048 events in flight against a 1024-line inbox; one side counts a
    // million deliveries before tearing both actors down.
    const SEED: u32 = 2048;
    const TARGET: u64 = 1_000_000;

    let done = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let echo = engine.add_actor(
        1,
        Bouncer {
            peer: ActorId::NOT_FOUND, // filled by replies; never pushes
            seed: 0,
            target: 0,
            count: 0,
            done: Arc::new(AtomicBool::new(false)),
        },
    );
    engine.add_actor(
        0,
        Bouncer {
            peer: echo,
            seed: SEED,
            target: TARGET,
            count: 0,
            done: Arc::clone(&done),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(done.load(Ordering::SeqCst));

    let m0 = engine.metrics(0).unwrap();
    let m1 = engine.metrics(1).unwrap();
    let tries = m0.nb_event_sent_try + m1.nb_event_sent_try;
    let sent = m0.nb_event_sent + m1.nb_event_sent;
    assert!(sent >= TARGET);
    // The ring was hit full at least once.
    assert!(tries > sent, "tries {} vs sent {}", tries, sent);
}

// ---------------------------------------------------------------------------
// S6: kill during iteration still delivers the whole drain
// ---------------------------------------------------------------------------

struct E1;
struct E2;
struct E3;

struct Tricount {
    invocations: Arc<AtomicU32>,
}

impl Actor for Tricount {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<E1, _>(self);
        ctx.register_event::<E2, _>(self);
        ctx.register_event::<E3, _>(self);
        true
    }
}

impl Handle<E1> for Tricount {
    fn on(&mut self, ctx: &mut Context<'_>, _event: &mut Packet<E1>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        // Killed here, but E2/E3 from the same drain still arrive.
        ctx.kill();
    }
}

impl Handle<E2> for Tricount {
    fn on(&mut self, _ctx: &mut Context<'_>, _event: &mut Packet<E2>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Handle<E3> for Tricount {
    fn on(&mut self, _ctx: &mut Context<'_>, _event: &mut Packet<E3>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

struct Trisend {
    target: ActorId,
}

impl Actor for Trisend {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.push(self.target, E1);
        ctx.push(self.target, E2);
        ctx.push(self.target, E3);
        ctx.kill();
        true
    }
}

#[test]
fn test_kill_during_iteration_delivers_same_drain() {
    init_logger();
    let invocations = Arc::new(AtomicU32::new(0));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    let target = engine.add_actor(
        0,
        Tricount {
            invocations: Arc::clone(&invocations),
        },
    );
    engine.add_actor(0, Trisend { target });

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Boundary: pushing to a killed actor is a logged drop
// ---------------------------------------------------------------------------

struct LatePush {
    dead: ActorId,
    iterations: u32,
    pushed: Arc<AtomicBool>,
}

impl Actor for LatePush {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_callback(self);
        true
    }
}

impl Callback for LatePush {
    fn on_callback(&mut self, ctx: &mut Context<'_>) {
        self.iterations += 1;
        if self.iterations == 3 {
            // The destination died iterations ago.
            ctx.push(self.dead, Work { seq: 0 });
            self.pushed.store(true, Ordering::SeqCst);
        }
        if self.iterations == 6 {
            ctx.kill();
        }
    }
}

struct InstantDeath;

impl Actor for InstantDeath {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.kill();
        true
    }
}

#[test]
fn test_push_to_killed_actor_drops_cleanly() {
    init_logger();
    let pushed = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    let dead = engine.add_actor(0, InstantDeath);
    engine.add_actor(
        0,
        LatePush {
            dead,
            iterations: 0,
            pushed: Arc::clone(&pushed),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(pushed.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Graceful stop, callbacks, referenced actors, heap payloads
// ---------------------------------------------------------------------------

struct Immortal;

impl Actor for Immortal {}

#[test]
fn test_stop_terminates_idle_engine() {
    init_logger();
    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    engine.add_actor(0, Immortal);
    engine.add_actor(1, Immortal);

    engine.start(true);
    engine.stop();
    engine.join();
    assert!(!engine.has_error());
}

struct Ticker {
    ticks: Arc<AtomicU32>,
}

impl Actor for Ticker {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_callback(self);
        true
    }
}

impl Callback for Ticker {
    fn on_callback(&mut self, ctx: &mut Context<'_>) {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            // Self-delivered unregistration, then death: no further ticks.
            let me = ctx.id();
            ctx.push(me, UnregisterCallbackEvent);
            ctx.push(me, KillEvent);
        }
    }
}

#[test]
fn test_callback_unregistration_via_event() {
    init_logger();
    let ticks = Arc::new(AtomicU32::new(0));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    engine.add_actor(
        0,
        Ticker {
            ticks: Arc::clone(&ticks),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

struct Child {
    value: u32,
    created: Arc<AtomicBool>,
}

impl Actor for Child {
    fn on_init(&mut self, _ctx: &mut Context<'_>) -> bool {
        self.created.store(true, Ordering::SeqCst);
        true
    }
}

impl Child {
    fn bump(&mut self) -> u32 {
        self.value += 1;
        self.value
    }
}

struct Parent {
    created: Arc<AtomicBool>,
    direct_call_ok: Arc<AtomicBool>,
}

impl Actor for Parent {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        let created = Arc::clone(&self.created);
        let Some((child_id, child)) = ctx.add_ref_actor(Child { value: 0, created }) else {
            return false;
        };
        // Zero-copy synchronous calls through the direct reference.
        let v = child.bump() + child.bump();
        self.direct_call_ok.store(v == 3, Ordering::SeqCst);

        ctx.push(child_id, KillEvent);
        ctx.kill();
        true
    }
}

#[test]
fn test_referenced_actor_direct_calls() {
    init_logger();
    let created = Arc::new(AtomicBool::new(false));
    let direct_call_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    engine.add_actor(
        0,
        Parent {
            created: Arc::clone(&created),
            direct_call_ok: Arc::clone(&direct_call_ok),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(created.load(Ordering::SeqCst));
    assert!(direct_call_ok.load(Ordering::SeqCst));
}

struct Blob {
    data: Box<[u8]>,
}

struct BlobEcho;

impl Actor for BlobEcho {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Blob, _>(self);
        true
    }
}

impl Handle<Blob> for BlobEcho {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Blob>) {
        ctx.reply(event);
    }
}

struct BlobSender {
    peer: ActorId,
    roundtrip_ok: Arc<AtomicBool>,
}

impl Actor for BlobSender {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Blob, _>(self);
        ctx.push(
            self.peer,
            Blob {
                data: (0..255u8).collect::<Vec<_>>().into_boxed_slice(),
            },
        );
        true
    }
}

impl Handle<Blob> for BlobSender {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Blob>) {
        let ok = event.data.len() == 255 && event.data.iter().enumerate().all(|(i, &b)| b == i as u8);
        self.roundtrip_ok.store(ok, Ordering::SeqCst);
        ctx.push(self.peer, KillEvent);
        ctx.kill();
    }
}

#[test]
fn test_heap_payload_survives_relocation() {
    init_logger();
    let roundtrip_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let echo = engine.add_actor(1, BlobEcho);
    engine.add_actor(
        0,
        BlobSender {
            peer: echo,
            roundtrip_ok: Arc::clone(&roundtrip_ok),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(roundtrip_ok.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Metrics and time
// ---------------------------------------------------------------------------

struct TimeWatcher {
    time_ok: Arc<AtomicBool>,
    last: u64,
    rounds: u32,
}

impl Actor for TimeWatcher {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_callback(self);
        self.last = ctx.time();
        true
    }
}

impl Callback for TimeWatcher {
    fn on_callback(&mut self, ctx: &mut Context<'_>) {
        let now = ctx.time();
        if now < self.last {
            self.time_ok.store(false, Ordering::SeqCst);
        }
        self.last = now;
        self.rounds += 1;
        if self.rounds == 10 {
            ctx.kill();
        }
    }
}

#[test]
fn test_iteration_time_is_monotonic() {
    init_logger();
    let time_ok = Arc::new(AtomicBool::new(true));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    engine.add_actor(
        0,
        TimeWatcher {
            time_ok: Arc::clone(&time_ok),
            last: 0,
            rounds: 0,
        },
    );

    engine.start(true);
    engine.join();
    assert!(time_ok.load(Ordering::SeqCst));
}

#[test]
fn test_metrics_count_cross_worker_traffic() {
    init_logger();
    let ping_seen = Arc::new(AtomicU32::new(0));
    let pong_seen = Arc::new(AtomicU32::new(0));
    let value_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let pong = engine.add_actor(
        1,
        Pong {
            seen: Arc::clone(&pong_seen),
        },
    );
    engine.add_actor(
        0,
        Ping {
            peer: pong,
            seen: Arc::clone(&ping_seen),
            value_ok: Arc::clone(&value_ok),
        },
    );

    engine.start(true);
    engine.join();

    let m0 = engine.metrics(0).unwrap();
    let m1 = engine.metrics(1).unwrap();
    assert!(m0.nb_event_sent >= 1);
    assert!(m0.nb_event_received >= 1);
    assert!(m1.nb_event_received >= 1);
    assert!(m0.nb_bucket_sent >= m0.nb_event_sent);
    assert_eq!(engine.metrics(7), None);
}

// ---------------------------------------------------------------------------
// FIFO ordering under randomized bursts (per-source, same destination)
// ---------------------------------------------------------------------------

struct Burst {
    seq: u64,
}

struct BurstSender {
    dest: ActorId,
    next_seq: u64,
    total: u64,
    rng: StdRng,
}

impl Actor for BurstSender {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_callback(self);
        true
    }
}

impl Callback for BurstSender {
    fn on_callback(&mut self, ctx: &mut Context<'_>) {
        let burst = self.rng.random_range(1..=97u64);
        for _ in 0..burst {
            if self.next_seq == self.total {
                ctx.kill();
                return;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            ctx.push(self.dest, Burst { seq });
        }
    }
}

struct BurstReceiver {
    expect: u64,
    total: u64,
    in_order: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
}

impl Actor for BurstReceiver {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Burst, _>(self);
        true
    }
}

impl Handle<Burst> for BurstReceiver {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Burst>) {
        if event.seq != self.expect {
            self.in_order.store(false, Ordering::SeqCst);
        }
        self.expect = event.seq + 1;
        self.received.fetch_add(1, Ordering::SeqCst);
        if self.expect == self.total {
            ctx.kill();
        }
    }
}

#[test]
fn test_per_source_fifo_across_randomized_bursts() {
    init_logger();
    const TOTAL: u64 = 50_000;

    let in_order = Arc::new(AtomicBool::new(true));
    let received = Arc::new(AtomicU64::new(0));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let receiver = engine.add_actor(
        1,
        BurstReceiver {
            expect: 0,
            total: TOTAL,
            in_order: Arc::clone(&in_order),
            received: Arc::clone(&received),
        },
    );
    engine.add_actor(
        0,
        BurstSender {
            dest: receiver,
            next_seq: 0,
            total: TOTAL,
            rng: StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15),
        },
    );

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(in_order.load(Ordering::SeqCst));
    assert_eq!(received.load(Ordering::SeqCst), TOTAL);
}

// ---------------------------------------------------------------------------
// Chained pushes, proxy pipes, trailers, forwarding, unregistration
// ---------------------------------------------------------------------------

struct First;
struct Second;

struct ChainTarget {
    order_ok: Arc<AtomicBool>,
    got_first: bool,
}

impl Actor for ChainTarget {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<First, _>(self);
        ctx.register_event::<Second, _>(self);
        true
    }
}

impl Handle<First> for ChainTarget {
    fn on(&mut self, _ctx: &mut Context<'_>, _event: &mut Packet<First>) {
        self.got_first = true;
    }
}

impl Handle<Second> for ChainTarget {
    fn on(&mut self, ctx: &mut Context<'_>, _event: &mut Packet<Second>) {
        // `to()` chains are delivered in push order.
        self.order_ok.store(self.got_first, Ordering::SeqCst);
        ctx.kill();
    }
}

struct ChainSender {
    target: ActorId,
}

impl Actor for ChainSender {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.to(self.target).push(First).push(Second);
        ctx.kill();
        true
    }
}

#[test]
fn test_event_builder_chains_in_order() {
    init_logger();
    let order_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let target = engine.add_actor(
        1,
        ChainTarget {
            order_ok: Arc::clone(&order_ok),
            got_first: false,
        },
    );
    engine.add_actor(0, ChainSender { target });

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(order_ok.load(Ordering::SeqCst));
}

struct Framed {
    trailer_len: u32,
}

struct FrameSink {
    trailer_ok: Arc<AtomicBool>,
}

impl Actor for FrameSink {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Framed, _>(self);
        true
    }
}

impl Handle<Framed> for FrameSink {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Framed>) {
        let want = event.trailer_len as usize;
        let trailer = event.trailer();
        let ok = trailer.len() >= want && trailer[..want].iter().all(|&b| b == 0xAB);
        self.trailer_ok.store(ok, Ordering::SeqCst);
        ctx.kill();
    }
}

struct FrameSender {
    target: ActorId,
}

impl Actor for FrameSender {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        const EXTRA: usize = 300;
        let mut pipe = ctx.pipe(self.target);
        let packet = pipe.push_allocated(EXTRA, Framed {
            trailer_len: EXTRA as u32,
        });
        packet.trailer_mut()[..EXTRA].fill(0xAB);
        ctx.kill();
        true
    }
}

#[test]
fn test_allocated_push_carries_trailer_bytes() {
    init_logger();
    let trailer_ok = Arc::new(AtomicBool::new(false));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let target = engine.add_actor(
        1,
        FrameSink {
            trailer_ok: Arc::clone(&trailer_ok),
        },
    );
    engine.add_actor(0, FrameSender { target });

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    assert!(trailer_ok.load(Ordering::SeqCst));
}

struct Hop;

struct Relay {
    next: ActorId,
}

impl Actor for Relay {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Hop, _>(self);
        true
    }
}

impl Handle<Hop> for Relay {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Hop>) {
        let next = self.next;
        ctx.forward(next, event);
        ctx.kill();
    }
}

struct HopSink {
    source_seen: Arc<AtomicU32>,
}

impl Actor for HopSink {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Hop, _>(self);
        true
    }
}

impl Handle<Hop> for HopSink {
    fn on(&mut self, ctx: &mut Context<'_>, event: &mut Packet<Hop>) {
        self.source_seen
            .store(event.source().as_u32(), Ordering::SeqCst);
        ctx.kill();
    }
}

struct HopStart {
    relay: ActorId,
}

impl Actor for HopStart {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.push(self.relay, Hop);
        ctx.kill();
        true
    }
}

#[test]
fn test_forward_retargets_with_new_source() {
    init_logger();
    let source_seen = Arc::new(AtomicU32::new(0));

    let mut engine = Engine::new(CoreSet::new([0, 1]).unwrap());
    let sink = engine.add_actor(
        1,
        HopSink {
            source_seen: Arc::clone(&source_seen),
        },
    );
    let relay = engine.add_actor(1, Relay { next: sink });
    engine.add_actor(0, HopStart { relay });

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    // The sink sees the relay, not the original sender.
    assert_eq!(source_seen.load(Ordering::SeqCst), relay.as_u32());
}

struct Toggle {
    count: Arc<AtomicU32>,
}

impl Actor for Toggle {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.register_event::<Work, _>(self);
        true
    }
}

impl Handle<Work> for Toggle {
    fn on(&mut self, ctx: &mut Context<'_>, _event: &mut Packet<Work>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        // Applied before the next event of the same drain is routed.
        ctx.unregister_event::<Work>();
    }
}

struct ToggleSender {
    target: ActorId,
}

impl Actor for ToggleSender {
    fn on_init(&mut self, ctx: &mut Context<'_>) -> bool {
        ctx.push(self.target, Work { seq: 0 });
        ctx.push(self.target, Work { seq: 1 });
        ctx.push(self.target, KillEvent);
        ctx.kill();
        true
    }
}

#[test]
fn test_unregister_event_stops_delivery() {
    init_logger();
    let count = Arc::new(AtomicU32::new(0));

    let mut engine = Engine::new(CoreSet::new([0]).unwrap());
    let target = engine.add_actor(
        0,
        Toggle {
            count: Arc::clone(&count),
        },
    );
    engine.add_actor(0, ToggleSender { target });

    engine.start(true);
    engine.join();

    assert!(!engine.has_error());
    // The second Work was dropped as undeliverable after unregistration.
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
