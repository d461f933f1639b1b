// clockfeed: Clock-Feed Service (C2)
//
// Periodically polls each registered hardware clock, writes one sample per
// poll into that clock's Ring Sample Store, and notifies event
// subscribers. Owns source registration, subscription, comparison
// queries.
//
// Registration state (source/subscription tables) is guarded by a single
// mutex rather than a literal mailbox actor: the source/subscription
// tables are mutex-guarded, but the compare fast path stays lock-free on
// the hot fields. The hot `compare` path below never takes that mutex; it
// only touches the per-source `RingStore` (itself lock-free, see
// `ring.rs`) and the per-subscription atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::driver::ClockDriver;
use crate::error::{CompareError, FeedError, FeedResult};
use crate::ring::{RingStore, SignedDuration};

pub const MAX_EVENT_SUBSCRIBERS: usize = 4;

/// Opaque identity handle for a registered hardware clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockHandle(pub u64);

/// Opaque identity handle for a live subscription, used only for
/// diagnostics/logging; the `Subscription` value itself is the capability
/// passed to `compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Best-effort notification that one poll cycle completed; enqueued once
/// to each registered event subscriber.
#[derive(Debug, Clone, Copy)]
pub struct SyncEvent {
    pub poll_tick: u64,
}

struct SourceEntry {
    driver: Arc<dyn ClockDriver>,
    ring: RingStore,
    poll_period_log2: i32,
    cycles: AtomicU64,
    inactive: std::sync::atomic::AtomicBool,
    subscriber_count: AtomicUsize,
}

/// Per-subscription mutable state, shared between the Feed's bookkeeping
/// table and the `Subscription` handle held by the consumer so that
/// `compare` can read/advance it without going through the mutex: compare
/// operations execute on the caller's thread and touch the ring store
/// directly.
struct SubscriptionShared {
    /// `u64::MAX` sentinel encodes "before any read".
    read_counter: AtomicU64,
    min_counter: AtomicU64,
    max_age_ns: AtomicU64,
    max_age_diff_ns: AtomicU64,
}

const NO_MAX_AGE: u64 = u64::MAX;

impl SubscriptionShared {
    fn new() -> Self {
        Self {
            read_counter: AtomicU64::new(u64::MAX),
            min_counter: AtomicU64::new(0),
            max_age_ns: AtomicU64::new(NO_MAX_AGE),
            max_age_diff_ns: AtomicU64::new(NO_MAX_AGE),
        }
    }

    fn max_age(&self) -> Option<Duration> {
        match self.max_age_ns.load(Ordering::Acquire) {
            NO_MAX_AGE => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    fn max_age_diff(&self) -> Option<Duration> {
        match self.max_age_diff_ns.load(Ordering::Acquire) {
            NO_MAX_AGE => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }
}

/// A consumer's handle to a Source's ring.
///
/// Cloning a `Subscription` shares the same underlying counters; a
/// subscription belongs to one consumer — if you need another independent
/// cursor, call `subscribe` again.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    clock: ClockHandle,
    source: Arc<SourceEntry>,
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn clock(&self) -> ClockHandle {
        self.clock
    }

    /// Read the freshest sample satisfying this subscription's staleness
    /// gates, advancing `read_counter` (the seq of the last successfully
    /// consumed sample) on success.
    fn freshest(&self, now_mono: Instant) -> Result<(SignedDuration, Instant), CompareError> {
        if self.source.inactive.load(Ordering::Acquire) {
            return Err(CompareError::OwnerDead);
        }
        let min_counter = self.shared.min_counter.load(Ordering::Acquire);
        let sample = self
            .source
            .ring
            .read_freshest(now_mono, min_counter, self.shared.max_age())?;
        self.shared.read_counter.store(sample.seq, Ordering::Release);
        Ok((sample.diff(), sample.mono))
    }
}

struct EventSubscriberSlot {
    id: u64,
    tx: mpsc::Sender<SyncEvent>,
}

struct FeedState {
    sources: HashMap<ClockHandle, Arc<SourceEntry>>,
    global_poll_period_log2: i32,
    next_subscription_id: u64,
    next_event_subscriber_id: u64,
    event_subscribers: Vec<EventSubscriberSlot>,
    poll_tick: u64,
    shutting_down: bool,
}

impl FeedState {
    fn new() -> Self {
        Self {
            sources: HashMap::new(),
            // No sources yet; an empty feed polls at the coarsest rate
            // (1 second) until the first clock is registered.
            global_poll_period_log2: 0,
            next_subscription_id: 0,
            next_event_subscriber_id: 0,
            event_subscribers: Vec::new(),
            poll_tick: 0,
            shutting_down: false,
        }
    }

    /// The global poll period is the minimum over all active sources'
    /// `poll_period_log2`; it is recomputed on every add/remove so it can
    /// both shrink and grow back as sources come and go.
    fn recompute_global_period(&mut self) {
        let min = self
            .sources
            .values()
            .filter(|s| !s.inactive.load(Ordering::Acquire))
            .map(|s| s.poll_period_log2)
            .min();
        if let Some(min) = min {
            self.global_poll_period_log2 = min;
        }
    }
}

/// Clock-Feed Service handle. Cheap to clone; all clones share the same
/// registration state and poll loop.
#[derive(Clone)]
pub struct ClockFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ClockFeed {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState::new())),
        }
    }

    /// Register a hardware clock.
    ///
    /// A requested `poll_period_log2` smaller than the current global
    /// minimum lowers the global period for every other registered source.
    pub fn add_clock(
        &self,
        clock: ClockHandle,
        driver: Arc<dyn ClockDriver>,
        poll_period_log2: i32,
    ) -> FeedResult<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(FeedError::ShuttingDown);
        }
        if state.sources.contains_key(&clock) {
            return Err(FeedError::AlreadyRegistered);
        }
        let now_mono = Instant::now();
        let now_system = SystemTime::now();
        state.sources.insert(
            clock,
            Arc::new(SourceEntry {
                driver,
                ring: RingStore::new(now_mono, now_system),
                poll_period_log2,
                cycles: AtomicU64::new(0),
                inactive: std::sync::atomic::AtomicBool::new(false),
                subscriber_count: AtomicUsize::new(0),
            }),
        );
        state.recompute_global_period();
        info!(?clock, poll_period_log2, "clock registered with feed");
        Ok(())
    }

    /// Tombstone a source. Reaped immediately if it has no subscribers.
    pub fn remove_clock(&self, clock: ClockHandle) -> FeedResult<()> {
        let mut state = self.state.lock();
        let source = state
            .sources
            .get(&clock)
            .cloned()
            .ok_or(FeedError::NotFound)?;
        if source.inactive.swap(true, Ordering::AcqRel) {
            return Err(FeedError::AlreadyInactive);
        }
        if source.subscriber_count.load(Ordering::Acquire) == 0 {
            state.sources.remove(&clock);
            debug!(?clock, "source reaped immediately (no subscribers)");
        }
        state.recompute_global_period();
        Ok(())
    }

    /// `subscribe`: create a Subscription to a registered clock (spec
    /// §4.2 table). Subscribing to an inactive source succeeds with a
    /// warning; subsequent compares return `OwnerDead`.
    pub fn subscribe(&self, clock: ClockHandle) -> FeedResult<Subscription> {
        let mut state = self.state.lock();
        let source = state
            .sources
            .get(&clock)
            .cloned()
            .ok_or(FeedError::NotFound)?;
        if source.inactive.load(Ordering::Acquire) {
            warn!(?clock, "subscribing to an inactive source");
        }
        source.subscriber_count.fetch_add(1, Ordering::AcqRel);
        let id = SubscriptionId(state.next_subscription_id);
        state.next_subscription_id += 1;
        Ok(Subscription {
            id,
            clock,
            source,
            shared: Arc::new(SubscriptionShared::new()),
        })
    }

    /// `unsubscribe`: free a Subscription; reaps the source immediately if
    /// it was inactive and this was its last subscriber.
    pub fn unsubscribe(&self, sub: Subscription) {
        let mut state = self.state.lock();
        let remaining = sub.source.subscriber_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && sub.source.inactive.load(Ordering::Acquire) {
            state.sources.remove(&sub.clock);
            debug!(clock = ?sub.clock, "source reaped on last unsubscribe");
        }
    }

    /// `subscribe_events`: register an event mailbox, capped at
    /// `MAX_EVENT_SUBSCRIBERS`.
    pub fn subscribe_events(&self, tx: mpsc::Sender<SyncEvent>) -> FeedResult<u64> {
        let mut state = self.state.lock();
        if state.event_subscribers.len() >= MAX_EVENT_SUBSCRIBERS {
            return Err(FeedError::NoSpace(state.event_subscribers.len()));
        }
        let id = state.next_event_subscriber_id;
        state.next_event_subscriber_id += 1;
        state.event_subscribers.push(EventSubscriberSlot { id, tx });
        Ok(id)
    }

    pub fn unsubscribe_events(&self, id: u64) {
        let mut state = self.state.lock();
        state.event_subscribers.retain(|slot| slot.id != id);
    }

    pub fn require_fresh(&self, sub: &Subscription) {
        let next = sub.shared.read_counter.load(Ordering::Acquire).wrapping_add(1);
        sub.shared.min_counter.store(next, Ordering::Release);
    }

    pub fn set_max_age(&self, sub: &Subscription, max_age: Option<Duration>) {
        sub.shared
            .max_age_ns
            .store(max_age.map(|d| d.as_nanos() as u64).unwrap_or(NO_MAX_AGE), Ordering::Release);
    }

    pub fn set_max_age_diff(&self, sub: &Subscription, max_age_diff: Option<Duration>) {
        sub.shared.max_age_diff_ns.store(
            max_age_diff.map(|d| d.as_nanos() as u64).unwrap_or(NO_MAX_AGE),
            Ordering::Release,
        );
    }

    /// The hot path. Runs on the caller's thread; never takes the
    /// registration mutex.
    pub fn compare(
        &self,
        a: Option<&Subscription>,
        b: Option<&Subscription>,
    ) -> Result<SignedDuration, CompareError> {
        let now = Instant::now();

        let (diff_a, mono_a) = match a {
            None => (SignedDuration::ZERO, now),
            Some(sub) => sub.freshest(now)?,
        };
        let (diff_b, mono_b) = match b {
            None => (SignedDuration::ZERO, now),
            Some(sub) => sub.freshest(now)?,
        };

        let max_age_diff = match (a, b) {
            (Some(a), Some(b)) => match (a.shared.max_age_diff(), b.shared.max_age_diff()) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (Some(x), None) => Some(x),
                (None, Some(y)) => Some(y),
                (None, None) => None,
            },
            (Some(a), None) => a.shared.max_age_diff(),
            (None, Some(b)) => b.shared.max_age_diff(),
            (None, None) => None,
        };
        if let Some(limit) = max_age_diff {
            let lag = mono_a.max(mono_b).saturating_duration_since(mono_a.min(mono_b));
            if lag > limit {
                return Err(CompareError::Stale);
            }
        }

        Ok(diff_a - diff_b)
    }

    /// Run one poll cycle: used both by the background poll task and
    /// directly by tests. Returns the number of sources sampled.
    pub fn poll_once(&self) -> usize {
        let (sources, tick, subscribers, global): (
            Vec<Arc<SourceEntry>>,
            u64,
            Vec<mpsc::Sender<SyncEvent>>,
            i32,
        ) = {
            let mut state = self.state.lock();
            state.poll_tick += 1;
            let sources = state
                .sources
                .values()
                .filter(|s| !s.inactive.load(Ordering::Acquire))
                .cloned()
                .collect();
            let subscribers = state.event_subscribers.iter().map(|s| s.tx.clone()).collect();
            (sources, state.poll_tick, subscribers, state.global_poll_period_log2)
        };

        let mut sampled = 0;
        for source in &sources {
            let cycles = source.cycles.fetch_add(1, Ordering::AcqRel) + 1;
            let shift = (source.poll_period_log2 - global).max(0) as u32;
            let divisor = 1u64 << shift;
            if cycles % divisor != 0 {
                continue;
            }
            self.sample_source(source);
            sampled += 1;
        }

        for tx in subscribers {
            if tx.try_send(SyncEvent { poll_tick: tick }).is_err() {
                debug!("event subscriber mailbox full or closed; dropping SYNC_EVENT");
            }
        }
        sampled
    }

    fn sample_source(&self, source: &Arc<SourceEntry>) {
        let now_mono = Instant::now();
        let now_system = SystemTime::now();
        match source.driver.compare_to_system() {
            Ok(diff) => {
                let snapshot = offset_systemtime(now_system, diff);
                source.ring.write(Ok(()), now_mono, now_system, snapshot);
            }
            Err(rc) => {
                source.ring.write(Err(rc), now_mono, now_system, now_system);
            }
        }
    }

    /// Spawn the background poll timer. The tick period is
    /// `2^global_poll_period_log2` seconds, re-evaluated every tick so a
    /// coercion from `add_clock`/`remove_clock` takes effect on the next
    /// wakeup.
    pub fn spawn_poll_loop(&self) -> tokio::task::JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            loop {
                let period_log2 = {
                    let state = feed.state.lock();
                    if state.shutting_down {
                        break;
                    }
                    state.global_poll_period_log2
                };
                let period = Duration::from_secs_f64(2f64.powi(period_log2));
                tokio::time::sleep(period).await;
                feed.poll_once();
            }
        })
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
    }
}

impl Default for ClockFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn offset_systemtime(base: SystemTime, diff: SignedDuration) -> SystemTime {
    if diff.nanos >= 0 {
        base + Duration::from_nanos(diff.nanos as u64)
    } else {
        base - Duration::from_nanos((-diff.nanos) as u64)
    }
}
