// clockfeed: Ring Sample Store (C1)
//
// Fixed-capacity, single-writer / many-reader record of clock/system time
// pairs with a monotonically increasing write counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use crate::error::CompareError;

/// log2 of the ring capacity.
pub const CAPACITY_LOG2: u32 = 4;
/// Ring capacity, `N = 16`.
pub const CAPACITY: usize = 1 << CAPACITY_LOG2;

/// One atomic record written by the feed thread and read by any number of
/// subscriber threads.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Write-counter value at which this slot was written.
    pub seq: u64,
    /// Compare result code: `Ok(())` or the driver-reported failure kind.
    pub rc: Result<(), CompareError>,
    /// Monotonic clock reading taken when sampled.
    pub mono: Instant,
    /// Realtime system clock reading taken when sampled.
    pub system: SystemTime,
    /// `system + (hw_clock - system)` when `rc` is `Ok`; zero duration
    /// offset from `system` otherwise.
    pub snapshot: SystemTime,
}

impl Sample {
    fn empty(now_mono: Instant, now_system: SystemTime) -> Self {
        Self {
            seq: 0,
            rc: Err(CompareError::NoData),
            mono: now_mono,
            system: now_system,
            snapshot: now_system,
        }
    }

    /// Signed offset this sample represents: `snapshot - system`, or zero
    /// when `rc` is an error (a failed compare carries no offset, but is
    /// not itself an error to report further).
    pub fn diff(&self) -> SignedDuration {
        if self.rc.is_err() {
            return SignedDuration::ZERO;
        }
        SignedDuration::from_systemtime_delta(self.snapshot, self.system)
    }
}

/// A signed nanosecond duration; `std::time::Duration` is unsigned, and the
/// feed/servo math throughout this crate needs signed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SignedDuration {
    pub nanos: i128,
}

impl SignedDuration {
    pub const ZERO: Self = Self { nanos: 0 };

    pub fn from_nanos(nanos: i128) -> Self {
        Self { nanos }
    }

    pub fn from_systemtime_delta(later: SystemTime, earlier: SystemTime) -> Self {
        match later.duration_since(earlier) {
            Ok(d) => Self::from_nanos(d.as_nanos() as i128),
            Err(e) => Self::from_nanos(-(e.duration().as_nanos() as i128)),
        }
    }

    pub fn abs(self) -> Self {
        Self {
            nanos: self.nanos.abs(),
        }
    }

    pub fn as_secs_f64(self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }
}

impl std::ops::Sub for SignedDuration {
    type Output = SignedDuration;
    fn sub(self, rhs: SignedDuration) -> SignedDuration {
        SignedDuration::from_nanos(self.nanos - rhs.nanos)
    }
}

impl std::ops::Add for SignedDuration {
    type Output = SignedDuration;
    fn add(self, rhs: SignedDuration) -> SignedDuration {
        SignedDuration::from_nanos(self.nanos + rhs.nanos)
    }
}

impl std::ops::Neg for SignedDuration {
    type Output = SignedDuration;
    fn neg(self) -> SignedDuration {
        SignedDuration::from_nanos(-self.nanos)
    }
}

/// Fixed-capacity ring of `Sample`s. Exactly one writer; any number of
/// lock-free readers.
///
/// `write_counter` is the publish point: writers populate a slot via a raw
/// `UnsafeCell`, then `Release`-store the incremented counter. Readers
/// `Acquire`-load the counter before and after reading a slot and discard
/// the read if it could have torn (seqlock-style double read).
/// Writers never block: there is no lock on the write path.
pub struct RingStore {
    samples: [std::cell::UnsafeCell<Sample>; CAPACITY],
    write_counter: AtomicU64,
}

// SAFETY: `samples` is only ever mutated by the single designated writer
// thread (enforced by the caller discipline documented on `write`), and
// readers only ever perform plain loads bracketed by the `write_counter`
// acquire/release pair, which the ring-buffer literature establishes as
// sufficient to make a torn read detectable rather than undefined: a torn
// `Sample` can only be observed transiently and is always caught by the
// `w2 >= w1 + (N-1)` re-check before being returned.
unsafe impl Sync for RingStore {}

impl RingStore {
    pub fn new(now_mono: Instant, now_system: SystemTime) -> Self {
        Self {
            samples: std::array::from_fn(|_| {
                std::cell::UnsafeCell::new(Sample::empty(now_mono, now_system))
            }),
            write_counter: AtomicU64::new(0),
        }
    }

    /// Current write counter (for cadence bookkeeping and tests). Not part
    /// of the reader hot path.
    pub fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Acquire)
    }

    /// Populate the slot, then publish.
    ///
    /// Single-writer only; callers (the feed thread) must serialize their
    /// own calls. Never blocks.
    pub fn write(&self, rc: Result<(), CompareError>, mono: Instant, system: SystemTime, snapshot: SystemTime) {
        let w = self.write_counter.load(Ordering::Relaxed);
        let idx = (w as usize) % CAPACITY;
        let seq = w + 1;
        let record = Sample {
            seq,
            rc,
            mono,
            system,
            snapshot,
        };
        // SAFETY: single writer by contract; no reader holds a reference
        // across this write because readers only ever copy the slot by
        // value inside `read_freshest`.
        unsafe {
            *self.samples[idx].get() = record;
        }
        self.write_counter.store(seq, Ordering::Release);
    }

    /// `min_counter` and `max_age` encode the staleness gates of a
    /// particular Subscription; pass `0` / `None` to
    /// skip them (used by the system-clock's implicit "always fresh"
    /// bypass and by tests).
    pub fn read_freshest(
        &self,
        now_mono: Instant,
        min_counter: u64,
        max_age: Option<Duration>,
    ) -> Result<Sample, CompareError> {
        let w1 = self.write_counter.load(Ordering::Acquire);
        if w1 == 0 {
            return Err(CompareError::NoData);
        }
        if w1 < min_counter {
            return Err(CompareError::Stale);
        }

        let idx = ((w1 - 1) as usize) % CAPACITY;
        // SAFETY: a plain copy read; may race a concurrent writer and tear,
        // which is caught by the w2 re-check below before the result is
        // trusted.
        let snapshot = unsafe { *self.samples[idx].get() };

        let w2 = self.write_counter.load(Ordering::Acquire);
        if w2 >= w1 + (CAPACITY as u64 - 1) {
            return Err(CompareError::Overrun);
        }

        if let Some(max_age) = max_age {
            if now_mono.saturating_duration_since(snapshot.mono) > max_age {
                return Err(CompareError::Stale);
            }
        }

        Ok(snapshot)
    }
}
