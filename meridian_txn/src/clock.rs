//! Monotonic wall clock with injectable time sources.

use meridian_types::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Raw time source behind the [`Clock`]. Tests substitute a fake advancing
/// on demand.
pub trait TimeSource: Send + Sync {
    /// Current instant in microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;
}

/// Wall-clock time source.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Manually driven time source for tests.
#[derive(Debug)]
pub struct FakeTimeSource {
    micros: AtomicI64,
}

impl FakeTimeSource {
    /// A fake source starting at `start`.
    pub fn new(start: Timestamp) -> Self {
        FakeTimeSource {
            micros: AtomicI64::new(start.as_micros()),
        }
    }

    /// Advance the source by `d`.
    pub fn advance(&self, d: Duration) {
        let micros = i64::try_from(d.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Jump the source to `ts`. Moving backwards is ignored by the clock's
    /// monotonic guard.
    pub fn set(&self, ts: Timestamp) {
        self.micros.store(ts.as_micros(), Ordering::SeqCst);
    }
}

impl TimeSource for FakeTimeSource {
    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Monotonic clock: `now()` never decreases across a process lifetime, even
/// when the underlying source stalls or steps backwards. Commit finalisation
/// feeds published timestamps back through [`Clock::observe`], so a strong
/// read never selects an instant below the newest commit.
pub struct Clock {
    source: Arc<dyn TimeSource>,
    last: AtomicI64,
}

impl Clock {
    /// A clock over the system wall clock.
    pub fn system() -> Self {
        Clock::new(Arc::new(SystemTimeSource))
    }

    /// A clock over the given source.
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Clock {
            source,
            last: AtomicI64::new(0),
        }
    }

    /// Current timestamp, guaranteed non-decreasing.
    pub fn now(&self) -> Timestamp {
        let raw = self.source.now_micros();
        let prev = self.last.fetch_max(raw, Ordering::SeqCst);
        Timestamp::from_micros(raw.max(prev))
    }

    /// Fold an externally produced timestamp (e.g. a published commit) into
    /// the monotonic floor.
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts.as_micros(), Ordering::SeqCst);
    }

    /// Block until the clock reaches `ts`. Cooperative: with a fake source
    /// another thread is expected to advance it.
    pub fn sleep_until(&self, ts: Timestamp) {
        while self.now() < ts {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}
