//! Clock and id-generator injection
//!
//! Scheduler transactions take their timestamps from the database; everything
//! the engine stamps in-process goes through [`Clock`] so tests can pin time.
//! Run and worker ids come from [`IdGen`] for the same reason.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use uuid::Uuid;

/// Injected time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time. The production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. For deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by `millis` milliseconds.
    pub fn advance_ms(&self, millis: i64) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += Duration::milliseconds(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Injected id source for runs and workers.
pub trait IdGen: Send + Sync {
    fn next_id(&self) -> Uuid;
}

/// Random UUIDv4 ids. The production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Counter-backed ids for reproducible tests.
#[derive(Debug, Default)]
pub struct SequenceIdGen {
    next: Mutex<u128>,
}

impl IdGen for SequenceIdGen {
    fn next_id(&self) -> Uuid {
        let mut next = self.next.lock().expect("idgen lock poisoned");
        *next += 1;
        Uuid::from_u128(*next)
    }
}
