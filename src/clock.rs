use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

/// Source of "now" in venue-local naive milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;
}

/// Wall clock shifted by the venue's fixed UTC offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    offset_ms: Ms,
}

impl SystemClock {
    pub fn new(utc_offset_minutes: i64) -> Self {
        Self {
            offset_ms: utc_offset_minutes * 60_000,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        chrono::Utc::now().timestamp_millis() + self.offset_ms
    }
}

/// Clock that only moves when told to. Used by tests and benchmarks.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}
