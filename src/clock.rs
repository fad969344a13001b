use chrono::{DateTime, Utc};

/// Injected time source. Production uses wall-clock `Utc::now`; tests
/// substitute a fixed or steppable clock, per the "global singletons in
/// source -> passed-in environment" design note.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock whose value is set explicitly, for deterministic tests of
    /// stuck-row reclaim, seeding timeouts, and retention pruning.
    pub struct FixedClock(AtomicI64);

    impl FixedClock {
        pub fn new(initial: DateTime<Utc>) -> Self {
            Self(AtomicI64::new(initial.timestamp_millis()))
        }

        pub fn advance(&self, delta: chrono::Duration) {
            self.0.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
        }

        pub fn set(&self, at: DateTime<Utc>) {
            self.0.store(at.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.0.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
        }
    }
}
