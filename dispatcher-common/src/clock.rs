//! Injectable wall-clock abstraction.
//!
//! Every timeout/cooldown computation in the core goes through a [`Clock`]
//! rather than calling `Utc::now()` directly, so minute-scale turnover and
//! hour-scale stop-retry windows can be exercised in tests without sleeping.

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock, backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock that only advances when told to. Starts at the Unix epoch.
    pub struct FakeClock {
        micros: AtomicI64,
    }

    impl FakeClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                micros: AtomicI64::new(start.timestamp_micros()),
            }
        }

        pub fn advance(&self, duration: chrono::Duration) {
            self.micros
                .fetch_add(duration.num_microseconds().unwrap_or(0), Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
                .expect("fake clock micros always in range")
        }
    }
}
