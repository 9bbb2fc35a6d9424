//! Time source used by the queue backends.
//!
//! Backends never call `SystemTime::now()` directly so that delay and
//! visibility behaviour can be exercised in tests without sleeping.

use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Something that knows what time it is.
pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Current time as whole unix seconds, rounded up.
    ///
    /// Rounding up keeps `now + delay` from ever being earlier than the
    /// requested delay once stored at second granularity.
    fn now_secs_ceil(&self) -> u64 {
        let since = self.now().duration_since(UNIX_EPOCH).unwrap_or_default();
        since.as_secs() + u64::from(since.subsec_nanos() > 0)
    }

    /// Current time as whole unix seconds, rounded down.
    fn now_secs(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub mod mock {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// A clock that only moves when told to.
    #[derive(Debug)]
    pub struct MockClock {
        current_time: Mutex<SystemTime>,
    }

    impl MockClock {
        /// Start the clock at the given time.
        pub fn new(initial_time: SystemTime) -> Self {
            Self {
                current_time: Mutex::new(initial_time),
            }
        }

        /// Start the clock at a whole number of unix seconds.
        pub fn at_secs(secs: u64) -> Self {
            Self::new(UNIX_EPOCH + Duration::from_secs(secs))
        }

        pub fn set_time(&self, time: SystemTime) {
            *self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = time;
        }

        pub fn advance(&self, duration: Duration) {
            let mut time = self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *time += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> SystemTime {
            *self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
        }
    }
}
