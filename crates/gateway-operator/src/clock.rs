//! Time source injected into the reconcilers
//!
//! Condition transition timestamps come from here so tests can pin them.

use chrono::{DateTime, Utc};
#[cfg(test)]
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// RFC 3339 rendering used in status fields
    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FakeClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut time = self.time.lock().unwrap_or_else(|e| e.into_inner());
        *time += by;
    }
}

#[cfg(test)]
impl Default for FakeClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::default())
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_advances() {
        let clock = FakeClock::default();
        let before = clock.now();
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!((clock.now() - before).num_seconds(), 90);
        assert!(clock.now_rfc3339().starts_with("1970-01-01T00:01:30"));
    }
}
