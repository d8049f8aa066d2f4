//! Bounded polling. Every wait on the hardware is "poll N times with sleep S", never a wall-clock
//! deadline, so the elapsed time is only ever approximately `max_attempts * interval`.

use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt::Debug,
    time::Duration,
};

/// Something that can put the current thread to sleep
pub trait Sleeper: Debug + Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Actually sleeps
#[derive(Debug, Default, Copy, Clone)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How many times to re-check a condition and how long to wait in between
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: usize,
    #[serde(with = "micros")]
    pub interval: Duration,
}

impl PollPolicy {
    #[must_use]
    pub const fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Scale the interval, keeping the attempt count
    #[must_use]
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            interval: self.interval * factor.max(1),
            ..self
        }
    }

    /// Evaluate `check` until it yields `Some`, sleeping `interval` after every miss.
    /// Returns `Ok(None)` once the attempts are exhausted.
    /// # Errors
    /// Returns the first error `check` produces
    pub fn poll<R, E>(
        &self,
        sleeper: &dyn Sleeper,
        mut check: impl FnMut(usize) -> Result<Option<R>, E>,
    ) -> Result<Option<R>, E> {
        for attempt in 0..self.max_attempts {
            if let Some(r) = check(attempt)? {
                return Ok(Some(r));
            }
            sleeper.sleep(self.interval);
        }
        Ok(None)
    }

    /// Poll a boolean condition, returning whether it ever held
    /// # Errors
    /// Returns the first error `check` produces
    pub fn until<E>(
        &self,
        sleeper: &dyn Sleeper,
        mut check: impl FnMut() -> Result<bool, E>,
    ) -> Result<bool, E> {
        Ok(self
            .poll(sleeper, |_| Ok(check()?.then_some(())))?
            .is_some())
    }
}

/// Durations are written in configuration files as integer microseconds
pub(crate) mod micros {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

/// Records requested delays instead of sleeping
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSleeper {
    total: std::sync::Mutex<Duration>,
    count: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RecordingSleeper {
    pub(crate) fn total(&self) -> Duration {
        *self.total.lock().unwrap()
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        *self.total.lock().unwrap() += duration;
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_success_stops_early() {
        let sleeper = RecordingSleeper::default();
        let policy = PollPolicy::new(10, Duration::from_millis(100));
        let got: Result<_, ()> = policy.poll(&sleeper, |attempt| Ok((attempt == 3).then_some(attempt)));
        assert_eq!(got, Ok(Some(3)));
        assert_eq!(sleeper.count(), 3);
        assert_eq!(sleeper.total(), Duration::from_millis(300));
    }

    #[test]
    fn test_poll_exhausts() {
        let sleeper = RecordingSleeper::default();
        let policy = PollPolicy::new(5, Duration::from_micros(200));
        let held: Result<bool, ()> = policy.until(&sleeper, || Ok(false));
        assert_eq!(held, Ok(false));
        assert_eq!(sleeper.count(), 5);
    }

    #[test]
    fn test_poll_propagates_errors() {
        let sleeper = RecordingSleeper::default();
        let policy = PollPolicy::new(5, Duration::from_micros(200));
        let got: Result<Option<()>, &str> = policy.poll(&sleeper, |_| Err("bus down"));
        assert_eq!(got, Err("bus down"));
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn test_scaled() {
        let policy = PollPolicy::new(100, Duration::from_micros(200)).scaled(3);
        assert_eq!(policy.interval, Duration::from_micros(600));
        assert_eq!(policy.max_attempts, 100);
    }
}
