use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Time source consumed by the timeline synchronizer.
///
/// Recording start detection needs two clocks: a wall clock to guard against
/// systems that boot with an unset date, and a monotonic clock that anchors
/// the session time origin. Both reads are fallible; a failed read aborts
/// only the packet being processed.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary fixed origin.
    fn monotonic(&self) -> Result<Duration>;

    /// Wall-clock seconds since the Unix epoch.
    fn wall_secs(&self) -> Result<i64>;

    /// Wall-clock seconds with fractional precision, for segment start
    /// stamps (serialized with 6 decimal places).
    fn wall_ts(&self) -> Result<f64>;
}

/// System clock: `Instant` for monotonic time, `chrono` for wall time.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Result<Duration> {
        Ok(self.origin.elapsed())
    }

    fn wall_secs(&self) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        if now < 0 {
            return Err(Error::ClockFailure(format!(
                "wall clock before epoch: {now}"
            )));
        }
        Ok(now)
    }

    fn wall_ts(&self) -> Result<f64> {
        let micros = chrono::Utc::now().timestamp_micros();
        if micros < 0 {
            return Err(Error::ClockFailure(format!(
                "wall clock before epoch: {micros}us"
            )));
        }
        Ok(micros as f64 / 1_000_000.0)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    monotonic: Duration,
    wall_secs: i64,
    fail: bool,
}

impl ManualClock {
    #[must_use]
    pub fn new(wall_secs: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                monotonic: Duration::ZERO,
                wall_secs,
                fail: false,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock();
        state.monotonic += by;
        state.wall_secs += by.as_secs() as i64;
    }

    pub fn set_wall_secs(&self, secs: i64) {
        self.inner.lock().wall_secs = secs;
    }

    /// Make subsequent reads fail, to exercise `ClockFailure` paths.
    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().fail = fail;
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Result<Duration> {
        let state = self.inner.lock();
        if state.fail {
            return Err(Error::ClockFailure("manual clock failing".to_string()));
        }
        Ok(state.monotonic)
    }

    fn wall_secs(&self) -> Result<i64> {
        let state = self.inner.lock();
        if state.fail {
            return Err(Error::ClockFailure("manual clock failing".to_string()));
        }
        Ok(state.wall_secs)
    }

    fn wall_ts(&self) -> Result<f64> {
        let state = self.inner.lock();
        if state.fail {
            return Err(Error::ClockFailure("manual clock failing".to_string()));
        }
        Ok(state.wall_secs as f64 + state.monotonic.subsec_micros() as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic_advances() {
        let clock = SystemClock::new();
        let a = clock.monotonic().expect("monotonic");
        let b = clock.monotonic().expect("monotonic");
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_700_000_000);
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.monotonic().expect("monotonic"), Duration::from_secs(3));
        assert_eq!(clock.wall_secs().expect("wall"), 1_700_000_003);

        clock.set_failing(true);
        assert!(clock.monotonic().is_err());
    }
}
