//! Per-connection timeout bookkeeping.
//!
//! One deadline is armed at a time, tagged with why it exists. Read and write
//! minimum-data-rate timing run alongside it. Nothing here owns a timer: the
//! heartbeat calls [`TimeoutControl::tick`] and acts on the returned reason.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Why an armed timeout exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutReason {
    KeepAlive,
    RequestHeaders,
    ReadDataRate,
    WriteDataRate,
    RequestBodyDrain,
    TimeoutFeature,
}

impl TimeoutReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutReason::KeepAlive => "keep_alive",
            TimeoutReason::RequestHeaders => "request_headers",
            TimeoutReason::ReadDataRate => "read_data_rate",
            TimeoutReason::WriteDataRate => "write_data_rate",
            TimeoutReason::RequestBodyDrain => "request_body_drain",
            TimeoutReason::TimeoutFeature => "timeout_feature",
        }
    }
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A minimum throughput requirement with a startup grace period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinDataRate {
    pub bytes_per_second: f64,
    #[serde(rename = "grace_period_secs", with = "duration_secs")]
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        Self {
            bytes_per_second,
            grace_period,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Timing limits applied to every connection of an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpLimits {
    pub keep_alive_timeout: Duration,
    pub request_headers_timeout: Duration,
    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(130),
            request_headers_timeout: Duration::from_secs(30),
            min_request_body_data_rate: Some(MinDataRate::new(240.0, Duration::from_secs(5))),
            min_response_data_rate: Some(MinDataRate::new(240.0, Duration::from_secs(5))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateTiming {
    rate: MinDataRate,
    started: Instant,
    bytes: u64,
}

impl RateTiming {
    fn too_slow(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed <= self.rate.grace_period {
            return false;
        }
        (self.bytes as f64) / elapsed.as_secs_f64() < self.rate.bytes_per_second
    }
}

fn start_timing(slot: &mut Option<RateTiming>, rate: MinDataRate) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(RateTiming {
        rate,
        started: Instant::now(),
        bytes: 0,
    });
    true
}

#[derive(Debug, Default)]
struct TimeoutState {
    deadline: Option<(Instant, TimeoutReason)>,
    read: Option<RateTiming>,
    write: Option<RateTiming>,
}

/// Timeout and data-rate state for one connection.
#[derive(Debug, Default)]
pub struct TimeoutControl {
    state: Mutex<TimeoutState>,
}

impl TimeoutControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timeout unless one is already armed. Returns whether it was armed.
    pub fn set_timeout(&self, timeout: Duration, reason: TimeoutReason) -> bool {
        let mut state = self.lock();
        if state.deadline.is_some() {
            return false;
        }
        state.deadline = Some((Instant::now() + timeout, reason));
        true
    }

    /// Arm a timeout, replacing whatever was armed.
    pub fn reset_timeout(&self, timeout: Duration, reason: TimeoutReason) {
        self.lock().deadline = Some((Instant::now() + timeout, reason));
    }

    /// Re-arm with `reason` only while `expected` is the armed reason.
    pub fn replace_timeout(&self, expected: TimeoutReason, timeout: Duration, reason: TimeoutReason) -> bool {
        let mut state = self.lock();
        match state.deadline {
            Some((_, armed)) if armed == expected => {
                state.deadline = Some((Instant::now() + timeout, reason));
                true
            }
            _ => false,
        }
    }

    pub fn cancel_timeout(&self) {
        self.lock().deadline = None;
    }

    /// Reason of the currently armed timeout.
    pub fn armed(&self) -> Option<TimeoutReason> {
        self.lock().deadline.map(|(_, reason)| reason)
    }

    /// Start timing reads against `rate`. Does nothing if reads are already
    /// being timed; returns whether timing started.
    pub fn start_timing_read(&self, rate: MinDataRate) -> bool {
        start_timing(&mut self.lock().read, rate)
    }

    pub fn bytes_read(&self, count: u64) {
        if let Some(read) = self.lock().read.as_mut() {
            read.bytes = read.bytes.saturating_add(count);
        }
    }

    pub fn stop_timing_read(&self) {
        self.lock().read = None;
    }

    /// Start timing writes against `rate`, unless they already are.
    pub fn start_timing_write(&self, rate: MinDataRate) -> bool {
        start_timing(&mut self.lock().write, rate)
    }

    pub fn bytes_written(&self, count: u64) {
        if let Some(write) = self.lock().write.as_mut() {
            write.bytes = write.bytes.saturating_add(count);
        }
    }

    pub fn stop_timing_write(&self) {
        self.lock().write = None;
    }

    /// Check every armed limit against `now`.
    ///
    /// An expired deadline or violated rate is disarmed as it is reported, so
    /// each arming fires at most once.
    pub fn tick(&self, now: Instant) -> Option<TimeoutReason> {
        let mut state = self.lock();

        if let Some((deadline, reason)) = state.deadline {
            if now >= deadline {
                state.deadline = None;
                return Some(reason);
            }
        }

        if state.read.is_some_and(|read| read.too_slow(now)) {
            state.read = None;
            return Some(TimeoutReason::ReadDataRate);
        }

        if state.write.is_some_and(|write| write.too_slow(now)) {
            state.write = None;
            return Some(TimeoutReason::WriteDataRate);
        }

        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimeoutState> {
        self.state.lock().expect("timeout mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_fires_once() {
        let control = TimeoutControl::new();
        assert!(control.set_timeout(Duration::from_millis(10), TimeoutReason::KeepAlive));
        assert_eq!(control.tick(Instant::now()), None);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(control.tick(later), Some(TimeoutReason::KeepAlive));
        assert_eq!(control.tick(later), None);
    }

    #[test]
    fn set_does_not_replace_but_reset_does() {
        let control = TimeoutControl::new();
        control.set_timeout(Duration::from_secs(60), TimeoutReason::KeepAlive);
        assert!(!control.set_timeout(Duration::from_secs(1), TimeoutReason::RequestHeaders));
        assert_eq!(control.armed(), Some(TimeoutReason::KeepAlive));

        control.reset_timeout(Duration::from_secs(1), TimeoutReason::RequestHeaders);
        assert_eq!(control.armed(), Some(TimeoutReason::RequestHeaders));

        control.cancel_timeout();
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(120)), None);
    }

    #[test]
    fn slow_reads_are_reported_after_grace_period() {
        let control = TimeoutControl::new();
        control.start_timing_read(MinDataRate::new(100.0, Duration::from_secs(2)));
        control.bytes_read(50);

        // Inside the grace period nothing fires regardless of rate.
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(1)), None);
        assert_eq!(
            control.tick(Instant::now() + Duration::from_secs(5)),
            Some(TimeoutReason::ReadDataRate)
        );
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(6)), None);
    }

    #[test]
    fn replace_only_swaps_the_expected_reason() {
        let control = TimeoutControl::new();
        assert!(!control.replace_timeout(TimeoutReason::KeepAlive, Duration::from_secs(1), TimeoutReason::RequestHeaders));
        assert_eq!(control.armed(), None);

        control.set_timeout(Duration::from_secs(60), TimeoutReason::KeepAlive);
        assert!(control.replace_timeout(TimeoutReason::KeepAlive, Duration::from_secs(1), TimeoutReason::RequestHeaders));
        assert_eq!(control.armed(), Some(TimeoutReason::RequestHeaders));
        assert!(!control.replace_timeout(TimeoutReason::KeepAlive, Duration::from_secs(1), TimeoutReason::RequestHeaders));
    }

    #[test]
    fn starting_twice_keeps_the_first_timing() {
        let control = TimeoutControl::new();
        assert!(control.start_timing_read(MinDataRate::new(100.0, Duration::from_secs(1))));
        assert!(!control.start_timing_read(MinDataRate::new(1.0, Duration::from_secs(100))));
        assert_eq!(
            control.tick(Instant::now() + Duration::from_secs(3)),
            Some(TimeoutReason::ReadDataRate)
        );
        assert!(control.start_timing_read(MinDataRate::new(1.0, Duration::from_secs(100))));
    }

    #[test]
    fn fast_writes_are_not_reported() {
        let control = TimeoutControl::new();
        control.start_timing_write(MinDataRate::new(100.0, Duration::from_secs(1)));
        control.bytes_written(10_000);
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(3)), None);
        control.stop_timing_write();
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(300)), None);
    }
}
