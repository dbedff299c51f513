//! Transfer speed metering.
//!
//! A fixed ring of time-bucketed byte counters: 60 closed one-second
//! buckets plus one working bucket that fills until its time limit
//! passes. Queries are non-blocking and amortise the working bucket's
//! partial second into the result. With zero elapsed time the speed is
//! defined as 0.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Width of one bucket.
pub const SPEED_STEP: Duration = Duration::from_millis(1000);
/// Number of closed buckets kept (more = smoother decay).
pub const SPEED_NUM_STEPS: usize = 60;

struct MeterInner {
    /// Ring of closed buckets + one working bucket at `index`.
    buckets: [u64; SPEED_NUM_STEPS + 1],
    index: usize,
    /// End of the working bucket's time window.
    window_end: Option<Instant>,
    /// Closed buckets + the working one currently valid in the ring.
    filled: usize,
    last_transfer: Option<Instant>,
}

/// Thread-safe speed meter; clone the `Arc` holding it per connection.
pub struct SpeedMeter {
    inner: Mutex<MeterInner>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                buckets: [0; SPEED_NUM_STEPS + 1],
                index: 0,
                window_end: None,
                filled: 0,
                last_transfer: None,
            }),
        }
    }

    /// Reset for reuse (called when a connection is established).
    pub fn clear(&self) {
        let mut m = self.inner.lock().unwrap();
        m.buckets = [0; SPEED_NUM_STEPS + 1];
        m.index = 0;
        m.window_end = None;
        m.filled = 0;
        m.last_transfer = None;
    }

    /// Record `count` transferred bytes at time `now`.
    pub fn bytes_transferred(&self, count: u64, now: Instant) {
        let mut m = self.inner.lock().unwrap();
        roll_forward(&mut m, now);
        let i = m.index;
        m.buckets[i] += count;
        m.last_transfer = Some(now);
    }

    /// Recent transfer speed in bytes per second, measured over the
    /// filled part of the ring.
    pub fn speed(&self, now: Instant) -> u64 {
        let mut m = self.inner.lock().unwrap();
        roll_forward(&mut m, now);
        let window_end = match m.window_end {
            Some(e) => e,
            None => return 0, // nothing recorded yet
        };

        // Elapsed time inside the working bucket.
        let working_elapsed = SPEED_STEP.saturating_sub(window_end.saturating_duration_since(now));
        let closed = m.filled.saturating_sub(1);
        let elapsed =
            Duration::from_millis(closed as u64 * SPEED_STEP.as_millis() as u64) + working_elapsed;
        if elapsed.is_zero() {
            return 0;
        }

        let mut total: u64 = 0;
        for k in 0..m.filled {
            let idx = (m.index + m.buckets.len() - k) % m.buckets.len();
            total += m.buckets[idx];
        }
        (total as u128 * 1000 / elapsed.as_millis().max(1)) as u64
    }

    /// Seconds since the last byte moved; `None` before any transfer.
    pub fn idle_time(&self, now: Instant) -> Option<Duration> {
        let m = self.inner.lock().unwrap();
        m.last_transfer.map(|t| now.saturating_duration_since(t))
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Close buckets whose window has passed; gaps become zero buckets.
fn roll_forward(m: &mut MeterInner, now: Instant) {
    match m.window_end {
        None => {
            m.window_end = Some(now + SPEED_STEP);
            m.filled = 1;
        }
        Some(mut end) => {
            while now >= end {
                end += SPEED_STEP;
                m.index = (m.index + 1) % m.buckets.len();
                let i = m.index;
                m.buckets[i] = 0;
                if m.filled < m.buckets.len() {
                    m.filled += 1;
                }
            }
            m.window_end = Some(end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_elapsed_returns_zero() {
        let meter = SpeedMeter::new();
        let now = Instant::now();
        assert_eq!(meter.speed(now), 0);
        meter.bytes_transferred(4096, now);
        // same instant: no elapsed time, never a division by zero
        assert_eq!(meter.speed(now), 0);
    }

    #[test]
    fn steady_rate_measured() {
        let meter = SpeedMeter::new();
        let t0 = Instant::now();
        for s in 0..5u64 {
            meter.bytes_transferred(1000, t0 + Duration::from_secs(s));
        }
        let speed = meter.speed(t0 + Duration::from_secs(5));
        // 5000 bytes over 5 seconds
        assert!((900..=1100).contains(&speed), "speed={}", speed);
    }

    #[test]
    fn partial_bucket_gets_credit() {
        let meter = SpeedMeter::new();
        let t0 = Instant::now();
        meter.bytes_transferred(500, t0);
        let speed = meter.speed(t0 + Duration::from_millis(500));
        // 500 bytes over half a second ≈ 1000 B/s
        assert!((800..=1200).contains(&speed), "speed={}", speed);
    }

    #[test]
    fn idle_gap_decays_speed() {
        let meter = SpeedMeter::new();
        let t0 = Instant::now();
        meter.bytes_transferred(10_000, t0);
        let busy = meter.speed(t0 + Duration::from_secs(1));
        let idle = meter.speed(t0 + Duration::from_secs(10));
        assert!(idle < busy);
    }

    #[test]
    fn idle_time_tracked() {
        let meter = SpeedMeter::new();
        let t0 = Instant::now();
        assert!(meter.idle_time(t0).is_none());
        meter.bytes_transferred(1, t0);
        assert_eq!(
            meter.idle_time(t0 + Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn clear_resets() {
        let meter = SpeedMeter::new();
        let t0 = Instant::now();
        meter.bytes_transferred(1000, t0);
        meter.clear();
        assert_eq!(meter.speed(t0 + Duration::from_secs(1)), 0);
        assert!(meter.idle_time(t0).is_none());
    }
}
