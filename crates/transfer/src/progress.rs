use std::time::{Duration, Instant};

/// Default window length for one throughput sample.
const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Accumulates byte counts and yields one throughput sample per elapsed
/// window. Both transfer directions use the same meter, so the numbers
/// shown on either end are comparable.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    window_start: Instant,
    bytes: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::with_window(SAMPLE_WINDOW)
    }

    /// Creates a meter with a custom sampling window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            bytes: 0,
        }
    }

    /// Records `bytes` transferred. Returns `Some(mbps)` once a full
    /// window has elapsed, resetting the counter for the next one.
    pub fn record(&mut self, bytes: u64) -> Option<f64> {
        self.bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed < self.window {
            return None;
        }
        let mbps = (self.bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0;
        self.bytes = 0;
        self.window_start = Instant::now();
        Some(mbps)
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}
