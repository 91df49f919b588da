use std::time::{
    Duration,
    Instant,
};

use prometheus::HistogramVec;

/// Timer that records into a `status`-labeled histogram on drop, defaulting
/// to `"error"` unless [`StatusTimer::finish`] (or a `finish_*` variant) runs
/// first. This means a timer dropped by an early `?` return is correctly
/// counted as a failure without the caller having to remember to do so.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    status: &'static str,
    recorded: bool,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            status: "error",
            recorded: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Mark the timer as successful and record it now.
    pub fn finish(mut self) -> Duration {
        self.status = "success";
        self.record()
    }

    /// Record with an arbitrary status label, e.g. an error's wire code.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.status = status;
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram
            .with_label_values(&[self.status])
            .observe(elapsed.as_secs_f64());
        self.recorded = true;
        elapsed
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if self.recorded || std::thread::panicking() {
            return;
        }
        self.histogram
            .with_label_values(&[self.status])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
