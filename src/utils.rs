use crate::common::*;
use std::time::Duration;

/// Measures how many units are processed per second, reported once per interval.
#[derive(Debug, Clone)]
pub struct RateCounter {
    interval: Duration,
    count: f64,
    since: Instant,
    rate: Option<f64>,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            count: 0.0,
            since: Instant::now(),
            rate: None,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, count: f64) {
        self.count += count;

        let elapsed = self.since.elapsed();
        if elapsed >= self.interval && elapsed > Duration::ZERO {
            self.rate = Some(self.count / elapsed.as_secs_f64());
            self.count = 0.0;
            self.since = Instant::now();
        }
    }

    /// Takes the last measured rate, if a new one is available.
    pub fn rate(&mut self) -> Option<f64> {
        self.rate.take()
    }
}
