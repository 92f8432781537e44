//! Latency statistics for lock requests.
//!
//! The monitor worker times every request it issues, from the call until
//! the result is back, and folds the samples into a [`LatencyStats`].

/// Width of one histogram bucket in nanoseconds.
const BUCKET_NS: u64 = 500;

/// Number of histogram buckets; the last one collects everything above.
const BUCKETS: usize = 20;

/// Tracks latency statistics with minimal overhead.
///
/// Accumulates min, max, sum and a fixed-width histogram. Updating is a
/// handful of integer operations so it can sit inside the measured loop
/// without distorting it much.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Creates an empty tracker.
    ///
    /// `min` starts at `u64::MAX` so the first sample becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one request latency in nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = (nanos / BUCKET_NS).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    /// Folds another tracker into this one.
    pub fn merge(&mut self, other: &LatencyStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
    }

    /// Average latency in nanoseconds, 0.0 when nothing was recorded.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Prints count, min/avg/max and the non-empty histogram buckets.
    pub fn print_report(&self) {
        println!("\nLatency Metrics (per request)");
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }

        let avg_ns = self.avg();
        if avg_ns < 1000.0 {
            println!("Min:   {:.2} ns", self.min as f64);
            println!("Avg:   {:.2} ns", avg_ns);
            println!("Max:   {:.2} ns", self.max as f64);
        } else {
            println!("Min:   {:.2} us", self.min as f64 / 1000.0);
            println!("Avg:   {:.2} us", avg_ns / 1000.0);
            println!("Max:   {:.2} us", self.max as f64 / 1000.0);
        }

        println!("Distribution ({} ns buckets):", BUCKET_NS);
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let open = if i == BUCKETS - 1 { ">" } else { "" };
                let lower = i as u64 * BUCKET_NS;
                let upper = (i as u64 + 1) * BUCKET_NS;
                println!("[{:5}-{:5}{} ns]: {}", lower, upper, open, count);
            }
        }
    }
}
