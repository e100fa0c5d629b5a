use serde::{Deserialize, Serialize};

/// Order-dependent running mean
///
/// Each sample is folded in with `new = (old * (n - 1) + value) / n`, where
/// `n` is the sample count after the increment. Samples for one accumulator
/// must be applied sequentially; the window owning it holds the lock that
/// guarantees this.
///
/// # Examples
///
/// ```
/// use processor::aggregation::RunningMean;
///
/// let mut latency = RunningMean::new();
/// latency.push(100.0);
/// latency.push(200.0);
/// latency.push(300.0);
///
/// assert_eq!(latency.mean(), 200.0);
/// assert_eq!(latency.count(), 3);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    mean: f64,
    count: u64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one sample
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let n = self.count as f64;
        self.mean = (self.mean * (n - 1.0) + value) / n;
    }

    /// Fold in a 0/1 indicator
    pub fn push_flag(&mut self, flag: bool) {
        self.push(if flag { 1.0 } else { 0.0 });
    }

    /// Current mean, `0.0` before the first sample
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
