use serde::{Deserialize, Serialize};

/// Streaming summary of one measured metric, updated via Welford's
/// online algorithm. `count`/`min`/`max`/`mean` are exact; `variance`
/// (derived from the running `m2`) may differ from another valid
/// streaming algorithm in the last ulp, which is acceptable per the
/// measurement contract — these are diagnostics, not settlement figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    m2: f64,
}

impl Default for MetricSummary {
    fn default() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl MetricSummary {
    fn record(&mut self, sample: f64) {
        self.count += 1;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample - self.mean;
        self.m2 += delta * delta2;
    }

    /// Population variance over the samples seen so far; `0.0` until at
    /// least one sample has been recorded.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

/// The three per-activity metrics tracked over a job's lifetime, all in
/// microseconds: how late a fire landed against its scheduled instant,
/// how far the quantized-to-millisecond instant drifted from the exact
/// computed one, and how long the task body itself took to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub scheduling_delay: MetricSummary,
    pub quantization_error: MetricSummary,
    pub execution_time: MetricSummary,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduling_delay_us(&mut self, value: f64) {
        self.scheduling_delay.record(value);
    }

    pub fn record_quantization_error_us(&mut self, value: f64) {
        self.quantization_error.record(value);
    }

    pub fn record_execution_time_us(&mut self, value: f64) {
        self.execution_time.record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_has_zero_count_and_no_variance() {
        let summary = MetricSummary::default();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.variance(), 0.0);
    }

    #[test]
    fn single_sample_sets_min_max_mean_and_zero_variance() {
        let mut summary = MetricSummary::default();
        summary.record(10.0);
        assert_eq!(summary.count, 1);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 10.0);
        assert_eq!(summary.mean, 10.0);
        assert_eq!(summary.variance(), 0.0);
    }

    #[test]
    fn multiple_samples_track_exact_min_max_mean() {
        let mut summary = MetricSummary::default();
        for sample in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            summary.record(sample);
        }
        assert_eq!(summary.count, 8);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 9.0);
        assert_eq!(summary.mean, 5.0);
        // Population variance of this classic example is 4.0.
        assert!((summary.variance() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn stats_tracks_three_independent_metrics() {
        let mut stats = Stats::new();
        stats.record_scheduling_delay_us(100.0);
        stats.record_quantization_error_us(5.0);
        stats.record_execution_time_us(2_000.0);

        assert_eq!(stats.scheduling_delay.count, 1);
        assert_eq!(stats.quantization_error.count, 1);
        assert_eq!(stats.execution_time.count, 1);
        assert_eq!(stats.scheduling_delay.mean, 100.0);
        assert_eq!(stats.quantization_error.mean, 5.0);
        assert_eq!(stats.execution_time.mean, 2_000.0);
    }
}
