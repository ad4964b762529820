use std::collections::VecDeque;

/// Outcome of a single probe. Arrival order is time order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: f64,
}

impl ProbeOutcome {
    pub fn success(latency_ms: f64) -> Self {
        Self { success: true, latency_ms }
    }

    pub fn failure() -> Self {
        Self { success: false, latency_ms: 0.0 }
    }
}

/// Loss / latency / jitter derived from a window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowMetrics {
    pub loss_pct: f64,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub sample_count: usize,
}

/// Bounded FIFO of probe outcomes for one target
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<ProbeOutcome>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an outcome, evicting the oldest one when full
    pub fn push(&mut self, outcome: ProbeOutcome) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(outcome);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.samples.iter()
    }

    /// Compute loss, mean latency and jitter over the window.
    ///
    /// Latency and jitter only consider successful samples and stay at 0 until
    /// at least two successes exist. Jitter is the mean absolute difference
    /// between consecutive successful latencies.
    pub fn metrics(&self) -> WindowMetrics {
        let total = self.samples.len();
        if total == 0 {
            return WindowMetrics::default();
        }

        let failures = self.samples.iter().filter(|s| !s.success).count();
        let loss_pct = failures as f64 / total as f64 * 100.0;

        let latencies: Vec<f64> = self
            .samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms)
            .collect();

        if latencies.len() < 2 {
            return WindowMetrics {
                loss_pct,
                avg_latency_ms: 0.0,
                jitter_ms: 0.0,
                sample_count: total,
            };
        }

        let avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let jitter_ms = latencies
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .sum::<f64>()
            / (latencies.len() - 1) as f64;

        WindowMetrics {
            loss_pct,
            avg_latency_ms,
            jitter_ms,
            sample_count: total,
        }
    }
}
