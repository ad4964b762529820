//! Per-target health state and the three-tier score.
//!
//! Score ordering (lower is better):
//!   established  <  warmup_band + raw  <  dead_band + overflow
//!
//! The established score is an EMA of the raw composite, updated on every
//! appended outcome so reads never mutate anything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::target::TargetDescriptor;
use crate::window::{ProbeOutcome, RollingWindow, WindowMetrics};

/// Which band a score falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreTier {
    Established,
    Warmup,
    Dead,
}

/// Derived view of one target, never stored
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreSnapshot {
    pub score: f64,
    pub loss_pct: f64,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub sample_count: usize,
    pub tier: ScoreTier,
}

impl ScoreSnapshot {
    pub fn is_dead(&self) -> bool {
        self.tier == ScoreTier::Dead
    }
}

/// Weights, thresholds and band offsets
#[derive(Debug, Clone)]
pub struct Scorer {
    weight_loss: f64,
    weight_jitter: f64,
    weight_latency: f64,
    alpha: f64,
    warmup_samples: usize,
    dead_threshold: Duration,
    warmup_band: f64,
    dead_band: f64,
}

impl Scorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            weight_loss: config.weight_loss,
            weight_jitter: config.weight_jitter,
            weight_latency: config.weight_latency,
            alpha: config.ema_alpha,
            warmup_samples: config.warmup_samples,
            dead_threshold: Duration::from_secs(config.dead_threshold_secs),
            warmup_band: config.warmup_band,
            dead_band: config.dead_band,
        }
    }

    /// raw = loss×W_loss + jitter×W_jitter + latency×W_latency
    pub fn raw_score(&self, m: &WindowMetrics) -> f64 {
        m.loss_pct * self.weight_loss + m.jitter_ms * self.weight_jitter + m.avg_latency_ms * self.weight_latency
    }
}

struct HealthState {
    window: RollingWindow,
    smoothed: Option<f64>,
    last_success: Instant,
}

/// Rolling window plus smoothing state for one target.
///
/// Only the target's own probe loop appends; the lock is held for O(window)
/// at most and never across an await.
pub struct TargetHealth {
    descriptor: Arc<TargetDescriptor>,
    scorer: Arc<Scorer>,
    state: Mutex<HealthState>,
}

impl TargetHealth {
    #[cfg(test)]
    pub fn new(descriptor: Arc<TargetDescriptor>, scorer: Arc<Scorer>, capacity: usize) -> Self {
        Self::with_start(descriptor, scorer, capacity, Instant::now())
    }

    /// Targets start out as if they had just succeeded, so they get a full
    /// dead-threshold worth of chances before being declared dead.
    pub fn with_start(
        descriptor: Arc<TargetDescriptor>,
        scorer: Arc<Scorer>,
        capacity: usize,
        start: Instant,
    ) -> Self {
        Self {
            descriptor,
            scorer,
            state: Mutex::new(HealthState {
                window: RollingWindow::new(capacity),
                smoothed: None,
                last_success: start,
            }),
        }
    }

    pub fn descriptor(&self) -> &Arc<TargetDescriptor> {
        &self.descriptor
    }

    pub fn add(&self, success: bool, latency_ms: f64) {
        self.add_at(success, latency_ms, Instant::now());
    }

    /// Append an outcome and advance the smoothing state
    pub fn add_at(&self, success: bool, latency_ms: f64, now: Instant) {
        let outcome = if success {
            ProbeOutcome::success(latency_ms)
        } else {
            ProbeOutcome::failure()
        };

        let mut state = self.state.lock();
        state.window.push(outcome);
        if success {
            state.last_success = now;
        }

        let metrics = state.window.metrics();
        if metrics.sample_count >= self.scorer.warmup_samples {
            let raw = self.scorer.raw_score(&metrics);
            state.smoothed = Some(match state.smoothed {
                None => raw,
                Some(prev) => self.scorer.alpha * raw + (1.0 - self.scorer.alpha) * prev,
            });
        }
    }

    #[cfg(test)]
    pub fn metrics(&self) -> WindowMetrics {
        self.state.lock().window.metrics()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().window.len()
    }

    pub fn since_last_success(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_success)
    }

    pub fn is_dead(&self, now: Instant) -> bool {
        self.since_last_success(now) > self.scorer.dead_threshold
    }

    /// Score the target as of `now`
    pub fn score_at(&self, now: Instant) -> ScoreSnapshot {
        let state = self.state.lock();
        let metrics = state.window.metrics();
        let silent_for = now.saturating_duration_since(state.last_success);

        if silent_for > self.scorer.dead_threshold {
            let overflow = (silent_for - self.scorer.dead_threshold).as_secs_f64();
            return ScoreSnapshot {
                score: self.scorer.dead_band + overflow,
                loss_pct: 100.0,
                avg_latency_ms: metrics.avg_latency_ms,
                jitter_ms: metrics.jitter_ms,
                sample_count: metrics.sample_count,
                tier: ScoreTier::Dead,
            };
        }

        let raw = self.scorer.raw_score(&metrics);
        let (score, tier) = match state.smoothed {
            Some(smoothed) if metrics.sample_count >= self.scorer.warmup_samples => {
                (smoothed, ScoreTier::Established)
            }
            _ => (self.scorer.warmup_band + raw, ScoreTier::Warmup),
        };

        ScoreSnapshot {
            score,
            loss_pct: metrics.loss_pct,
            avg_latency_ms: metrics.avg_latency_ms,
            jitter_ms: metrics.jitter_ms,
            sample_count: metrics.sample_count,
            tier,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_scorer() -> Arc<Scorer> {
    Arc::new(Scorer::new(&ScoringConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::test_descriptor;

    fn health(id: &str, start: Instant) -> TargetHealth {
        TargetHealth::with_start(test_descriptor(id), test_scorer(), 100, start)
    }

    #[test]
    fn test_fresh_target_is_warmup() {
        let now = Instant::now();
        let h = health("a", now);
        let s = h.score_at(now);
        assert_eq!(s.tier, ScoreTier::Warmup);
        assert_eq!(s.sample_count, 0);
        assert_eq!(s.score, 2_000_000.0);
    }

    #[test]
    fn test_warmup_sorts_after_established_with_total_loss() {
        let now = Instant::now();
        let lossy = health("lossy", now);
        for _ in 0..10 {
            lossy.add_at(false, 0.0, now);
        }
        let warm = health("warm", now);
        warm.add_at(true, 20.0, now);

        let a = lossy.score_at(now);
        let b = warm.score_at(now);
        assert_eq!(a.tier, ScoreTier::Established);
        assert_eq!(a.loss_pct, 100.0);
        assert_eq!(b.tier, ScoreTier::Warmup);
        assert!(a.score < b.score, "{} !< {}", a.score, b.score);
    }

    #[test]
    fn test_established_seeds_ema_with_raw() {
        let now = Instant::now();
        let h = health("a", now);
        for lat in [50.0, 55.0, 50.0, 55.0, 50.0] {
            h.add_at(true, lat, now);
        }
        let s = h.score_at(now);
        assert_eq!(s.tier, ScoreTier::Established);
        // raw = 0 loss + jitter 5 * 5 + latency 52 * 0.5
        assert!((s.score - (5.0 * 5.0 + 52.0 * 0.5)).abs() < 1e-9, "score = {}", s.score);
    }

    #[test]
    fn test_ema_damps_single_outlier() {
        let now = Instant::now();
        let h = health("a", now);
        for _ in 0..10 {
            h.add_at(true, 50.0, now);
        }
        let before = h.score_at(now).score;
        h.add_at(true, 1500.0, now);
        let after = h.score_at(now).score;

        let raw_after = test_scorer().raw_score(&h.metrics());
        assert!(after > before);
        assert!(after - before < (raw_after - before) * 0.1, "outlier not damped: {} -> {}", before, after);
    }

    #[test]
    fn test_loss_dominates_latency() {
        let now = Instant::now();
        let fast_lossy = health("fast", now);
        let slow_clean = health("slow", now);
        for i in 0..20 {
            fast_lossy.add_at(i != 0, 10.0, now);
            slow_clean.add_at(true, 900.0, now);
        }
        assert!(slow_clean.score_at(now).score < fast_lossy.score_at(now).score);
    }

    #[test]
    fn test_dead_sorts_after_every_live_target() {
        let start = Instant::now();
        let later = start + Duration::from_secs(601);

        let dead = health("dead", start);
        for _ in 0..5 {
            dead.add_at(true, 1.0, start);
        }

        // Worst possible live targets: warmup with full loss, huge latency and jitter
        let awful = health("awful", start);
        awful.add_at(true, 2000.0, later);
        awful.add_at(false, 0.0, later);

        let d = dead.score_at(later);
        let a = awful.score_at(later);
        assert_eq!(d.tier, ScoreTier::Dead);
        assert_eq!(d.loss_pct, 100.0);
        assert!(d.is_dead());
        assert!(d.score > a.score);
    }

    #[test]
    fn test_longer_dead_sorts_later() {
        let start = Instant::now();
        let h = health("a", start);
        let s1 = h.score_at(start + Duration::from_secs(700));
        let s2 = h.score_at(start + Duration::from_secs(900));
        assert!(s1.is_dead() && s2.is_dead());
        assert!(s2.score > s1.score);
        assert!((s2.score - s1.score - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_success_resets_dead_clock() {
        let start = Instant::now();
        let h = health("a", start);
        let later = start + Duration::from_secs(700);
        assert!(h.is_dead(later));
        h.add_at(true, 30.0, later);
        assert!(!h.is_dead(later));
        assert_eq!(h.since_last_success(later), Duration::ZERO);
    }
}
