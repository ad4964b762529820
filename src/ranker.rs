use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::scorer::{ScoreSnapshot, ScoreTier, TargetHealth};
use crate::target::TargetDescriptor;

/// One row of the ranked snapshot
#[derive(Debug, Clone)]
pub struct RankedTarget {
    pub descriptor: Arc<TargetDescriptor>,
    pub snapshot: ScoreSnapshot,
}

impl RankedTarget {
    pub fn identity(&self) -> &str {
        &self.descriptor.identity
    }
}

/// Score every target and sort ascending (lower is better).
///
/// The sort is stable, so equal scores keep their load order.
pub fn rank(targets: &[Arc<TargetHealth>], now: Instant) -> Vec<RankedTarget> {
    let mut ranked: Vec<RankedTarget> = targets
        .iter()
        .map(|t| RankedTarget {
            descriptor: t.descriptor().clone(),
            snapshot: t.score_at(now),
        })
        .collect();
    ranked.sort_by(|a, b| a.snapshot.score.total_cmp(&b.snapshot.score));
    ranked
}

/// Overall network condition derived from the best few targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkHealth {
    Excellent,
    Good,
    Unstable,
    Degraded,
    Critical,
    /// Only warmup targets have data so far
    Calculating,
}

impl NetworkHealth {
    pub fn describe(&self) -> &'static str {
        match self {
            NetworkHealth::Excellent => "Network is stable and low jitter",
            NetworkHealth::Good => "Usable, slight jitter detected",
            NetworkHealth::Unstable => "High jitter detected",
            NetworkHealth::Degraded => "Significant packet loss detected",
            NetworkHealth::Critical => "Most targets are unreachable",
            NetworkHealth::Calculating => "Collecting samples",
        }
    }
}

/// Classify the network from the top `sample` live targets.
///
/// Established targets are preferred; when none exist yet, warmup targets
/// that have at least one sample are used and the result is `Calculating`.
pub fn assess_network(ranked: &[RankedTarget], sample: usize) -> NetworkHealth {
    let live = |r: &&RankedTarget| r.snapshot.loss_pct < 100.0;

    let established: Vec<&RankedTarget> = ranked
        .iter()
        .filter(|r| r.snapshot.tier == ScoreTier::Established)
        .filter(live)
        .take(sample)
        .collect();

    if established.is_empty() {
        let warming = ranked
            .iter()
            .filter(|r| r.snapshot.tier == ScoreTier::Warmup && r.snapshot.sample_count > 0)
            .any(|r| r.snapshot.loss_pct < 100.0);
        return if warming {
            NetworkHealth::Calculating
        } else {
            NetworkHealth::Critical
        };
    }

    let n = established.len() as f64;
    let avg_loss = established.iter().map(|r| r.snapshot.loss_pct).sum::<f64>() / n;
    let avg_jitter = established.iter().map(|r| r.snapshot.jitter_ms).sum::<f64>() / n;

    if avg_loss < 10.0 {
        if avg_jitter < 50.0 {
            NetworkHealth::Excellent
        } else if avg_jitter < 200.0 {
            NetworkHealth::Good
        } else {
            NetworkHealth::Unstable
        }
    } else if avg_loss < 50.0 {
        NetworkHealth::Degraded
    } else {
        NetworkHealth::Critical
    }
}

#[cfg(test)]
pub(crate) fn test_row(identity: &str, score: f64, loss_pct: f64, tier: ScoreTier) -> RankedTarget {
    RankedTarget {
        descriptor: crate::target::test_descriptor(identity),
        snapshot: ScoreSnapshot {
            score,
            loss_pct,
            avg_latency_ms: 50.0,
            jitter_ms: 5.0,
            sample_count: 10,
            tier,
        },
    }
}
