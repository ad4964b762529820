//! Sticky recommendation with hysteresis.
//!
//! ```text
//!   NONE ──(grace elapsed, candidate verified)──▶ HOLDING
//!                                                 │   ▲
//!          (rank > K, dead or gone; cooldown ok)  ▼   │ (candidate verified)
//!                                              RE_EVALUATING
//!                                                 │
//!                     (every candidate failed) ───┴──▶ NONE
//! ```
//!
//! Only the evaluation tick owns the engine. Readers get whole
//! `RecommendationView` values through a watch channel, never a half-updated one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RecommendConfig;
use crate::metrics::ProbeCounters;
use crate::ranker::RankedTarget;
use crate::target::TargetDescriptor;
use crate::verifier::{Verifier, VerifyResult};

/// Extra slack on top of the verify timeout before the engine gives up on a verifier
const VERIFY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    None,
    Holding,
    ReEvaluating,
}

/// What readers see of the engine
#[derive(Debug, Clone)]
pub struct RecommendationView {
    pub phase: Phase,
    pub current: Option<Arc<TargetDescriptor>>,
    pub status: String,
    pub excluded: Vec<String>,
    /// True when the pick was made without deep verification
    pub degraded: bool,
}

impl Default for RecommendationView {
    fn default() -> Self {
        Self {
            phase: Phase::None,
            current: None,
            status: String::new(),
            excluded: Vec::new(),
            degraded: false,
        }
    }
}

pub struct RecommendationEngine {
    grace_period: Duration,
    band: usize,
    cooldown: Duration,
    max_candidates: usize,
    exclusion_ttl: Duration,
    verify_timeout: Duration,
    verifier: Arc<dyn Verifier>,
    counters: Arc<ProbeCounters>,
    started_at: Instant,
    phase: Phase,
    current: Option<Arc<TargetDescriptor>>,
    /// identity -> exclusion expiry
    excluded: HashMap<String, Instant>,
    last_attempt: Option<Instant>,
    status: String,
    degraded: bool,
    publisher: watch::Sender<RecommendationView>,
}

impl RecommendationEngine {
    pub fn new(
        config: &RecommendConfig,
        verifier: Arc<dyn Verifier>,
        counters: Arc<ProbeCounters>,
        started_at: Instant,
    ) -> (Self, watch::Receiver<RecommendationView>) {
        let (publisher, receiver) = watch::channel(RecommendationView::default());
        let engine = Self {
            grace_period: Duration::from_secs(config.grace_period_secs),
            band: config.hysteresis_band,
            cooldown: Duration::from_secs(config.cooldown_secs),
            max_candidates: config.max_candidates,
            exclusion_ttl: Duration::from_secs(config.exclusion_ttl_secs),
            verify_timeout: Duration::from_millis(config.verify_timeout_ms),
            verifier,
            counters,
            started_at,
            phase: Phase::None,
            current: None,
            excluded: HashMap::new(),
            last_attempt: None,
            status: String::new(),
            degraded: false,
            publisher,
        };
        (engine, receiver)
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<&Arc<TargetDescriptor>> {
        self.current.as_ref()
    }

    /// Run one evaluation tick against the latest ranking
    pub async fn evaluate(&mut self, ranked: &[RankedTarget], now: Instant) {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed < self.grace_period {
            let remaining = (self.grace_period - elapsed).as_secs_f64().ceil() as u64;
            self.phase = Phase::None;
            self.status = format!("Analyzing stability... best target in {}s", remaining);
            self.publish();
            return;
        }

        self.excluded.retain(|_, expiry| *expiry > now);

        if let Some(current) = self.current.clone() {
            let position = ranked.iter().position(|r| r.identity() == current.identity);
            match position {
                Some(idx) if idx < self.band && !ranked[idx].snapshot.is_dead() => {
                    if self.phase != Phase::Holding {
                        self.phase = Phase::Holding;
                        self.status = self.holding_status();
                        self.publish();
                    }
                    return;
                }
                Some(idx) => debug!(
                    "Recommendation {} at rank {} (dead: {}) is outside the band of {}",
                    current.label,
                    idx + 1,
                    ranked[idx].snapshot.is_dead(),
                    self.band
                ),
                None => debug!("Recommendation {} is no longer ranked", current.label),
            }
        }

        if let Some(last) = self.last_attempt {
            let since = now.saturating_duration_since(last);
            if since < self.cooldown {
                if self.current.is_some() {
                    // Switch pending: keep advertising the pick but say so
                    let remaining = (self.cooldown - since).as_secs_f64().ceil() as u64;
                    self.phase = Phase::ReEvaluating;
                    self.status = format!("Recommendation slipped; re-evaluating in {}s", remaining);
                    self.publish();
                }
                return;
            }
        }

        self.reevaluate(ranked, now).await;
    }

    async fn reevaluate(&mut self, ranked: &[RankedTarget], now: Instant) {
        self.last_attempt = Some(now);

        let candidates: Vec<Arc<TargetDescriptor>> = ranked
            .iter()
            .filter(|r| self.is_eligible(r))
            .take(self.max_candidates)
            .map(|r| r.descriptor.clone())
            .collect();

        if candidates.is_empty() {
            let any_live = ranked
                .iter()
                .any(|r| r.snapshot.loss_pct < 100.0 && !r.snapshot.is_dead());
            if !self.excluded.is_empty() {
                info!("All live targets were excluded; clearing {} exclusions", self.excluded.len());
                self.excluded.clear();
            }
            let status = if any_live {
                "All candidates excluded; retrying"
            } else {
                "No live targets to recommend"
            };
            self.clear_recommendation(status.to_string());
            return;
        }

        if !self.verifier.is_available().await {
            let pick = candidates[0].clone();
            warn!("Deep verification unavailable; trusting probe result for {}", pick);
            self.adopt(pick, true);
            return;
        }

        self.phase = Phase::ReEvaluating;
        for candidate in candidates {
            self.status = format!(
                "Verifying: {} {}",
                candidate.protocol.to_uppercase(),
                candidate.label
            );
            self.publish();

            ProbeCounters::inc(&self.counters.verifications_total);
            let result = tokio::time::timeout(
                self.verify_timeout + VERIFY_GRACE,
                self.verifier.verify(&candidate, self.verify_timeout),
            )
            .await
            .unwrap_or_else(|_| VerifyResult::failed());

            if result.valid {
                debug!("Verified {} in {:.0}ms", candidate.label, result.latency_ms);
                self.adopt(candidate, false);
                return;
            }

            ProbeCounters::inc(&self.counters.verification_failures);
            info!("❌ {} failed verification, excluded for {:?}", candidate, self.exclusion_ttl);
            self.excluded.insert(candidate.identity.clone(), now + self.exclusion_ttl);
        }

        ProbeCounters::inc(&self.counters.exhaustions);
        let remaining = ranked.iter().filter(|r| self.is_eligible(r)).count();
        if remaining == 0 {
            info!("Verification pass exhausted every live target; clearing exclusions");
            self.excluded.clear();
        }
        self.clear_recommendation("Top targets failed verification.".to_string());
    }

    fn is_eligible(&self, row: &RankedTarget) -> bool {
        row.snapshot.loss_pct < 100.0
            && !row.snapshot.is_dead()
            && !self.excluded.contains_key(row.identity())
    }

    fn adopt(&mut self, pick: Arc<TargetDescriptor>, degraded: bool) {
        let changed = self
            .current
            .as_ref()
            .map_or(true, |c| c.identity != pick.identity);
        if changed {
            ProbeCounters::inc(&self.counters.switches);
            info!("🏆 Best stable target: {}", pick);
        }
        self.current = Some(pick);
        self.phase = Phase::Holding;
        self.degraded = degraded;
        self.status = self.holding_status();
        self.publish();
    }

    fn holding_status(&self) -> String {
        if self.degraded {
            "Deep verification unavailable; trusting probe results".to_string()
        } else {
            String::new()
        }
    }

    fn clear_recommendation(&mut self, status: String) {
        if let Some(old) = self.current.take() {
            warn!("Dropping recommendation {}", old);
        }
        self.phase = Phase::None;
        self.degraded = false;
        self.status = status;
        self.publish();
    }

    fn publish(&self) {
        let mut excluded: Vec<String> = self.excluded.keys().cloned().collect();
        excluded.sort();
        self.publisher.send_replace(RecommendationView {
            phase: self.phase,
            current: self.current.clone(),
            status: self.status.clone(),
            excluded,
            degraded: self.degraded,
        });
    }
}
