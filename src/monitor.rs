//! Realtime monitor: one probe task per target plus the evaluation tick.
//!
//! `Monitor` owns the tasks and the shutdown signal. `MonitorHandle` is the
//! cheap read side handed to the web server and the status logger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics::ProbeCounters;
use crate::prober::{run_probe_loop, Probe, ProbeContext, ProbeSettings};
use crate::ranker::{assess_network, rank, NetworkHealth, RankedTarget};
use crate::recommend::{Phase, RecommendationEngine, RecommendationView};
use crate::scorer::{ScoreTier, Scorer, TargetHealth};
use crate::target::TargetDescriptor;
use crate::verifier::Verifier;

/// Bumped whenever the snapshot JSON layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub rank: usize,
    pub identity: String,
    pub label: String,
    pub protocol: String,
    pub score: f64,
    pub loss_pct: f64,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub sample_count: usize,
    pub tier: ScoreTier,
    pub dead: bool,
}

impl SnapshotRow {
    fn from_ranked(rank: usize, row: &RankedTarget) -> Self {
        Self {
            rank,
            identity: row.descriptor.identity.clone(),
            label: row.descriptor.label.clone(),
            protocol: row.descriptor.protocol.clone(),
            score: row.snapshot.score,
            loss_pct: row.snapshot.loss_pct,
            avg_latency_ms: row.snapshot.avg_latency_ms,
            jitter_ms: row.snapshot.jitter_ms,
            sample_count: row.snapshot.sample_count,
            tier: row.snapshot.tier,
            dead: row.snapshot.is_dead(),
        }
    }
}

/// Everything a presenter needs for one frame
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub ranked: Vec<SnapshotRow>,
    pub recommendation: Option<TargetDescriptor>,
    pub status: String,
    pub phase: Phase,
    pub degraded: bool,
    pub excluded: Vec<String>,
    pub network: NetworkHealth,
    pub network_detail: &'static str,
}

/// Read side of a running monitor
#[derive(Clone)]
pub struct MonitorHandle {
    targets: Arc<Vec<Arc<TargetHealth>>>,
    recommendation: watch::Receiver<RecommendationView>,
    counters: Arc<ProbeCounters>,
    health_sample: usize,
}

impl MonitorHandle {
    pub fn counters(&self) -> &Arc<ProbeCounters> {
        &self.counters
    }

    /// Latest published recommendation
    pub fn recommendation(&self) -> RecommendationView {
        self.recommendation.borrow().clone()
    }

    /// Rank every target now and pair it with the latest recommendation
    pub fn snapshot(&self) -> MonitorSnapshot {
        let ranked = rank(&self.targets, Instant::now());
        let view = self.recommendation();
        let network = assess_network(&ranked, self.health_sample);

        MonitorSnapshot {
            version: SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            ranked: ranked
                .iter()
                .enumerate()
                .map(|(i, row)| SnapshotRow::from_ranked(i + 1, row))
                .collect(),
            recommendation: view.current.as_deref().cloned(),
            status: view.status,
            phase: view.phase,
            degraded: view.degraded,
            excluded: view.excluded,
            network,
            network_detail: network.describe(),
        }
    }
}

pub struct Monitor {
    handle: MonitorHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Spawn the probe loops and the evaluation tick. Must run inside a tokio runtime.
    pub fn start(
        config: Arc<Config>,
        targets: Vec<Arc<TargetDescriptor>>,
        probe: Arc<dyn Probe>,
        verifier: Arc<dyn Verifier>,
    ) -> anyhow::Result<Self> {
        if targets.is_empty() {
            anyhow::bail!("No valid targets to monitor");
        }

        let started_at = Instant::now();
        let scorer = Arc::new(Scorer::new(&config.scoring));
        let health: Arc<Vec<Arc<TargetHealth>>> = Arc::new(
            targets
                .into_iter()
                .map(|d| {
                    Arc::new(TargetHealth::with_start(
                        d,
                        scorer.clone(),
                        config.scoring.window_capacity,
                        started_at,
                    ))
                })
                .collect(),
        );

        let counters = Arc::new(ProbeCounters::new());
        let ctx = Arc::new(ProbeContext {
            probe,
            limiter: Arc::new(Semaphore::new(config.probe.concurrency)),
            counters: counters.clone(),
            settings: ProbeSettings::from_config(&config),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(health.len() + 1);
        for target in health.iter() {
            tasks.push(tokio::spawn(run_probe_loop(
                ctx.clone(),
                target.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        let (engine, recommendation) =
            RecommendationEngine::new(&config.recommend, verifier, counters.clone(), started_at);
        tasks.push(tokio::spawn(run_evaluation_loop(
            engine,
            health.clone(),
            Duration::from_millis(config.recommend.tick_ms.max(1)),
            shutdown_tx.subscribe(),
        )));

        info!(
            "📡 Monitoring {} targets (concurrency {}, window {})",
            health.len(),
            config.probe.concurrency,
            config.scoring.window_capacity
        );

        Ok(Self {
            handle: MonitorHandle {
                targets: health,
                recommendation,
                counters,
                health_sample: config.recommend.health_sample.max(1),
            },
            shutdown_tx,
            tasks,
        })
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Signal every task and wait for all of them to finish
    pub async fn shutdown(self) {
        info!("Stopping {} monitor tasks...", self.tasks.len());
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!("Monitor task ended abnormally: {}", e);
            }
        }
        info!("Monitor stopped");
    }
}

async fn run_evaluation_loop(
    mut engine: RecommendationEngine,
    targets: Arc<Vec<Arc<TargetHealth>>>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Instant::now();
        let ranked = rank(&targets, now);
        // Verifications are bounded by their own timeout, so a tick always finishes
        engine.evaluate(&ranked, now).await;
    }
    debug!("Evaluation loop stopped");
}
