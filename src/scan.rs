//! One-shot scans: `quick` probes every target once, `stable` probes each
//! target repeatedly for a fixed duration and ranks by loss, jitter, latency.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::prober::Probe;
use crate::target::TargetDescriptor;
use crate::window::{ProbeOutcome, RollingWindow, WindowMetrics};

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub descriptor: Arc<TargetDescriptor>,
    pub outcome: ProbeOutcome,
}

/// Probe each target once, at most `concurrency` at a time.
///
/// Results come back with reachable targets first, fastest first; unreachable
/// ones keep their load order.
pub async fn quick_scan(
    targets: &[Arc<TargetDescriptor>],
    probe: Arc<dyn Probe>,
    concurrency: usize,
    timeout: Duration,
) -> Vec<ScanResult> {
    let limiter = Arc::new(Semaphore::new(concurrency.max(1)));

    let handles: Vec<_> = targets
        .iter()
        .cloned()
        .map(|descriptor| {
            let probe = probe.clone();
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let outcome = match limiter.acquire_owned().await {
                    Ok(_permit) => match probe.probe(&descriptor, timeout).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Probe error for {}: {:#}", descriptor.label, e);
                            ProbeOutcome::failure()
                        }
                    },
                    Err(_) => ProbeOutcome::failure(),
                };
                ScanResult { descriptor, outcome }
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, descriptor) in handles.into_iter().zip(targets) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!("Scan task for {} failed: {}", descriptor.label, e);
                results.push(ScanResult {
                    descriptor: descriptor.clone(),
                    outcome: ProbeOutcome::failure(),
                });
            }
        }
    }

    results.sort_by(|a, b| {
        b.outcome
            .success
            .cmp(&a.outcome.success)
            .then_with(|| {
                if a.outcome.success {
                    a.outcome.latency_ms.total_cmp(&b.outcome.latency_ms)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    });
    results
}

/// Log the scan as a table
pub fn log_results(results: &[ScanResult]) {
    info!("--- Quick Scan Results ---");
    info!("{:<8} | {:<10} | {:<8} | {}", "STATUS", "LATENCY", "PROTOCOL", "TARGET");
    let mut up = 0;
    for r in results.iter().filter(|r| r.outcome.success) {
        up += 1;
        info!(
            "{:<8} | {:<10} | {:<8} | {}",
            "UP",
            format!("{:.0}ms", r.outcome.latency_ms),
            r.descriptor.protocol,
            r.descriptor.label
        );
    }
    info!("Total: {}, UP: {}, DOWN: {}", results.len(), up, results.len() - up);
}

#[derive(Debug, Clone)]
pub struct StabilityResult {
    pub descriptor: Arc<TargetDescriptor>,
    pub metrics: WindowMetrics,
}

/// Probe every target every `interval` for `duration` and rank by loss,
/// then jitter, then mean latency.
///
/// The limiter gates each probe, not the whole run, so every target gets
/// the same observation period.
pub async fn stability_scan(
    targets: &[Arc<TargetDescriptor>],
    probe: Arc<dyn Probe>,
    concurrency: usize,
    timeout: Duration,
    duration: Duration,
    interval: Duration,
) -> Vec<StabilityResult> {
    let limiter = Arc::new(Semaphore::new(concurrency.max(1)));
    let capacity = (duration.as_millis() / interval.as_millis().max(1)) as usize + 1;
    let deadline = Instant::now() + duration;

    let handles: Vec<_> = targets
        .iter()
        .cloned()
        .map(|descriptor| {
            let probe = probe.clone();
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut window = RollingWindow::new(capacity);
                loop {
                    let outcome = match limiter.clone().acquire_owned().await {
                        Ok(_permit) => match probe.probe(&descriptor, timeout).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                warn!("Probe error for {}: {:#}", descriptor.label, e);
                                ProbeOutcome::failure()
                            }
                        },
                        Err(_) => break,
                    };
                    window.push(outcome);
                    if Instant::now() + interval >= deadline {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                }
                StabilityResult {
                    descriptor,
                    metrics: window.metrics(),
                }
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, descriptor) in handles.into_iter().zip(targets) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!("Stability task for {} failed: {}", descriptor.label, e);
                results.push(StabilityResult {
                    descriptor: descriptor.clone(),
                    metrics: WindowMetrics {
                        loss_pct: 100.0,
                        ..Default::default()
                    },
                });
            }
        }
    }

    results.sort_by(|a, b| {
        a.metrics
            .loss_pct
            .total_cmp(&b.metrics.loss_pct)
            .then_with(|| a.metrics.jitter_ms.total_cmp(&b.metrics.jitter_ms))
            .then_with(|| a.metrics.avg_latency_ms.total_cmp(&b.metrics.avg_latency_ms))
    });
    results
}

/// Up to `limit` results under 10% loss, one per label, in ranked order
pub fn top_stable(results: &[StabilityResult], limit: usize) -> Vec<&StabilityResult> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| r.metrics.loss_pct < 10.0)
        .filter(|r| seen.insert(r.descriptor.label.as_str()))
        .take(limit)
        .collect()
}

/// Log every reachable target, then the short list
pub fn log_stability_results(results: &[StabilityResult], duration: Duration) {
    info!("--- Stability Results ({}s) ---", duration.as_secs());
    info!(
        "{:<8} | {:<10} | {:<10} | {:<8} | {}",
        "LOSS %", "AVG LAT", "JITTER", "PROTOCOL", "TARGET"
    );
    for r in results.iter().filter(|r| r.metrics.loss_pct < 100.0) {
        info!(
            "{:<8.1} | {:<10.1} | {:<10.1} | {:<8} | {}",
            r.metrics.loss_pct,
            r.metrics.avg_latency_ms,
            r.metrics.jitter_ms,
            r.descriptor.protocol,
            r.descriptor.label
        );
    }

    let top = top_stable(results, 5);
    if top.is_empty() {
        info!("No target stayed under 10% loss");
        return;
    }
    info!("🏆 Top {} stable targets:", top.len());
    for (i, r) in top.iter().enumerate() {
        info!("{}. {}", i + 1, r.descriptor);
    }
}
