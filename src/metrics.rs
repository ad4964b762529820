//! Prometheus-compatible metrics exporter for proxy-watch
//!
//! Counters are bumped from the probe loops and the evaluation tick; nothing
//! here touches the disk. Endpoint: GET /metrics (on the web port, default 8054)

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::monitor::MonitorSnapshot;

/// Process-wide counters, updated atomically
pub struct ProbeCounters {
    /// Total probes completed (success or failure)
    pub probes_total: AtomicU64,
    /// Probes that recorded a failed sample
    pub probe_failures: AtomicU64,
    /// Unexpected internal errors inside a probe loop
    pub probe_errors: AtomicU64,
    /// Single wake probes sent to dormant targets
    pub wake_probes: AtomicU64,
    /// Deep verifications attempted by the recommendation engine
    pub verifications_total: AtomicU64,
    /// Deep verifications that failed or timed out
    pub verification_failures: AtomicU64,
    /// Times the recommendation changed to a different target
    pub switches: AtomicU64,
    /// Passes where every candidate failed verification
    pub exhaustions: AtomicU64,
    pub start_time: Instant,
}

impl ProbeCounters {
    pub fn new() -> Self {
        Self {
            probes_total: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            probe_errors: AtomicU64::new(0),
            wake_probes: AtomicU64::new(0),
            verifications_total: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Generate Prometheus-format metrics text
pub fn render_metrics(counters: &ProbeCounters, snapshot: &MonitorSnapshot) -> String {
    let mut out = String::with_capacity(4096);

    // ──────────────────────────────────────────────
    // Process
    // ──────────────────────────────────────────────
    write_help_type(&mut out, "proxywatch_up", "Whether the monitor is running.", "gauge");
    writeln!(out, "proxywatch_up 1").ok();

    write_help_type(&mut out, "proxywatch_uptime_seconds_total", "Seconds since the monitor started.", "counter");
    writeln!(out, "proxywatch_uptime_seconds_total {:.3}", counters.start_time.elapsed().as_secs_f64()).ok();

    // ──────────────────────────────────────────────
    // Probe / verification totals
    // ──────────────────────────────────────────────
    let totals = [
        ("proxywatch_probes_total", "Total probes completed.", &counters.probes_total),
        ("proxywatch_probe_failures_total", "Probes recorded as failed samples.", &counters.probe_failures),
        ("proxywatch_probe_errors_total", "Unexpected internal probe loop errors.", &counters.probe_errors),
        ("proxywatch_wake_probes_total", "Wake probes sent to dormant targets.", &counters.wake_probes),
        ("proxywatch_verifications_total", "Deep verifications attempted.", &counters.verifications_total),
        ("proxywatch_verification_failures_total", "Deep verifications that failed.", &counters.verification_failures),
        ("proxywatch_recommendation_switches_total", "Changes of the recommended target.", &counters.switches),
        ("proxywatch_candidate_exhaustions_total", "Passes where every candidate failed verification.", &counters.exhaustions),
    ];
    for (name, help, counter) in totals {
        write_help_type(&mut out, name, help, "counter");
        writeln!(out, "{} {}", name, ProbeCounters::get(counter)).ok();
    }

    // ──────────────────────────────────────────────
    // Target state (from the current ranking)
    // ──────────────────────────────────────────────
    let dead = snapshot.ranked.iter().filter(|r| r.dead).count();
    write_help_type(&mut out, "proxywatch_targets", "Monitored targets by state.", "gauge");
    writeln!(out, "proxywatch_targets{{state=\"live\"}} {}", snapshot.ranked.len() - dead).ok();
    writeln!(out, "proxywatch_targets{{state=\"dead\"}} {}", dead).ok();

    write_help_type(&mut out, "proxywatch_recommendation_present", "Whether a verified recommendation is held.", "gauge");
    writeln!(out, "proxywatch_recommendation_present {}", u8::from(snapshot.recommendation.is_some())).ok();

    write_help_type(&mut out, "proxywatch_target_score", "Current score per target (lower is better).", "gauge");
    for row in &snapshot.ranked {
        writeln!(out, "proxywatch_target_score{{target=\"{}\"}} {:.3}", escape_label(&row.label), row.score).ok();
    }

    write_help_type(&mut out, "proxywatch_target_loss_percent", "Loss percentage over the rolling window.", "gauge");
    for row in &snapshot.ranked {
        writeln!(out, "proxywatch_target_loss_percent{{target=\"{}\"}} {:.1}", escape_label(&row.label), row.loss_pct).ok();
    }

    out
}

fn write_help_type(out: &mut String, name: &str, help: &str, metric_type: &str) {
    writeln!(out, "# HELP {} {}", name, help).ok();
    writeln!(out, "# TYPE {} {}", name, metric_type).ok();
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}
