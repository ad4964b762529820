mod config;
mod metrics;
mod monitor;
mod prober;
mod ranker;
mod recommend;
mod scan;
mod scorer;
mod target;
mod verifier;
mod web;
mod window;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, ProbeMode};
use crate::monitor::{Monitor, MonitorHandle};
use crate::prober::{Probe, TcpProbe, VerifyProbe};
use crate::target::load_targets;
use crate::verifier::{CommandVerifier, NoVerifier, Verifier};
use crate::web::server::WebServer;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STABLE_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxy_watch=info".into()),
        )
        .init();

    info!("📡 proxy-watch v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "proxy-watch.toml".to_string());
    let mode = std::env::args().nth(2).unwrap_or_else(|| "realtime".to_string());

    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);
    let config = Arc::new(config);

    let (targets, rejected) = load_targets(&config.targets);
    if targets.is_empty() {
        anyhow::bail!(
            "No valid targets in {} ({} rejected)",
            config_path,
            rejected.len()
        );
    }
    info!("Loaded {} targets ({} rejected)", targets.len(), rejected.len());

    let verifier: Arc<dyn Verifier> = match CommandVerifier::from_config(&config.verifier) {
        Some(v) => {
            if !v.is_available().await {
                if config.probe.mode == ProbeMode::Verify {
                    anyhow::bail!("probe.mode = \"verify\" but the verifier command was not found");
                }
                warn!("Verifier command not found; recommendations will be unverified");
            }
            Arc::new(v)
        }
        None => {
            info!("No verifier configured; recommendations will be unverified");
            Arc::new(NoVerifier)
        }
    };

    let probe: Arc<dyn Probe> = match config.probe.mode {
        ProbeMode::Tcp => Arc::new(TcpProbe::from_config(&config)?),
        ProbeMode::Verify => Arc::new(VerifyProbe::new(verifier.clone())),
    };

    match mode.as_str() {
        "quick" => {
            info!("Starting QUICK scan with concurrency={}...", config.probe.concurrency);
            let results =
                scan::quick_scan(&targets, probe, config.probe.concurrency, config.probe_timeout()).await;
            scan::log_results(&results);
        }
        "stable" => {
            let secs = match std::env::args().nth(3) {
                Some(arg) => arg
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid stable duration '{}': {}", arg, e))?,
                None => DEFAULT_STABLE_SECS,
            };
            let duration = Duration::from_secs(secs);
            info!(
                "Starting STABILITY scan for {}s with concurrency={}...",
                secs, config.probe.concurrency
            );
            let results = scan::stability_scan(
                &targets,
                probe,
                config.probe.concurrency,
                config.probe_timeout(),
                duration,
                Duration::from_millis(config.probe.steady_interval_ms),
            )
            .await;
            scan::log_stability_results(&results, duration);
        }
        "realtime" => run_realtime(config, targets, probe, verifier).await?,
        other => anyhow::bail!("Unknown mode '{}' (expected realtime, quick or stable)", other),
    }

    Ok(())
}

async fn run_realtime(
    config: Arc<Config>,
    targets: Vec<Arc<target::TargetDescriptor>>,
    probe: Arc<dyn Probe>,
    verifier: Arc<dyn Verifier>,
) -> anyhow::Result<()> {
    let monitor = Monitor::start(config.clone(), targets, probe, verifier)?;

    // Start Web API
    let web_handle = monitor.handle();
    let web_config = config.clone();
    let web = tokio::spawn(async move {
        let web = WebServer::new(web_handle, web_config);
        if let Err(e) = web.run().await {
            error!("Web server error: {}", e);
        }
    });

    let status = tokio::spawn(run_status_log(monitor.handle()));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    status.abort();
    web.abort();
    monitor.shutdown().await;
    Ok(())
}

/// Periodic one-line summary of the current pick and network state
async fn run_status_log(handle: MonitorHandle) {
    let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
    loop {
        interval.tick().await;
        let snap = handle.snapshot();
        let pick = snap
            .recommendation
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string());
        info!(
            "Network {:?} ({}) | pick: {} | {}",
            snap.network, snap.network_detail, pick, snap.status
        );
    }
}
