//! Per-target probe loop.
//!
//! Each target gets one long-lived task. A shared semaphore bounds how many
//! probes are on the wire at once; it is held only around the network call,
//! never across sleeps. Targets silent for longer than the dead threshold go
//! dormant: one wake probe per dead-threshold period until they answer again.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::ProbeCounters;
use crate::scorer::TargetHealth;
use crate::target::{stable_offset, TargetDescriptor};
use crate::verifier::Verifier;
use crate::window::ProbeOutcome;

/// Slack past the probe timeout before a stuck probe is abandoned
const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Target used only to ask the OS which local address routes outward
const ROUTE_HINT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// A single liveness/latency check.
///
/// Expected network failures come back as `Ok(ProbeOutcome::failure())`.
/// `Err` is reserved for internal problems (bad local bind, socket setup).
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &TargetDescriptor, timeout: Duration) -> anyhow::Result<ProbeOutcome>;
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error("socket setup failed: {0}")]
    Socket(io::Error),

    #[error("bind to {0} failed: {1}")]
    Bind(IpAddr, io::Error),

    #[error("{0}")]
    Network(io::Error),
}

/// Bare TCP connect probe
pub struct TcpProbe {
    bind: Option<IpAddr>,
}

impl TcpProbe {
    pub fn new(bind: Option<IpAddr>) -> Self {
        Self { bind }
    }

    /// `bind_address = "auto"` binds to the address the OS would use for
    /// outbound traffic, so probes go out the physical interface even when a
    /// VPN owns the default route for other sockets.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let bind = match config.probe.bind_address.as_deref() {
            Some("auto") => {
                let ip = local_ip_towards(ROUTE_HINT)
                    .map_err(|e| anyhow::anyhow!("Could not auto-detect a local address: {}", e))?;
                info!("Auto-detected local IP {}; probes will bind to it", ip);
                Some(ip)
            }
            Some(addr) => Some(
                addr.parse::<IpAddr>()
                    .map_err(|e| anyhow::anyhow!("Invalid probe.bind_address '{}': {}", addr, e))?,
            ),
            None => None,
        };
        Ok(Self::new(bind))
    }

    async fn connect(&self, target: &TargetDescriptor) -> Result<(), ConnectError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.address.as_str(), target.port))
            .await
            .map_err(ConnectError::Network)?
            .filter(|a| self.bind.map_or(true, |b| b.is_ipv4() == a.is_ipv4()))
            .collect();

        let addr = addrs.first().copied().ok_or_else(|| {
            ConnectError::Network(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address of a usable family",
            ))
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ConnectError::Socket)?;

        if let Some(ip) = self.bind {
            socket
                .bind(SocketAddr::new(ip, 0))
                .map_err(|e| ConnectError::Bind(ip, e))?;
        }

        let _stream = socket.connect(addr).await.map_err(ConnectError::Network)?;
        Ok(())
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, target: &TargetDescriptor, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.connect(target)).await {
            Ok(Ok(())) => Ok(ProbeOutcome::success(start.elapsed().as_secs_f64() * 1000.0)),
            Ok(Err(ConnectError::Network(e))) => {
                debug!("TCP probe {} failed: {}", target.endpoint(), e);
                Ok(ProbeOutcome::failure())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                debug!("TCP probe {} timed out", target.endpoint());
                Ok(ProbeOutcome::failure())
            }
        }
    }
}

/// Local address a connected UDP socket gets towards `remote`. Nothing is sent.
fn local_ip_towards(remote: SocketAddr) -> io::Result<IpAddr> {
    let any: IpAddr = if remote.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind(SocketAddr::new(any, 0))?;
    socket.connect(remote)?;
    Ok(socket.local_addr()?.ip())
}

/// Probe that runs the deep verifier on every iteration
pub struct VerifyProbe {
    verifier: Arc<dyn Verifier>,
}

impl VerifyProbe {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Probe for VerifyProbe {
    async fn probe(&self, target: &TargetDescriptor, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let result = self.verifier.verify(target, timeout).await;
        Ok(if result.valid {
            ProbeOutcome::success(result.latency_ms)
        } else {
            ProbeOutcome::failure()
        })
    }
}

/// Timing knobs for the probe loops
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub warmup_interval: Duration,
    pub steady_interval: Duration,
    pub interval_spread_ms: u64,
    pub error_backoff: Duration,
    pub warmup_samples: usize,
    pub dead_threshold: Duration,
}

impl ProbeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.probe_timeout(),
            warmup_interval: Duration::from_millis(config.probe.warmup_interval_ms),
            steady_interval: Duration::from_millis(config.probe.steady_interval_ms),
            interval_spread_ms: config.probe.interval_spread_ms,
            error_backoff: Duration::from_millis(config.probe.error_backoff_ms),
            warmup_samples: config.scoring.warmup_samples,
            dead_threshold: config.dead_threshold(),
        }
    }

    /// Short fixed interval while warming up, then the steady interval plus a
    /// per-target offset so targets don't probe in lockstep.
    pub fn next_interval(&self, identity: &str, sample_count: usize) -> Duration {
        if sample_count < self.warmup_samples {
            self.warmup_interval
        } else {
            self.steady_interval + Duration::from_millis(stable_offset(identity, self.interval_spread_ms))
        }
    }
}

/// Everything a probe loop needs, shared by all loops
pub struct ProbeContext {
    pub probe: Arc<dyn Probe>,
    pub limiter: Arc<Semaphore>,
    pub counters: Arc<ProbeCounters>,
    pub settings: ProbeSettings,
}

/// Probe one target until the shutdown signal fires
pub async fn run_probe_loop(ctx: Arc<ProbeContext>, target: Arc<TargetHealth>, mut shutdown: watch::Receiver<bool>) {
    let label = target.descriptor().label.clone();
    debug!("Probe loop started for {}", label);

    loop {
        if *shutdown.borrow() {
            break;
        }

        if target.is_dead(Instant::now()) {
            debug!("{} is dormant; next wake probe in {:?}", label, ctx.settings.dead_threshold);
            if !sleep_or_shutdown(ctx.settings.dead_threshold, &mut shutdown).await {
                break;
            }
            ProbeCounters::inc(&ctx.counters.wake_probes);
        }

        let permit = tokio::select! {
            permit = ctx.limiter.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        // In-flight probes finish under their own timeout, even during shutdown
        let result = guarded_probe(ctx.probe.clone(), target.descriptor().clone(), ctx.settings.timeout).await;
        drop(permit);

        ProbeCounters::inc(&ctx.counters.probes_total);
        let pause = match result {
            Ok(outcome) => {
                target.add(outcome.success, outcome.latency_ms);
                if !outcome.success {
                    ProbeCounters::inc(&ctx.counters.probe_failures);
                }
                debug!(
                    "Probed {}: up={} latency={:.0}ms samples={}",
                    label,
                    outcome.success,
                    outcome.latency_ms,
                    target.sample_count()
                );
                ctx.settings
                    .next_interval(&target.descriptor().identity, target.sample_count())
            }
            Err(e) => {
                warn!("Probe loop error for {}: {:#}", label, e);
                target.add(false, 0.0);
                ProbeCounters::inc(&ctx.counters.probe_failures);
                ProbeCounters::inc(&ctx.counters.probe_errors);
                ctx.settings.error_backoff
            }
        };

        if !sleep_or_shutdown(pause, &mut shutdown).await {
            break;
        }
    }

    debug!("Probe loop for {} stopped", label);
}

/// Run one probe in its own task under a hard deadline.
///
/// A panicking probe comes back as `Err`; one that overruns its timeout by
/// more than `PROBE_GRACE` is abandoned and counts as a failed sample.
async fn guarded_probe(
    probe: Arc<dyn Probe>,
    descriptor: Arc<TargetDescriptor>,
    timeout: Duration,
) -> anyhow::Result<ProbeOutcome> {
    let task = tokio::spawn(async move {
        match tokio::time::timeout(timeout + PROBE_GRACE, probe.probe(&descriptor, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Probe of {} overran its {:?} timeout", descriptor.label, timeout);
                Ok(ProbeOutcome::failure())
            }
        }
    });

    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow::anyhow!("probe task panicked")),
        Err(e) => Err(anyhow::anyhow!("probe task failed: {}", e)),
    }
}

/// Returns false when shutdown was signalled before the sleep finished
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scorer::test_scorer;
    use crate::target::test_descriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted probe: fixed result, optional delay, tracks concurrency
    pub(crate) struct FakeProbe {
        pub up: bool,
        pub fail_internally: bool,
        /// 1-based call number that panics
        pub panic_on_call: Option<usize>,
        pub delay: Duration,
        pub calls: AtomicUsize,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeProbe {
        pub(crate) fn new(up: bool) -> Self {
            Self {
                up,
                fail_internally: false,
                panic_on_call: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        async fn probe(&self, _target: &TargetDescriptor, _timeout: Duration) -> anyhow::Result<ProbeOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_call == Some(call) {
                panic!("blew up on call {}", call);
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_internally {
                anyhow::bail!("socket exploded");
            }
            Ok(if self.up {
                ProbeOutcome::success(10.0)
            } else {
                ProbeOutcome::failure()
            })
        }
    }

    pub(crate) fn fast_settings() -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_millis(200),
            warmup_interval: Duration::from_millis(1),
            steady_interval: Duration::from_millis(2),
            interval_spread_ms: 2,
            error_backoff: Duration::from_millis(5),
            warmup_samples: 5,
            dead_threshold: Duration::from_secs(600),
        }
    }

    fn context(probe: Arc<FakeProbe>, concurrency: usize, settings: ProbeSettings) -> Arc<ProbeContext> {
        Arc::new(ProbeContext {
            probe,
            limiter: Arc::new(Semaphore::new(concurrency)),
            counters: Arc::new(ProbeCounters::new()),
            settings,
        })
    }

    fn target(id: &str) -> Arc<TargetHealth> {
        Arc::new(TargetHealth::new(test_descriptor(id), test_scorer(), 100))
    }

    #[test]
    fn test_next_interval_warmup_then_offset() {
        let settings = ProbeSettings {
            warmup_interval: Duration::from_millis(200),
            steady_interval: Duration::from_millis(1000),
            interval_spread_ms: 500,
            ..fast_settings()
        };
        assert_eq!(settings.next_interval("node-a", 0), Duration::from_millis(200));
        assert_eq!(settings.next_interval("node-a", 4), Duration::from_millis(200));

        let steady = settings.next_interval("node-a", 5);
        assert!(steady >= Duration::from_millis(1000) && steady < Duration::from_millis(1500));
        assert_eq!(steady, settings.next_interval("node-a", 50));
    }

    #[tokio::test]
    async fn test_loop_records_samples_and_drains_on_shutdown() {
        let probe = Arc::new(FakeProbe::new(true));
        let ctx = context(probe.clone(), 4, fast_settings());
        let t = target("a");
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_probe_loop(ctx.clone(), t.clone(), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop after shutdown")
            .unwrap();

        assert!(t.sample_count() > 5, "samples = {}", t.sample_count());
        assert_eq!(t.metrics().loss_pct, 0.0);
        assert_eq!(
            ProbeCounters::get(&ctx.counters.probes_total) as usize,
            probe.calls.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_internal_error_is_recorded_as_failure() {
        let mut fake = FakeProbe::new(true);
        fake.fail_internally = true;
        let probe = Arc::new(fake);
        let ctx = context(probe.clone(), 4, fast_settings());
        let t = target("a");
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_probe_loop(ctx.clone(), t.clone(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(t.sample_count() >= 1);
        assert_eq!(t.metrics().loss_pct, 100.0);
        assert!(ProbeCounters::get(&ctx.counters.probe_errors) >= 1);
        // error_backoff (5ms) keeps the loop from spinning
        assert!(probe.calls.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test]
    async fn test_limiter_bounds_concurrent_probes() {
        let mut fake = FakeProbe::new(true);
        fake.delay = Duration::from_millis(10);
        let probe = Arc::new(fake);
        let ctx = context(probe.clone(), 2, fast_settings());
        let (tx, rx) = watch::channel(false);

        let handles: Vec<_> = (0..6)
            .map(|i| tokio::spawn(run_probe_loop(ctx.clone(), target(&format!("t{}", i)), rx.clone())))
            .collect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }

        assert!(probe.calls.load(Ordering::SeqCst) >= 6);
        assert!(probe.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dormant_target_gets_one_wake_probe_per_period() {
        let probe = Arc::new(FakeProbe::new(false));
        let settings = ProbeSettings {
            dead_threshold: Duration::from_millis(300),
            ..fast_settings()
        };
        let ctx = context(probe.clone(), 4, settings);

        // Scorer treats anything silent for more than 0s as dead
        let scoring = crate::config::ScoringConfig {
            dead_threshold_secs: 0,
            ..Default::default()
        };
        let scorer = Arc::new(crate::scorer::Scorer::new(&scoring));
        let t = Arc::new(TargetHealth::new(test_descriptor("dead"), scorer, 100));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_probe_loop(ctx.clone(), t.clone(), rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ProbeCounters::get(&ctx.counters.wake_probes), 1);

        // Shutdown interrupts the dormant sleep right away
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("dormant loop should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {}
        });

        let mut descriptor = (*test_descriptor("local")).clone();
        descriptor.port = port;
        let outcome = TcpProbe::new(None)
            .probe(&descriptor, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused_is_a_failed_sample() {
        // Grab a free port, then close it
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut descriptor = (*test_descriptor("closed")).clone();
        descriptor.port = port;
        let outcome = TcpProbe::new(None)
            .probe(&descriptor, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::failure());
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let mut config = Config::parse("").unwrap();
        config.probe.bind_address = Some("not-an-ip".to_string());
        assert!(TcpProbe::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_panic_is_recorded_and_loop_survives() {
        let mut fake = FakeProbe::new(true);
        fake.panic_on_call = Some(3);
        let probe = Arc::new(fake);
        let ctx = context(probe.clone(), 4, fast_settings());
        let t = target("a");
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_probe_loop(ctx.clone(), t.clone(), rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished(), "loop must outlive a panic");

        tx.send(true).unwrap();
        handle.await.unwrap();

        let calls = probe.calls.load(Ordering::SeqCst);
        assert!(calls > 3, "calls = {}", calls);
        // every call lands in the window (capacity 100)
        assert_eq!(t.sample_count(), calls.min(100));
        assert_eq!(ProbeCounters::get(&ctx.counters.probe_errors), 1);
        assert_eq!(ProbeCounters::get(&ctx.counters.probe_failures), 1);
    }

    #[tokio::test]
    async fn test_call_ignoring_timeout_is_abandoned() {
        let mut fake = FakeProbe::new(true);
        fake.delay = Duration::from_secs(30);
        let probe = Arc::new(fake);
        let settings = ProbeSettings {
            timeout: Duration::from_millis(20),
            ..fast_settings()
        };
        // One permit: a stuck call that never returned would starve the second target
        let ctx = context(probe.clone(), 1, settings);
        let (a, b) = (target("a"), target("b"));
        let (tx, rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(run_probe_loop(ctx.clone(), a.clone(), rx.clone())),
            tokio::spawn(run_probe_loop(ctx.clone(), b.clone(), rx)),
        ];
        tokio::time::sleep(Duration::from_millis(2600)).await;
        tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(3), h)
                .await
                .expect("loop should stop after the deadline")
                .unwrap();
        }

        assert!(a.sample_count() >= 1 && b.sample_count() >= 1);
        assert_eq!(a.metrics().loss_pct, 100.0);
        assert_eq!(b.metrics().loss_pct, 100.0);
    }

    #[test]
    fn test_local_ip_towards_loopback() {
        let ip = local_ip_towards(SocketAddr::from(([127, 0, 0, 1], 9))).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
