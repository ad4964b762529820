use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Bare TCP connect
    Tcp,
    /// Every probe goes through the deep verifier
    Verify,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_mode")]
    pub mode: ProbeMode,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval while a target is still warming up
    #[serde(default = "default_warmup_interval_ms")]
    pub warmup_interval_ms: u64,
    /// Base interval once a target is established
    #[serde(default = "default_steady_interval_ms")]
    pub steady_interval_ms: u64,
    /// Upper bound of the per-target deterministic offset added to the steady interval
    #[serde(default = "default_interval_spread_ms")]
    pub interval_spread_ms: u64,
    /// Pause after an unexpected internal probe error
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Global limit on simultaneous network probes
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Local address to bind probe sockets to (bypasses a local VPN route)
    #[serde(default)]
    pub bind_address: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Targets with fewer samples than this are scored in the warmup band
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: usize,
    /// No success for longer than this marks a target dead
    #[serde(default = "default_dead_threshold_secs")]
    pub dead_threshold_secs: u64,
    #[serde(default = "default_weight_loss")]
    pub weight_loss: f64,
    #[serde(default = "default_weight_jitter")]
    pub weight_jitter: f64,
    #[serde(default = "default_weight_latency")]
    pub weight_latency: f64,
    /// EMA factor applied to each new raw score (0.0 - 1.0]
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Offset separating warmup scores from established ones
    #[serde(default = "default_warmup_band")]
    pub warmup_band: f64,
    /// Offset separating dead scores from everything else
    #[serde(default = "default_dead_band")]
    pub dead_band: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecommendConfig {
    /// No recommendation is made before this much time has passed
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// A held recommendation is kept while its rank stays within this band
    #[serde(default = "default_hysteresis_band")]
    pub hysteresis_band: usize,
    /// Minimum time between two re-evaluation attempts
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// How long a candidate that failed verification stays excluded
    #[serde(default = "default_exclusion_ttl_secs")]
    pub exclusion_ttl_secs: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Evaluation tick rate
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// How many top targets feed the network health assessment
    #[serde(default = "default_health_sample")]
    pub health_sample: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VerifierConfig {
    /// External program performing the deep check. Unset means no verifier.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

/// One `[[targets]]` table, as produced by the link-parsing collaborator
#[derive(Debug, Deserialize, Clone)]
pub struct TargetEntry {
    pub protocol: String,
    pub address: String,
    pub port: u16,
    /// Stable identity (usually the raw link). Falls back to protocol://address:port.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: default_probe_mode(),
            timeout_ms: default_probe_timeout_ms(),
            warmup_interval_ms: default_warmup_interval_ms(),
            steady_interval_ms: default_steady_interval_ms(),
            interval_spread_ms: default_interval_spread_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            concurrency: default_concurrency(),
            bind_address: None,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            warmup_samples: default_warmup_samples(),
            dead_threshold_secs: default_dead_threshold_secs(),
            weight_loss: default_weight_loss(),
            weight_jitter: default_weight_jitter(),
            weight_latency: default_weight_latency(),
            ema_alpha: default_ema_alpha(),
            warmup_band: default_warmup_band(),
            dead_band: default_dead_band(),
        }
    }
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            hysteresis_band: default_hysteresis_band(),
            cooldown_secs: default_cooldown_secs(),
            max_candidates: default_max_candidates(),
            exclusion_ttl_secs: default_exclusion_ttl_secs(),
            verify_timeout_ms: default_verify_timeout_ms(),
            tick_ms: default_tick_ms(),
            health_sample: default_health_sample(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_web_address(),
            port: default_web_port(),
        }
    }
}

// Default value functions
fn default_probe_mode() -> ProbeMode { ProbeMode::Tcp }
fn default_probe_timeout_ms() -> u64 { 2000 }
fn default_warmup_interval_ms() -> u64 { 200 }
fn default_steady_interval_ms() -> u64 { 1000 }
fn default_interval_spread_ms() -> u64 { 500 }
fn default_error_backoff_ms() -> u64 { 1000 }
fn default_concurrency() -> usize { 100 }
fn default_window_capacity() -> usize { 100 }
fn default_warmup_samples() -> usize { 5 }
fn default_dead_threshold_secs() -> u64 { 600 }
fn default_weight_loss() -> f64 { 10_000.0 }
fn default_weight_jitter() -> f64 { 5.0 }
fn default_weight_latency() -> f64 { 0.5 }
fn default_ema_alpha() -> f64 { 0.05 }
fn default_warmup_band() -> f64 { 2_000_000.0 }
fn default_dead_band() -> f64 { 10_000_000.0 }
fn default_grace_period_secs() -> u64 { 60 }
fn default_hysteresis_band() -> usize { 10 }
fn default_cooldown_secs() -> u64 { 10 }
fn default_max_candidates() -> usize { 3 }
fn default_exclusion_ttl_secs() -> u64 { 300 }
fn default_verify_timeout_ms() -> u64 { 5000 }
fn default_tick_ms() -> u64 { 500 }
fn default_health_sample() -> usize { 5 }
fn default_true() -> bool { true }
fn default_web_address() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8054 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path, e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the monitor at startup
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scoring;
        if s.window_capacity == 0 {
            anyhow::bail!("scoring.window_capacity must be at least 1");
        }
        if !(s.ema_alpha > 0.0 && s.ema_alpha <= 1.0) {
            anyhow::bail!("scoring.ema_alpha must be in (0, 1], got {}", s.ema_alpha);
        }
        if self.probe.concurrency == 0 {
            anyhow::bail!("probe.concurrency must be at least 1");
        }
        if self.probe.timeout_ms == 0 {
            anyhow::bail!("probe.timeout_ms must be at least 1");
        }
        if self.recommend.max_candidates == 0 {
            anyhow::bail!("recommend.max_candidates must be at least 1");
        }
        if self.probe.mode == ProbeMode::Verify && self.verifier.command.is_none() {
            anyhow::bail!("probe.mode = \"verify\" needs [verifier] command");
        }

        // Latency and jitter can never exceed the probe timeout, which bounds every raw score.
        let max_raw = self.max_raw_score();
        if s.warmup_band <= max_raw {
            anyhow::bail!(
                "scoring.warmup_band ({}) must exceed the largest raw score ({})",
                s.warmup_band, max_raw
            );
        }
        if s.dead_band <= s.warmup_band + max_raw {
            anyhow::bail!(
                "scoring.dead_band ({}) must exceed warmup_band + largest raw score ({})",
                s.dead_band,
                s.warmup_band + max_raw
            );
        }
        Ok(())
    }

    /// Largest raw composite score a live target can produce
    pub fn max_raw_score(&self) -> f64 {
        let bound_ms = self.probe.timeout_ms.max(self.recommend.verify_timeout_ms) as f64;
        let s = &self.scoring;
        s.weight_loss * 100.0 + (s.weight_jitter + s.weight_latency) * bound_ms
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    pub fn dead_threshold(&self) -> Duration {
        Duration::from_secs(self.scoring.dead_threshold_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[probe]
mode = "tcp"
timeout_ms = 1500
concurrency = 20

[recommend]
hysteresis_band = 8

[verifier]
command = "/usr/local/bin/xray-check"
args = ["{address}", "{port}"]

[[targets]]
protocol = "vless"
address = "1.2.3.4"
port = 443
identity = "vless://abc@1.2.3.4:443"
label = "Frankfurt"

[[targets]]
protocol = "trojan"
address = "example.net"
port = 8443
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.probe.mode, ProbeMode::Tcp);
        assert_eq!(config.probe.timeout_ms, 1500);
        assert_eq!(config.probe.concurrency, 20);
        assert_eq!(config.recommend.hysteresis_band, 8);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[1].identity, None);
        assert_eq!(config.verifier.args, vec!["{address}", "{port}"]);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.scoring.window_capacity, 100);
        assert_eq!(config.scoring.warmup_samples, 5);
        assert_eq!(config.scoring.dead_threshold_secs, 600);
        assert_eq!(config.recommend.grace_period_secs, 60);
        assert!(config.verifier.command.is_none());
        assert!(config.web.enabled);
    }

    #[test]
    fn test_rejects_overlapping_bands() {
        let err = Config::parse("[scoring]\nwarmup_band = 1000.0\n").unwrap_err();
        assert!(err.to_string().contains("warmup_band"), "got: {}", err);

        let err = Config::parse("[scoring]\ndead_band = 2500000.0\n").unwrap_err();
        assert!(err.to_string().contains("dead_band"), "got: {}", err);
    }

    #[test]
    fn test_rejects_bad_alpha_and_capacity() {
        assert!(Config::parse("[scoring]\nema_alpha = 0.0\n").is_err());
        assert!(Config::parse("[scoring]\nema_alpha = 1.5\n").is_err());
        assert!(Config::parse("[scoring]\nwindow_capacity = 0\n").is_err());
        assert!(Config::parse("[probe]\nconcurrency = 0\n").is_err());
    }

    #[test]
    fn test_unknown_probe_mode_fails() {
        assert!(Config::parse("[probe]\nmode = \"icmp\"\n").is_err());
    }

    #[test]
    fn test_verify_mode_requires_verifier_command() {
        let err = Config::parse("[probe]\nmode = \"verify\"\n").unwrap_err();
        assert!(err.to_string().contains("[verifier] command"), "got: {}", err);

        let config = Config::parse("[probe]\nmode = \"verify\"\n\n[verifier]\ncommand = \"true\"\n").unwrap();
        assert_eq!(config.probe.mode, ProbeMode::Verify);
    }
}
