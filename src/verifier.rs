//! Deep verification contract.
//!
//! A verifier routes real traffic through a target. Every failure mode
//! (spawn error, timeout, non-zero exit) collapses into `VerifyResult::failed()`;
//! nothing crosses this boundary as an error.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Command;
use tracing::debug;

use crate::config::VerifierConfig;
use crate::target::TargetDescriptor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyResult {
    pub valid: bool,
    pub latency_ms: f64,
}

impl VerifyResult {
    pub fn failed() -> Self {
        Self { valid: false, latency_ms: 0.0 }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Whether the deep check can run at all on this host
    async fn is_available(&self) -> bool;

    async fn verify(&self, target: &TargetDescriptor, timeout: Duration) -> VerifyResult;
}

/// Used when no verifier is configured: the engine falls back to probe results
pub struct NoVerifier;

#[async_trait]
impl Verifier for NoVerifier {
    async fn is_available(&self) -> bool {
        false
    }

    async fn verify(&self, _target: &TargetDescriptor, _timeout: Duration) -> VerifyResult {
        VerifyResult::failed()
    }
}

/// Runs an external program per verification; exit status 0 means the target carried traffic.
///
/// Arguments may contain `{address}`, `{port}`, `{protocol}`, `{identity}`,
/// `{label}` and `{local_port}` placeholders. `{local_port}` is a random port in
/// 30000..40000 for programs that need a temporary local inbound.
pub struct CommandVerifier {
    program: String,
    args: Vec<String>,
}

impl CommandVerifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &VerifierConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|cmd| Self::new(cmd.clone(), config.args.clone()))
    }

    fn render_args(&self, target: &TargetDescriptor, local_port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{address}", &target.address)
                    .replace("{port}", &target.port.to_string())
                    .replace("{protocol}", &target.protocol)
                    .replace("{identity}", &target.identity)
                    .replace("{label}", &target.label)
                    .replace("{local_port}", &local_port.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn is_available(&self) -> bool {
        program_exists(&self.program)
    }

    async fn verify(&self, target: &TargetDescriptor, timeout: Duration) -> VerifyResult {
        let local_port: u16 = rand::thread_rng().gen_range(30000..40000);
        let args = self.render_args(target, local_port);

        let start = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                debug!("Verifier spawn failed for {}: {}", target.label, e);
                return VerifyResult::failed();
            }
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => VerifyResult {
                valid: true,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
            Ok(Ok(status)) => {
                debug!("Verifier rejected {} ({})", target.label, status);
                VerifyResult::failed()
            }
            Ok(Err(e)) => {
                debug!("Verifier wait failed for {}: {}", target.label, e);
                VerifyResult::failed()
            }
            Err(_) => {
                debug!("Verifier timed out for {} after {:?}", target.label, timeout);
                // kill_on_drop reaps it, but don't leave it running until then
                let _ = child.start_kill();
                VerifyResult::failed()
            }
        }
    }
}

fn program_exists(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
