//! # Controller Configuration
//!
//! All configuration values are loaded from environment variables with
//! sensible defaults. This eliminates hardcoded values and allows runtime
//! configuration via ConfigMaps/Secrets in the deployment manifest.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Resolved controller configuration, built once at startup and threaded
/// through the [`crate::context::ControllerContext`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root of the per-configuration workdir tree.
    pub base_config_path: PathBuf,
    /// Path of the TOFU known-hosts file.
    pub known_hosts_path: PathBuf,
    /// Local path of the hardware scanner script shipped to machines.
    pub hardware_scanner_path: PathBuf,
    /// Remote path the scanner script is uploaded to before execution.
    pub remote_hardware_script_path: String,

    /// How often machine reachability is probed.
    pub machine_discovery_interval: Duration,
    /// How often hardware facts are re-scanned on discoverable machines.
    pub hardware_scan_interval: Duration,
    /// Periodic reconcile interval for configurations.
    pub config_reconcile_interval: Duration,

    /// Wall-clock ceiling for `nixos-rebuild` / `nixos-anywhere`.
    pub nixos_apply_timeout: Duration,

    /// Retry policy for idempotent operations (git, K8s reads).
    pub retry: RetryConfig,

    /// Port serving Prometheus metrics.
    pub metrics_port: u16,
    /// Port serving `/health`, `/ready` and `/live`.
    pub health_port: u16,
}

/// Exponential backoff parameters for the retry engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_config_path: PathBuf::from("/tmp/nixos-config"),
            known_hosts_path: PathBuf::from("/tmp/nio-ssh-known-hosts/known_hosts"),
            hardware_scanner_path: PathBuf::from("scripts/hardware_scanner.sh"),
            remote_hardware_script_path: "/tmp/hardware_scanner.sh".to_string(),
            machine_discovery_interval: Duration::from_secs(60),
            hardware_scan_interval: Duration::from_secs(300),
            config_reconcile_interval: Duration::from_secs(120),
            nixos_apply_timeout: Duration::from_secs(3600),
            retry: RetryConfig::default(),
            metrics_port: 8000,
            health_port: 8080,
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("environment variable {key}={value} is not a valid integer")),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<f64>()
            .with_context(|| format!("environment variable {key}={value} is not a valid float")),
        Err(_) => Ok(default),
    }
}

fn env_u16(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u16>()
            .with_context(|| format!("environment variable {key}={value} is not a valid port")),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

fn secs_f64(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl ControllerConfig {
    /// Load the configuration from the environment.
    ///
    /// Every variable is optional; the defaults match the values the
    /// deployment manifests assume.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            base_config_path: env_path("NIO_BASE_CONFIG_PATH", "/tmp/nixos-config"),
            known_hosts_path: env_path(
                "NIO_KNOWN_HOSTS_PATH",
                "/tmp/nio-ssh-known-hosts/known_hosts",
            ),
            hardware_scanner_path: env_path(
                "NIO_HARDWARE_SCANNER_PATH",
                "scripts/hardware_scanner.sh",
            ),
            remote_hardware_script_path: std::env::var("NIO_REMOTE_HARDWARE_SCRIPT_PATH")
                .unwrap_or_else(|_| "/tmp/hardware_scanner.sh".to_string()),
            machine_discovery_interval: secs_f64(env_f64(
                "NIO_MACHINE_DISCOVERY_INTERVAL",
                60.0,
            )?),
            hardware_scan_interval: secs_f64(env_f64("NIO_HARDWARE_SCAN_INTERVAL", 300.0)?),
            config_reconcile_interval: secs_f64(env_f64("NIO_CONFIG_RECONCILE_INTERVAL", 120.0)?),
            nixos_apply_timeout: Duration::from_secs(env_u64("NIO_NIXOS_APPLY_TIMEOUT", 3600)?),
            retry: RetryConfig {
                max_attempts: env_u64("NIO_RETRY_MAX_ATTEMPTS", 3)? as u32,
                initial_delay: secs_f64(env_f64("NIO_RETRY_INITIAL_DELAY", 2.0)?),
                max_delay: secs_f64(env_f64("NIO_RETRY_MAX_DELAY", 30.0)?),
                exponential_base: env_f64("NIO_RETRY_EXPONENTIAL_BASE", 2.0)?,
            },
            metrics_port: env_u16("METRICS_PORT", defaults.metrics_port)?,
            health_port: env_u16("HEALTH_CHECK_PORT", defaults.health_port)?,
        })
    }

    /// Multi-line summary logged once at startup.
    pub fn summary(&self) -> String {
        format!(
            "NixOS Infrastructure Controller configuration:\n\
             \x20 paths: base={} known_hosts={} scanner={} remote_scanner={}\n\
             \x20 intervals: discovery={:?} hardware_scan={:?} reconcile={:?}\n\
             \x20 timeouts: nixos_apply={:?}\n\
             \x20 retry: attempts={} initial={:?} max={:?} base={}\n\
             \x20 ports: metrics={} health={}",
            self.base_config_path.display(),
            self.known_hosts_path.display(),
            self.hardware_scanner_path.display(),
            self.remote_hardware_script_path,
            self.machine_discovery_interval,
            self.hardware_scan_interval,
            self.config_reconcile_interval,
            self.nixos_apply_timeout,
            self.retry.max_attempts,
            self.retry.initial_delay,
            self.retry.max_delay,
            self.retry.exponential_base,
            self.metrics_port,
            self.health_port,
        )
    }
}
