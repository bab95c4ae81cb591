//! Configuration loaded from `sandbox.toml`.
//!
//! Every field carries a serde default so a partial file (or no file at
//! all) yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE: &str = "sandbox.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Host port pool.
    #[serde(default)]
    pub ports: PortConfig,
    /// Container engine selection.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Per-container run settings.
    #[serde(default)]
    pub container: ContainerConfig,
    /// Build context scaffold.
    #[serde(default)]
    pub build: BuildConfig,
    /// TTL clamping window.
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Health probe budget.
    #[serde(default)]
    pub health: HealthConfig,
    /// Background sweep intervals.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Host port pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// First port handed out
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// Last port handed out (inclusive)
    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Address used for the bind probe
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            bind_host: default_bind_host(),
        }
    }
}

/// Which container engine backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeBackend {
    /// Shell out to the engine CLI.
    #[default]
    Cli,
    /// Talk to the Docker Engine API over its local socket.
    Api,
}

/// Container engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backend used to issue engine commands
    #[serde(default)]
    pub backend: RuntimeBackend,

    /// Engine CLI invocation for the `cli` backend
    /// - Default: "docker"
    /// - Examples: "podman", "sudo docker"
    #[serde(default = "default_command")]
    pub command: String,

    /// Named network sandbox containers join (created on demand)
    #[serde(default)]
    pub network: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::default(),
            command: default_command(),
            network: None,
        }
    }
}

/// Settings applied to every sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Port the generated backend listens on inside the container
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Memory limit (e.g., "512m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "0.5")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Host name used in the sandbox base URL
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Prefix for container and image names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Grace period given to `stop` before the engine kills the container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            internal_port: default_internal_port(),
            memory: default_memory(),
            cpus: default_cpus(),
            public_host: default_public_host(),
            name_prefix: default_name_prefix(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Fixed scaffold added to every build context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Base image of the scaffold Dockerfile
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// File name of the scaffold Dockerfile inside the context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,

    /// Command the container runs; `{port}` becomes `container.internal_port`
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            dockerfile: default_dockerfile(),
            start_command: default_start_command(),
        }
    }
}

/// TTL window every requested TTL is clamped into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Shortest allowed TTL
    #[serde(default = "default_min_ttl")]
    pub min_minutes: u32,

    /// Longest allowed TTL, also the cap for extensions
    #[serde(default = "default_max_ttl")]
    pub max_minutes: u32,

    /// TTL used when the caller does not ask for one
    #[serde(default = "default_ttl")]
    pub default_minutes: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            min_minutes: default_min_ttl(),
            max_minutes: default_max_ttl(),
            default_minutes: default_ttl(),
        }
    }
}

impl TtlConfig {
    /// Clamp a requested TTL into `[min_minutes, max_minutes]`.
    pub fn clamp(&self, requested_minutes: u32) -> u32 {
        requested_minutes.clamp(self.min_minutes, self.max_minutes)
    }

    /// The maximum TTL as a chrono duration.
    pub fn max(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.max_minutes))
    }
}

/// Health probe budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Maximum number of probe attempts
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Path appended to the sandbox base URL
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            retries: default_health_retries(),
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

impl HealthConfig {
    /// Delay between attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background sweep intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Seconds between container expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub container_interval_secs: u64,

    /// Seconds between session expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub session_interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            container_interval_secs: default_sweep_interval(),
            session_interval_secs: default_sweep_interval(),
        }
    }
}

// Default value functions
fn default_port_start() -> u16 {
    9000
}

fn default_port_end() -> u16 {
    9999
}

fn default_bind_host() -> String {
    crate::runtime::PUBLISH_HOST.to_string()
}

fn default_command() -> String {
    "docker".to_string()
}

fn default_internal_port() -> u16 {
    8000
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> String {
    "0.5".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_name_prefix() -> String {
    "sandbox".to_string()
}

fn default_stop_timeout() -> u32 {
    10
}

fn default_base_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile.sandbox".to_string()
}

fn default_start_command() -> Vec<String> {
    ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "{port}"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_min_ttl() -> u32 {
    5
}

fn default_max_ttl() -> u32 {
    120
}

fn default_ttl() -> u32 {
    30
}

fn default_health_retries() -> u32 {
    30
}

fn default_health_interval() -> u64 {
    1000
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from `dir/sandbox.toml`, then the user config
    /// directory, using defaults if neither exists.
    pub fn load(dir: &Path) -> Result<Self> {
        let candidates = [
            Some(dir.join(CONFIG_FILE)),
            dirs::config_dir().map(|d| d.join("sandbox-deploy").join(CONFIG_FILE)),
        ];

        match candidates.into_iter().flatten().find(|p| p.exists()) {
            Some(path) => Self::load_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate configuration from an explicit file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the lifecycle manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            anyhow::bail!(
                "Invalid port range {}-{}",
                self.ports.start,
                self.ports.end
            );
        }
        if self.ttl.min_minutes == 0 || self.ttl.min_minutes > self.ttl.max_minutes {
            anyhow::bail!(
                "Invalid TTL window {}-{} minutes",
                self.ttl.min_minutes,
                self.ttl.max_minutes
            );
        }
        if self.health.retries == 0 {
            anyhow::bail!("health.retries must be at least 1");
        }
        if self.build.start_command.is_empty() {
            anyhow::bail!("build.start_command must not be empty");
        }
        parse_memory_limit(&self.container.memory)?;
        parse_cpus(&self.container.cpus)?;
        if shell_words::split(&self.runtime.command)
            .context("Invalid runtime.command")?
            .is_empty()
        {
            anyhow::bail!("runtime.command must not be empty");
        }
        Ok(())
    }

    /// Path of the config file `load` would read, if any.
    pub fn resolve_path(dir: &Path) -> Option<PathBuf> {
        let local = dir.join(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("sandbox-deploy").join(CONFIG_FILE))
            .filter(|p| p.exists())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

/// Parse a CPU limit (e.g., "0.5") into nano-CPUs
#[allow(clippy::cast_possible_truncation)]
pub fn parse_cpus(cpus: &str) -> Result<i64> {
    let value: f64 = cpus.trim().parse().context("Invalid CPU limit")?;
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("Invalid CPU limit: {cpus}");
    }
    Ok((value * 1_000_000_000.0) as i64)
}
