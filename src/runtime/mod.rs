//! Container runtime gateway.
//!
//! The lifecycle manager never talks to a container engine directly; it
//! goes through the narrow [`ContainerRuntime`] trait so the engine can be
//! swapped (CLI, Engine API) or faked in tests.

mod api;
mod cli;
#[cfg(test)]
pub(crate) mod mock;

pub use api::DockerApi;
pub use cli::DockerCli;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{RuntimeBackend, RuntimeConfig};
use crate::error::SandboxError;

/// Label present on every container and image this crate creates.
pub const LABEL_MANAGED: &str = "sandbox-deploy.managed";
/// Label carrying the owning session id.
pub const LABEL_SESSION: &str = "sandbox-deploy.session";

/// Host interface sandbox ports are published on.
pub const PUBLISH_HOST: &str = "0.0.0.0";

/// Everything needed to build a sandbox image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory holding the assembled build context.
    pub context_dir: PathBuf,
    /// Dockerfile name, relative to `context_dir`.
    pub dockerfile: String,
    /// Tag given to the built image.
    pub image: String,
    /// Labels applied to the image.
    pub labels: BTreeMap<String, String>,
}

/// Everything needed to start a sandbox container.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Image to run.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Host port published for the backend.
    pub host_port: u16,
    /// Port the backend listens on inside the container.
    pub container_port: u16,
    /// Memory limit (e.g., "512m").
    pub memory: String,
    /// CPU limit (e.g., "0.5").
    pub cpus: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Network to join, if any.
    pub network: Option<String>,
}

impl RunRequest {
    /// `hostPort:containerPort` mapping string.
    pub fn port_mapping(&self) -> String {
        format!("{}:{}", self.host_port, self.container_port)
    }
}

/// Commands the lifecycle manager issues to a container engine.
///
/// Build and run may block for a long time; implementations must not
/// stall the async scheduler while they wait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Builds an image from a context directory.
    async fn build_image(&self, request: &BuildRequest) -> Result<(), SandboxError>;

    /// Starts a detached container, returning its engine id.
    async fn run_container(&self, request: &RunRequest) -> Result<String, SandboxError>;

    /// Stops a named container.
    async fn stop_container(&self, name: &str, timeout_secs: u32) -> Result<(), SandboxError>;

    /// Removes a named container.
    async fn remove_container(&self, name: &str) -> Result<(), SandboxError>;

    /// Removes a named image.
    async fn remove_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Returns the last `tail` lines of a container's output.
    async fn logs(&self, name: &str, tail: usize) -> Result<String, SandboxError>;

    /// Ensures a named network exists, creating it if needed.
    async fn ensure_network(&self, name: &str) -> Result<(), SandboxError>;

    /// Lists managed containers whose name starts with `prefix`.
    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, SandboxError>;
}

/// Build the runtime selected by `[runtime]`.
pub async fn from_config(config: &RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>, SandboxError> {
    match config.backend {
        RuntimeBackend::Cli => Ok(Arc::new(DockerCli::new(&config.command)?)),
        RuntimeBackend::Api => Ok(Arc::new(DockerApi::connect().await?)),
    }
}

/// Keep only the last `n` lines of engine output for error messages.
pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping() {
        let request = RunRequest {
            image: "img".to_string(),
            name: "c".to_string(),
            host_port: 9001,
            container_port: 8000,
            memory: "512m".to_string(),
            cpus: "0.5".to_string(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            network: None,
        };
        assert_eq!(request.port_mapping(), "9001:8000");
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 3), "");
    }

    #[tokio::test]
    async fn test_from_config_cli_backend() {
        let config = RuntimeConfig::default();
        let runtime = from_config(&config).await.unwrap();
        assert_eq!(runtime.name(), "docker-cli");
    }
}
