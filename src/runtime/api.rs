//! Container runtime backed by the Docker Engine API.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::service::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tar::Builder;
use tracing::{debug, info};

use super::{BuildRequest, ContainerRuntime, RunRequest, LABEL_MANAGED, PUBLISH_HOST};
use crate::config::{parse_cpus, parse_memory_limit};
use crate::error::SandboxError;

/// Talks to the local Docker daemon over its socket.
#[derive(Debug, Clone)]
pub struct DockerApi {
    docker: Docker,
}

impl DockerApi {
    /// Connect to the local daemon and check it answers.
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::docker_unavailable(format!("Failed to connect to Docker: {e}"))
        })?;

        docker.ping().await.map_err(|e| {
            SandboxError::docker_unavailable(format!("Cannot ping Docker daemon: {e}"))
        })?;

        Ok(Self { docker })
    }
}

/// Tar up a build context directory.
fn tar_context(context_dir: PathBuf) -> std::io::Result<Vec<u8>> {
    let mut tar_buf = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_buf);
        tar.append_dir_all(".", &context_dir)?;
        tar.finish()?;
    }
    Ok(tar_buf)
}

/// Container config for a sandbox: published port, limits, no restarts.
fn container_config(request: &RunRequest) -> Result<ContainerConfig<String>, SandboxError> {
    let memory = parse_memory_limit(&request.memory)
        .map_err(|e| SandboxError::run_failed(&request.name, e.to_string()))?;
    let nano_cpus =
        parse_cpus(&request.cpus).map_err(|e| SandboxError::run_failed(&request.name, e.to_string()))?;

    let port_key = format!("{}/tcp", request.container_port);
    let port_bindings = HashMap::from([(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some(PUBLISH_HOST.to_string()),
            host_port: Some(request.host_port.to_string()),
        }]),
    )]);
    let exposed_ports = HashMap::from([(port_key, HashMap::new())]);

    Ok(ContainerConfig {
        image: Some(request.image.clone()),
        env: Some(
            request
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        ),
        labels: Some(request.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            network_mode: request.network.clone(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerRuntime for DockerApi {
    fn name(&self) -> &'static str {
        "docker-api"
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<(), SandboxError> {
        let context_dir = request.context_dir.clone();
        let tar_buf = tokio::task::spawn_blocking(move || tar_context(context_dir))
            .await
            .map_err(|e| SandboxError::build_failed(&request.image, e.to_string()))??;

        let build_options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.image.clone(),
            rm: true,
            forcerm: true,
            labels: request.labels.clone().into_iter().collect(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(build_options, None, Some(Bytes::from(tar_buf)));

        info!(image = %request.image, "Building image");
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(SandboxError::build_failed(&request.image, error));
                    }
                    if let Some(message) = output.error_detail.and_then(|d| d.message) {
                        return Err(SandboxError::build_failed(&request.image, message));
                    }
                    if let Some(text) = output.stream {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            debug!(image = %request.image, "{trimmed}");
                        }
                    }
                }
                Err(e) => return Err(SandboxError::build_failed(&request.image, e.to_string())),
            }
        }

        Ok(())
    }

    async fn run_container(&self, request: &RunRequest) -> Result<String, SandboxError> {
        let config = container_config(request)?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::run_failed(&request.name, e.to_string()))?;

        self.docker
            .start_container::<String>(&request.name, None)
            .await
            .map_err(|e| SandboxError::run_failed(&request.name, e.to_string()))?;

        Ok(created.id)
    }

    async fn stop_container(&self, name: &str, timeout_secs: u32) -> Result<(), SandboxError> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: i64::from(timeout_secs),
                }),
            )
            .await
            .map_err(|e| SandboxError::container_failed(format!("stop {name}: {e}")))
    }

    async fn remove_container(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::container_failed(format!("remove {name}: {e}")))
    }

    async fn remove_image(&self, image: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::container_failed(format!("remove image {image}: {e}")))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, SandboxError> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message } | LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SandboxError::container_failed(format!("logs {name}: {e}")));
                }
            }
        }
        Ok(output)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), SandboxError> {
        if self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            return Ok(());
        }

        debug!(network = name, "Creating network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::container_failed(format!("create network {name}: {e}")))
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([("label".to_string(), vec![format!("{LABEL_MANAGED}=true")])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::container_failed(format!("list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }
}
