//! Container runtime backed by the engine CLI.
//!
//! Every command is a blocking child process, so each one runs on the
//! blocking thread pool rather than the async workers.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Command;
use tracing::{debug, warn};

use super::{tail_lines, BuildRequest, ContainerRuntime, RunRequest, LABEL_MANAGED};
use crate::error::SandboxError;

/// Lines of engine stderr kept in error messages.
const ERROR_TAIL: usize = 20;

/// Captured result of one engine command.
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Shells out to `docker` (or a compatible CLI such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    base_args: Vec<String>,
}

impl DockerCli {
    /// Creates a runtime from a command line such as `"docker"` or
    /// `"sudo docker"`.
    pub fn new(command: &str) -> Result<Self, SandboxError> {
        let mut parts = shell_words::split(command)
            .map_err(|e| SandboxError::docker_unavailable(format!("bad command '{command}': {e}")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| SandboxError::docker_unavailable("empty engine command"))?;
        Ok(Self {
            program,
            base_args: parts.collect(),
        })
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput, SandboxError> {
        let program = self.program.clone();
        let mut full_args = self.base_args.clone();
        full_args.extend(args);
        debug!("Engine command: {} {}", program, full_args.join(" "));

        let output = tokio::task::spawn_blocking(move || Command::new(&program).args(&full_args).output())
            .await
            .map_err(|e| SandboxError::container_failed(format!("engine task failed: {e}")))?
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    SandboxError::docker_unavailable(format!("'{}' not found", self.program))
                } else {
                    SandboxError::container_failed(e.to_string())
                }
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Runs a command whose failure maps to `ContainerFailed`.
    async fn exec_checked(&self, args: Vec<String>, what: &str) -> Result<String, SandboxError> {
        let output = self.exec(args).await?;
        if !output.success {
            return Err(SandboxError::container_failed(format!(
                "{what}: {}",
                tail_lines(&output.stderr, ERROR_TAIL)
            )));
        }
        Ok(output.stdout)
    }
}

/// Arguments for `docker build`.
pub(crate) fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "-f".to_string(),
        request
            .context_dir
            .join(&request.dockerfile)
            .display()
            .to_string(),
        "-t".to_string(),
        request.image.clone(),
    ];
    for (key, value) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(request.context_dir.display().to_string());
    args
}

/// Arguments for `docker run`.
pub(crate) fn run_args(request: &RunRequest) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        request.name.clone(),
        "-p".to_string(),
        request.port_mapping(),
        "--memory".to_string(),
        request.memory.clone(),
        "--cpus".to_string(),
        request.cpus.clone(),
        "--restart".to_string(),
        "no".to_string(),
    ];
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(ref network) = request.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push(request.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &'static str {
        "docker-cli"
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<(), SandboxError> {
        let output = self.exec(build_args(request)).await?;
        if !output.success {
            return Err(SandboxError::build_failed(
                &request.image,
                tail_lines(&output.stderr, ERROR_TAIL),
            ));
        }
        Ok(())
    }

    async fn run_container(&self, request: &RunRequest) -> Result<String, SandboxError> {
        let output = self.exec(run_args(request)).await?;
        if !output.success {
            return Err(SandboxError::run_failed(
                &request.name,
                tail_lines(&output.stderr, ERROR_TAIL),
            ));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn stop_container(&self, name: &str, timeout_secs: u32) -> Result<(), SandboxError> {
        self.exec_checked(
            vec![
                "stop".to_string(),
                "-t".to_string(),
                timeout_secs.to_string(),
                name.to_string(),
            ],
            "stop",
        )
        .await
        .map(|_| ())
    }

    async fn remove_container(&self, name: &str) -> Result<(), SandboxError> {
        self.exec_checked(
            vec!["rm".to_string(), "-f".to_string(), name.to_string()],
            "rm",
        )
        .await
        .map(|_| ())
    }

    async fn remove_image(&self, image: &str) -> Result<(), SandboxError> {
        self.exec_checked(
            vec!["rmi".to_string(), "-f".to_string(), image.to_string()],
            "rmi",
        )
        .await
        .map(|_| ())
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, SandboxError> {
        let output = self
            .exec(vec![
                "logs".to_string(),
                "--tail".to_string(),
                tail.to_string(),
                name.to_string(),
            ])
            .await?;
        if !output.success {
            return Err(SandboxError::container_failed(format!(
                "logs: {}",
                tail_lines(&output.stderr, ERROR_TAIL)
            )));
        }
        // The engine replays container stderr on its own stderr.
        let mut combined = output.stdout;
        combined.push_str(&output.stderr);
        Ok(combined)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), SandboxError> {
        let inspect = self
            .exec(vec![
                "network".to_string(),
                "inspect".to_string(),
                name.to_string(),
            ])
            .await?;
        if inspect.success {
            return Ok(());
        }

        debug!(network = name, "Creating network");
        let created = self
            .exec(vec![
                "network".to_string(),
                "create".to_string(),
                name.to_string(),
            ])
            .await?;
        if !created.success {
            // Lost a race with a concurrent create.
            if created.stderr.contains("already exists") {
                warn!(network = name, "Network created concurrently");
                return Ok(());
            }
            return Err(SandboxError::container_failed(format!(
                "network create: {}",
                tail_lines(&created.stderr, ERROR_TAIL)
            )));
        }
        Ok(())
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, SandboxError> {
        let stdout = self
            .exec_checked(
                vec![
                    "ps".to_string(),
                    "-a".to_string(),
                    "--filter".to_string(),
                    format!("label={LABEL_MANAGED}=true"),
                    "--format".to_string(),
                    "{{.Names}}".to_string(),
                ],
                "ps",
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(ToString::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn run_request() -> RunRequest {
        RunRequest {
            image: "sandbox-s1:abc".to_string(),
            name: "sandbox-s1-abc".to_string(),
            host_port: 9003,
            container_port: 8000,
            memory: "512m".to_string(),
            cpus: "0.5".to_string(),
            env: BTreeMap::from([("SANDBOX_MODE".to_string(), "true".to_string())]),
            labels: BTreeMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
            network: Some("previews".to_string()),
        }
    }

    #[test]
    fn test_new_splits_command() {
        let cli = DockerCli::new("sudo docker").unwrap();
        assert_eq!(cli.program, "sudo");
        assert_eq!(cli.base_args, vec!["docker".to_string()]);

        let cli = DockerCli::new("podman").unwrap();
        assert_eq!(cli.program, "podman");
        assert!(cli.base_args.is_empty());
    }

    #[test]
    fn test_new_rejects_empty_command() {
        assert!(DockerCli::new("   ").unwrap_err().is_docker_unavailable());
    }

    #[test]
    fn test_build_args() {
        let request = BuildRequest {
            context_dir: PathBuf::from("/tmp/ctx"),
            dockerfile: "Dockerfile.sandbox".to_string(),
            image: "sandbox-s1:abc".to_string(),
            labels: BTreeMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
        };
        let args = build_args(&request);
        assert_eq!(
            args,
            vec![
                "build",
                "-f",
                "/tmp/ctx/Dockerfile.sandbox",
                "-t",
                "sandbox-s1:abc",
                "--label",
                "sandbox-deploy.managed=true",
                "/tmp/ctx",
            ]
        );
    }

    #[test]
    fn test_run_args_carry_limits_and_policy() {
        let args = run_args(&run_request());
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name sandbox-s1-abc -p 9003:8000"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--restart no"));
        assert!(joined.contains("-e SANDBOX_MODE=true"));
        assert!(joined.contains("--network previews"));
        assert_eq!(args.last().unwrap(), "sandbox-s1:abc");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let cli = DockerCli::new("definitely-not-a-container-engine-binary").unwrap();
        let err = cli.remove_container("x").await.unwrap_err();
        assert!(err.is_docker_unavailable());
    }
}
