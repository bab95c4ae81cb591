//! Recording container runtime for testing.
//!
//! Records every command it receives so tests can assert on the exact
//! sequence of engine calls, and fails on demand.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BuildRequest, ContainerRuntime, RunRequest};
use crate::error::SandboxError;

/// One recorded engine command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuntimeCall {
    Build { image: String },
    Run { name: String, host_port: u16 },
    Stop { name: String },
    RemoveContainer { name: String },
    RemoveImage { image: String },
    Logs { name: String, tail: usize },
    EnsureNetwork { name: String },
    List { prefix: String },
}

/// Which command should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FailOn {
    Build,
    Run,
    Stop,
    RemoveContainer,
    RemoveImage,
    Logs,
}

/// A fake runtime that never touches a container engine.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockRuntime {
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
    fail_on: Arc<Mutex<HashSet<FailOn>>>,
    fail_once: Arc<Mutex<HashSet<FailOn>>>,
    build_delay: Option<Duration>,
    run_delay: Option<Duration>,
    stop_delay: Option<Duration>,
    orphans: Arc<Mutex<Vec<String>>>,
}

impl MockRuntime {
    /// Create a runtime where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail from now on.
    pub fn failing(self, op: FailOn) -> Self {
        self.fail_on.lock().unwrap().insert(op);
        self
    }

    /// Make only the next `op` fail.
    pub fn failing_once(self, op: FailOn) -> Self {
        self.fail_once.lock().unwrap().insert(op);
        self
    }

    /// Make builds take `delay` before returning.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Make container starts take `delay` before returning.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    /// Make container stops take `delay` before returning.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    /// Containers reported by `list_containers`.
    pub fn with_containers(self, names: &[&str]) -> Self {
        *self.orphans.lock().unwrap() = names.iter().map(ToString::to_string).collect();
        self
    }

    /// Snapshot of every call made so far.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, op: FailOn) -> bool {
        self.fail_once.lock().unwrap().remove(&op) || self.fail_on.lock().unwrap().contains(&op)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<(), SandboxError> {
        assert!(
            request.context_dir.join(&request.dockerfile).exists(),
            "build context is missing its Dockerfile"
        );
        self.record(RuntimeCall::Build {
            image: request.image.clone(),
        });
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails(FailOn::Build) {
            return Err(SandboxError::build_failed(&request.image, "exit status 1"));
        }
        Ok(())
    }

    async fn run_container(&self, request: &RunRequest) -> Result<String, SandboxError> {
        self.record(RuntimeCall::Run {
            name: request.name.clone(),
            host_port: request.host_port,
        });
        if let Some(delay) = self.run_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails(FailOn::Run) {
            return Err(SandboxError::run_failed(&request.name, "port is already allocated"));
        }
        Ok(format!("id-{}", request.name))
    }

    async fn stop_container(&self, name: &str, _timeout_secs: u32) -> Result<(), SandboxError> {
        self.record(RuntimeCall::Stop {
            name: name.to_string(),
        });
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails(FailOn::Stop) {
            return Err(SandboxError::container_failed("stop failed"));
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), SandboxError> {
        self.record(RuntimeCall::RemoveContainer {
            name: name.to_string(),
        });
        if self.fails(FailOn::RemoveContainer) {
            return Err(SandboxError::container_failed("rm failed"));
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), SandboxError> {
        self.record(RuntimeCall::RemoveImage {
            image: image.to_string(),
        });
        if self.fails(FailOn::RemoveImage) {
            return Err(SandboxError::container_failed("rmi failed"));
        }
        Ok(())
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, SandboxError> {
        self.record(RuntimeCall::Logs {
            name: name.to_string(),
            tail,
        });
        if self.fails(FailOn::Logs) {
            return Err(SandboxError::container_failed("no such container"));
        }
        Ok(format!("{name}: listening on 0.0.0.0:8000\n"))
    }

    async fn ensure_network(&self, name: &str) -> Result<(), SandboxError> {
        self.record(RuntimeCall::EnsureNetwork {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, SandboxError> {
        self.record(RuntimeCall::List {
            prefix: prefix.to_string(),
        });
        Ok(self
            .orphans
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runtime_records_calls() {
        let runtime = MockRuntime::new();
        runtime.stop_container("c1", 5).await.unwrap();
        runtime.remove_container("c1").await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Stop {
                    name: "c1".to_string()
                },
                RuntimeCall::RemoveContainer {
                    name: "c1".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_runtime_fails_on_demand() {
        let runtime = MockRuntime::new().failing(FailOn::Stop);
        assert!(runtime.stop_container("c1", 5).await.is_err());
        assert!(runtime.remove_container("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_runtime_fails_once() {
        let runtime = MockRuntime::new().failing_once(FailOn::Stop);
        assert!(runtime.stop_container("c1", 5).await.is_err());
        assert!(runtime.stop_container("c1", 5).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_runtime_delays_run_and_stop() {
        let delay = Duration::from_millis(30);
        let runtime = MockRuntime::new()
            .with_run_delay(delay)
            .with_stop_delay(delay);
        let request = RunRequest {
            image: "img:1".to_string(),
            name: "c1".to_string(),
            host_port: 9000,
            container_port: 8000,
            memory: "512m".to_string(),
            cpus: "0.5".to_string(),
            env: std::collections::BTreeMap::new(),
            labels: std::collections::BTreeMap::new(),
            network: None,
        };

        let started = std::time::Instant::now();
        runtime.run_container(&request).await.unwrap();
        runtime.stop_container("c1", 5).await.unwrap();
        assert!(started.elapsed() >= delay * 2);
    }

    #[tokio::test]
    async fn test_mock_runtime_lists_by_prefix() {
        let runtime = MockRuntime::new().with_containers(&["sandbox-a", "other-b"]);
        let names = runtime.list_containers("sandbox").await.unwrap();
        assert_eq!(names, vec!["sandbox-a".to_string()]);
    }

    #[test]
    fn test_mock_runtime_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockRuntime>();
    }
}
