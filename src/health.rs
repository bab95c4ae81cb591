//! Bounded-retry health probing of freshly started sandboxes.
//!
//! A sandbox is healthy once `GET {base_url}/health` answers `200` with a
//! JSON body whose `status` is `"ok"`. Connection errors, timeouts and any
//! other answer count as "not yet"; only running out of attempts is fatal.

use async_trait::async_trait;
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::HealthConfig;
use crate::error::SandboxError;

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend reported ready.
    Healthy,
    /// Not ready yet, with a short reason for logs.
    NotReady(String),
}

impl ProbeOutcome {
    /// Returns true for [`ProbeOutcome::Healthy`].
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// How a [`HealthProber::wait_until_healthy`] loop ended without timing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Healthy on this 1-based attempt.
    Healthy(u32),
    /// The caller stopped the loop before this attempt was made.
    Cancelled(u32),
}

/// A single readiness check against a sandbox.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes `base_url` once.
    async fn check(&self, base_url: &str) -> ProbeOutcome;
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
}

/// Probes the sandbox over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Creates a probe hitting `path` with a per-request `timeout`.
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
            timeout,
        }
    }

    /// Creates a probe from the `[health]` config section.
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.path.clone(), config.timeout())
    }

    fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, base_url: &str) -> ProbeOutcome {
        let url = self.url(base_url);
        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::NotReady(format!("request failed: {e}")),
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return ProbeOutcome::NotReady(format!("status {status}"));
        }

        match response.json::<HealthBody>().await {
            Ok(HealthBody {
                status: Some(ref s),
            }) if s.trim().eq_ignore_ascii_case("ok") => ProbeOutcome::Healthy,
            Ok(body) => ProbeOutcome::NotReady(format!("body status {:?}", body.status)),
            Err(e) => ProbeOutcome::NotReady(format!("invalid body: {e}")),
        }
    }
}

/// Repeats a [`HealthProbe`] at a fixed interval until it succeeds or the
/// attempt budget runs out.
#[derive(Clone)]
pub struct HealthProber {
    probe: Arc<dyn HealthProbe>,
    retries: u32,
    interval: Duration,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("retries", &self.retries)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl HealthProber {
    /// Creates a prober making at most `retries` attempts `interval` apart.
    pub fn new(probe: Arc<dyn HealthProbe>, retries: u32, interval: Duration) -> Self {
        Self {
            probe,
            retries: retries.max(1),
            interval,
        }
    }

    /// Creates an HTTP prober from the `[health]` config section.
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            Arc::new(HttpHealthProbe::from_config(config)),
            config.retries,
            config.interval(),
        )
    }

    /// Maximum number of attempts.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Poll `base_url` until healthy.
    ///
    /// `on_attempt` runs before each attempt with the 1-based attempt number;
    /// returning [`ControlFlow::Break`] stops polling without probing again.
    pub async fn wait_until_healthy<F>(
        &self,
        base_url: &str,
        mut on_attempt: F,
    ) -> Result<Readiness, SandboxError>
    where
        F: FnMut(u32) -> ControlFlow<()> + Send,
    {
        for attempt in 1..=self.retries {
            if on_attempt(attempt).is_break() {
                debug!(base_url, attempt, "Health polling cancelled");
                return Ok(Readiness::Cancelled(attempt));
            }

            match self.probe.check(base_url).await {
                ProbeOutcome::Healthy => {
                    debug!(base_url, attempt, "Sandbox healthy");
                    return Ok(Readiness::Healthy(attempt));
                }
                ProbeOutcome::NotReady(reason) => {
                    debug!(base_url, attempt, %reason, "Sandbox not ready");
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(SandboxError::health_timeout(
            base_url,
            self.retries,
            self.interval * (self.retries - 1),
        ))
    }
}

/// A probe that plays back a fixed script of outcomes.
#[cfg(test)]
pub(crate) struct ScriptedProbe {
    script: Vec<ProbeOutcome>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedProbe {
    /// Reports not-ready `failures` times, then healthy forever.
    pub fn healthy_after(failures: usize) -> Self {
        let mut script = vec![ProbeOutcome::NotReady("starting".to_string()); failures];
        script.push(ProbeOutcome::Healthy);
        Self {
            script,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Never reports healthy.
    pub fn never_healthy() -> Self {
        Self {
            script: vec![ProbeOutcome::NotReady("connection refused".to_string())],
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of probes made.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, _base_url: &str) -> ProbeOutcome {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.script[n.min(self.script.len() - 1)].clone()
    }
}
