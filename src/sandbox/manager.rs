//! Sandbox lifecycle manager.
//!
//! Ties the port pool, the container runtime and the health prober into
//! `create_sandbox` / `destroy_sandbox` / `extend_ttl`. Bookkeeping lives in
//! a single map guarded by a synchronous mutex that is never held across an
//! await; every engine call happens with the lock released.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::container::{SandboxContainer, SandboxStatus};
use super::context::{self, BuildContext};
use crate::config::Config;
use crate::error::SandboxError;
use crate::health::{HealthProber, Readiness};
use crate::ports::PortAllocator;
use crate::runtime::{BuildRequest, ContainerRuntime, RunRequest, LABEL_MANAGED, LABEL_SESSION};

/// Owns every sandbox container created by this process.
pub struct SandboxManager {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    prober: HealthProber,
    ports: PortAllocator,
    containers: Mutex<HashMap<String, SandboxContainer>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("runtime", &self.runtime.name())
            .field("ports", &self.ports)
            .field("containers", &self.count())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Create a manager with its own port pool taken from `config.ports`.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, prober: HealthProber) -> Self {
        let ports = PortAllocator::from_config(&config.ports);
        Self {
            config,
            runtime,
            prober,
            ports,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// The port pool backing this manager.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SandboxContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the record for `session_id` if it is still the one
    /// identified by `id`. Returns false once the record is gone.
    fn update<F>(&self, session_id: &str, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SandboxContainer),
    {
        match self.lock().get_mut(session_id) {
            Some(record) if record.id == id => {
                f(record);
                true
            }
            _ => false,
        }
    }

    /// Remove the record for `session_id` if it is still the one identified
    /// by `id`.
    fn take(&self, session_id: &str, id: &str) -> Option<SandboxContainer> {
        let mut containers = self.lock();
        match containers.get(session_id) {
            Some(record) if record.id == id => containers.remove(session_id),
            _ => None,
        }
    }

    /// Build, start and health-check a sandbox for `session_id`.
    ///
    /// Calling this again while the session's sandbox is up returns the
    /// existing record with its expiry pushed out to at least `now + ttl`.
    pub async fn create_sandbox(
        &self,
        session_id: &str,
        files: &HashMap<String, String>,
        ttl_minutes: u32,
    ) -> Result<SandboxContainer, SandboxError> {
        let ttl = self.config.ttl.clamp(ttl_minutes);
        context::validate_files(files, &self.config.build.dockerfile)?;

        if let Some(existing) = self.reuse_existing(session_id, ttl)? {
            return Ok(existing);
        }

        let port = self.ports.allocate()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        let (container_name, image_name) = context::sandbox_names(
            &self.config.container.name_prefix,
            session_id,
            now,
            &id.simple().to_string(),
        );

        let record = SandboxContainer {
            id: id.to_string(),
            session_id: session_id.to_string(),
            container_name,
            image_name,
            container_id: None,
            port,
            base_url: format!("http://{}:{port}", self.config.container.public_host),
            status: SandboxStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(ttl)),
            health_checks: 0,
            last_health_check: None,
            error_message: None,
        };

        {
            let mut containers = self.lock();
            // Re-check: another create may have won the race while we were
            // allocating.
            if containers.contains_key(session_id) {
                drop(containers);
                self.ports.release(port);
                return Err(SandboxError::creation_in_progress(session_id));
            }
            containers.insert(session_id.to_string(), record.clone());
        }

        info!(
            session_id,
            port,
            container = %record.container_name,
            ttl_minutes = ttl,
            "Creating sandbox"
        );

        self.provision(record, files).await
    }

    /// Idempotent path: extend and return an active sandbox, refuse while
    /// one is mid-creation. Failed creates remove their record before
    /// cleaning up, so terminal records are never found here.
    fn reuse_existing(
        &self,
        session_id: &str,
        ttl: u32,
    ) -> Result<Option<SandboxContainer>, SandboxError> {
        let mut containers = self.lock();
        let Some(existing) = containers.get_mut(session_id) else {
            return Ok(None);
        };

        if existing.status.is_active() {
            let target = Utc::now() + Duration::minutes(i64::from(ttl));
            existing.expires_at = existing.expires_at.max(target);
            debug!(
                session_id,
                port = existing.port,
                expires_at = %existing.expires_at,
                "Reusing active sandbox"
            );
            return Ok(Some(existing.clone()));
        }

        Err(SandboxError::creation_in_progress(session_id))
    }

    async fn provision(
        &self,
        record: SandboxContainer,
        files: &HashMap<String, String>,
    ) -> Result<SandboxContainer, SandboxError> {
        let session_id = record.session_id.as_str();
        let id = record.id.as_str();

        self.update(session_id, id, |r| {
            r.transition(SandboxStatus::Building);
        });

        let build_context = match self.assemble_context(files).await {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.fail_creation(&record, SandboxStatus::Failed, e).await),
        };

        if let Some(network) = &self.config.runtime.network {
            if let Err(e) = self.runtime.ensure_network(network).await {
                return Err(self.fail_creation(&record, SandboxStatus::Failed, e).await);
            }
        }

        let build = BuildRequest {
            context_dir: build_context.path().to_path_buf(),
            dockerfile: self.config.build.dockerfile.clone(),
            image: record.image_name.clone(),
            labels: self.labels(session_id),
        };
        let built = self.runtime.build_image(&build).await;
        drop(build_context);
        if let Err(e) = built {
            error!(session_id, image = %record.image_name, error = %e, "Image build failed");
            return Err(self.fail_creation(&record, SandboxStatus::Failed, e).await);
        }

        if !self.update(session_id, id, |r| {
            r.transition(SandboxStatus::Starting);
        }) {
            return Err(self.abort_creation(&record, "build").await);
        }

        let run = self.run_request(&record);
        let container_id = match self.runtime.run_container(&run).await {
            Ok(container_id) => container_id,
            Err(e) => {
                error!(session_id, container = %record.container_name, error = %e, "Container start failed");
                return Err(self.fail_creation(&record, SandboxStatus::Failed, e).await);
            }
        };

        if !self.update(session_id, id, |r| {
            r.container_id = Some(container_id.clone());
            r.transition(SandboxStatus::Running);
        }) {
            return Err(self.abort_creation(&record, "start").await);
        }

        let probed = self
            .prober
            .wait_until_healthy(&record.base_url, |attempt| {
                let tracked = self.update(session_id, id, |r| {
                    r.health_checks = attempt;
                    r.last_health_check = Some(Utc::now());
                });
                if tracked {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })
            .await;

        match probed {
            Ok(Readiness::Healthy(_)) => {}
            Ok(Readiness::Cancelled(_)) => {
                return Err(self.abort_creation(&record, "health check").await);
            }
            Err(e) => {
                warn!(session_id, base_url = %record.base_url, error = %e, "Sandbox never became healthy");
                return Err(self.fail_creation(&record, SandboxStatus::Unhealthy, e).await);
            }
        }

        let mut healthy = None;
        self.update(session_id, id, |r| {
            r.transition(SandboxStatus::Healthy);
            healthy = Some(r.clone());
        });

        match healthy {
            Some(container) => {
                info!(
                    session_id,
                    base_url = %container.base_url,
                    health_checks = container.health_checks,
                    "Sandbox healthy"
                );
                Ok(container)
            }
            None => Err(self.abort_creation(&record, "health check").await),
        }
    }

    async fn assemble_context(
        &self,
        files: &HashMap<String, String>,
    ) -> Result<BuildContext, SandboxError> {
        let files = files.clone();
        let build = self.config.build.clone();
        let internal_port = self.config.container.internal_port;
        tokio::task::spawn_blocking(move || context::assemble(&files, &build, internal_port))
            .await
            .map_err(|e| SandboxError::container_failed(format!("build context task: {e}")))?
    }

    fn labels(&self, session_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SESSION.to_string(), session_id.to_string()),
        ])
    }

    fn run_request(&self, record: &SandboxContainer) -> RunRequest {
        let container = &self.config.container;
        let secret = format!(
            "sandbox-{}-{}",
            context::session_slug(&record.session_id),
            Uuid::new_v4().simple()
        );
        let env = BTreeMap::from([
            ("SANDBOX_MODE".to_string(), "true".to_string()),
            ("SANDBOX_SESSION_ID".to_string(), record.session_id.clone()),
            ("SECRET_KEY".to_string(), secret),
            ("PORT".to_string(), container.internal_port.to_string()),
        ]);

        RunRequest {
            image: record.image_name.clone(),
            name: record.container_name.clone(),
            host_port: record.port,
            container_port: container.internal_port,
            memory: container.memory.clone(),
            cpus: container.cpus.clone(),
            env,
            labels: self.labels(&record.session_id),
            network: self.config.runtime.network.clone(),
        }
    }

    /// Drop the record, tear down whatever was created and give the port
    /// back. Returns `err` for the caller to propagate.
    ///
    /// The create call owns its port until the record turns healthy, so the
    /// port is released here even when a destroy or sweep got to the record
    /// first.
    async fn fail_creation(
        &self,
        record: &SandboxContainer,
        status: SandboxStatus,
        err: SandboxError,
    ) -> SandboxError {
        if let Some(mut failed) = self.take(&record.session_id, &record.id) {
            failed.transition(status);
            failed.error_message = Some(err.to_string());
            debug!(
                session_id = %failed.session_id,
                status = %failed.status,
                "Removed failed sandbox record"
            );
        }

        self.teardown(&record.container_name, &record.image_name).await;
        self.ports.release(record.port);
        err
    }

    /// The record was destroyed while an engine call was in flight; remove
    /// whatever that call left behind, then release the port.
    async fn abort_creation(&self, record: &SandboxContainer, stage: &'static str) -> SandboxError {
        warn!(
            session_id = %record.session_id,
            stage,
            "Sandbox destroyed during creation, cleaning up"
        );
        self.teardown(&record.container_name, &record.image_name).await;
        self.ports.release(record.port);
        SandboxError::aborted(&record.session_id, stage)
    }

    /// Release the port of a record removed by destroy or sweep, unless a
    /// create call is still working on it.
    fn release_removed(&self, record: &SandboxContainer, removed_status: SandboxStatus) {
        if removed_status.is_creating() {
            debug!(
                session_id = %record.session_id,
                port = record.port,
                status = %removed_status,
                "Port stays reserved until creation unwinds"
            );
        } else {
            self.ports.release(record.port);
        }
    }

    /// Best-effort stop, remove and image removal. Never fails.
    async fn teardown(&self, container_name: &str, image_name: &str) {
        let timeout = self.config.container.stop_timeout_secs;
        if let Err(e) = self.runtime.stop_container(container_name, timeout).await {
            debug!(container = container_name, error = %e, "Stop failed");
        }
        if let Err(e) = self.runtime.remove_container(container_name).await {
            debug!(container = container_name, error = %e, "Remove failed");
        }
        if let Err(e) = self.runtime.remove_image(image_name).await {
            debug!(image = image_name, error = %e, "Image removal failed");
        }
    }

    /// Tear down the sandbox for `session_id`.
    ///
    /// Returns whether a record existed. Engine failures are logged and
    /// swallowed.
    pub async fn destroy_sandbox(&self, session_id: &str) -> bool {
        let (record, removed_status) = {
            let mut containers = self.lock();
            match containers.remove(session_id) {
                Some(mut record) => {
                    let removed_status = record.status;
                    record.transition(SandboxStatus::Stopping);
                    (record, removed_status)
                }
                None => return false,
            }
        };

        self.teardown(&record.container_name, &record.image_name).await;
        self.release_removed(&record, removed_status);

        let mut record = record;
        record.transition(SandboxStatus::Stopped);
        info!(session_id, port = record.port, "Sandbox destroyed");
        true
    }

    /// Push the expiry of `session_id` out by `additional_minutes`, capped at
    /// `now + ttl.max_minutes`. Never shortens it.
    pub fn extend_ttl(&self, session_id: &str, additional_minutes: u32) -> bool {
        let mut containers = self.lock();
        let Some(record) = containers.get_mut(session_id) else {
            return false;
        };

        let cap = Utc::now() + self.config.ttl.max();
        let wanted = record.expires_at + Duration::minutes(i64::from(additional_minutes));
        record.expires_at = record.expires_at.max(wanted.min(cap));
        debug!(session_id, expires_at = %record.expires_at, "Extended sandbox TTL");
        true
    }

    /// Last `tail` lines of the sandbox's output, `None` if unknown or the
    /// engine cannot provide them.
    pub async fn get_logs(&self, session_id: &str, tail: usize) -> Option<String> {
        let container_name = self.lock().get(session_id)?.container_name.clone();
        match self.runtime.logs(&container_name, tail).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(session_id, error = %e, "Failed to fetch sandbox logs");
                None
            }
        }
    }

    /// Snapshot of the record for `session_id`.
    pub fn get(&self, session_id: &str) -> Option<SandboxContainer> {
        self.lock().get(session_id).cloned()
    }

    /// Snapshot of every running or healthy sandbox.
    pub fn active_sandboxes(&self) -> Vec<SandboxContainer> {
        self.lock()
            .values()
            .filter(|c| c.status.is_active())
            .cloned()
            .collect()
    }

    /// Number of tracked records, in any state.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Destroy every sandbox whose expiry has passed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Destroy every sandbox whose expiry is at or before `now`.
    pub async fn sweep_expired_at(&self, now: chrono::DateTime<Utc>) -> usize {
        let expired: Vec<(SandboxContainer, SandboxStatus)> = {
            let mut containers = self.lock();
            let ids: Vec<String> = containers
                .iter()
                .filter(|(_, c)| c.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            ids.iter()
                .filter_map(|k| containers.remove(k))
                .map(|mut record| {
                    let removed_status = record.status;
                    record.transition(SandboxStatus::Expired);
                    (record, removed_status)
                })
                .collect()
        };

        for (record, removed_status) in &expired {
            info!(
                session_id = %record.session_id,
                container = %record.container_name,
                "Sandbox expired"
            );
            self.teardown(&record.container_name, &record.image_name).await;
            self.release_removed(record, *removed_status);
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every
    /// `sweep.container_interval_secs` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = std::time::Duration::from_secs(manager.config.sweep.container_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let swept = manager.sweep_expired().await;
                if swept > 0 {
                    info!(swept, "Container sweep removed expired sandboxes");
                }
            }
        })
    }

    /// Destroy every tracked sandbox.
    pub async fn shutdown(&self) -> usize {
        let sessions: Vec<String> = self.lock().keys().cloned().collect();
        let mut destroyed = 0;
        for session_id in sessions {
            if self.destroy_sandbox(&session_id).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Remove managed containers left behind by a previous process.
    ///
    /// Containers tracked by this manager are left alone. Returns the names
    /// that were removed.
    pub async fn cleanup_orphaned(&self) -> Result<Vec<String>, SandboxError> {
        let prefix = format!("{}-", self.config.container.name_prefix);
        let listed = self.runtime.list_containers(&prefix).await?;

        let tracked: Vec<String> = self
            .lock()
            .values()
            .map(|c| c.container_name.clone())
            .collect();

        let mut removed = Vec::new();
        for name in listed.into_iter().filter(|n| !tracked.contains(n)) {
            let image = context::image_for_container(&name).unwrap_or_default();
            self.teardown(&name, &image).await;
            info!(container = %name, "Removed orphaned sandbox");
            removed.push(name);
        }
        Ok(removed)
    }
}
