//! Domain-specific error types for sandbox and session operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! (and map them to 404 / 403 / 410 style responses) rather than
//! parsing error message strings.

use std::time::Duration;

/// Errors that can occur while creating, running or tearing down a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// No port in the configured range is both untracked and bindable.
    #[error("No free port in range {start}-{end}")]
    PortExhausted {
        /// First port of the range.
        start: u16,
        /// Last port of the range (inclusive).
        end: u16,
    },

    /// The container engine failed to build the sandbox image.
    #[error("Image build failed for {image}: {message}")]
    BuildFailed {
        /// Image tag that was being built.
        image: String,
        /// Engine output explaining the failure.
        message: String,
    },

    /// The container engine failed to start the sandbox container.
    #[error("Container run failed for {container}: {message}")]
    RunFailed {
        /// Container name that was being started.
        container: String,
        /// Engine output explaining the failure.
        message: String,
    },

    /// The health endpoint never reported ready within the retry budget.
    #[error("Health check timed out for {url} after {attempts} attempts ({waited_ms} ms)")]
    HealthCheckTimeout {
        /// Base URL that was probed.
        url: String,
        /// Number of probe attempts made.
        attempts: u32,
        /// Approximate time spent waiting between attempts.
        waited_ms: u64,
    },

    /// The container engine is not running or not reachable.
    #[error("Container engine is not available: {message}")]
    DockerUnavailable {
        /// Underlying failure.
        message: String,
    },

    /// Any other container engine operation failed (stop, remove, logs, ...).
    #[error("Container operation failed: {message}")]
    ContainerFailed {
        /// Underlying failure.
        message: String,
    },

    /// A provided source file path would escape the build context.
    #[error("Invalid sandbox file path: {path}")]
    InvalidFile {
        /// The rejected path.
        path: String,
    },

    /// A sandbox for this session is still being created.
    #[error("Sandbox creation already in progress for session {session_id}")]
    CreationInProgress {
        /// Session whose sandbox is mid-creation.
        session_id: String,
    },

    /// The sandbox was destroyed while its creation was still in flight.
    #[error("Sandbox creation aborted for session {session_id}: destroyed during {stage}")]
    Aborted {
        /// Session whose creation was aborted.
        session_id: String,
        /// Lifecycle stage that was in progress.
        stage: &'static str,
    },

    /// Local filesystem failure while assembling a build context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Creates a `PortExhausted` error for the given range.
    pub fn port_exhausted(start: u16, end: u16) -> Self {
        Self::PortExhausted { start, end }
    }

    /// Creates a `BuildFailed` error.
    pub fn build_failed(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BuildFailed {
            image: image.into(),
            message: message.into(),
        }
    }

    /// Creates a `RunFailed` error.
    pub fn run_failed(container: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RunFailed {
            container: container.into(),
            message: message.into(),
        }
    }

    /// Creates a `HealthCheckTimeout` error.
    pub fn health_timeout(url: impl Into<String>, attempts: u32, waited: Duration) -> Self {
        Self::HealthCheckTimeout {
            url: url.into(),
            attempts,
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates an `InvalidFile` error.
    pub fn invalid_file(path: impl Into<String>) -> Self {
        Self::InvalidFile { path: path.into() }
    }

    /// Creates a `CreationInProgress` error.
    pub fn creation_in_progress(session_id: impl Into<String>) -> Self {
        Self::CreationInProgress {
            session_id: session_id.into(),
        }
    }

    /// Creates an `Aborted` error.
    pub fn aborted(session_id: impl Into<String>, stage: &'static str) -> Self {
        Self::Aborted {
            session_id: session_id.into(),
            stage,
        }
    }

    /// Returns true if the port pool is exhausted.
    pub fn is_port_exhausted(&self) -> bool {
        matches!(self, Self::PortExhausted { .. })
    }

    /// Returns true if the image build failed.
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::BuildFailed { .. })
    }

    /// Returns true if the container failed to start.
    pub fn is_run_failure(&self) -> bool {
        matches!(self, Self::RunFailed { .. })
    }

    /// Returns true if the health probe budget was exhausted.
    pub fn is_health_timeout(&self) -> bool {
        matches!(self, Self::HealthCheckTimeout { .. })
    }

    /// Returns true if the container engine could not be reached.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }
}

/// Errors returned by ownership-checked session lookups.
///
/// Each variant is distinct so the HTTP layer can answer 404, 403 and 410
/// respectively.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session is registered under this id.
    #[error("Session not found: {session_id}")]
    NotFound {
        /// Requested session id.
        session_id: String,
    },

    /// The requesting user does not own the session.
    #[error("Access denied to session {session_id}")]
    AccessDenied {
        /// Requested session id.
        session_id: String,
    },

    /// The session existed but its expiry has passed; it has been evicted.
    #[error("Session expired: {session_id}")]
    Expired {
        /// Requested session id.
        session_id: String,
    },
}

impl SessionError {
    /// Creates a `NotFound` error.
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates an `AccessDenied` error.
    pub fn access_denied(session_id: impl Into<String>) -> Self {
        Self::AccessDenied {
            session_id: session_id.into(),
        }
    }

    /// Creates an `Expired` error.
    pub fn expired(session_id: impl Into<String>) -> Self {
        Self::Expired {
            session_id: session_id.into(),
        }
    }

    /// Returns true if the session does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the caller is not the owner.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }

    /// Returns true if the session had expired.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}
