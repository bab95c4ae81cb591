//! Versioned wire representations for callers outside the process.
//!
//! Internal code passes [`SandboxContainer`] and [`SandboxSession`] around;
//! these types exist only at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sandbox::{SandboxContainer, SandboxStatus};
use crate::session::SandboxSession;

/// Version stamped on every payload.
pub const API_VERSION: u32 = 1;

/// Public view of a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfoV1 {
    /// Always [`API_VERSION`].
    pub api_version: u32,
    /// Record id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Engine container name.
    pub container_name: String,
    /// Host port.
    pub port: u16,
    /// Reachable URL.
    pub base_url: String,
    /// Lifecycle state.
    pub status: SandboxStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Health probe attempts made.
    pub health_checks: u32,
    /// Failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&SandboxContainer> for ContainerInfoV1 {
    fn from(container: &SandboxContainer) -> Self {
        Self {
            api_version: API_VERSION,
            id: container.id.clone(),
            session_id: container.session_id.clone(),
            container_name: container.container_name.clone(),
            port: container.port,
            base_url: container.base_url.clone(),
            status: container.status,
            created_at: container.created_at,
            expires_at: container.expires_at,
            health_checks: container.health_checks,
            error_message: container.error_message.clone(),
        }
    }
}

/// Public view of a session. The owner is deliberately not exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfoV1 {
    /// Always [`API_VERSION`].
    pub api_version: u32,
    /// Session id.
    pub session_id: String,
    /// Routed URL.
    pub backend_url: String,
    /// Project name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Caller metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Whether the entry had expired when this view was taken.
    pub is_expired: bool,
}

impl From<&SandboxSession> for SessionInfoV1 {
    fn from(session: &SandboxSession) -> Self {
        Self {
            api_version: API_VERSION,
            session_id: session.session_id.clone(),
            backend_url: session.backend_url.clone(),
            project_name: session.project_name.clone(),
            metadata: session.metadata.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            is_expired: session.is_expired(),
        }
    }
}
