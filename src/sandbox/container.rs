//! Sandbox container records and their lifecycle state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sandbox container.
///
/// ```text
/// PENDING -> BUILDING -> STARTING -> RUNNING -> HEALTHY | UNHEALTHY -> STOPPING -> STOPPED
///               |           |                              |
///               +-----------+------------> FAILED <--------+
/// any non-terminal state -> EXPIRED (sweep)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Record created, nothing issued to the engine yet.
    Pending,
    /// Image build in progress.
    Building,
    /// Container start in progress.
    Starting,
    /// Container started, health probing in progress.
    Running,
    /// Health endpoint reported ready.
    Healthy,
    /// Health probing exhausted its budget.
    Unhealthy,
    /// Teardown in progress.
    Stopping,
    /// Torn down on request.
    Stopped,
    /// Build, start or health check failed.
    Failed,
    /// Torn down by the expiry sweep.
    Expired,
}

impl SandboxStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Expired)
    }

    /// A container that is up and can serve (or is about to serve) traffic.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Healthy)
    }

    /// States a create call is still working through. Whoever removes a
    /// record in one of these leaves its port to that create call.
    pub fn is_creating(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Building | Self::Starting | Self::Running | Self::Unhealthy
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SandboxStatus::{
            Building, Expired, Failed, Healthy, Pending, Running, Starting, Stopped, Stopping,
            Unhealthy,
        };

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Expired) => true,
            (Stopping, Stopped) => true,
            (_, Stopping) => self != Stopping,
            (Pending, Building)
            | (Building, Starting | Failed)
            | (Starting, Running | Failed)
            | (Running, Healthy | Unhealthy)
            | (Unhealthy, Failed) => true,
            _ => false,
        }
    }

    /// Lowercase name used in logs and serialized output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ephemeral deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxContainer {
    /// Opaque record id.
    pub id: String,
    /// Session this sandbox belongs to.
    pub session_id: String,
    /// Engine container name.
    pub container_name: String,
    /// Engine image tag.
    pub image_name: String,
    /// Engine container id, once started.
    pub container_id: Option<String>,
    /// Host port, exclusively owned by this record while it is tracked.
    pub port: u16,
    /// URL the backend is reachable at.
    pub base_url: String,
    /// Current lifecycle state.
    pub status: SandboxStatus,
    /// When creation started.
    pub created_at: DateTime<Utc>,
    /// When the sweep may destroy this sandbox.
    pub expires_at: DateTime<Utc>,
    /// Health probe attempts made so far.
    pub health_checks: u32,
    /// Time of the last health probe attempt.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Why creation failed, if it did.
    pub error_message: Option<String>,
}

impl SandboxContainer {
    /// Move to `next`, refusing illegal transitions.
    ///
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: SandboxStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.session_id,
                from = %self.status,
                to = %next,
                "Refusing illegal sandbox transition"
            );
            return false;
        }
        tracing::debug!(
            session_id = %self.session_id,
            from = %self.status,
            to = %next,
            "Sandbox transition"
        );
        self.status = next;
        true
    }

    /// Whether the expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxStatus::*;

    fn record(status: SandboxStatus) -> SandboxContainer {
        let now = Utc::now();
        SandboxContainer {
            id: "id".to_string(),
            session_id: "s1".to_string(),
            container_name: "sandbox-s1-1".to_string(),
            image_name: "sandbox-s1:1".to_string(),
            container_id: None,
            port: 9000,
            base_url: "http://localhost:9000".to_string(),
            status,
            created_at: now,
            expires_at: now + Duration::minutes(30),
            health_checks: 0,
            last_health_check: None,
            error_message: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [Pending, Building, Starting, Running, Healthy, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_failure_transitions() {
        assert!(Building.can_transition_to(Failed));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Healthy.can_transition_to(Failed));
    }

    #[test]
    fn test_expired_from_any_non_terminal() {
        for status in [Pending, Building, Starting, Running, Healthy, Unhealthy, Stopping] {
            assert!(status.can_transition_to(Expired), "{status} -> expired");
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Stopped, Failed, Expired] {
            assert!(terminal.is_terminal());
            for next in [Pending, Building, Running, Healthy, Stopping, Stopped, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cannot_skip_build() {
        assert!(!Pending.can_transition_to(Running));
        assert!(!Building.can_transition_to(Healthy));
        assert!(!Stopping.can_transition_to(Stopping));
    }

    #[test]
    fn test_transition_refuses_illegal_move() {
        let mut container = record(Pending);
        assert!(!container.transition(Healthy));
        assert_eq!(container.status, Pending);
        assert!(container.transition(Building));
        assert_eq!(container.status, Building);
    }

    #[test]
    fn test_active_states() {
        assert!(Running.is_active());
        assert!(Healthy.is_active());
        assert!(!Building.is_active());
        assert!(!Unhealthy.is_active());
    }

    #[test]
    fn test_creating_states() {
        for status in [Pending, Building, Starting, Running, Unhealthy] {
            assert!(status.is_creating(), "{status}");
        }
        for status in [Healthy, Stopping, Stopped, Failed, Expired] {
            assert!(!status.is_creating(), "{status}");
        }
    }

    #[test]
    fn test_expiry() {
        let container = record(Healthy);
        let now = container.created_at;
        assert!(!container.is_expired_at(now));
        assert!(container.is_expired_at(now + Duration::minutes(31)));
        assert_eq!(container.remaining(now + Duration::hours(1)), Duration::zero());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Healthy).unwrap(), "\"healthy\"");
        assert_eq!(Unhealthy.to_string(), "unhealthy");
    }
}
