//! Ownership-checked routing from sessions to live sandbox URLs.
//!
//! Every read or write that names a user compares it against the stored
//! owner before anything else happens. Mismatches are logged on the
//! `security` target.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// One routing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSession {
    /// Session identifier.
    pub session_id: String,
    /// Owner; fixed at registration.
    pub user_id: String,
    /// URL requests for this session are routed to.
    pub backend_url: String,
    /// Container serving `backend_url`.
    pub container_name: String,
    /// Optional human-readable project name.
    pub project_name: Option<String>,
    /// Free-form caller data.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// When the entry stops resolving.
    pub expires_at: DateTime<Utc>,
}

impl SandboxSession {
    /// Whether the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Input to [`SessionRegistry::register`].
#[derive(Debug, Clone)]
pub struct SessionRegistration {
    /// Session identifier.
    pub session_id: String,
    /// Owner.
    pub user_id: String,
    /// URL to route to.
    pub backend_url: String,
    /// Container serving the URL.
    pub container_name: String,
    /// Expiry of the entry.
    pub expires_at: DateTime<Utc>,
    /// Optional project name.
    pub project_name: Option<String>,
    /// Free-form caller data.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SessionRegistration {
    /// Registration with no project name or metadata.
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        backend_url: impl Into<String>,
        container_name: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            backend_url: backend_url.into(),
            container_name: container_name.into(),
            expires_at,
            project_name: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the project name.
    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, SandboxSession>,
    by_user: HashMap<String, HashSet<String>>,
}

impl Sessions {
    fn insert(&mut self, session: SandboxSession) -> Option<SandboxSession> {
        let previous = self.remove(&session.session_id);
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.session_id.clone());
        self.by_id.insert(session.session_id.clone(), session);
        previous
    }

    fn remove(&mut self, session_id: &str) -> Option<SandboxSession> {
        let session = self.by_id.remove(session_id)?;
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }

    /// Look up `session_id` on behalf of `user_id`, enforcing ownership.
    fn owned(&self, session_id: &str, user_id: &str) -> Result<&SandboxSession, SessionError> {
        let session = self
            .by_id
            .get(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;

        if session.user_id != user_id {
            warn!(
                target: "security",
                session_id,
                requested_by = user_id,
                owner = %session.user_id,
                "Session access denied: user does not own session"
            );
            return Err(SessionError::access_denied(session_id));
        }
        Ok(session)
    }
}

/// In-memory, single-process session registry.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Sessions>,
    max_ttl: Duration,
}

impl SessionRegistry {
    /// Create an empty registry; `extend_expiry` never goes past
    /// `now + max_ttl`.
    pub fn new(max_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Sessions::default()),
            max_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or fully replace the entry for `registration.session_id`.
    pub fn register(&self, registration: SessionRegistration) -> SandboxSession {
        let session = SandboxSession {
            session_id: registration.session_id,
            user_id: registration.user_id,
            backend_url: registration.backend_url,
            container_name: registration.container_name,
            project_name: registration.project_name,
            metadata: registration.metadata,
            created_at: Utc::now(),
            expires_at: registration.expires_at,
        };

        let previous = self.lock().insert(session.clone());
        if let Some(previous) = previous {
            if previous.user_id != session.user_id {
                warn!(
                    target: "security",
                    session_id = %session.session_id,
                    previous_owner = %previous.user_id,
                    owner = %session.user_id,
                    "Session re-registered under a different owner"
                );
            }
        }
        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            backend_url = %session.backend_url,
            "Registered session"
        );
        session
    }

    /// Resolve the backend URL for `session_id` on behalf of `user_id`.
    ///
    /// With `check_expiry`, an expired entry is removed and reported as
    /// [`SessionError::Expired`].
    pub fn get_backend_url(
        &self,
        session_id: &str,
        user_id: &str,
        check_expiry: bool,
    ) -> Result<String, SessionError> {
        let mut sessions = self.lock();
        let session = sessions.owned(session_id, user_id)?;
        if check_expiry && session.is_expired() {
            sessions.remove(session_id);
            debug!(session_id, "Evicted expired session on lookup");
            return Err(SessionError::expired(session_id));
        }
        Ok(session.backend_url.clone())
    }

    /// Full entry for `session_id` on behalf of `user_id`. Expired entries
    /// are evicted.
    pub fn get_session(&self, session_id: &str, user_id: &str) -> Result<SandboxSession, SessionError> {
        let mut sessions = self.lock();
        let session = sessions.owned(session_id, user_id)?;
        if session.is_expired() {
            sessions.remove(session_id);
            return Err(SessionError::expired(session_id));
        }
        Ok(session.clone())
    }

    /// Remove `session_id` on behalf of its owner.
    ///
    /// Unknown sessions are `Ok(false)`; another user's session is an error.
    pub fn unregister(&self, session_id: &str, user_id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.lock();
        match sessions.owned(session_id, user_id) {
            Ok(_) => {}
            Err(SessionError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        sessions.remove(session_id);
        info!(session_id, user_id, "Unregistered session");
        Ok(true)
    }

    /// Push the expiry out by `additional_minutes`, capped at
    /// `now + max_ttl` and never shortened. Returns the new expiry.
    pub fn extend_expiry(
        &self,
        session_id: &str,
        user_id: &str,
        additional_minutes: u32,
    ) -> Result<DateTime<Utc>, SessionError> {
        let mut sessions = self.lock();
        let session = sessions.owned(session_id, user_id)?;
        let now = Utc::now();
        if session.is_expired_at(now) {
            sessions.remove(session_id);
            return Err(SessionError::expired(session_id));
        }

        let current = session.expires_at;
        let wanted = current + Duration::minutes(i64::from(additional_minutes));
        let expires_at = current.max(wanted.min(now + self.max_ttl));

        if let Some(session) = sessions.by_id.get_mut(session_id) {
            session.expires_at = expires_at;
        }
        debug!(session_id, %expires_at, "Extended session expiry");
        Ok(expires_at)
    }

    /// Live sessions owned by `user_id`. Expired ones are evicted on the way.
    pub fn get_user_sessions(&self, user_id: &str) -> Vec<SandboxSession> {
        let mut sessions = self.lock();
        let now = Utc::now();
        let ids: Vec<String> = sessions
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut live = Vec::new();
        for id in ids {
            match sessions.by_id.get(&id) {
                Some(session) if session.is_expired_at(now) => {
                    sessions.remove(&id);
                }
                Some(session) => live.push(session.clone()),
                None => {}
            }
        }
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        live
    }

    /// Remove `session_id` without an ownership check.
    ///
    /// For cleanup paths only; never reachable from an end-user request.
    pub fn force_unregister(&self, session_id: &str) -> bool {
        let removed = self.lock().remove(session_id).is_some();
        if removed {
            info!(session_id, "Force-unregistered session");
        }
        removed
    }

    /// Remove every expired entry.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Remove every entry expired at `now`.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .by_id
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `period` until the
    /// handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let swept = registry.sweep_expired();
                if swept > 0 {
                    info!(swept, "Session sweep removed expired entries");
                }
            }
        })
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
