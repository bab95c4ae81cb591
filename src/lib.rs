//! Ephemeral sandbox deployments.
//!
//! Turns a set of generated backend source files into a short-lived,
//! network-reachable container, and routes later requests to it only on
//! behalf of the user who created it.
//!
//! - [`SandboxManager`] builds, starts, health-checks and tears down
//!   containers, and sweeps expired ones.
//! - [`SessionRegistry`] maps `(session, user)` to the live backend URL with
//!   an ownership check on every call, and sweeps its own expired entries.
//!
//! The two are not transactionally linked; each expires on its own clock.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod ports;
pub mod runtime;
pub mod sandbox;
pub mod session;

pub use config::Config;
pub use error::{SandboxError, SessionError};
pub use health::{HealthProbe, HealthProber, HttpHealthProbe, ProbeOutcome, Readiness};
pub use ports::PortAllocator;
pub use runtime::ContainerRuntime;
pub use sandbox::{SandboxContainer, SandboxManager, SandboxStatus};
pub use session::{SandboxSession, SessionRegistration, SessionRegistry};
