//! Ephemeral sandbox containers.
//!
//! A sandbox is a short-lived container running generated backend code,
//! reachable on a host port handed out by the [`PortAllocator`](crate::ports::PortAllocator).

mod container;
mod context;
mod manager;

pub use container::{SandboxContainer, SandboxStatus};
pub use manager::SandboxManager;
