//! CLI command implementations.
//!
//! Each submodule keeps its core logic and formatting pure, with IO only
//! in its `run` entry point.

pub mod clean;
pub mod config;
pub mod deploy;
