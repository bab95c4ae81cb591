//! Deploy a directory of backend sources as a sandbox.
//!
//! Reads the sources, creates the sandbox, registers a session for the
//! requesting user and keeps both alive (with their sweeps running) until
//! Ctrl-C or expiry.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use sandbox_deploy::api::{ContainerInfoV1, SessionInfoV1};
use sandbox_deploy::config::CONFIG_FILE;
use sandbox_deploy::{
    runtime, Config, HealthProber, SandboxContainer, SandboxManager, SandboxSession,
    SessionRegistration, SessionRegistry,
};

/// Directories never shipped into a build context.
const SKIPPED_DIRS: &[&str] = &[".git", "__pycache__", ".venv", "node_modules", "target"];

/// Options for the deploy command
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Source directory
    pub dir: PathBuf,
    /// Session id, generated when `None`
    pub session: Option<String>,
    /// Session owner
    pub user: String,
    /// Requested TTL in minutes
    pub ttl: Option<u32>,
    /// Emit JSON instead of text
    pub json: bool,
    /// Tear down right after the sandbox is healthy
    pub once: bool,
}

/// Read every source file under `dir`, keyed by its `/`-separated path
/// relative to `dir`.
pub fn collect_files(dir: &Path) -> Result<HashMap<String, String>> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }

    let mut files = HashMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory: {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if path.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push(path);
                }
                continue;
            }
            if name == CONFIG_FILE {
                continue;
            }

            let relative = path
                .strip_prefix(dir)
                .context("Source file outside the deploy directory")?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            files.insert(relative, content);
        }
    }

    if files.is_empty() {
        bail!("No source files found in {}", dir.display());
    }
    Ok(files)
}

/// Format the deploy result as a displayable string. `url` is the backend
/// URL as resolved through the session registry.
pub fn format_summary(url: &str, container: &SandboxContainer, session: &SandboxSession) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "\n{} Sandbox is healthy", "✓".green());
    let _ = writeln!(&mut out, "  {:<10} {}", "URL:".bold(), url.cyan());
    let _ = writeln!(&mut out, "  {:<10} {}", "Session:".bold(), session.session_id);
    let _ = writeln!(&mut out, "  {:<10} {}", "Owner:".bold(), session.user_id);
    let _ = writeln!(&mut out, "  {:<10} {}", "Container:".bold(), container.container_name.dimmed());
    let _ = writeln!(
        &mut out,
        "  {:<10} {} ({} health checks)",
        "Expires:".bold(),
        container.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        container.health_checks
    );
    out
}

/// Format the deploy result as JSON
pub fn format_json(container: &SandboxContainer, session: &SandboxSession) -> Result<String> {
    let value = serde_json::json!({
        "container": ContainerInfoV1::from(container),
        "session": SessionInfoV1::from(session),
    });
    serde_json::to_string_pretty(&value).context("Failed to serialize deploy result")
}

/// Entry point: drives the real container engine
pub async fn run(config: Config, options: DeployOptions) -> Result<()> {
    let files = collect_files(&options.dir)?;
    let session_id = options
        .session
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let ttl = options.ttl.unwrap_or(config.ttl.default_minutes);
    let session_sweep = Duration::from_secs(config.sweep.session_interval_secs.max(1));

    let runtime = runtime::from_config(&config.runtime).await?;
    let prober = HealthProber::from_config(&config.health);
    let registry = Arc::new(SessionRegistry::new(config.ttl.max()));
    let manager = Arc::new(SandboxManager::new(config, runtime, prober));

    info!(
        session_id = %session_id,
        files = files.len(),
        dir = %options.dir.display(),
        "Deploying sandbox"
    );
    let container = manager.create_sandbox(&session_id, &files, ttl).await?;

    let session = registry.register(SessionRegistration::new(
        &session_id,
        &options.user,
        &container.base_url,
        &container.container_name,
        container.expires_at,
    ));
    let url = registry.get_backend_url(&session_id, &options.user, true)?;

    if options.json {
        println!("{}", format_json(&container, &session)?);
    } else {
        print!("{}", format_summary(&url, &container, &session));
    }

    if !options.once {
        let container_sweeper = manager.spawn_sweeper();
        let session_sweeper = registry.spawn_sweeper(session_sweep);

        if !options.json {
            println!("\n{} Press Ctrl-C to tear down", "ℹ".blue());
        }
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!(session_id = %session_id, "Interrupted, tearing down");
            }
            () = wait_until_gone(&manager, &session_id) => {
                info!(session_id = %session_id, "Sandbox expired");
            }
        }

        container_sweeper.abort();
        session_sweeper.abort();
    }

    manager.shutdown().await;
    registry.force_unregister(&session_id);
    if !options.json {
        println!("{} Sandbox torn down", "✓".green());
    }
    Ok(())
}

/// Resolves once the container sweep has removed `session_id`.
async fn wait_until_gone(manager: &SandboxManager, session_id: &str) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if manager.get(session_id).is_none() {
            return;
        }
    }
}
