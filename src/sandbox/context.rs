//! Build-context assembly and sandbox naming.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

use crate::config::BuildConfig;
use crate::error::SandboxError;

const DOCKERIGNORE: &str = "__pycache__\n*.pyc\n.git\n.env\n";

/// Longest session slug embedded in engine names.
const MAX_SLUG_LEN: usize = 24;

/// Characters of the record id appended to the name stamp.
const UNIQUE_LEN: usize = 6;

/// Placeholder in `start_command` replaced by the internal port.
pub(crate) const PORT_PLACEHOLDER: &str = "{port}";

/// A build context on disk. The directory is deleted on drop.
#[derive(Debug)]
pub(crate) struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    /// Directory holding the context.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Reject paths that would land outside the context or clobber the
/// scaffold Dockerfile.
pub(crate) fn validate_files(
    files: &HashMap<String, String>,
    dockerfile: &str,
) -> Result<(), SandboxError> {
    for path in files.keys() {
        let parsed = Path::new(path);
        let normal_only = parsed
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || !normal_only || parsed.is_absolute() {
            return Err(SandboxError::invalid_file(path));
        }
        if normalize(parsed) == Path::new(dockerfile) {
            return Err(SandboxError::invalid_file(path));
        }
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Render the scaffold Dockerfile. `{port}` in the start command becomes
/// `internal_port`.
pub(crate) fn render_dockerfile(build: &BuildConfig, internal_port: u16) -> String {
    let port = internal_port.to_string();
    let start_command: Vec<String> = build
        .start_command
        .iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
        .collect();
    let command = serde_json::to_string(&start_command).unwrap_or_else(|_| "[]".to_string());
    format!(
        "FROM {base}\n\
         WORKDIR /app\n\
         COPY . /app\n\
         RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\n\
         ENV PORT={port}\n\
         EXPOSE {port}\n\
         CMD {command}\n",
        base = build.base_image,
        port = internal_port,
    )
}

/// Write the scaffold plus `files` into a fresh temporary directory.
///
/// Blocking; call from a blocking-capable context.
pub(crate) fn assemble(
    files: &HashMap<String, String>,
    build: &BuildConfig,
    internal_port: u16,
) -> Result<BuildContext, SandboxError> {
    validate_files(files, &build.dockerfile)?;

    let dir = tempfile::Builder::new().prefix("sandbox-ctx-").tempdir()?;

    fs::write(dir.path().join(".dockerignore"), DOCKERIGNORE)?;
    for (path, content) in files {
        let target = dir.path().join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
    }
    fs::write(
        dir.path().join(&build.dockerfile),
        render_dockerfile(build, internal_port),
    )?;

    Ok(BuildContext { dir })
}

/// Lowercase a session id into something engines accept in names.
pub(crate) fn session_slug(session_id: &str) -> String {
    let slug: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug.to_string()
    }
}

/// Derive `(container_name, image_name)` from the session, a timestamp and
/// the record id. Only the first alphanumeric characters of `unique` are used.
pub(crate) fn sandbox_names(
    prefix: &str,
    session_id: &str,
    at: DateTime<Utc>,
    unique: &str,
) -> (String, String) {
    let slug = session_slug(session_id);
    let suffix: String = unique
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(UNIQUE_LEN)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let stamp = format!("{:x}{suffix}", at.timestamp_millis());
    (
        format!("{prefix}-{slug}-{stamp}"),
        format!("{prefix}-{slug}:{stamp}"),
    )
}

/// Recover the image tag from a container name built by [`sandbox_names`].
pub(crate) fn image_for_container(container_name: &str) -> Option<String> {
    container_name
        .rsplit_once('-')
        .map(|(repo, stamp)| format!("{repo}:{stamp}"))
}
