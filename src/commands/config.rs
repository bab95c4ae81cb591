//! Show the effective configuration.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use sandbox_deploy::Config;

/// Render the config source and its TOML form.
pub fn format_config(config: &Config, source: Option<&Path>) -> Result<String> {
    let body = toml::to_string_pretty(config).context("Failed to serialize config")?;

    let mut out = String::new();
    let source = match source {
        Some(path) => path.display().to_string(),
        None => "built-in defaults".to_string(),
    };
    let _ = writeln!(&mut out, "{} {}", "# Source:".dimmed(), source.dimmed());
    out.push_str(&body);
    Ok(out)
}

/// Entry point: prints to stdout
pub fn run(config: &Config, source: Option<&Path>) -> Result<()> {
    print!("{}", format_config(config, source)?);
    Ok(())
}
