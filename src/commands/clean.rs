//! Remove sandbox containers left behind by earlier runs.
//!
//! Core logic lives in [`SandboxManager::cleanup_orphaned`]; formatting is
//! pure. IO happens only at the top level.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use sandbox_deploy::{runtime, Config, HealthProber, SandboxManager};

/// Format the clean results as a displayable string
pub fn format_results(removed: &[String]) -> String {
    let mut out = String::new();
    if removed.is_empty() {
        let _ = writeln!(&mut out, "\n{} No orphaned sandboxes found.", "ℹ".blue());
    } else {
        let _ = writeln!(&mut out, "\n{} Removed orphaned sandboxes:", "✓".green());
        for name in removed {
            let _ = writeln!(&mut out, "  {} {}", "✗".red(), name.dimmed());
        }
    }
    out
}

/// Entry point: sweeps the real container engine
pub async fn run(config: Config) -> Result<()> {
    let runtime = runtime::from_config(&config.runtime).await?;
    let prober = HealthProber::from_config(&config.health);
    let manager = SandboxManager::new(config, runtime, prober);

    let removed = manager.cleanup_orphaned().await?;
    print!("{}", format_results(&removed));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_results_empty() {
        colored::control::set_override(false);
        let output = format_results(&[]);
        assert!(output.contains("No orphaned sandboxes found"));
    }

    #[test]
    fn test_format_results_lists_names() {
        colored::control::set_override(false);
        let removed = vec![
            "sandbox-a-18bcfe56800".to_string(),
            "sandbox-b-18bcfe56801".to_string(),
        ];
        let output = format_results(&removed);
        assert!(output.contains("Removed orphaned sandboxes"));
        assert!(output.contains("sandbox-a-18bcfe56800"));
        assert!(output.contains("sandbox-b-18bcfe56801"));
    }
}
