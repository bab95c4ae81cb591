use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandbox_deploy::Config;

mod commands;

#[derive(Parser)]
#[command(name = "sandbox-deploy")]
#[command(
    author,
    version,
    about = "Build, run and health-check short-lived backend sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write JSON logs to a daily-rotated file in this directory
    #[arg(long, global = true, env = "SANDBOX_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to ./sandbox.toml, then the user config dir)
    #[arg(short, long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a directory of backend sources as a sandbox
    Deploy {
        /// Directory holding the backend sources
        dir: PathBuf,

        /// Session id (generated if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Owner of the session
        #[arg(short, long, env = "USER", default_value = "local")]
        user: String,

        /// Time to live in minutes (clamped to the configured window)
        #[arg(short, long)]
        ttl: Option<u32>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Tear the sandbox down as soon as it is healthy
        #[arg(long)]
        once: bool,
    },

    /// Remove sandbox containers left behind by earlier runs
    Clean,

    /// Show the effective configuration
    Config,
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("sandbox_deploy=debug,security=warn")
        } else {
            EnvFilter::new("sandbox_deploy=info,security=warn")
        }
    });

    let stderr_layer = if cli.json_logs {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sandbox-deploy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<(Config, Option<PathBuf>)> {
    match &cli.config {
        Some(path) => Ok((Config::load_file(path)?, Some(path.clone()))),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Ok((Config::load(&cwd)?, Config::resolve_path(&cwd)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;
    let (config, config_path) = load_config(&cli)?;

    match cli.command {
        Commands::Deploy {
            dir,
            session,
            user,
            ttl,
            json,
            once,
        } => {
            let options = commands::deploy::DeployOptions {
                dir,
                session,
                user,
                ttl,
                json,
                once,
            };
            commands::deploy::run(config, options).await?;
        }
        Commands::Clean => {
            commands::clean::run(config).await?;
        }
        Commands::Config => {
            commands::config::run(&config, config_path.as_deref())?;
        }
    }

    Ok(())
}
