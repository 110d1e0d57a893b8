use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dock_schedule_store::access::Secret;
use dock_schedule_store::bootstrap;
use dock_schedule_store::config::{AppConfig, CliConfig, FileConfig};
use dock_schedule_store::{ExpiryReaper, SqliteDataStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(name = "dock-store", about = "Bootstraps and maintains the dock scheduler store")]
struct CliArgs {
    /// Path to the SQLite store file.
    #[clap(long, env = "DOCK_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Upper bound in milliseconds on waiting for the store.
    #[clap(long, env = "DOCK_STORE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Application scope (database) holding jobs and crons.
    #[clap(long, env = "DOCK_DB")]
    pub scope: Option<String>,

    #[clap(long, env = "DOCK_ADMIN_USER")]
    pub admin_user: Option<String>,

    #[clap(long, env = "DOCK_ADMIN_PASS", hide_env_values = true)]
    pub admin_pass: Option<String>,

    /// Defaults to the admin user.
    #[clap(long, env = "DOCK_APP_USER")]
    pub app_user: Option<String>,

    /// Defaults to the admin secret.
    #[clap(long, env = "DOCK_APP_PASS", hide_env_values = true)]
    pub app_pass: Option<String>,

    /// Fail instead of skipping when a principal already exists.
    #[clap(long)]
    pub strict_principals: bool,

    /// Seconds between expiry sweeps.
    #[clap(long)]
    pub reap_interval_secs: Option<u64>,

    /// Path to a TOML config file. Values in it override the command line.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create principals, containers and indexes. Safe to run repeatedly.
    Bootstrap,
    /// Remove expired jobs, periodically until Ctrl-C.
    Reap {
        /// Run a single sweep and exit.
        #[clap(long)]
        once: bool,
    },
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            store_path: self.store_path.clone(),
            timeout_ms: self.timeout_ms,
            scope: self.scope.clone(),
            admin_user: self.admin_user.clone(),
            admin_pass: self.admin_pass.clone().map(Secret::from),
            app_user: self.app_user.clone(),
            app_pass: self.app_pass.clone().map(Secret::from),
            strict_principals: self.strict_principals,
            reap_interval_secs: self.reap_interval_secs,
        }
    }
}

async fn run(cli_args: CliArgs) -> Result<()> {
    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    let store = Arc::new(
        SqliteDataStore::open(&config.store_path, config.store_options())
            .with_context(|| format!("Failed to open store at {:?}", config.store_path))?,
    );

    match cli_args.command {
        Command::Bootstrap => {
            let plan = config.bootstrap_plan()?;
            let report = tokio::task::spawn_blocking(move || {
                bootstrap::run(store, &plan).map(|report| report.summary(&plan))
            })
            .await??;
            println!("{}", report);
        }
        Command::Reap { once: true } => {
            let reaper = ExpiryReaper::new(store, config.reap_interval);
            let removed = tokio::task::spawn_blocking(move || reaper.reap_once()).await??;
            println!("reaped {} expired documents", removed);
        }
        Command::Reap { once: false } => {
            let shutdown = CancellationToken::new();
            let reaper = ExpiryReaper::new(store, config.reap_interval);
            info!(
                "Expired documents disappear within {:?} of their expiry time",
                reaper.latency_bound()
            );
            let handle = reaper.spawn(shutdown.clone());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down expiry reaper...");
            shutdown.cancel();
            handle.await?;
        }
    }
    Ok(())
}

/// Collapses a clap usage error to the first line of its message.
fn usage_error_line(e: &clap::Error) -> String {
    let rendered = e.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.trim_start_matches("error: ").to_string()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = match CliArgs::try_parse() {
        Ok(cli_args) => cli_args,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            eprintln!("error: {}", usage_error_line(&e));
            return ExitCode::FAILURE;
        }
    };

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    match run(cli_args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let line = format!("{:#}", e).replace('\n', " ");
            eprintln!("error: {}", line);
            ExitCode::FAILURE
        }
    }
}
