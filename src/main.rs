use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use quotaguard::{Algorithm, Config, QuotaError, RateLimitRequest, RateLimiter, SlidingWindowMode};
use serde_json::json;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "quotaguard",
    version,
    about = "Rate limit decisions over memory, SQLite or Redis"
)]
struct Cli {
    /// Override QUOTA_BACKEND for this invocation
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a request and print the decision; exits 2 when denied
    Decide(RequestArgs),
    /// Print the current status without consuming quota
    Status(RequestArgs),
    /// Clear stored state for an identifier
    Reset(RequestArgs),
    /// Remove expired records
    Purge {
        /// Keep purging on QUOTA_PURGE_INTERVAL_SECS until interrupted
        #[arg(long)]
        every: bool,
    },
}

#[derive(Args)]
struct RequestArgs {
    #[arg(long)]
    identifier: String,

    #[arg(long, default_value = "default")]
    scope: String,

    #[arg(long)]
    limit: u64,

    /// Window length in seconds
    #[arg(long)]
    window: f64,

    /// Defaults to QUOTA_DEFAULT_ALGORITHM
    #[arg(long)]
    algorithm: Option<String>,

    /// Token bucket ceiling; defaults to --limit
    #[arg(long)]
    burst_capacity: Option<u64>,

    /// Sliding window mode: log or counter
    #[arg(long)]
    mode: Option<String>,
}

impl RequestArgs {
    fn into_request(self) -> Result<RateLimitRequest> {
        let window = Duration::try_from_secs_f64(self.window)
            .map_err(|_| QuotaError::config("window must be a non-negative number of seconds"))?;
        let mut request = RateLimitRequest::new(self.identifier, self.scope, self.limit, window);
        if let Some(name) = self.algorithm {
            request = request.algorithm(name.parse::<Algorithm>()?);
        }
        if let Some(burst) = self.burst_capacity {
            request = request.burst_capacity(burst);
        }
        if let Some(mode) = self.mode {
            request = request.sliding_mode(mode.parse::<SlidingWindowMode>()?);
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "quotaguard failed");
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("quotaguard={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let run_id = Uuid::new_v4();
    tracing::debug!(%run_id, backend = %config.backend, "Starting quotaguard");

    let limiter = RateLimiter::from_config(&config)?;

    match cli.command {
        Command::Decide(args) => {
            let request = args.into_request()?;
            let decision = limiter.decide(&request)?;
            println!("{}", serde_json::to_string(&decision)?);
            Ok(if decision.allowed { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Command::Status(args) => {
            let request = args.into_request()?;
            let decision = limiter.peek_status(&request)?;
            println!("{}", serde_json::to_string(&decision)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset(args) => {
            let request = args.into_request()?;
            limiter.reset(&request)?;
            println!("{}", json!({ "reset": true, "identifier": request.identifier }));
            Ok(ExitCode::SUCCESS)
        }
        Command::Purge { every: false } => {
            let removed = purge_once(&limiter).await?;
            println!("{}", json!({ "removed": removed }));
            Ok(ExitCode::SUCCESS)
        }
        Command::Purge { every: true } => {
            purge_loop(limiter, config.purge_interval()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn purge_once(limiter: &RateLimiter) -> Result<u64> {
    let registry = limiter.registry().clone();
    let removed =
        tokio::task::spawn_blocking(move || quotaguard::maintenance::purge_all(&registry))
            .await??;
    Ok(removed)
}

async fn purge_loop(limiter: RateLimiter, period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(QuotaError::config("purge interval must be greater than 0").into());
    }
    tracing::info!(interval_secs = period.as_secs(), "Starting purge loop");

    let mut ticker = tokio::time::interval(period);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A failed pass is logged by maintenance; the next tick retries.
                if let Err(err) = purge_once(&limiter).await {
                    tracing::warn!(error = %err, "Purge pass failed");
                }
            }
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("Purge loop stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down");
        },
    }
}
