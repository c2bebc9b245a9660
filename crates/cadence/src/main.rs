//! Cadence: scheduled post publishing worker
//!
//! Main binary with subcommands:
//! - `serve`: HTTP trigger endpoint for an external cron
//! - `run`: one invocation, response printed as JSON
//! - `daemon`: periodic invocations without an external cron

use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::{InvocationRequest, InvocationResponse};
use cadence_web::{AppState, create_router};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;

use config::WorkerArgs;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Scheduled post publishing worker", long_about = None)]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the authenticated trigger endpoint
    Serve {
        /// Shared secret callers must present
        #[arg(long, env = "CADENCE_CRON_SECRET", hide_env_values = true)]
        cron_secret: String,

        /// HTTP server port
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,
    },

    /// Run one invocation and print the response
    Run {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Run invocations periodically until interrupted
    Daemon {
        /// Seconds between invocations
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Also retry failed posts on every tick
        #[arg(long)]
        retry_failed: bool,
    },
}

#[derive(Debug, clap::Args)]
struct RequestArgs {
    /// Process exactly this post, regardless of its schedule
    #[arg(long)]
    job_id: Option<String>,

    /// Also claim failed posts that are under their attempt budget
    #[arg(long)]
    retry_failed: bool,

    /// Include diagnostics in the response
    #[arg(long)]
    debug: bool,

    /// Rebind the post to another upload first (requires test overrides)
    #[arg(long, requires = "job_id")]
    upload_id: Option<String>,
}

impl From<RequestArgs> for InvocationRequest {
    fn from(args: RequestArgs) -> Self {
        InvocationRequest {
            job_id: args.job_id,
            retry_failed: args.retry_failed,
            debug: args.debug,
            upload_id: args.upload_id,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `run` output stays parseable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { cron_secret, port } => serve(&cli.worker, cron_secret, port).await,
        Commands::Run { request } => run_once(&cli.worker, request.into()).await,
        Commands::Daemon {
            interval,
            retry_failed,
        } => run_daemon(&cli.worker, interval, retry_failed).await,
    }
}

async fn serve(args: &WorkerArgs, cron_secret: String, port: u16) -> Result<()> {
    if cron_secret.trim().is_empty() {
        return Err(miette::miette!("CADENCE_CRON_SECRET must not be empty"));
    }

    let worker = args.build_worker()?;
    let router = create_router(Arc::new(AppState {
        worker,
        cron_secret,
    }));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!("trigger server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    Ok(())
}

async fn run_once(args: &WorkerArgs, request: InvocationRequest) -> Result<()> {
    let worker = args.build_worker()?;
    let (response, outcome) = match worker.run(&request).await {
        Ok(response) => (response, Ok(())),
        Err(e) => (
            InvocationResponse::failure(e.to_string()),
            Err(miette::miette!("invocation failed: {}", e)),
        ),
    };

    let json = serde_json::to_string_pretty(&response).into_diagnostic()?;
    println!("{}", json);
    outcome
}

async fn run_daemon(args: &WorkerArgs, interval: u64, retry_failed: bool) -> Result<()> {
    if interval == 0 {
        return Err(miette::miette!("--interval must be at least 1 second"));
    }

    let worker = args.build_worker()?;
    let request = InvocationRequest {
        retry_failed,
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    daemon::run(
        &worker,
        &request,
        Duration::from_secs(interval),
        shutdown_rx,
    )
    .await;
    Ok(())
}
