use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use http_mirror::config::{self, Config, LoggingConfig};
use http_mirror::metrics::Metrics;
use http_mirror::{logging, web, Emitter, Plugins, StopReason};

#[derive(Parser, Debug)]
#[command(name = "http-mirror")]
#[command(about = "Capture live HTTP traffic and replay it to other destinations", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS", global = true)]
    exit_after: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the pipeline (default)
    Run,
    /// Serve the current directory over HTTP, logging every request
    FileServer {
        /// Listen address, e.g. 127.0.0.1:8000
        addr: String,
    },
}

/// How the process is about to end.
enum Finish {
    Clean,
    Interrupted,
}

const EXIT_INTERRUPTED: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Some(Command::FileServer { ref addr }) => {
            let _guard = logging::init(&LoggingConfig::default(), args.debug);
            file_server(addr).await
        }
        Some(Command::Run) | None => run(&args).await,
    };

    match result {
        Ok(Finish::Clean) => ExitCode::SUCCESS,
        Ok(Finish::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!("{:#}", e);
            // The subscriber may not be installed yet.
            eprintln!("http-mirror: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration"),
    }
}

async fn run(args: &Args) -> anyhow::Result<Finish> {
    let config = load_config(args.config.as_ref()).await?;
    let _guard = logging::init(&config.logging, args.debug);

    info!(
        inputs = config.inputs.len(),
        outputs = config.outputs.len(),
        middleware = config.middleware.is_some(),
        "Starting http-mirror"
    );

    let metrics = Arc::new(Metrics::new());
    let server_shutdown = CancellationToken::new();
    let diagnostics = match &config.diagnostics.address {
        Some(address) => Some(web::serve_diagnostics(
            address,
            metrics.clone(),
            server_shutdown.clone(),
        )?),
        None => None,
    };

    let plugins = Plugins::from_config(&config, metrics.clone())
        .await
        .context("Failed to open inputs and outputs")?;
    let emitter = Arc::new(Emitter::with_metrics(config.emitter.clone(), metrics));
    let mut running = {
        let emitter = emitter.clone();
        tokio::spawn(async move { emitter.start(plugins).await })
    };

    let exit_after = async {
        match args.exit_after {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };

    let finish = tokio::select! {
        result = &mut running => {
            let reason = result.context("Emitter task panicked")??;
            if reason == StopReason::SourcesExhausted {
                info!("Nothing left to read");
            }
            Finish::Clean
        }
        _ = exit_after => {
            info!("Run duration elapsed");
            emitter.close().await;
            running.await.context("Emitter task panicked")??;
            Finish::Clean
        }
        _ = shutdown_signal() => {
            emitter.close().await;
            running.await.context("Emitter task panicked")??;
            Finish::Interrupted
        }
    };

    server_shutdown.cancel();
    if let Some(server) = diagnostics {
        if let Err(e) = server.task.await {
            warn!("Diagnostics endpoint did not stop cleanly: {}", e);
        }
    }

    info!("http-mirror stopped");
    Ok(finish)
}

async fn file_server(addr: &str) -> anyhow::Result<Finish> {
    let root = std::env::current_dir().context("Cannot read current directory")?;
    let shutdown = CancellationToken::new();
    let server = web::serve_files(addr, root, shutdown.clone())?;

    shutdown_signal().await;
    shutdown.cancel();
    server.task.await.context("File server task panicked")?;
    Ok(Finish::Interrupted)
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
