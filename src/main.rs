use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokengate::config::{LoggingConfig, TokengateConfig};
use tokengate::{Limiter, LimiterError};

/// Read keys from stdin, one per line, and print the admission decision
/// for each.
#[derive(Debug, Parser)]
#[command(name = "tokengate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the per-key capacity
    #[arg(long)]
    capacity: Option<u64>,

    /// Override the refill interval in milliseconds
    #[arg(long = "refill-ms")]
    refill_ms: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TokengateConfig::load(args.config.as_deref())?;
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(refill_ms) = args.refill_ms {
        config.limiter.refill_interval_ms = refill_ms;
    }
    config.logging.json |= args.json;

    init_tracing(&config.logging);

    info!("Starting tokengate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = Limiter::from_config(&config.limiter)?;
    info!(
        capacity = limiter.capacity(),
        refill_interval = ?limiter.refill_interval(),
        "Limiter initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut limiter_shutdown = shutdown_rx.clone();
    limiter.start_with_shutdown(async move {
        let _ = limiter_shutdown.changed().await;
    });

    let mut lines = spawn_stdin_reader();
    let mut main_shutdown = shutdown_rx;

    loop {
        tokio::select! {
            _ = main_shutdown.changed() => break,
            line = lines.recv() => {
                let Some(line) = line else {
                    info!("Input closed");
                    break;
                };
                let line = line?;
                let key = line.trim();
                if key.is_empty() {
                    continue;
                }
                println!("{}", decide(&limiter, key));
            }
        }
    }

    limiter.stop().await;

    info!("tokengate stopped");
    Ok(())
}

/// Render the decision for one key as a single output line.
fn decide(limiter: &Limiter, key: &str) -> String {
    match limiter.request_token(key) {
        Ok(token) => format!("ALLOW {} {}", key, token),
        Err(err @ LimiterError::TooManyRequests { .. }) => format!(
            "DENY {} {} (retry in {:?})",
            key,
            err,
            limiter.refill_interval()
        ),
        Err(err) => format!("DENY {} {}", key, err),
    }
}

/// Forward stdin lines from a plain thread so a pending read never holds
/// up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve once the operator asks the CLI to exit.
///
/// A signal whose handler cannot be installed is logged and never fires;
/// closing stdin still ends the session.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Ctrl+C handler unavailable, close stdin to exit");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {
            info!("Interrupted, stopping decay and ignoring further keys");
        }
        _ = terminate => {
            info!("SIGTERM received, stopping decay and ignoring further keys");
        }
    }
}
