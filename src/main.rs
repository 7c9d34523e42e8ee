use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures::stream::{self, StreamExt};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::{Algorithm, LimiterConfig, RateLimiter};

/// Drive a rate limiter with a burst of acquisitions and report the outcome.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// YAML limiter configuration; FLOODGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Limiter name
    #[arg(long)]
    name: Option<String>,

    /// Algorithm: counter, leaky_bucket or token_bucket
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Window unit in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Maximum requests per window unit
    #[arg(long)]
    max_requests: Option<u64>,

    /// Share state through the Redis server at this address
    #[arg(long)]
    redis: Option<String>,

    /// Number of acquisitions to attempt
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Acquisitions in flight at once
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Sleep out denials and retry until admitted
    #[arg(long)]
    wait: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default)]
struct Summary {
    admitted: usize,
    denied: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!(
        name = %config.name,
        algorithm = %config.algorithm,
        window_ms = config.window_ms,
        max_requests = config.max_requests,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::from_config(&config).await?);
    let started = Instant::now();

    let summary = tokio::select! {
        summary = drive(limiter, args.requests, args.concurrency.max(1), args.wait) => summary,
        _ = shutdown_signal() => {
            warn!("Interrupted before all requests were attempted");
            return Ok(());
        }
    };

    info!(
        admitted = summary.admitted,
        denied = summary.denied,
        failed = summary.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Run complete"
    );
    Ok(())
}

/// Layer the config file, the environment and command-line flags.
fn load_config(args: &Args) -> anyhow::Result<LimiterConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = &args.config {
        info!(path = %path.display(), "Loading limiter configuration");
        builder = builder.add_source(
            config::File::from(path.as_path()).format(config::FileFormat::Yaml),
        );
    }

    builder = builder
        .add_source(
            config::Environment::with_prefix("FLOODGATE")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("name", args.name.clone())?
        .set_override_option("algorithm", args.algorithm.map(|a| a.as_str().to_string()))?
        .set_override_option("window_ms", args.window_ms.map(|v| v as i64))?
        .set_override_option("max_requests", args.max_requests.map(|v| v as i64))?;

    if let Some(address) = &args.redis {
        builder = builder
            .set_override("storage.type", "redis")?
            .set_override("storage.address", address.as_str())?;
    }

    let config: LimiterConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

async fn drive(
    limiter: Arc<RateLimiter>,
    requests: usize,
    concurrency: usize,
    wait: bool,
) -> Summary {
    stream::iter(0..requests)
        .map(|_| {
            let limiter = limiter.clone();
            async move {
                loop {
                    let decision = if wait {
                        limiter.wait().await
                    } else {
                        limiter.acquire().await
                    };
                    match decision {
                        Ok(d) if d.allowed || !wait => break Ok(d.allowed),
                        Ok(_) => continue,
                        Err(e) => break Err(e),
                    }
                }
            }
        })
        .buffer_unordered(concurrency)
        .fold(Summary::default(), |mut summary, outcome| async move {
            match outcome {
                Ok(true) => summary.admitted += 1,
                Ok(false) => summary.denied += 1,
                Err(e) => {
                    error!(error = %e, "Acquisition failed");
                    summary.failed += 1;
                }
            }
            summary
        })
        .await
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
