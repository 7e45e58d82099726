use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keygate::config::{KeygateConfig, LoggingConfig, StoreBackend, StoreConfig};
use keygate::ratelimit::store::{CounterStore, MemoryStore, RedisStore};
use keygate::ratelimit::{CallContext, CallSiteGuard, RateLimiter, RequestInfo, RouteTable};

#[derive(Parser)]
#[command(
    name = "keygate",
    version,
    about = "Per-key request admission against a shared counter store"
)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit JSON logs regardless of configuration
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the rate limited routes
    Routes,
    /// Evaluate a single call and print the decision
    Check {
        #[command(flatten)]
        call: CallArgs,
    },
    /// Fire concurrent calls at one route and summarise the decisions
    Burst {
        #[command(flatten)]
        call: CallArgs,
        /// Number of calls to make
        #[arg(long, default_value_t = 20)]
        requests: usize,
        /// Calls in flight at once
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
    },
}

#[derive(clap::Args)]
struct CallArgs {
    /// Request method
    #[arg(long, default_value = "GET")]
    method: String,
    /// Request path of a registered route
    #[arg(long)]
    path: String,
    /// Address of the calling peer
    #[arg(long, default_value = "127.0.0.1")]
    peer: String,
    /// X-Forwarded-For header value
    #[arg(long)]
    forwarded_for: Option<String>,
}

impl CallArgs {
    fn context(&self) -> CallContext {
        let mut request = RequestInfo::new(&self.method, &self.path, &self.peer);
        if let Some(header) = &self.forwarded_for {
            request = request.with_forwarded_for(header);
        }
        CallContext::request(format!("{}:{}", self.method, self.path), request)
    }
}

#[derive(Serialize)]
struct BurstReport {
    requests: usize,
    allowed: usize,
    denied: usize,
    degraded: usize,
    errors: usize,
    elapsed_ms: u128,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = KeygateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.json_logs);

    info!("Starting Keygate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let routes = config.route_table()?;
    let registry = config.strategy_registry()?;
    info!(routes = routes.len(), backend = ?config.store.backend, "Configuration loaded");

    let (store, reaper) = open_store(&config.store).await?;
    let limiter = Arc::new(
        RateLimiter::new(store)
            .with_registry(registry)
            .with_failure_policy(config.failure_policy)
            .with_store_timeout(config.store.timeout()),
    );
    info!(failure_policy = ?limiter.failure_policy(), "Rate limiter initialized");

    let result = tokio::select! {
        result = run(cli.command, limiter, &routes) => result,
        _ = shutdown_signal() => Ok(()),
    };

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Keygate stopped");
    result
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json || force_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connect to the configured store. The memory backend also gets a reaper task.
async fn open_store(
    config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn CounterStore>, Option<JoinHandle<()>>)> {
    match config.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            let reaper = memory.clone().spawn_reaper(config.reaper_interval());
            info!("Using in-memory counter store");
            let store: Arc<dyn CounterStore> = memory;
            Ok((store, Some(reaper)))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.url).await?;
            store.ping().await?;
            let store: Arc<dyn CounterStore> = Arc::new(store);
            Ok((store, None))
        }
    }
}

async fn run(
    command: Command,
    limiter: Arc<RateLimiter>,
    routes: &RouteTable,
) -> anyhow::Result<()> {
    match command {
        Command::Routes => {
            for (method, path, config) in routes.routes() {
                println!(
                    "{method:<6} {path:<32} {:<14} {}/{}s key={}",
                    config.algorithm(),
                    config.limit(),
                    config.window_secs(),
                    config.key().unwrap_or("<derived>")
                );
            }
        }
        Command::Check { call } => {
            let guard = CallSiteGuard::for_route(limiter, routes, &call.method, &call.path)?;
            let decision = guard.check(&call.context()).await?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Burst {
            call,
            requests,
            concurrency,
        } => {
            let guard = CallSiteGuard::for_route(limiter, routes, &call.method, &call.path)?;
            let ctx = call.context();
            let started = Instant::now();

            let outcomes: Vec<_> = stream::iter(0..requests)
                .map(|_| {
                    let guard = guard.clone();
                    let ctx = ctx.clone();
                    async move { guard.check(&ctx).await }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

            let mut report = BurstReport {
                requests,
                allowed: 0,
                denied: 0,
                degraded: 0,
                errors: 0,
                elapsed_ms: started.elapsed().as_millis(),
            };
            for outcome in &outcomes {
                match outcome {
                    Ok(decision) if decision.allowed => {
                        report.allowed += 1;
                        if decision.degraded {
                            report.degraded += 1;
                        }
                    }
                    Ok(_) => report.denied += 1,
                    Err(_) => report.errors += 1,
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
