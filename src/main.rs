use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{DecisionEngine, Target};
use turnstile::store::{CounterStore, MemoryStore, RedisStore};

#[derive(Parser)]
#[command(name = "turnstile", version, about = "Distributed fixed-window rate limiting")]
struct Cli {
    /// Configuration file (YAML); TURNSTILE__* variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Count in process memory instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run rate limit decisions for one identity and print them as JSON
    Check {
        #[arg(long)]
        route: String,
        #[arg(long)]
        handler: Option<String>,
        /// Raw client identity, e.g. an IP address
        #[arg(long)]
        identity: String,
        /// Number of requests to issue concurrently
        #[arg(long, default_value_t = 1)]
        hits: usize,
    },
    /// Print the configured policy table as JSON
    Policies,
    /// Print the policy that governs a target as JSON
    Resolve {
        #[arg(long)]
        route: String,
        #[arg(long)]
        handler: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Turnstile");

    let policies = config.policy_table()?;

    match cli.command {
        Command::Policies => {
            println!("{}", serde_json::to_string_pretty(&policies)?);
        }
        Command::Resolve { route, handler } => {
            let target = target(route, handler);
            println!("{}", serde_json::to_string_pretty(&policies.resolve(&target))?);
        }
        Command::Check {
            route,
            handler,
            identity,
            hits,
        } => {
            let store = open_store(&config, cli.memory).await?;
            let engine = DecisionEngine::with_policies(store, policies, config.identity.hasher());
            let target = target(route, handler);

            let decisions = futures::future::join_all(
                (0..hits).map(|_| engine.decide(&target, &identity)),
            )
            .await;

            for decision in decisions {
                println!("{}", serde_json::to_string(&decision?)?);
            }
        }
    }

    Ok(())
}

fn target(route: String, handler: Option<String>) -> Target {
    let target = Target::route(route);
    match handler {
        Some(handler) => target.with_handler(handler),
        None => target,
    }
}

async fn open_store(config: &TurnstileConfig, memory: bool) -> anyhow::Result<Arc<dyn CounterStore>> {
    if memory {
        info!("Using in-process counter store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = RedisStore::connect_with_timeout(&config.store.url, config.store.command_timeout()).await?;
    Ok(Arc::new(store))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()));

    // Logs go to stderr so stdout stays machine-readable.
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
