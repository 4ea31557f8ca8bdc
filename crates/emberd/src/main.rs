//! emberd — the Ember daemon.
//!
//! Single binary that assembles the orchestrator:
//! - Resource clients (AWS CLI, or simulated)
//! - Readiness prober
//! - Lifecycle state machine
//! - Inference proxy
//! - REST + SSE API
//!
//! # Usage
//!
//! ```text
//! emberd serve --config /etc/ember/ember.toml --port 8080
//! emberd serve --simulate --executor 127.0.0.1:11434
//! emberd check-config --config ember.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ember_core::EmberConfig;
use ember_orchestrator::Orchestrator;
use ember_resource::ResourceClients;
use ember_resource::memory::Simulation;

const DEFAULT_FILTER: &str = "info,emberd=debug,ember=debug";

#[derive(Parser)]
#[command(name = "emberd", about = "Ember daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and serve the API.
    Serve {
        /// Path to ember.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Override `executor.address` (host:port).
        #[arg(long)]
        executor: Option<String>,

        /// Drive in-memory resources instead of AWS.
        #[arg(long)]
        simulate: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Parse the config and print the effective settings as TOML.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            executor,
            simulate,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(address) = executor {
                config.executor.address = address;
            }
            run_serve(config, port, simulate).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let config = load_config(config.as_deref())?;
            if let Err(e) = config.aws.validate() {
                warn!(error = %e, "aws section incomplete, only --simulate will work");
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EmberConfig> {
    match path {
        Some(path) => {
            let config = EmberConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => {
            info!("no config file given, using defaults");
            Ok(EmberConfig::default())
        }
    }
}

fn build_clients(config: &EmberConfig, simulate: bool) -> anyhow::Result<ResourceClients> {
    if simulate {
        info!("using simulated resource clients");
        return Ok(Simulation::new().clients());
    }
    config.aws.validate().context("aws resource clients")?;
    info!(
        group = %config.aws.autoscaling_group,
        cluster = %config.aws.cluster,
        service = %config.aws.service,
        "using aws resource clients"
    );
    Ok(ember_resource::aws::clients(&config.aws))
}

async fn run_serve(config: EmberConfig, port: u16, simulate: bool) -> anyhow::Result<()> {
    info!("Ember daemon starting");

    anyhow::ensure!(
        !config.executor.address.trim().is_empty(),
        "executor address is empty"
    );

    // ── Assemble ───────────────────────────────────────────────

    let clients = build_clients(&config, simulate)?;
    let orchestrator = Orchestrator::from_config(&config, clients);

    // Pick up whatever an earlier process left running.
    let status = orchestrator.reconcile().await;
    info!(state = %status.state, route_attached = status.route_attached, "boot reconciliation done");

    // ── Start API server ───────────────────────────────────────

    let router = ember_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Ember daemon stopped");
    Ok(())
}
