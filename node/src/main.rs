// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # QUASAR Node
//!
//! Entry point for the `quasar-node` binary. Parses CLI arguments, loads
//! the config file, initializes logging and metrics, binds the TCP
//! transport and runs the consensus node until SIGINT/SIGTERM.
//!
//! The binary supports three subcommands:
//!
//! - `run`     start the node
//! - `init`    create the data directory, node key and default config
//! - `version` print build version information

mod cli;
mod logging;
mod metrics;
mod settings;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use quasar_protocol::config::NodeConfig;
use quasar_protocol::consensus::SystemClock;
use quasar_protocol::crypto::NodeKeypair;
use quasar_protocol::network::Transport;
use quasar_protocol::ConsensusNode;
use tokio::signal;
use tokio::sync::watch;

use cli::{Commands, QuasarNodeCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::NodeMetrics;
use tcp::TcpTransport;

/// How long background tasks get to wind down after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = QuasarNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: transport, consensus tasks and the metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, args.log_format.into());

    let settings = settings::resolve(&args)?;
    let keypair = settings::load_keypair(&args)?;
    let config = settings.config;

    tracing::info!(
        listen = %config.network.listen_addr,
        bootstrap = config.network.bootstrap_peers.len(),
        metrics_port = settings.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting quasar-node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Transport ---
    let (transport, inbound) = TcpTransport::bind(
        &config.network.listen_addr,
        settings.advertise.clone(),
        config.network.max_message_size,
        Duration::from_millis(config.network.send_timeout_ms),
        shutdown_rx.clone(),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    if let Ok(addr) = transport.local_addr().parse::<SocketAddr>() {
        if addr.ip().is_unspecified() {
            tracing::warn!(
                %addr,
                "advertising an unspecified address; peers cannot dial it, pass --advertise"
            );
        }
    }

    // --- Consensus node ---
    let node = Arc::new(
        ConsensusNode::new(config, keypair, Arc::new(transport), Arc::new(SystemClock))
            .context("failed to create consensus node")?,
    );
    tracing::info!(node = %node.node_id(), address = %node.address(), "node identity");

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let metrics_addr = format!("0.0.0.0:{}", settings.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    let metrics_server = {
        let router = metrics::router(Arc::clone(&node_metrics));
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let graceful = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = axum::serve(metrics_listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                tracing::error!(error = %e, "metrics server error");
            }
        })
    };
    let metrics_task = tokio::spawn(metrics::track(
        Arc::clone(&node),
        Arc::clone(&node_metrics),
        shutdown_rx.clone(),
    ));

    // --- Consensus tasks ---
    let node_task = tokio::spawn(Arc::clone(&node).run(inbound, shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping tasks");
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = node_task.await;
        let _ = metrics_task.await;
        let _ = metrics_server.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(grace = ?SHUTDOWN_GRACE, "tasks did not stop in time");
    }

    tracing::info!(
        height = node.chain().height(),
        poh_entries = node.poh().len(),
        "quasar-node stopped"
    );
    Ok(())
}

/// Initializes a data directory: node key plus a default `config.toml`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("quasar_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = settings::key_path(data_dir);
    if key_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }
    let keypair = NodeKeypair::generate();
    settings::write_keypair(&key_path, &keypair)?;

    let config_path = data_dir.join(settings::CONFIG_FILE_NAME);
    if !config_path.exists() {
        let config = NodeConfig {
            node_id: args.node_id.clone(),
            ..NodeConfig::default()
        };
        std::fs::write(&config_path, settings::render(&config)?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    let public_key = keypair.public_key();
    tracing::info!(
        public_key = %public_key,
        key_path = %key_path.display(),
        "node keypair generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Public key     : {}", public_key.to_base58());
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("quasar-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", quasar_protocol::config::PROTOCOL_VERSION);
    println!("wire        v{}", quasar_protocol::config::WIRE_PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
