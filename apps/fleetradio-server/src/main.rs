//! fleetradio-server - Standalone headless control-plane node.
//!
//! Wires the `fleetradio-core` library against concrete UDP/TCP/ZMQ
//! transports and runs until a shutdown signal is received.

mod config;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetradio_core::bootstrap::{bootstrap_node, CollabDeps, NodeDeps};
use fleetradio_core::controller::NoopRouteTable;
use tokio::signal;

use crate::config::NodeConfig;
use crate::transport::{
    run_control_listener, NoDspSource, UdpClockProbeTransport, UdpHelloTransport,
    UdpInternalTransport, ZmqCollabTransport,
};

/// Headless node in a cooperating radio fleet's control plane.
#[derive(Parser, Debug)]
#[command(name = "fleetradio-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FLEETRADIO_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// This node's id (overrides config file).
    #[arg(short = 'i', long, env = "FLEETRADIO_SELF_ID")]
    self_id: Option<fleetradio_core::neighborhood::NodeId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("fleetradio-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(self_id) = args.self_id {
        config.self_id = self_id;
    }

    log::info!(
        "node {} starting (gateway_capable={}, peers={})",
        config.self_id,
        config.is_gateway_capable,
        config.peers.len()
    );

    let hello_transport = Arc::new(
        UdpHelloTransport::bind(config.hello_bind_addr, config.hello_broadcast_addr)
            .await
            .context("failed to bind hello socket")?,
    );
    let internal_transport = Arc::new(
        UdpInternalTransport::bind(config.internal_bind_addr, config.peers.clone())
            .await
            .context("failed to bind internal peer socket")?,
    );
    let clock_probe = Arc::new(UdpClockProbeTransport::new(Arc::clone(&internal_transport)));

    let collab = match (&config.collab_register_addr, &config.collab_push_addr) {
        (Some(register_addr), Some(push_addr)) => {
            let transport = ZmqCollabTransport::connect(register_addr, push_addr)
                .context("failed to connect to collaboration bus")?;
            Some(CollabDeps {
                transport: Arc::new(transport),
                spectrum: Arc::new(NoDspSource),
                performance: Arc::new(NoDspSource),
            })
        }
        _ => None,
    };

    let deps = NodeDeps {
        self_id: config.self_id,
        is_gateway_capable: config.is_gateway_capable,
        config: config.tunables.clone(),
        hello_transport: Arc::clone(&hello_transport),
        internal_transport: Arc::clone(&internal_transport),
        clock_probe,
        route_table: Arc::new(NoopRouteTable),
        collab,
        initial_frequency: config.initial_frequency,
        initial_bandwidth: config.initial_bandwidth,
        nchannels: config.nchannels,
        nslots: config.nslots,
        log_dir: config.log_dir.clone(),
    };

    let node = bootstrap_node(deps).context("failed to bootstrap node")?;
    log::info!("node bootstrapped, state = {:?}", node.controller.state());

    let cancel = node.cancel_token.clone();
    node.controller.spawn_active_tasks(&node.spawner);

    tokio::spawn(UdpHelloTransport::run_receive_loop(
        hello_transport.socket(),
        Arc::clone(&node.discovery),
        Arc::clone(&node.time),
        cancel.clone(),
    ));
    tokio::spawn(UdpInternalTransport::run_receive_loop(
        internal_transport.socket(),
        Arc::clone(&node.controller),
        cancel.clone(),
    ));

    let control_addr = config.control_addr;
    let control_controller = Arc::clone(&node.controller);
    let control_spawner = node.spawner.clone();
    let control_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) =
            run_control_listener(control_addr, control_controller, control_spawner, control_cancel)
                .await
        {
            log::error!("remote-control listener failed: {err}");
        }
    });

    log::info!("node {} running", config.self_id);
    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up");

    node.controller.shutdown().await;
    cancel.cancel();

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
