//! ensembled — Ensemble device daemon.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use ensemble_core::config::{AccessMode, EnsembleConfig};
use ensemble_core::crypto::CodeKey;

use ensemble_services::broadcast::{BroadcastChannel, DatagramSink};
use ensemble_services::loader::{new_store, ActionRegistry, ExecutionContext, LoggingOutput};
use ensemble_services::{
    alive_loop, control_loop, netif, ClockSynchronizer, CodeServer, ControlDispatcher,
    DeviceState, SecureCodeLoader,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = EnsembleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = EnsembleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        EnsembleConfig::default()
    });

    let interface = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.network.interface.clone());
    let selection = netif::resolve(&interface);
    tracing::info!(interface = selection.name(), addr = ?selection.addr(), "ensembled starting");

    let group: Ipv4Addr = config
        .network
        .multicast_addr
        .parse()
        .with_context(|| format!("invalid multicast address {}", config.network.multicast_addr))?;

    // ── Channels ─────────────────────────────────────────────────────────────
    let broadcast_channel = BroadcastChannel::join(group, config.network.broadcast_port, selection.addr())
        .context("failed to join broadcast group")?;
    let status_channel = BroadcastChannel::join(group, config.network.status_port, selection.addr())
        .context("failed to join status group")?;
    let sync_channel = BroadcastChannel::join(group, config.network.clock_sync_port, selection.addr())
        .context("failed to join clock sync group")?;

    let clock = ClockSynchronizer::start(&config.clock, sync_channel.clone());

    // ── Device identity ──────────────────────────────────────────────────────
    let hostname = hostname::get()
        .context("failed to read hostname")?
        .to_string_lossy()
        .into_owned();
    let device_name = if config.device.name.is_empty() {
        hostname.clone()
    } else {
        config.device.name.clone()
    };
    let address = selection.addr().map(|a| a.to_string()).unwrap_or_default();
    let device = DeviceState::new(&hostname, &device_name, &address);
    tracing::info!(host = %hostname, device = %device_name, %address, "device identity");

    // ── Execution context and loader ─────────────────────────────────────────
    let ctx = ExecutionContext {
        clock: clock.clone(),
        store: new_store(),
        output: Arc::new(LoggingOutput),
        device: device.clone(),
        status_out: status_channel.clone() as Arc<dyn DatagramSink>,
        broadcast_out: broadcast_channel.clone() as Arc<dyn DatagramSink>,
    };
    let dispatcher = Arc::new(ControlDispatcher::for_context(&ctx));
    let loader = Arc::new(SecureCodeLoader::new(
        CodeKey::from_passphrase(&config.code.encryption_key),
        ActionRegistry::new(),
        ctx,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let code_task = if config.code.access_mode == AccessMode::Closed {
        tracing::info!("code access closed, not listening for code");
        None
    } else {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.network.code_port));
        let server = CodeServer::bind(
            addr,
            loader.clone(),
            config.code.access_mode,
            config.code.max_unit_bytes,
        )
        .await?
        .with_read_timeout(Duration::from_millis(config.code.read_timeout_ms));
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                tracing::error!(error = %e, "code server failed");
            }
        }))
    };

    let control_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.network.control_port))
        .await
        .context("failed to bind control port")?;
    let control_task = tokio::spawn(control_loop(
        control_socket,
        dispatcher,
        shutdown_tx.subscribe(),
    ));

    let alive_task = tokio::spawn(alive_loop(
        device.clone(),
        broadcast_channel.clone(),
        Duration::from_millis(config.device.alive_interval_ms),
        shutdown_tx.subscribe(),
    ));

    let sync_printer = {
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                tracing::info!(
                    state = ?clock.state(),
                    stability = clock.stability(),
                    offset_ms = clock.offset_ms(),
                    "clock snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let code_task = async move {
        match code_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = code_task          => tracing::error!("code server exited: {:?}", r),
        r = control_task       => tracing::error!("control listener exited: {:?}", r),
        r = alive_task         => tracing::error!("alive loop exited: {:?}", r),
        r = sync_printer       => tracing::error!("clock printer exited: {:?}", r),
    }

    clock.shutdown();
    for channel in [&broadcast_channel, &status_channel, &sync_channel] {
        channel.dispose();
    }

    Ok(())
}
