// src/core/ha/mod.rs

//! Per-node high-availability supervisor: elects a single leader among
//! database replicas via an external coordination store, reconfigures
//! followers, and drives failover. Entered via `pgwarden --ha <path>`.

pub mod api;
pub mod config;
pub mod coordination;
pub mod database;
pub mod decision;
pub mod error;
pub mod supervisor;

use self::config::HaConfig;
use self::coordination::EtcdClient;
use self::database::{NoopRoleChangeHook, PostgresAdapter};
use self::supervisor::Supervisor;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Builds the connection URL advertised to peers for this node, falling
/// back to the listen address when no separate connect address is given.
fn build_connection_url(host: &str, username: &str, password: &str) -> String {
    format!("postgresql://{username}:{password}@{host}/postgres")
}

/// Entry point for `--ha <path>`: loads configuration, wires CC/DA/SL
/// together, and runs until a shutdown signal is received.
pub async fn run(config_path: &str) -> Result<()> {
    let config = HaConfig::from_file(config_path)
        .await
        .with_context(|| format!("failed to load HA configuration from {config_path}"))?;

    info!(
        "starting HA supervisor for node '{}' (scope '{}')",
        config.postgresql.name, config.etcd.scope
    );

    let cc = Arc::new(EtcdClient::new(&config.etcd)?);
    let da = Arc::new(PostgresAdapter::new(
        config.postgresql.clone(),
        Box::new(NoopRoleChangeHook),
    ));

    let connect_host = config
        .postgresql
        .connect_address
        .clone()
        .unwrap_or_else(|| config.postgresql.listen.clone());
    let conn_url = build_connection_url(
        &connect_host,
        &config.postgresql.replication.username,
        &config.postgresql.replication.password,
    );

    let supervisor = Supervisor::new(
        config.postgresql.name.clone(),
        conn_url,
        config.loop_wait,
        config.member_ttl(),
        config.postgresql.maximum_lag_on_failover,
        cc,
        da,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let api_shutdown = shutdown_rx.clone();
    let api_supervisor = supervisor.clone();
    let listen = config.restapi.listen.clone();
    let api_handle = tokio::spawn(async move {
        api::run_api(&listen, api_supervisor, api_shutdown).await;
    });

    let run_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            supervisor.run(shutdown_rx).await;
        }
    });

    shutdown_signal().await;
    info!("HA supervisor received shutdown signal, stopping");
    let _ = shutdown_tx.send(true);

    let _ = run_handle.await;
    let _ = api_handle.await;
    Ok(())
}

/// Waits for SIGTERM/Ctrl-C, matching the signal handling in `main.rs`'s
/// other process modes.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
