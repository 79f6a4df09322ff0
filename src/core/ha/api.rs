// src/core/ha/api.rs

//! Read-only admin HTTP interface for the HA supervisor: exposes the
//! current snapshot of a `Supervisor` as JSON over a small axum router.
//! Never touches the supervisor's tick loop or its internal lock for
//! writing, only for a point-in-time clone.

use super::supervisor::Supervisor;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Serialize)]
struct StatusResponse {
    name: String,
    role: Option<&'static str>,
    holds_lease: bool,
    last_action: String,
}

#[derive(Serialize)]
struct LeaderResponse {
    leader: Option<String>,
}

async fn status_handler(supervisor: Supervisor) -> impl IntoResponse {
    let snap = supervisor.snapshot();
    (
        StatusCode::OK,
        axum::Json(StatusResponse {
            name: snap.name,
            role: snap.role,
            holds_lease: snap.holds_lease,
            last_action: snap.last_action,
        }),
    )
}

async fn leader_handler(supervisor: Supervisor) -> impl IntoResponse {
    let snap = supervisor.snapshot();
    let leader = snap.cluster.and_then(|c| c.leader).map(|m| m.name);
    (StatusCode::OK, axum::Json(LeaderResponse { leader }))
}

/// Runs the admin HTTP interface on `listen` until `shutdown` fires.
pub async fn run_api(listen: &str, supervisor: Supervisor, mut shutdown: watch::Receiver<bool>) {
    let addr: SocketAddr = match listen.parse() {
        Ok(a) => a,
        Err(e) => {
            error!("invalid restapi.listen address '{}': {}", listen, e);
            return;
        }
    };

    let status_supervisor = supervisor.clone();
    let leader_supervisor = supervisor.clone();
    let app = Router::new()
        .route(
            "/status",
            get(move || status_handler(status_supervisor.clone())),
        )
        .route(
            "/leader",
            get(move || leader_handler(leader_supervisor.clone())),
        );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind HA admin interface on {}: {}", addr, e);
            return;
        }
    };

    info!("HA admin interface listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .unwrap();
}
