//! Liveness probing and the health/metrics HTTP surface.
//!
//! A background prober sends one ICMP Echo per configured target each
//! round and records the unix time of every pong. `/readyz` reports 200
//! only while every target answered within the readiness window;
//! `/metrics` dumps the engine status with key material redacted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use tracing::{error, info};

use crate::tun::VirtualTun;

/// Slack added to the probe interval before a target counts as stale,
/// covering probe round-trip time.
const READINESS_SLACK_SECS: u64 = 2;

#[derive(Clone)]
struct HealthState {
    vt: Arc<VirtualTun>,
}

/// Periodically probe every `check_alive` target. Probe failures are only
/// visible through `/readyz`; they never tear anything down.
pub fn start_pinger(vt: Arc<VirtualTun>) {
    let targets = vt.conf().check_alive.clone();
    if targets.is_empty() {
        return;
    }
    let interval = Duration::from_secs(vt.conf().check_alive_interval);

    tokio::spawn(async move {
        loop {
            for target in &targets {
                let vt = vt.clone();
                let target = *target;
                tokio::spawn(async move {
                    match vt.ping(target, interval).await {
                        Ok(()) => vt.record_pong(target).await,
                        Err(e) => error!(target = %target, error = %e, "liveness probe failed"),
                    }
                });
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// Serve `/readyz` and `/metrics` on the given address.
pub async fn serve(bind: SocketAddr, vt: Arc<VirtualTun>) -> Result<()> {
    let app = axum::Router::new()
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(HealthState { vt });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("health endpoint listen on {}", bind))?;
    info!(addr = %bind, "health endpoint listening");
    axum::serve(listener, app).await.context("health server")?;
    Ok(())
}

/// 200 with the pong map while every target answered inside the window,
/// 503 with the same body otherwise.
async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    let record = state.vt.ping_snapshot().await;
    let window = state.vt.conf().check_alive_interval + READINESS_SLACK_SECS;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut status = StatusCode::OK;
    for last_pong in record.values() {
        if now.saturating_sub(*last_pong) > window {
            status = StatusCode::SERVICE_UNAVAILABLE;
            break;
        }
    }

    (status, Json(record))
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    let dump = state.vt.ipc_get().await;
    (StatusCode::OK, redact_keys(&dump))
}

/// Rewrite every `private_key` and `preshared_key` line to carry the value
/// `REDACTED`. Line order is preserved and lines without a `=` pass
/// through verbatim.
pub fn redact_keys(dump: &str) -> String {
    let mut out = String::with_capacity(dump.len());
    for line in dump.lines() {
        match line.split_once('=') {
            Some((key, _)) if key == "private_key" || key == "preshared_key" => {
                out.push_str(key);
                out.push_str("=REDACTED\n");
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}
