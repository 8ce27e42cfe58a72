//! Binds one TCP listener and serves REST, the two WebSocket bridges, and
//! the streaming-RPC surface behind a single hand-rolled h2c auto-protocol
//! server (spec.md §6.1) so WebSocket upgrades still work behind proxies
//! that only forward HTTP/2.
//!
//! Grounded on the teacher's `ipc::mod::run` (bind + accept-loop + signal
//! select, draining in-flight work before returning) — the accept loop
//! itself is new because this crate serves HTTP/axum rather than a raw
//! WebSocket protocol, so it reaches for `hyper-util`'s auto builder
//! instead of `tokio-tungstenite`.

use anyhow::{Context as _, Result};
use axum::extract::ConnectInfo;
use axum::routing::get;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::{rest, rpc, ws, AppContext};

/// How long in-flight connections are given to finish after a shutdown
/// signal before the server hard-closes them (spec.md §4.9).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds the full router: REST (`rest::build_router`) plus the two WS
/// bridges and the streaming-RPC endpoint at the configured `rpcPath`.
fn build_app(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ws/pty", get(ws::pty::pty_bridge))
        .route("/api/mission/events", get(ws::mission::mission_events))
        .route(&ctx.config.rpc_path, get(rpc::ws::rpc_stream))
        .with_state(ctx.clone())
        .merge(rest::build_router(ctx))
}

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let app = build_app(ctx.clone());

    let listener = TcpListener::bind(&ctx.config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", ctx.config.bind_address))?;
    info!(addr = %ctx.config.bind_address, rpc_path = %ctx.config.rpc_path, "buckleyd listening");

    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining connections");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                // `ConnectInfo` isn't populated by hand-rolled accept loops the
                // way `axum::serve`'s `into_make_service_with_connect_info`
                // does it, so each connection's client address is layered in
                // here for handlers (e.g. `poll_ticket`) that extract it.
                let per_conn_app = app.clone().layer(Extension(ConnectInfo(peer)));
                let service = TowerToHyperService::new(per_conn_app);
                let conn = builder.serve_connection_with_upgrades(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %peer, err = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {
            info!("all connections drained");
        }
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("shutdown grace period elapsed — hard-closing remaining connections");
        }
    }

    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
