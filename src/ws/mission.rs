//! `GET /api/mission/events` — the mission-control WebSocket bridge
//! (spec.md §4.6). Fleet-wide, so only operators may connect (mission
//! events are an operator-only namespace throughout the rest of this
//! crate — see DESIGN.md's "mission WS scope gate" entry).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::auth::Scope;
use crate::hub::{ClientFilter, Event};
use crate::rest::auth::resolve_for_ws;
use crate::AppContext;

const READ_LIMIT_BYTES: usize = 64 * 1024;
const PING_INTERVAL_SECS: u64 = 20;
const WRITE_DEADLINE_SECS: u64 = 5;
const ACTIVE_WINDOW_HOURS: i64 = 24;

#[derive(Deserialize)]
pub struct MissionQuery {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
}

pub async fn mission_events(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<MissionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !super::origin_allowed(&headers, host, &ctx.config.allowed_origins) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    let cookie_header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
    let authorization_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let principal = match resolve_for_ws(&ctx, cookie_header, authorization_header, None, &headers).await {
        Some(p) => p,
        None => return axum::http::StatusCode::UNAUTHORIZED.into_response(),
    };
    if ctx.config.require_token && principal.name == crate::auth::ANONYMOUS {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    if principal.scope != Scope::Operator {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    if !ctx.mission_ws_cap.try_acquire(crate::WS_GLOBAL_CAP_KEY).await {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(READ_LIMIT_BYTES).on_upgrade(move |socket| handle(socket, ctx, query.session_id))
}

async fn handle(mut socket: WebSocket, ctx: Arc<AppContext>, session_filter: Option<String>) {
    let filter = ClientFilter { session_id: session_filter.clone(), type_patterns: vec!["mission.*".to_string()] };
    let mut sub = ctx.hub.register_client(filter).await;

    if send_snapshot(&mut socket, &ctx, session_filter.as_deref()).await.is_err() {
        ctx.hub.unregister_client(sub.id).await;
        ctx.mission_ws_cap.release(crate::WS_GLOBAL_CAP_KEY).await;
        return;
    }

    let mut ping_ticker = interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                let frame = tokio::time::timeout(Duration::from_secs(WRITE_DEADLINE_SECS), socket.send(Message::Ping(Vec::<u8>::new().into()))).await;
                if frame.is_err() || matches!(frame, Ok(Err(_))) {
                    break;
                }
            }
            event = sub.rx.recv() => {
                let Some(event) = event else { break };
                if write_json(&mut socket, &event_json(&event)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|v| v.as_str()) == Some("ping") {
                                let pong = json!({"type": "server.pong"});
                                if write_json(&mut socket, &pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                        // Any other inbound shape is silently ignored (spec.md §4.6).
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    ctx.hub.unregister_client(sub.id).await;
    ctx.mission_ws_cap.release(crate::WS_GLOBAL_CAP_KEY).await;
}

async fn send_snapshot(socket: &mut WebSocket, ctx: &Arc<AppContext>, session_filter: Option<&str>) -> Result<(), axum::Error> {
    write_json(socket, &json!({"type": "server.hello"})).await?;

    let cutoff = Utc::now() - ChronoDuration::hours(ACTIVE_WINDOW_HOURS);
    let agents: Vec<_> = ctx
        .store
        .list_sessions()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.last_active >= cutoff)
        .filter(|s| session_filter.map_or(true, |want| s.id == want))
        .map(|s| json!({"id": s.id, "principal": s.principal, "status": s.status, "lastActive": s.last_active}))
        .collect();

    let pending_changes: Vec<_> = ctx
        .store
        .list_pending_approvals()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|a| !a.is_expired())
        .filter(|a| session_filter.map_or(true, |want| a.session_id == want))
        .collect();

    write_json(socket, &json!({"type": "mission.snapshot", "payload": {"agents": agents, "pendingChanges": pending_changes}})).await
}

fn event_json(event: &Event) -> serde_json::Value {
    json!({"type": event.event_type, "sessionID": event.session_id, "payload": event.payload, "timestamp": event.timestamp})
}

async fn write_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    tokio::time::timeout(Duration::from_secs(WRITE_DEADLINE_SECS), socket.send(Message::Text(value.to_string().into())))
        .await
        .unwrap_or(Err(axum::Error::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))))
}
