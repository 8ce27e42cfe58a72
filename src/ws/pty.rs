//! `GET /ws/pty` — the interactive shell bridge (spec.md §4.6).
//!
//! Grounded on the PTY-state idiom in the pack's terminal example
//! (`portable-pty` open → spawn → reader thread forwarding raw bytes
//! over a channel), adapted to frame I/O as JSON over the WebSocket
//! instead of feeding a local terminal parser.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::Deserialize;
use serde_json::json;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::interval;

use crate::AppContext;

const READ_LIMIT_BYTES: usize = 8 * 1024 * 1024;
const PING_INTERVAL_SECS: u64 = 20;
/// spec.md §5 timeout table: "WS ping: 5 s".
const PING_WRITE_DEADLINE_SECS: u64 = 5;
/// spec.md §5 timeout table: "shell output write: 10 s".
const SHELL_WRITE_DEADLINE_SECS: u64 = 10;
const AUTH_WAIT_SECS: u64 = 10;
const OUTPUT_CHUNK_BYTES: usize = 4 * 1024;
const SESSION_TOKEN_HEADER: &str = "x-buckley-session-token";
const POLICY_VIOLATION: u16 = 1008;

#[derive(Deserialize)]
pub struct PtyQuery {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub session_token: Option<String>,
    pub cmd: Option<String>,
}

pub async fn pty_bridge(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<PtyQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !super::origin_allowed(&headers, host, &ctx.config.allowed_origins) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    let header_token = headers.get(SESSION_TOKEN_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    let query_token = if ctx.config.is_loopback_bind() { query.session_token.clone() } else { None };
    let pre_supplied_token = header_token.or(query_token);

    if !ctx.pty_ws_cap.try_acquire(crate::WS_GLOBAL_CAP_KEY).await {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(READ_LIMIT_BYTES)
        .on_upgrade(move |socket| handle(socket, ctx, query.session_id, pre_supplied_token, query.cmd))
}

async fn handle(
    mut socket: WebSocket,
    ctx: Arc<AppContext>,
    session_id: String,
    pre_supplied_token: Option<String>,
    cmd_override: Option<String>,
) {
    let authenticated = match pre_supplied_token {
        Some(token) => validate(&ctx, &session_id, &token).await,
        None => wait_for_auth_frame(&mut socket, &ctx, &session_id).await,
    };

    if !authenticated {
        close_policy_violation(&mut socket).await;
        ctx.pty_ws_cap.release(crate::WS_GLOBAL_CAP_KEY).await;
        return;
    }

    let Some(session) = ctx.store.get_session(&session_id).await.ok().flatten() else {
        close_policy_violation(&mut socket).await;
        ctx.pty_ws_cap.release(crate::WS_GLOBAL_CAP_KEY).await;
        return;
    };

    run_shell(&mut socket, &session.project_path, cmd_override).await;
    ctx.pty_ws_cap.release(crate::WS_GLOBAL_CAP_KEY).await;
}

async fn validate(ctx: &Arc<AppContext>, session_id: &str, token: &str) -> bool {
    ctx.store.validate_session_token(session_id, token).await.unwrap_or(false)
}

/// Reads text frames for up to [`AUTH_WAIT_SECS`], looking for
/// `{"type":"auth","data":"<token>"}` (spec.md §4.6).
async fn wait_for_auth_frame(socket: &mut WebSocket, ctx: &Arc<AppContext>, session_id: &str) -> bool {
    let deadline = tokio::time::sleep(Duration::from_secs(AUTH_WAIT_SECS));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
                        if value.get("type").and_then(|v| v.as_str()) != Some("auth") {
                            continue;
                        }
                        let Some(token) = value.get("data").and_then(|v| v.as_str()) else { return false };
                        return validate(ctx, session_id, token).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => return false,
                }
            }
        }
    }
}

async fn close_policy_violation(socket: &mut WebSocket) {
    let frame = CloseFrame { code: POLICY_VIOLATION, reason: "policy-violation".into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Resolves the program and arguments the PTY should spawn, without
/// touching `portable_pty::CommandBuilder` — kept separate so the
/// resolution logic is unit-testable without a real PTY.
fn resolve_shell(cmd_override: Option<&str>, windows: bool) -> (String, Vec<&'static str>) {
    if let Some(cmd) = cmd_override {
        return (cmd.to_string(), Vec::new());
    }
    if windows {
        (std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string()), vec!["/NoLogo"])
    } else {
        (std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()), vec!["-l"])
    }
}

fn shell_command(cmd_override: Option<&str>) -> CommandBuilder {
    let (program, args) = resolve_shell(cmd_override, cfg!(windows));
    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }
    cmd
}

async fn run_shell(socket: &mut WebSocket, cwd: &str, cmd_override: Option<String>) {
    let pty_system = native_pty_system();
    let pair = match pty_system.openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 }) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut cmd = shell_command(cmd_override.as_deref());
    cmd.cwd(crate::security::normalize_path(std::path::Path::new(cwd)));

    let mut child = match pair.slave.spawn_command(cmd) {
        Ok(c) => c,
        Err(_) => return,
    };
    drop(pair.slave);

    let Ok(mut reader) = pair.master.try_clone_reader() else { return };
    let Ok(writer) = pair.master.take_writer() else { return };
    let writer = Arc::new(Mutex::new(writer));
    let master = Arc::new(Mutex::new(pair.master));

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut buf = [0u8; OUTPUT_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let (exit_tx, mut exit_rx) = tokio::sync::oneshot::channel::<i32>();
    std::thread::spawn(move || {
        let code = child.wait().map(|s| s.exit_code() as i32).unwrap_or(1);
        let _ = exit_tx.send(code);
    });

    let mut ping_ticker = interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_ticker.tick().await;

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                let sent = tokio::time::timeout(Duration::from_secs(PING_WRITE_DEADLINE_SECS), socket.send(Message::Ping(Vec::<u8>::new().into()))).await;
                if sent.is_err() || matches!(sent, Ok(Err(_))) {
                    break;
                }
            }
            chunk = out_rx.recv() => {
                let Some(chunk) = chunk else { break };
                let frame = json!({"type": "data", "data": base64::engine::general_purpose::STANDARD.encode(&chunk)});
                if write_json(socket, &frame).await.is_err() {
                    break;
                }
            }
            code = &mut exit_rx => {
                let code = code.unwrap_or(1);
                let _ = write_json(socket, &json!({"type": "exit", "data": code.to_string()})).await;
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound(&text, &writer, &master) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Returns `false` when the frame asked to close the bridge (`{"type":"close"}`).
fn handle_inbound(
    text: &str,
    writer: &Arc<Mutex<Box<dyn Write + Send>>>,
    master: &Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else { return true };
    match value.get("type").and_then(|v| v.as_str()) {
        Some("input") => {
            if let Some(data) = value.get("data").and_then(|v| v.as_str()) {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) {
                    if let Ok(mut w) = writer.lock() {
                        let _ = w.write_all(&bytes);
                    }
                }
            }
            true
        }
        Some("resize") => {
            let rows = value.get("rows").and_then(|v| v.as_i64()).unwrap_or(0);
            let cols = value.get("cols").and_then(|v| v.as_i64()).unwrap_or(0);
            if rows > 0 && cols > 0 {
                if let Ok(m) = master.lock() {
                    let _ = m.resize(PtySize {
                        rows: rows.clamp(1, u16::MAX as i64) as u16,
                        cols: cols.clamp(1, u16::MAX as i64) as u16,
                        pixel_width: 0,
                        pixel_height: 0,
                    });
                }
            }
            true
        }
        Some("close") => false,
        _ => true,
    }
}

async fn write_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    tokio::time::timeout(Duration::from_secs(SHELL_WRITE_DEADLINE_SECS), socket.send(Message::Text(value.to_string().into())))
        .await
        .unwrap_or(Err(axum::Error::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_override_wins_with_no_extra_args() {
        let (program, args) = resolve_shell(Some("tmux attach"), false);
        assert_eq!(program, "tmux attach");
        assert!(args.is_empty());
    }

    #[test]
    fn unix_default_runs_a_login_shell() {
        let (program, args) = resolve_shell(None, false);
        assert!(!program.is_empty());
        assert_eq!(args, vec!["-l"]);
    }

    #[test]
    fn windows_default_suppresses_the_logo_banner() {
        let (program, args) = resolve_shell(None, true);
        assert!(!program.is_empty());
        assert_eq!(args, vec!["/NoLogo"]);
    }
}
