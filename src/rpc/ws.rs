//! The streaming-RPC transport binding (spec.md §4.5, §6.1.2) — upgrades
//! the configured `rpcPath`, decodes length-prefixed binary frames inside
//! WS binary frames into method calls, and multiplexes the per-subscriber
//! push stream onto the same socket.
//!
//! Grounded on `ipc/mod.rs`'s flat `match method { ... }` dispatch table
//! in the teacher daemon (kept verbatim as the shape of [`Call`]), with
//! the wire format swapped for the binary framing [`super::framing`]
//! defines and delivery routed through [`super::service::RpcService`].

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::approval::ApprovalWorkflow;
use crate::auth::Scope;
use crate::error::ErrorCode;
use crate::hub::Event;
use crate::rest::auth::resolve_for_ws;
use crate::rpc::framing;
use crate::rpc::service::{
    dispatch_session_command, dispatch_workflow_action, hello_event, SubscribeRequest, WorkflowVerb,
};
use crate::AppContext;

/// spec.md §4.1: "the streaming-RPC read cap is 32 MiB".
const READ_LIMIT_BYTES: usize = 32 * 1024 * 1024;
const KEEPALIVE_SECS: u64 = 20;
/// spec.md §6.1.2: end-of-stream frames set bit `0x02` of the header's flags byte.
const EOS_FLAG: u8 = 0x02;

#[derive(Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
enum Call {
    Subscribe(SubscribeRequest),
    SendCommand(SendCommandParams),
    WorkflowAction(WorkflowActionParams),
    ApproveToolCall(ApprovalDecisionParams),
    RejectToolCall(ApprovalDecisionParams),
    CreateHeadlessSession(CreateHeadlessParams),
    DeleteHeadlessSession(DeleteHeadlessParams),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendCommandParams {
    session_id: String,
    session_token: String,
    kind: String,
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowActionParams {
    session_id: String,
    session_token: String,
    #[serde(flatten)]
    verb: WorkflowVerb,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalDecisionParams {
    id: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateHeadlessParams {
    project_path: String,
    git_repo: Option<String>,
    git_branch: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteHeadlessParams {
    session_id: String,
}

#[derive(Deserialize)]
struct Envelope {
    id: Option<String>,
    #[serde(flatten)]
    call: Call,
}

#[derive(Serialize)]
struct Reply<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

#[derive(Serialize)]
struct ReplyError {
    code: &'static str,
    message: String,
}

impl<'a> Reply<'a> {
    fn ok(id: Option<&'a str>, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    fn err(id: Option<&'a str>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(ReplyError { code: code.as_str(), message: message.into() }) }
    }
}

pub async fn rpc_stream(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookie_header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
    let authorization_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(principal) = resolve_for_ws(&ctx, cookie_header, authorization_header, None, &headers).await else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    if ctx.config.require_token && principal.name == crate::auth::ANONYMOUS {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    if !principal.has_scope(Scope::Viewer) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(READ_LIMIT_BYTES)
        .on_upgrade(move |socket| handle(socket, ctx, principal))
}

async fn handle(mut socket: WebSocket, ctx: Arc<AppContext>, principal: crate::auth::Principal) {
    let initial_request = match read_initial_subscribe(&mut socket).await {
        Ok(req) => req,
        Err(code) => {
            let _ = send_eos(&mut socket, Some(code)).await;
            return;
        }
    };

    // spec.md §4.5 step 1: a requested sessionID filter requires access to
    // that session, checked before the subscription is established.
    if let Some(session_id) = &initial_request.session_id {
        match ctx.store.get_session(session_id).await {
            Ok(Some(session)) if crate::access::can_access_session(&principal, &session) => {}
            _ => {
                let _ = send_eos(&mut socket, Some(ErrorCode::NotFound)).await;
                return;
            }
        }
    }

    let session_filter = initial_request.session_id.clone();
    let mut sub = match ctx.rpc.subscribe(&principal, initial_request).await {
        Ok(sub) => sub,
        Err(code) => {
            let _ = send_eos(&mut socket, Some(code)).await;
            return;
        }
    };

    if send_frame(&mut socket, &hello_event_json()).await.is_err() {
        ctx.rpc.unsubscribe(&sub).await;
        return;
    }
    if send_snapshot(&mut socket, &ctx, &principal, session_filter.as_deref()).await.is_err() {
        ctx.rpc.unsubscribe(&sub).await;
        return;
    }

    let mut keepalive = interval(Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                let event = Event::new("server.keepalive", serde_json::json!({}));
                if send_frame(&mut socket, &event_json(&event)).await.is_err() {
                    break;
                }
            }
            _ = sub.cancel_watcher.cancelled() => break,
            event = sub.rx.recv() => {
                let Some(event) = event else { break };
                if send_frame(&mut socket, &event_json(&event)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let reply = handle_call(&ctx, &principal, &data).await;
                        if send_frame(&mut socket, &reply).await.is_err() {
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

    let _ = send_eos(&mut socket, None).await;
    ctx.rpc.unsubscribe(&sub).await;
}

/// Reads the client's first binary frame and requires it to be a
/// `Subscribe` call (spec.md §4.5) — there is no other way into the
/// stream's single subscription, so anything else is rejected.
async fn read_initial_subscribe(socket: &mut WebSocket) -> Result<SubscribeRequest, ErrorCode> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => {
                let envelope: Envelope = framing::decode(&data).map_err(|_| ErrorCode::InvalidInput)?;
                return match envelope.call {
                    Call::Subscribe(req) => Ok(req),
                    _ => Err(ErrorCode::FailedPrecondition),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(ErrorCode::InvalidInput),
            Some(Ok(_)) => continue,
            Some(Err(_)) => return Err(ErrorCode::InvalidInput),
        }
    }
}

async fn handle_call(ctx: &Arc<AppContext>, principal: &crate::auth::Principal, frame: &[u8]) -> Value {
    let envelope: Envelope = match framing::decode(frame) {
        Ok(e) => e,
        Err(e) => return reply_value(Reply::err(None, ErrorCode::InvalidInput, e.to_string())),
    };
    let id = envelope.id.as_deref();

    let result = match envelope.call {
        Call::Subscribe(_) => {
            // Re-subscribing mid-stream isn't supported — one subscription
            // per connection, established at upgrade time (spec.md §4.5).
            Err((ErrorCode::FailedPrecondition, "already subscribed on this stream".to_string()))
        }
        Call::SendCommand(p) => dispatch_session_command(
            &ctx.store,
            ctx.dispatcher.as_ref(),
            principal,
            &p.session_id,
            &p.session_token,
            Scope::Member,
            &p.kind,
            p.payload,
        )
        .await
        .map(|accepted| serde_json::json!({ "accepted": accepted }))
        .map_err(|c| (c, c.as_str().to_string())),
        Call::WorkflowAction(p) => dispatch_workflow_action(
            &ctx.store,
            ctx.dispatcher.as_ref(),
            principal,
            &p.session_id,
            &p.session_token,
            &p.verb,
        )
        .await
        .map(|accepted| serde_json::json!({ "accepted": accepted }))
        .map_err(|c| (c, c.as_str().to_string())),
        Call::ApproveToolCall(p) => decide_approval(ctx, principal, &p, true).await,
        Call::RejectToolCall(p) => decide_approval(ctx, principal, &p, false).await,
        Call::CreateHeadlessSession(p) => create_headless(ctx, principal, p).await,
        Call::DeleteHeadlessSession(p) => delete_headless(ctx, principal, &p.session_id).await,
    };

    match result {
        Ok(value) => reply_value(Reply::ok(id, value)),
        Err((code, message)) => reply_value(Reply::err(id, code, message)),
    }
}

async fn decide_approval(
    ctx: &Arc<AppContext>,
    principal: &crate::auth::Principal,
    params: &ApprovalDecisionParams,
    approving: bool,
) -> Result<Value, (ErrorCode, String)> {
    let workflow = ApprovalWorkflow::new(ctx.store.clone(), ctx.hub.clone());
    let outcome = if approving {
        workflow.approve(ctx.dispatcher.as_ref(), principal, &params.id, params.reason.as_deref()).await
    } else {
        workflow.reject(ctx.dispatcher.as_ref(), principal, &params.id, params.reason.as_deref()).await
    };
    outcome
        .map(|o| serde_json::json!({ "approval": o.approval, "dispatchFailed": o.dispatch_failed, "success": !o.conflict }))
        .map_err(|c| (c, c.as_str().to_string()))
}

async fn create_headless(
    ctx: &Arc<AppContext>,
    principal: &crate::auth::Principal,
    params: CreateHeadlessParams,
) -> Result<Value, (ErrorCode, String)> {
    if !principal.has_scope(Scope::Member) {
        return Err((ErrorCode::PermissionDenied, ErrorCode::PermissionDenied.as_str().to_string()));
    }
    let session = ctx
        .store
        .create_session(&principal.name, &params.project_path, params.git_repo.as_deref(), params.git_branch.as_deref())
        .await
        .map_err(|e| (ErrorCode::Storage, e.to_string()))?;
    ctx.rpc.note_session_owner(&session.id, &principal.name).await;
    ctx.hub
        .broadcast(
            Event::new("session.created", serde_json::json!({ "principal": principal.name, "session": session }))
                .with_session(session.id.clone()),
        )
        .await;
    Ok(serde_json::json!({ "session": session }))
}

async fn delete_headless(
    ctx: &Arc<AppContext>,
    principal: &crate::auth::Principal,
    session_id: &str,
) -> Result<Value, (ErrorCode, String)> {
    if !principal.has_scope(Scope::Member) {
        return Err((ErrorCode::PermissionDenied, ErrorCode::PermissionDenied.as_str().to_string()));
    }
    let session = ctx.store.get_session(session_id).await.map_err(|e| (ErrorCode::Storage, e.to_string()))?;
    let Some(session) = session else { return Err((ErrorCode::NotFound, "session not found".to_string())) };
    if !crate::access::can_access_session(principal, &session) {
        return Err((ErrorCode::NotFound, "session not found".to_string()));
    }
    let deleted = ctx.store.delete_session(session_id).await.map_err(|e| (ErrorCode::Storage, e.to_string()))?;
    if deleted {
        ctx.hub.broadcast(Event::new("session.deleted", serde_json::json!({})).with_session(session_id.to_string())).await;
    }
    Ok(serde_json::json!({ "deleted": deleted }))
}

/// spec.md §4.5 step 4: `sessions.snapshot` when unfiltered, a per-session
/// `view.patch` when the subscription requested a `sessionID`.
async fn send_snapshot(
    socket: &mut WebSocket,
    ctx: &Arc<AppContext>,
    principal: &crate::auth::Principal,
    session_filter: Option<&str>,
) -> Result<(), axum::Error> {
    if let Some(session_id) = session_filter {
        let Some(session) = ctx.store.get_session(session_id).await.ok().flatten() else { return Ok(()) };
        if !crate::access::can_access_session(principal, &session) {
            return Ok(());
        }
        ctx.rpc.note_session_owner(&session.id, &session.principal).await;
        let event = Event::new("view.patch", serde_json::json!({ "session": session })).with_session(session.id.clone());
        return send_frame(socket, &event_json(&event)).await;
    }

    let sessions = ctx.store.list_sessions().await.unwrap_or_default();
    let mut visible = Vec::new();
    for session in sessions {
        if !crate::access::can_access_session(principal, &session) {
            continue;
        }
        ctx.rpc.note_session_owner(&session.id, &session.principal).await;
        visible.push(session);
    }
    let event = Event::new("sessions.snapshot", serde_json::json!({ "sessions": visible }));
    send_frame(socket, &event_json(&event)).await
}

fn hello_event_json() -> Value {
    event_json(&hello_event())
}

fn event_json(event: &Event) -> Value {
    serde_json::json!({ "event": event.event_type, "sessionID": event.session_id, "payload": event.payload, "timestamp": event.timestamp })
}

fn reply_value<'a>(reply: Reply<'a>) -> Value {
    serde_json::to_value(&reply).unwrap_or(Value::Null)
}

async fn send_frame(socket: &mut WebSocket, value: &Value) -> Result<(), axum::Error> {
    let frame = framing::encode(value).map_err(axum::Error::new)?;
    socket.send(Message::Binary(frame.into())).await
}

async fn send_eos(socket: &mut WebSocket, error: Option<ErrorCode>) -> Result<(), axum::Error> {
    let envelope = match error {
        Some(code) => serde_json::json!({ "error": { "code": code.as_str(), "message": code.as_str() } }),
        None => serde_json::json!({}),
    };
    let payload = serde_json::to_vec(&envelope).map_err(axum::Error::new)?;
    let mut frame = Vec::with_capacity(framing::HEADER_LEN + payload.len());
    frame.push(EOS_FLAG);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    socket.send(Message::Binary(frame.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;

    fn ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(Arc::new(DaemonConfig::default()), Arc::new(MemoryStore::new()), "test-daemon".into(), None))
    }

    fn principal(name: &str, scope: Scope) -> Principal {
        Principal { name: name.to_string(), scope, token_id: None }
    }

    fn frame(call: Value) -> Vec<u8> {
        framing::encode(&call).unwrap()
    }

    #[tokio::test]
    async fn subscribe_mid_stream_is_rejected_with_failed_precondition() {
        let ctx = ctx();
        let alice = principal("alice", Scope::Viewer);
        let call = frame(serde_json::json!({"id": "1", "method": "subscribe", "params": {}}));
        let reply = handle_call(&ctx, &alice, &call).await;
        assert_eq!(reply["id"], "1");
        assert_eq!(reply["error"]["code"], ErrorCode::FailedPrecondition.as_str());
    }

    #[tokio::test]
    async fn create_then_delete_headless_session_round_trips() {
        let ctx = ctx();
        let member = principal("bob", Scope::Member);

        let create = frame(serde_json::json!({
            "id": "create-1",
            "method": "createHeadlessSession",
            "params": {"projectPath": "/tmp/proj"},
        }));
        let reply = handle_call(&ctx, &member, &create).await;
        assert_eq!(reply["id"], "create-1");
        let session_id = reply["result"]["session"]["id"].as_str().expect("session id in reply").to_string();

        let delete = frame(serde_json::json!({
            "id": "delete-1",
            "method": "deleteHeadlessSession",
            "params": {"sessionId": session_id},
        }));
        let reply = handle_call(&ctx, &member, &delete).await;
        assert_eq!(reply["id"], "delete-1");
        assert_eq!(reply["result"]["deleted"], true);
    }

    #[tokio::test]
    async fn create_headless_session_requires_member_scope() {
        let ctx = ctx();
        let viewer = principal("eve", Scope::Viewer);
        let call = frame(serde_json::json!({
            "id": "2",
            "method": "createHeadlessSession",
            "params": {"projectPath": "/tmp/proj"},
        }));
        let reply = handle_call(&ctx, &viewer, &call).await;
        assert_eq!(reply["error"]["code"], ErrorCode::PermissionDenied.as_str());
    }

    #[tokio::test]
    async fn snapshot_only_includes_sessions_the_principal_can_access() {
        let ctx = ctx();
        let owner = principal("carol", Scope::Member);
        let session = ctx.store.create_session(&owner.name, "/tmp/proj", None, None).await.unwrap();

        let visible = ctx.store.list_sessions().await.unwrap();
        let visible: Vec<_> = visible.into_iter().filter(|s| crate::access::can_access_session(&owner, s)).collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, session.id);

        let stranger = principal("mallory", Scope::Viewer);
        let visible_to_stranger = ctx.store.list_sessions().await.unwrap();
        let visible_to_stranger: Vec<_> =
            visible_to_stranger.into_iter().filter(|s| crate::access::can_access_session(&stranger, s)).collect();
        assert!(visible_to_stranger.is_empty());
    }
}
