//! The two WebSocket upgrade endpoints, the frame dispatch loop, and
//! subject rewriting.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use relay_auth::AuthVerifier;
use relay_bus::{BusClient, MessageHandler};
use relay_common::{AgentId, ConnectionRecord, Principal, RelayError, Role, Subject, TenantStatus};
use relay_counters::{Direction, MessageCounter};
use relay_registry::ConnectionRegistry;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::frames::{id_from_raw, InboundFrame, OutboundFrame};
use crate::limits::TenantLimitsSource;
use crate::session::{CloseReason, Session, SessionManager};

const WRITE_DEADLINE: Duration = Duration::from_secs(30);
const DRAIN_BUDGET: Duration = Duration::from_secs(1);
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

pub struct GatewayState {
    pub bus: Arc<BusClient>,
    pub registry: Arc<ConnectionRegistry>,
    pub auth: Arc<AuthVerifier>,
    pub counters: Arc<MessageCounter>,
    pub sessions: Arc<SessionManager>,
    pub limits: Arc<dyn TenantLimitsSource>,
    pub server_instance_id: String,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/agents/:agent_id", get(agent_ws_handler))
        .route("/dashboard", get(dashboard_ws_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AgentConnectParams {
    challenge: String,
    signature: String,
    #[serde(rename = "tenant-id")]
    tenant_id: Option<String>,
}

#[instrument(skip(state, params))]
async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    Query(params): Query<AgentConnectParams>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let agent_id = AgentId::new(agent_id);
    let signature = match hex::decode(&params.signature) {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let verify = tokio::time::timeout(
        AUTH_DEADLINE,
        state.auth.verify_challenge(&agent_id, &params.challenge, &signature),
    )
    .await;

    let principal = match verify {
        Ok(Ok(principal)) => principal,
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };

    if let Some(expected_tenant) = params.tenant_id {
        if expected_tenant != principal.tenant_id.as_ref() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if state.limits.status_of(&principal.tenant_id).await != TenantStatus::Active {
        return (StatusCode::FORBIDDEN, "tenant-suspended").into_response();
    }

    let limits = state.limits.limits_for(&principal.tenant_id).await;
    if tenant_connection_count_at_or_over(&state, &principal.tenant_id, limits.max_connections).await {
        return (StatusCode::TOO_MANY_REQUESTS, "max-connections-exceeded").into_response();
    }

    ws.on_upgrade(move |socket| run_session(socket, Principal::Agent(principal), Role::Agent, limits.max_subjects_per_session, state))
}

async fn tenant_connection_count_at_or_over(state: &Arc<GatewayState>, tenant_id: &relay_common::TenantId, max_connections: u32) -> bool {
    match state.registry.list_by_tenant(tenant_id).await {
        Ok(records) => records.len() as u32 >= max_connections,
        Err(_) => false, // registry unavailable: fail open rather than block new connections
    }
}

#[instrument(skip(state, headers))]
async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.get("token").cloned());

    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let principal = match state.auth.verify_dashboard_token(&token) {
        Ok(principal) => principal,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    if state.limits.status_of(&principal.tenant_id).await != TenantStatus::Active {
        return (StatusCode::FORBIDDEN, "tenant-suspended").into_response();
    }

    let limits = state.limits.limits_for(&principal.tenant_id).await;
    if tenant_connection_count_at_or_over(&state, &principal.tenant_id, limits.max_connections).await {
        return (StatusCode::TOO_MANY_REQUESTS, "max-connections-exceeded").into_response();
    }

    ws.on_upgrade(move |socket| {
        run_session(socket, Principal::User(principal), Role::Dashboard, limits.max_subjects_per_session, state)
    })
}

/// The full per-connection lifecycle: Session creation, registry
/// registration, reader/writer tasks, and teardown on any close cause.
async fn run_session(socket: WebSocket, principal: Principal, role: Role, max_subscriptions: u32, state: Arc<GatewayState>) {
    let (session, outbound_rx) = Session::new(principal, role, state.server_instance_id.clone(), max_subscriptions);
    let session_id = session.session_id;
    let tenant_id = session.tenant_id.clone();

    let record = ConnectionRecord {
        session_id,
        principal_id: session.principal.principal_id(),
        tenant_id: tenant_id.clone(),
        role,
        server_instance_id: state.server_instance_id.clone(),
        opened_at: session.opened_at,
        last_heartbeat_at: session.opened_at,
    };
    if let Err(e) = state.registry.register(&record).await {
        warn!(error = %e, %session_id, "failed to register session, closing");
        return;
    }

    state.sessions.insert(session.clone());
    info!(%session_id, %tenant_id, role = ?role, "session opened");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_writer(sink, outbound_rx, session.clone()));

    run_reader(stream, session.clone(), state.clone()).await;

    // Teardown: every cause funnels through here.
    session.unsubscribe_all().await;
    state.sessions.remove(&session_id);
    let _ = state.registry.unregister(&session_id).await;
    let _ = writer.await;

    let reason = session.close_reason().unwrap_or(CloseReason::ClientClosed);
    info!(%session_id, %tenant_id, ?reason, "session closed");
}

async fn run_reader(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    session: Arc<Session>,
    state: Arc<GatewayState>,
) {
    loop {
        tokio::select! {
            _ = session.wait_for_close() => break,
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_inbound(&text, &session, &state).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        session.request_close(CloseReason::ClientClosed);
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: ignored
                    Some(Err(_)) => {
                        session.request_close(CloseReason::InternalError);
                        break;
                    }
                }
            }
        }
    }
}

async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    session: Arc<Session>,
) {
    loop {
        tokio::select! {
            _ = session.wait_for_close() => break,
            maybe_frame = rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            session.request_close(CloseReason::InternalError);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Drain whatever is already queued, bounded to a 1s budget, then close.
    let deadline = tokio::time::Instant::now() + DRAIN_BUDGET;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(deadline - tokio::time::Instant::now(), rx.recv()).await {
            Ok(Some(frame)) => {
                let _ = send_frame(&mut sink, &frame).await;
            }
            _ => break,
        }
    }

    let (code, text) = session.close_reason().unwrap_or(CloseReason::ClientClosed).code_and_text();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: text.into(),
        })))
        .await;
}

async fn send_frame(sink: &mut futures_util::stream::SplitSink<WebSocket, Message>, frame: &OutboundFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text)))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())
}

async fn dispatch_inbound(raw: &str, session: &Arc<Session>, state: &Arc<GatewayState>) {
    let frame: InboundFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => {
            session.try_enqueue(OutboundFrame::Error {
                id: id_from_raw(raw),
                message: RelayError::InvalidFrame(String::new()).category().to_string(),
            });
            return;
        }
    };

    let id = frame.id().map(str::to_string);

    if let Some(required) = frame.required_role() {
        if required != session.role {
            session.try_enqueue(OutboundFrame::Error {
                id,
                message: RelayError::InvalidFrame("frame type not permitted for this session role".into()).category().to_string(),
            });
            return;
        }
    }

    let result = match frame {
        InboundFrame::Heartbeat { .. } => handle_heartbeat(session, state).await,
        InboundFrame::Publish { subject, payload, .. } => handle_publish(session, state, subject, payload).await,
        InboundFrame::Subscribe { subject, .. } => handle_subscribe(session, state, subject).await,
        InboundFrame::Unsubscribe { subject, .. } => handle_unsubscribe(session, subject).await,
        InboundFrame::SubscribeChannel { channel_id, .. } => {
            handle_subscribe(session, state, format!("channel.{channel_id}")).await
        }
        InboundFrame::UnsubscribeChannel { channel_id, .. } => {
            handle_unsubscribe(session, format!("channel.{channel_id}")).await
        }
        InboundFrame::SubscribeTopicPreview { .. } => handle_subscribe_wildcard(session, state).await,
        InboundFrame::UnsubscribeTopicPreview { .. } => {
            let wildcard = format!("tenant.{}.>", session.tenant_id);
            handle_unsubscribe(session, wildcard).await
        }
    };

    match result {
        Ok(()) => session.try_enqueue(OutboundFrame::Ack { id }),
        Err(e) => session.try_enqueue(OutboundFrame::Error {
            id,
            message: e.category().to_string(),
        }),
    }
}

async fn handle_heartbeat(session: &Arc<Session>, state: &Arc<GatewayState>) -> Result<(), RelayError> {
    session.touch_heartbeat();
    state.registry.heartbeat(&session.session_id).await
}

async fn handle_publish(session: &Arc<Session>, state: &Arc<GatewayState>, raw_subject: String, payload: serde_json::Value) -> Result<(), RelayError> {
    let subject = Subject::rewrite_for_tenant(&raw_subject, &session.tenant_id)?;
    if subject.has_wildcard() {
        return Err(RelayError::InvalidFrame("publish subject may not contain a wildcard".into()));
    }

    let limits = state.limits.limits_for(&session.tenant_id).await;
    if tenant_over_daily_message_quota(state, &session.tenant_id, limits.max_messages_per_day).await {
        return Err(RelayError::TenantQuotaExceeded("daily message quota reached".into()));
    }

    let bytes = serde_json::to_vec(&payload).map_err(|_| RelayError::InvalidFrame("payload not serializable".into()))?;
    state.bus.publish(subject.as_str(), &bytes).await?;

    state
        .counters
        .record_event(&session.tenant_id, &session.principal.principal_id(), subject.as_str(), Direction::Ingress, bytes.len())
        .await;
    Ok(())
}

async fn tenant_over_daily_message_quota(state: &Arc<GatewayState>, tenant_id: &relay_common::TenantId, max_messages_per_day: u64) -> bool {
    match state.counters.today_total_messages(tenant_id).await {
        Ok(count) => count as u64 >= max_messages_per_day,
        Err(_) => false, // counter store unavailable: fail open rather than block publishing
    }
}

async fn handle_subscribe(session: &Arc<Session>, state: &Arc<GatewayState>, raw_subject: String) -> Result<(), RelayError> {
    let subject = Subject::rewrite_for_tenant(&raw_subject, &session.tenant_id)?;
    subscribe_to(session, state, subject.as_str()).await
}

async fn handle_subscribe_wildcard(session: &Arc<Session>, state: &Arc<GatewayState>) -> Result<(), RelayError> {
    let wildcard = format!("tenant.{}.>", session.tenant_id);
    subscribe_to(session, state, &wildcard).await
}

async fn subscribe_to(session: &Arc<Session>, state: &Arc<GatewayState>, subject: &str) -> Result<(), RelayError> {
    if session.has_subscription(subject).await {
        return Ok(()); // already subscribed: idempotent no-op
    }
    if session.subject_count().await >= session.max_subscriptions as usize {
        return Err(RelayError::TenantQuotaExceeded("subscription cap reached".into()));
    }

    let handler = build_bus_handler(session.session_id, state.clone());
    let handle = state.bus.subscribe(subject, handler).await?;
    session.insert_subscription(subject.to_string(), handle).await;
    Ok(())
}

async fn handle_unsubscribe(session: &Arc<Session>, raw_subject: String) -> Result<(), RelayError> {
    let subject = if raw_subject.starts_with("tenant.") {
        raw_subject
    } else {
        format!("tenant.{}.{}", session.tenant_id, raw_subject)
    };
    if let Some(handle) = session.remove_subscription(&subject).await {
        handle.unsubscribe().await;
    }
    Ok(()) // unsubscribing a subject never subscribed still acks
}

/// Builds the bus-dispatch closure. Captures `session_id`, not the
/// session itself, so the arena lookup happens at delivery time and a
/// torn-down session never keeps its bus handler alive.
fn build_bus_handler(session_id: relay_common::SessionId, state: Arc<GatewayState>) -> MessageHandler {
    Arc::new(move |subject: &str, payload: &[u8]| {
        let Some(session) = state.sessions.get(&session_id) else {
            return; // session torn down between subscribe and delivery
        };

        let payload_value: serde_json::Value = serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null);
        session.try_enqueue(OutboundFrame::Message {
            subject: subject.to_string(),
            payload: payload_value,
            timestamp: Utc::now(),
        });

        let tenant_id = session.tenant_id.clone();
        let principal_id = session.principal.principal_id();
        let subject = subject.to_string();
        let len = payload.len();
        let counters = state.counters.clone();
        tokio::spawn(async move {
            counters.record_event(&tenant_id, &principal_id, &subject, Direction::Egress, len).await;
        });
    })
}

