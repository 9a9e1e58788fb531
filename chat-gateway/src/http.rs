//! HTTP surface (spec §6 "External interfaces"): the REST mirror of the
//! WebSocket `publish`/`ack`/resync operations, for callers that don't
//! hold a live connection (webhooks, backfill jobs, non-realtime
//! clients), plus the gateway's health/readiness probes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_core::error::ChatError;
use chat_core::ids::{ChannelId, ClientMsgId, MsgId, SeqId, UserId};
use chat_core::message::{Attachment, Envelope, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::GatewayState;
use crate::ingest::CreateMessageRequest;
use crate::resync;

/// Wraps [`ChatError`] so it can be returned directly from an axum
/// handler; status/code mapping matches spec §7.
struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiErrorBody { code: self.0.code(), message: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

/// Resolves the caller's identity from `Authorization: Bearer <token>`
/// via the configured [`chat_core::membership::AuthProvider`]. The HTTP
/// surface shares the same external auth collaborator as the WebSocket
/// `hello` frame (spec §1).
async fn authenticate(state: &GatewayState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ChatError::Unauthenticated)?;
    Ok(state.auth.authenticate(token).await?)
}

#[derive(Deserialize)]
pub struct CreateMessageBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub client_msg_id: Option<ClientMsgId>,
    pub parent_id: Option<MsgId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub metadata: Option<Value>,
}

#[derive(Serialize)]
pub struct CreateMessageResponse {
    pub msg_id: MsgId,
    pub seq_id: SeqId,
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Spec §6: "Status 409 implies `status=duplicate`" — the HTTP surface
/// maps `CreateStatus::Duplicate` onto 409 even though it travels back
/// as a successful `CreateMessageResult`, not a `ChatError`, since a
/// duplicate is not a failure to the caller's business logic (spec §7).
pub async fn create_message(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<ChannelId>,
    headers: HeaderMap,
    Json(body): Json<CreateMessageBody>,
) -> Result<(StatusCode, Json<CreateMessageResponse>), ApiError> {
    let sender_id = authenticate(&state, &headers).await?;
    let result = state
        .ingest
        .create_message(CreateMessageRequest {
            channel_id,
            sender_id,
            content: body.content,
            kind: body.kind,
            parent_id: body.parent_id,
            client_msg_id: body.client_msg_id,
            metadata: body.metadata,
            attachments: body.attachments,
        })
        .await?;

    let status = match result.status {
        crate::ingest::CreateStatus::Persisted => StatusCode::CREATED,
        crate::ingest::CreateStatus::Duplicate => StatusCode::CONFLICT,
    };
    let status_label = match result.status {
        crate::ingest::CreateStatus::Persisted => "persisted",
        crate::ingest::CreateStatus::Duplicate => "duplicate",
    };
    Ok((
        status,
        Json(CreateMessageResponse {
            msg_id: result.msg_id,
            seq_id: result.seq_id,
            status: status_label,
            timestamp: result.timestamp,
        }),
    ))
}

#[derive(Deserialize)]
pub struct ResyncQuery {
    #[serde(default)]
    pub after_seq: i64,
    #[serde(default = "default_resync_limit")]
    pub limit: i64,
}

fn default_resync_limit() -> i64 {
    200
}

#[derive(Serialize)]
pub struct ResyncResponse {
    pub messages: Vec<Envelope>,
    pub has_more: bool,
    pub next_cursor: Option<SeqId>,
}

pub async fn list_messages(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<ChannelId>,
    Query(query): Query<ResyncQuery>,
) -> Result<Json<ResyncResponse>, ApiError> {
    let page = resync::resync(&state.store, channel_id, SeqId(query.after_seq), query.limit.min(state.config.resync_page_size))
        .await
        .map_err(ChatError::from)?;
    Ok(Json(ResyncResponse { messages: page.messages, has_more: page.has_more, next_cursor: page.next_cursor }))
}

#[derive(Deserialize)]
pub struct EditMessageBody {
    pub content: String,
}

pub async fn edit_message(
    State(state): State<Arc<GatewayState>>,
    Path(msg_id): Path<MsgId>,
    headers: HeaderMap,
    Json(body): Json<EditMessageBody>,
) -> Result<Json<Envelope>, ApiError> {
    let sender_id = authenticate(&state, &headers).await?;
    let envelope = state.ingest.edit_message(msg_id, sender_id, body.content).await?;
    Ok(Json(envelope))
}

pub async fn delete_message(
    State(state): State<Arc<GatewayState>>,
    Path(msg_id): Path<MsgId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let sender_id = authenticate(&state, &headers).await?;
    state.ingest.delete_message(msg_id, sender_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MarkReadBody {
    pub seq_id: SeqId,
}

pub async fn mark_read(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<ChannelId>,
    headers: HeaderMap,
    Json(body): Json<MarkReadBody>,
) -> Result<StatusCode, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    state.store.mark_read(user_id, channel_id, body.seq_id).await.map_err(ChatError::from)?;
    state.bus.publish_event(
        channel_id,
        serde_json::json!({
            "event": "read_receipt",
            "userId": user_id,
            "channelId": channel_id,
            "seqId": body.seq_id,
        }),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

pub async fn unread_count(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<ChannelId>,
    headers: HeaderMap,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let count = state.store.unread_count(user_id, channel_id).await.map_err(ChatError::from)?;
    Ok(Json(UnreadCountResponse { unread_count: count }))
}

/// Liveness probe: the process is up and able to handle a request at
/// all (spec's ambient stack, carried regardless of spec.md's
/// Non-goals around metrics/observability surfaces).
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: the database is reachable. Used by orchestrators to
/// gate traffic until migrations/connection pool warm-up finish. The Bus
/// has no separate reachability check: `InProcessBus` is in-memory state
/// owned by this process, so it's up whenever the process is serving
/// requests at all.
pub async fn readyz(State(state): State<Arc<GatewayState>>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.store.pool()).await {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
