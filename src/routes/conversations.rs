use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::{Error, Result},
    models::{conversation::Conversation, conversation::ConversationStatus, message::Message},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub tenant_id: Uuid,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConversationWithMessages {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    #[validate(length(min = 1, max = 4096))]
    pub text: String,
}

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(50).clamp(1, 200), offset.unwrap_or(0).max(0))
}

/// List a tenant's conversations, optionally filtered by status.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ConversationStatus::parse(raw)
                .ok_or_else(|| Error::Validation(format!("unknown conversation status: {}", raw)))
        })
        .transpose()?;
    let (limit, offset) = page(query.limit, query.offset);

    let conversations = state
        .store
        .list_by_tenant(query.tenant_id, status, limit, offset)
        .await?;
    Ok(Json(conversations))
}

pub async fn list_campaign_conversations(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let (limit, offset) = page(query.limit, query.offset);
    let conversations = state
        .store
        .list_by_campaign(campaign_id, limit, offset)
        .await?;
    Ok(Json(conversations))
}

/// Fetch one conversation with its full message log (oldest first).
pub async fn get_conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation {} not found", id)))?;
    let messages = state.store.recent_messages(id, 500).await?;
    Ok(Json(ConversationWithMessages {
        conversation,
        messages,
    }))
}

/// Operator-initiated outbound message: sent through the channel provider
/// and recorded on the conversation, bypassing the agent.
pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let message = state
        .dispatcher
        .handle_operator_send(payload.conversation_id, &payload.text)
        .await?;
    Ok(Json(message))
}
