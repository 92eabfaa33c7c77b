use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};

use crate::{
    channels::{self, InboundPayload},
    config::get_config,
    error::Error,
    models::conversation::ConversationStatus,
    utils::webhook_auth::{verify_channel_signature, verify_platform_signature},
    AppState,
};

/// Empty TwiML document: the carrier-safe "no further instructions" reply.
const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

fn twiml(status: StatusCode) -> Response {
    (status, [(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response()
}

/// Carrier webhook for the SMS channel: both inbound messages and delivery
/// status callbacks land here, discriminated by the payload shape. Auth and
/// validation failures are rejected before any state mutation; everything
/// downstream degrades to a carrier-safe acknowledgement so the carrier does
/// not retry-storm us into duplicate customer messages.
pub async fn handle_sms(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let config = get_config();
    let signature = headers
        .get("x-twilio-signature")
        .and_then(|value| value.to_str().ok());
    if !verify_channel_signature(body.as_bytes(), signature, &config.sms_webhook_secret) {
        warn!(channel = "sms", "rejected webhook with missing or invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    match channels::sms::parse_payload(&body) {
        Ok(InboundPayload::Status(update)) => {
            match state.dispatcher.handle_status_callback(update).await {
                Ok(()) => (StatusCode::OK, "OK").into_response(),
                Err(e) => {
                    error!(channel = "sms", error = %e, "status callback failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response()
                }
            }
        }
        Ok(InboundPayload::Message(inbound)) => {
            let channel_message_id = inbound.channel_message_id.clone();
            match state.dispatcher.handle_inbound(inbound).await {
                Ok(outcome) => {
                    debug!(
                        channel = "sms",
                        conversation_id = %outcome.conversation_id,
                        duplicate = outcome.duplicate,
                        used_tools = outcome.used_tools,
                        "inbound processed"
                    );
                    twiml(StatusCode::OK)
                }
                Err(Error::NotFound(reason)) => {
                    // A number we do not manage; acknowledge so the carrier
                    // stops redelivering, but process nothing.
                    warn!(channel = "sms", channel_message_id = %channel_message_id, reason = %reason, "ignoring inbound");
                    twiml(StatusCode::OK)
                }
                Err(e) => {
                    error!(channel = "sms", channel_message_id = %channel_message_id, error = %e, "inbound processing failed");
                    twiml(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        Err(Error::Validation(message)) => {
            warn!(channel = "sms", reason = %message, "malformed webhook payload");
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(e) => {
            error!(channel = "sms", error = %e, "webhook decoding failed");
            twiml(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Subscription handshake for the WhatsApp webhook: echo the challenge when
/// the verify token matches, reject otherwise.
pub async fn verify_whatsapp(Query(query): Query<HashMap<String, String>>) -> Response {
    let config = get_config();
    let mode = query.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = query
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");

    if mode == "subscribe"
        && !config.whatsapp_verify_token.is_empty()
        && token == config.whatsapp_verify_token
    {
        let challenge = query.get("hub.challenge").cloned().unwrap_or_default();
        return (StatusCode::OK, challenge).into_response();
    }
    warn!(channel = "whatsapp", "webhook verification failed");
    (StatusCode::FORBIDDEN, "verification failed").into_response()
}

/// WhatsApp Business webhook: one delivery may batch inbound messages and
/// delivery statuses across several value objects. Once authenticated and
/// parsed, per-item failures are logged but the delivery is acknowledged.
pub async fn handle_whatsapp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let config = get_config();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());
    if !verify_channel_signature(body.as_bytes(), signature, &config.whatsapp_app_secret) {
        warn!(channel = "whatsapp", "rejected webhook with missing or invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: JsonValue = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = "whatsapp", error = %e, "webhook body is not valid JSON");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };

    let items = match channels::whatsapp::parse_payloads(&payload) {
        Ok(items) => items,
        Err(Error::Validation(message)) => {
            warn!(channel = "whatsapp", reason = %message, "malformed webhook payload");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
        Err(e) => {
            error!(channel = "whatsapp", error = %e, "webhook decoding failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response();
        }
    };

    for item in items {
        match item {
            InboundPayload::Message(inbound) => {
                let channel_message_id = inbound.channel_message_id.clone();
                match state.dispatcher.handle_inbound(inbound).await {
                    Ok(outcome) => {
                        debug!(
                            channel = "whatsapp",
                            conversation_id = %outcome.conversation_id,
                            duplicate = outcome.duplicate,
                            "inbound processed"
                        );
                    }
                    Err(e) => {
                        warn!(channel = "whatsapp", channel_message_id = %channel_message_id, error = %e, "inbound processing degraded");
                    }
                }
            }
            InboundPayload::Status(update) => {
                if let Err(e) = state.dispatcher.handle_status_callback(update).await {
                    warn!(channel = "whatsapp", error = %e, "status callback degraded");
                }
            }
        }
    }

    (StatusCode::OK, "OK").into_response()
}

#[derive(Debug, Deserialize)]
pub struct PlatformEnvelope {
    pub event: String,
    #[serde(default)]
    pub tenant_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub store_phone: Option<String>,
}

/// Merchant-platform webhook (order events and the like). Verified with its
/// own shared secret, never the channel secrets. An order event pauses the
/// conversation's automation so the agent stops talking over fulfillment.
pub async fn handle_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let config = get_config();
    if !verify_platform_signature(&headers, body.as_bytes(), &config.platform_webhook_secret) {
        warn!("rejected platform webhook with missing or invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let envelope: PlatformEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed platform webhook payload");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };

    if matches!(envelope.event.as_str(), "order_created" | "checkout_completed") {
        if let (Some(tenant_id), Some(customer), Some(store)) = (
            envelope.tenant_id,
            envelope.customer_phone.as_deref(),
            envelope.store_phone.as_deref(),
        ) {
            match state.store.find_by_key(tenant_id, customer, store).await {
                Ok(Some(conversation)) => {
                    if let Err(e) = state
                        .store
                        .update_status(conversation.id, ConversationStatus::Paused)
                        .await
                    {
                        error!(conversation_id = %conversation.id, error = %e, "failed to pause conversation");
                        return (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response();
                    }
                    info!(
                        conversation_id = %conversation.id,
                        event = %envelope.event,
                        "paused conversation automation after platform event"
                    );
                }
                Ok(None) => {
                    debug!(event = %envelope.event, "platform event for unknown conversation");
                }
                Err(e) => {
                    error!(error = %e, "platform event lookup failed");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response();
                }
            }
        }
    }

    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}
