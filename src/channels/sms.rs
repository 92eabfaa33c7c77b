use std::collections::HashMap;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::message::MessageStatus;

use super::{Channel, InboundPayload, NormalizedInbound, StatusUpdate};

/// Parse a raw form-encoded carrier webhook body. A payload carrying a
/// `MessageStatus`/`SmsStatus` field without a `Body` field is a delivery
/// status callback; everything else is treated as an inbound message.
pub fn parse_payload(raw: &str) -> Result<InboundPayload> {
    let fields = parse_form(raw);

    let has_status = fields.contains_key("MessageStatus") || fields.contains_key("SmsStatus");
    let has_body = fields.contains_key("Body");

    if has_status && !has_body {
        parse_status(&fields).map(InboundPayload::Status)
    } else {
        parse_inbound(&fields).map(InboundPayload::Message)
    }
}

fn parse_form(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Validation(format!("missing required field: {}", name)))
}

fn parse_inbound(fields: &HashMap<String, String>) -> Result<NormalizedInbound> {
    let body = fields
        .get("Body")
        .cloned()
        .ok_or_else(|| Error::Validation("missing required field: Body".to_string()))?;

    Ok(NormalizedInbound {
        channel: Channel::Sms,
        channel_message_id: required(fields, "MessageSid")?.to_string(),
        from: required(fields, "From")?.to_string(),
        to: required(fields, "To")?.to_string(),
        body,
        // The carrier form payload carries no timestamp; receipt time is the
        // closest thing to one.
        timestamp: Utc::now(),
    })
}

fn parse_status(fields: &HashMap<String, String>) -> Result<StatusUpdate> {
    let raw_status = fields
        .get("MessageStatus")
        .or_else(|| fields.get("SmsStatus"))
        .map(String::as_str)
        .unwrap_or_default();

    let failure_reason = fields
        .get("ErrorCode")
        .filter(|code| !code.is_empty())
        .map(|code| format!("carrier error {}", code));

    Ok(StatusUpdate {
        channel: Channel::Sms,
        channel_message_id: required(fields, "MessageSid")?.to_string(),
        status: map_status(raw_status),
        failure_reason,
    })
}

/// Total mapping from carrier statuses to the canonical set. Unknown values
/// fall back to `pending` so a new carrier status never blocks processing.
pub fn map_status(raw: &str) -> MessageStatus {
    match raw.to_ascii_lowercase().as_str() {
        "queued" | "accepted" | "scheduled" | "sending" => MessageStatus::Pending,
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "failed" | "undelivered" | "canceled" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}
