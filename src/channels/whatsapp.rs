use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::models::message::MessageStatus;

use super::{Channel, InboundPayload, NormalizedInbound, StatusUpdate};

/// Parse a WhatsApp Business webhook body. A single delivery can batch
/// several `entry[].changes[].value` objects, each mixing inbound messages
/// and delivery statuses, so this returns every payload it finds.
pub fn parse_payloads(payload: &JsonValue) -> Result<Vec<InboundPayload>> {
    let values = extract_value_objects(payload);
    if values.is_empty() {
        return Err(Error::Validation(
            "payload contained no entry[].changes[].value objects".to_string(),
        ));
    }

    let mut parsed = Vec::new();
    for value in values {
        let store_phone = value
            .get("metadata")
            .and_then(|m| m.get("display_phone_number"))
            .and_then(JsonValue::as_str)
            .map(normalize_msisdn)
            .unwrap_or_default();

        if let Some(messages) = value.get("messages").and_then(JsonValue::as_array) {
            for message in messages {
                match parse_message(message, &store_phone) {
                    Ok(Some(inbound)) => parsed.push(InboundPayload::Message(inbound)),
                    Ok(None) => {
                        tracing::debug!(channel = "whatsapp", "skipping non-text message");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(statuses) = value.get("statuses").and_then(JsonValue::as_array) {
            for status in statuses {
                parsed.push(InboundPayload::Status(parse_status(status)?));
            }
        }
    }

    if parsed.is_empty() {
        return Err(Error::Validation(
            "payload contained neither messages nor statuses".to_string(),
        ));
    }
    Ok(parsed)
}

fn extract_value_objects(payload: &JsonValue) -> Vec<JsonValue> {
    let mut values = Vec::new();
    if let Some(entries) = payload.get("entry").and_then(JsonValue::as_array) {
        for entry in entries {
            if let Some(changes) = entry.get("changes").and_then(JsonValue::as_array) {
                for change in changes {
                    if let Some(value) = change.get("value") {
                        if value.is_object() {
                            values.push(value.clone());
                        }
                    }
                }
            }
        }
    }
    values
}

fn parse_message(message: &JsonValue, store_phone: &str) -> Result<Option<NormalizedInbound>> {
    let id = message
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Validation("message missing id".to_string()))?;
    let from = message
        .get("from")
        .and_then(JsonValue::as_str)
        .filter(|from| !from.is_empty())
        .ok_or_else(|| Error::Validation("message missing from".to_string()))?;

    // Only text messages carry a body we can hand to the agent; media and
    // interactive payloads are acknowledged upstream and skipped here.
    let Some(body) = message
        .get("text")
        .and_then(|t| t.get("body"))
        .and_then(JsonValue::as_str)
    else {
        return Ok(None);
    };

    if store_phone.is_empty() {
        return Err(Error::Validation(
            "value object missing metadata.display_phone_number".to_string(),
        ));
    }

    Ok(Some(NormalizedInbound {
        channel: Channel::WhatsApp,
        channel_message_id: id.to_string(),
        from: normalize_msisdn(from),
        to: store_phone.to_string(),
        body: body.to_string(),
        timestamp: parse_timestamp(message.get("timestamp")),
    }))
}

fn parse_status(status: &JsonValue) -> Result<StatusUpdate> {
    let id = status
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Validation("status missing id".to_string()))?;
    let raw_status = status
        .get("status")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();

    let failure_reason = status
        .get("errors")
        .and_then(JsonValue::as_array)
        .and_then(|errors| errors.first())
        .and_then(|err| {
            err.get("title")
                .or_else(|| err.get("message"))
                .and_then(JsonValue::as_str)
        })
        .map(str::to_string);

    Ok(StatusUpdate {
        channel: Channel::WhatsApp,
        channel_message_id: id.to_string(),
        status: map_status(raw_status),
        failure_reason,
    })
}

fn parse_timestamp(raw: Option<&JsonValue>) -> DateTime<Utc> {
    raw.and_then(JsonValue::as_str)
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// The Business API reports bare MSISDNs (`15551230000`); canonical addresses
/// in the store are E.164 with a leading `+`.
pub fn normalize_msisdn(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches("whatsapp:");
    if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{}", trimmed)
    }
}

/// Total mapping from Business API statuses to the canonical set; unknown
/// statuses fall back to `pending` rather than failing the callback.
pub fn map_status(raw: &str) -> MessageStatus {
    match raw.to_ascii_lowercase().as_str() {
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cloud_payload(value: JsonValue) -> JsonValue {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{ "id": "1", "changes": [{ "field": "messages", "value": value }] }]
        })
    }

    #[test]
    fn parses_a_text_message() {
        let payload = cloud_payload(json!({
            "metadata": { "display_phone_number": "15559998888" },
            "messages": [{
                "id": "wamid.abc",
                "from": "15551230000",
                "timestamp": "1738000000",
                "type": "text",
                "text": { "body": "hello" }
            }]
        }));

        let parsed = parse_payloads(&payload).expect("parse");
        assert_eq!(parsed.len(), 1);
        let InboundPayload::Message(msg) = &parsed[0] else {
            panic!("expected message");
        };
        assert_eq!(msg.channel_message_id, "wamid.abc");
        assert_eq!(msg.from, "+15551230000");
        assert_eq!(msg.to, "+15559998888");
        assert_eq!(msg.body, "hello");
    }

    #[test]
    fn parses_statuses_and_messages_in_one_delivery() {
        let payload = cloud_payload(json!({
            "metadata": { "display_phone_number": "15559998888" },
            "messages": [{
                "id": "wamid.msg",
                "from": "15551230000",
                "type": "text",
                "text": { "body": "hi" }
            }],
            "statuses": [{
                "id": "wamid.out",
                "status": "delivered",
                "recipient_id": "15551230000"
            }]
        }));

        let parsed = parse_payloads(&payload).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], InboundPayload::Message(_)));
        let InboundPayload::Status(update) = &parsed[1] else {
            panic!("expected status");
        };
        assert_eq!(update.status, MessageStatus::Delivered);
    }

    #[test]
    fn failed_status_surfaces_the_error_title() {
        let payload = cloud_payload(json!({
            "metadata": { "display_phone_number": "15559998888" },
            "statuses": [{
                "id": "wamid.out",
                "status": "failed",
                "errors": [{ "code": 131026, "title": "Message undeliverable" }]
            }]
        }));

        let parsed = parse_payloads(&payload).expect("parse");
        let InboundPayload::Status(update) = &parsed[0] else {
            panic!("expected status");
        };
        assert_eq!(update.status, MessageStatus::Failed);
        assert_eq!(update.failure_reason.as_deref(), Some("Message undeliverable"));
    }

    #[test]
    fn payload_without_value_objects_is_rejected() {
        let payload = json!({ "object": "whatsapp_business_account", "entry": [] });
        assert!(matches!(
            parse_payloads(&payload),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn unknown_status_maps_to_pending() {
        assert_eq!(map_status("warned"), MessageStatus::Pending);
        assert_eq!(map_status("read"), MessageStatus::Read);
    }
}
