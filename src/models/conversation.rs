use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

use crate::channels::Channel;

/// One durable thread between a customer phone and a store phone, scoped to a
/// tenant. Unique per (tenant_id, customer_phone, store_phone); archived
/// instead of deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub customer_phone: String,
    pub store_phone: String,
    pub status: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub tenant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub customer_phone: String,
    pub store_phone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Paused,
    Resolved,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Resolved => "resolved",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "resolved" => Some(Self::Resolved),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A provisioned channel phone number and the tenant that owns it. Inbound
/// traffic on an unmapped number is acknowledged but never processed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoreNumber {
    pub phone: String,
    pub tenant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub channel: String,
}

impl StoreNumber {
    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::ConversationStatus;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ConversationStatus::Active,
            ConversationStatus::Paused,
            ConversationStatus::Resolved,
            ConversationStatus::Archived,
        ] {
            assert_eq!(ConversationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConversationStatus::parse("deleted"), None);
    }
}
