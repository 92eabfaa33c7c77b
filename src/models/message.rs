use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only log entry inside a conversation. `channel_message_id` is the
/// idempotency key for duplicate webhook deliveries and status callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub content: String,
    pub status: String,
    pub channel_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub content: String,
    pub status: MessageStatus,
    pub channel_message_id: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Monotonic ordering for status transitions. `read` and `failed` share
    /// the top rank: both are terminal and neither may overwrite the other.
    pub fn rank(&self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read | Self::Failed => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MessageStatus;

    #[test]
    fn status_ranks_are_monotonic_along_the_happy_path() {
        assert!(MessageStatus::Pending.rank() < MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }

    #[test]
    fn terminal_states_do_not_outrank_each_other() {
        assert_eq!(MessageStatus::Read.rank(), MessageStatus::Failed.rank());
    }

    #[test]
    fn unknown_status_strings_do_not_parse() {
        assert_eq!(MessageStatus::parse("queued"), None);
        assert_eq!(MessageStatus::parse("sent"), Some(MessageStatus::Sent));
    }
}
