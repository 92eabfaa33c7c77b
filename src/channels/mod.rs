pub mod sms;
pub mod whatsapp;

use chrono::{DateTime, Utc};

use crate::models::message::MessageStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Sms,
    WhatsApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::WhatsApp => "whatsapp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::WhatsApp),
            _ => None,
        }
    }
}

/// Canonical shape every channel codec normalizes an inbound message into.
#[derive(Debug, Clone)]
pub struct NormalizedInbound {
    pub channel: Channel,
    pub channel_message_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Canonical shape of a provider delivery-status callback.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub channel: Channel,
    pub channel_message_id: String,
    pub status: MessageStatus,
    pub failure_reason: Option<String>,
}

/// A webhook payload is either a customer message or a delivery status for a
/// message we already sent. The discriminator is channel-specific.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    Message(NormalizedInbound),
    Status(StatusUpdate),
}
