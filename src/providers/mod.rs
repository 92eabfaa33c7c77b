pub mod sms;
pub mod whatsapp;

use async_trait::async_trait;

use crate::channels::Channel;
use crate::error::Result;
use crate::models::message::MessageStatus;

/// Outbound content: free text, or a pre-approved template with positional
/// parameters for channels that require them. A provider rejects the kind it
/// cannot carry instead of silently downgrading.
#[derive(Debug, Clone)]
pub enum OutboundContent {
    Text(String),
    Template { name: String, parameters: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ProviderSendResult {
    pub channel_message_id: String,
    pub status: MessageStatus,
    pub provider_id: &'static str,
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        to: &str,
        from: &str,
        content: &OutboundContent,
    ) -> Result<ProviderSendResult>;

    fn validate_address(&self, address: &str) -> bool;

    async fn health(&self) -> bool;

    /// Poll the provider for a message's current status. Providers whose
    /// status only arrives via webhook return `Error::NotFound`; callers
    /// treat that as a non-fatal miss.
    async fn fetch_status(&self, channel_message_id: &str) -> Result<MessageStatus>;
}

/// Truncate to the channel limit with an explicit marker so a clipped reply
/// is visible as clipped, never silently dropped.
pub(crate) fn truncate_with_marker(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit - 1).collect();
    out.push('…');
    out
}

pub(crate) fn is_e164(address: &str) -> bool {
    let Some(digits) = address.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::{is_e164, truncate_with_marker};

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_with_marker("hello", 1600), "hello");
    }

    #[test]
    fn long_text_is_clipped_with_a_marker() {
        let long = "a".repeat(2000);
        let clipped = truncate_with_marker(&long, 1600);
        assert_eq!(clipped.chars().count(), 1600);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn e164_requires_plus_and_digits() {
        assert!(is_e164("+15551230000"));
        assert!(!is_e164("15551230000"));
        assert!(!is_e164("+1555abc0000"));
        assert!(!is_e164("+123"));
    }
}
