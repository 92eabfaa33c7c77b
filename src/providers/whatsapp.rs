use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::channels::Channel;
use crate::error::{Error, Result};
use crate::models::message::MessageStatus;

use super::{is_e164, truncate_with_marker, MessageProvider, OutboundContent, ProviderSendResult};

const WHATSAPP_BODY_LIMIT: usize = 4096;

pub struct WhatsAppCloudProvider {
    client: Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
}

impl WhatsAppCloudProvider {
    pub fn new(access_token: String, phone_number_id: String, client: Client) -> Self {
        Self {
            client,
            access_token,
            phone_number_id,
            api_base: "https://graph.facebook.com/v19.0".to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.phone_number_id)
    }
}

#[derive(Debug, Deserialize)]
struct GraphSendResponse {
    messages: Vec<GraphMessageId>,
}

#[derive(Debug, Deserialize)]
struct GraphMessageId {
    id: String,
}

#[async_trait]
impl MessageProvider for WhatsAppCloudProvider {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    // The sending number is fixed by the phone number id on the URL, so the
    // `from` argument is not forwarded.
    async fn send(
        &self,
        to: &str,
        _from: &str,
        content: &OutboundContent,
    ) -> Result<ProviderSendResult> {
        let payload = match content {
            OutboundContent::Text(text) => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": truncate_with_marker(text, WHATSAPP_BODY_LIMIT),
                },
            }),
            OutboundContent::Template { name, parameters } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "template",
                "template": {
                    "name": name,
                    "language": { "code": "en_US" },
                    "components": [{
                        "type": "body",
                        "parameters": parameters
                            .iter()
                            .map(|p| json!({ "type": "text", "text": p }))
                            .collect::<Vec<_>>(),
                    }],
                },
            }),
        };

        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("whatsapp api unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ProviderSend(format!(
                "whatsapp api rejected send ({}): {}",
                status, text
            )));
        }

        let parsed: GraphSendResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderSend(format!("invalid whatsapp response: {}", e)))?;
        let message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| {
                Error::ProviderSend("whatsapp response contained no message id".to_string())
            })?;

        Ok(ProviderSendResult {
            channel_message_id: message_id,
            // Delivery state arrives exclusively via the status webhook.
            status: MessageStatus::Pending,
            provider_id: "whatsapp_cloud",
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        is_e164(address.strip_prefix("whatsapp:").unwrap_or(address))
    }

    async fn health(&self) -> bool {
        let url = format!("{}/{}?fields=id", self.api_base, self.phone_number_id);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn fetch_status(&self, channel_message_id: &str) -> Result<MessageStatus> {
        // No status-polling endpoint exists; delivery receipts only arrive on
        // the webhook. A miss here is an expected condition for callers.
        Err(Error::NotFound(format!(
            "whatsapp exposes no status query for message {}",
            channel_message_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> WhatsAppCloudProvider {
        WhatsAppCloudProvider::new("token".to_string(), "1234567890".to_string(), Client::new())
    }

    #[test]
    fn address_validation_accepts_the_prefixed_form() {
        let provider = provider();
        assert!(provider.validate_address("+15551230000"));
        assert!(provider.validate_address("whatsapp:+15551230000"));
        assert!(!provider.validate_address("15551230000"));
    }

    #[tokio::test]
    async fn status_polling_is_a_not_found_miss() {
        let result = provider().fetch_status("wamid.abc").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
