use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::channels::{self, Channel};
use crate::error::{Error, Result};
use crate::models::message::MessageStatus;

use super::{is_e164, truncate_with_marker, MessageProvider, OutboundContent, ProviderSendResult};

/// Carrier hard-rejects anything past 1600 characters, so clip before send.
const SMS_BODY_LIMIT: usize = 1600;

pub struct TwilioSmsProvider {
    client: Client,
    account_sid: String,
    auth_token: String,
    api_base: String,
}

impl TwilioSmsProvider {
    pub fn new(account_sid: String, auth_token: String, client: Client) -> Self {
        Self {
            client,
            account_sid,
            auth_token,
            api_base: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

#[derive(Debug, Deserialize)]
struct CarrierMessage {
    sid: String,
    status: String,
}

#[async_trait]
impl MessageProvider for TwilioSmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        to: &str,
        from: &str,
        content: &OutboundContent,
    ) -> Result<ProviderSendResult> {
        let body = match content {
            OutboundContent::Text(text) => truncate_with_marker(text, SMS_BODY_LIMIT),
            OutboundContent::Template { name, .. } => {
                return Err(Error::Validation(format!(
                    "sms channel cannot deliver template '{}': only free text is supported",
                    name
                )));
            }
        };

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", from), ("Body", body.as_str())])
            .send()
            .await
            .map_err(|e| Error::Connection(format!("carrier unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ProviderSend(format!(
                "carrier rejected send ({}): {}",
                status, text
            )));
        }

        let message: CarrierMessage = response
            .json()
            .await
            .map_err(|e| Error::ProviderSend(format!("invalid carrier response: {}", e)))?;

        Ok(ProviderSendResult {
            channel_message_id: message.sid,
            status: channels::sms::map_status(&message.status),
            provider_id: "twilio",
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        is_e164(address)
    }

    async fn health(&self) -> bool {
        let url = format!("{}/Accounts/{}.json", self.api_base, self.account_sid);
        match self
            .client
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn fetch_status(&self, channel_message_id: &str) -> Result<MessageStatus> {
        let url = format!(
            "{}/Accounts/{}/Messages/{}.json",
            self.api_base, self.account_sid, channel_message_id
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| Error::Connection(format!("carrier unreachable: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!(
                "carrier has no message {}",
                channel_message_id
            )));
        }
        if !response.status().is_success() {
            return Err(Error::ProviderSend(format!(
                "carrier status query failed ({})",
                response.status()
            )));
        }

        let message: CarrierMessage = response
            .json()
            .await
            .map_err(|e| Error::ProviderSend(format!("invalid carrier response: {}", e)))?;
        Ok(channels::sms::map_status(&message.status))
    }
}
