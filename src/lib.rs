pub mod channels;
pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::PgPool;

use crate::providers::{
    sms::TwilioSmsProvider, whatsapp::WhatsAppCloudProvider, MessageProvider,
};
use crate::services::{
    ai_service::{AiOrchestrator, LlmClient, OpenAiClient},
    conversation_service::{ConversationStore, PgConversationStore},
    dispatch_service::ConversationDispatcher,
    tool_service::{RpcToolClient, ToolInvoker},
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub store: Arc<dyn ConversationStore>,
    pub sms_provider: Arc<dyn MessageProvider>,
    pub whatsapp_provider: Arc<dyn MessageProvider>,
    pub dispatcher: Arc<ConversationDispatcher>,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let config = crate::config::get_config();
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create shared HTTP client");

        let store: Arc<dyn ConversationStore> = Arc::new(PgConversationStore::new(pool.clone()));
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
            config.openai_api_key.clone(),
            config.openai_model.clone(),
            http_client.clone(),
        ));
        let tools: Arc<dyn ToolInvoker> = Arc::new(RpcToolClient::new(
            config.merchant_tools_url.clone(),
            http_client.clone(),
        ));
        let orchestrator = Arc::new(AiOrchestrator::new(
            llm,
            tools,
            store.clone(),
            Duration::from_secs(config.model_timeout_secs),
            Duration::from_secs(config.tool_timeout_secs),
        ));
        let sms_provider: Arc<dyn MessageProvider> = Arc::new(TwilioSmsProvider::new(
            config.twilio_account_sid.clone(),
            config.twilio_auth_token.clone(),
            http_client.clone(),
        ));
        let whatsapp_provider: Arc<dyn MessageProvider> = Arc::new(WhatsAppCloudProvider::new(
            config.whatsapp_access_token.clone(),
            config.whatsapp_phone_number_id.clone(),
            http_client,
        ));
        let dispatcher = Arc::new(ConversationDispatcher::new(
            store.clone(),
            orchestrator,
            sms_provider.clone(),
            whatsapp_provider.clone(),
            Duration::from_millis(config.send_retry_backoff_ms),
        ));

        Self {
            pool,
            store,
            sms_provider,
            whatsapp_provider,
            dispatcher,
        }
    }

    /// Wire explicit components instead of the production stack. Used by
    /// tests and alternative deployments.
    pub fn from_parts(
        pool: PgPool,
        store: Arc<dyn ConversationStore>,
        sms_provider: Arc<dyn MessageProvider>,
        whatsapp_provider: Arc<dyn MessageProvider>,
        dispatcher: Arc<ConversationDispatcher>,
    ) -> Self {
        Self {
            pool,
            store,
            sms_provider,
            whatsapp_provider,
            dispatcher,
        }
    }
}
