use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{Channel, NormalizedInbound, StatusUpdate};
use crate::error::{Error, Result};
use crate::models::conversation::{Conversation, ConversationStatus, NewConversation};
use crate::models::message::{Direction, Message, MessageStatus, NewMessage};
use crate::providers::{MessageProvider, OutboundContent};
use crate::services::ai_service::AiOrchestrator;
use crate::services::conversation_service::ConversationStore;

/// The serialization boundary: everything that mutates one conversation runs
/// under that conversation's keyed lock, in arrival order (tokio mutexes are
/// fair), while different conversations proceed fully in parallel. Status
/// callbacks bypass the lock entirely — they are pure store updates and must
/// not wait behind an in-flight agent turn.
pub struct ConversationDispatcher {
    store: Arc<dyn ConversationStore>,
    orchestrator: Arc<AiOrchestrator>,
    sms_provider: Arc<dyn MessageProvider>,
    whatsapp_provider: Arc<dyn MessageProvider>,
    locks: Mutex<HashMap<Uuid, Weak<tokio::sync::Mutex<()>>>>,
    send_retry_backoff: Duration,
}

/// What one inbound delivery produced. A duplicate delivery short-circuits
/// with `duplicate = true` and no outbound message.
#[derive(Debug)]
pub struct InboundOutcome {
    pub conversation_id: Uuid,
    pub duplicate: bool,
    pub reply_text: String,
    pub used_tools: bool,
    pub tools_executed: Vec<String>,
    pub outbound: Option<Message>,
}

impl ConversationDispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        orchestrator: Arc<AiOrchestrator>,
        sms_provider: Arc<dyn MessageProvider>,
        whatsapp_provider: Arc<dyn MessageProvider>,
        send_retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            sms_provider,
            whatsapp_provider,
            locks: Mutex::new(HashMap::new()),
            send_retry_backoff,
        }
    }

    fn provider_for(&self, channel: Channel) -> &Arc<dyn MessageProvider> {
        match channel {
            Channel::Sms => &self.sms_provider,
            Channel::WhatsApp => &self.whatsapp_provider,
        }
    }

    /// Fetch (or lazily create) the per-conversation lock. Entries are held
    /// weakly and pruned once no task is using them, so the table only ever
    /// holds in-flight conversations.
    fn lock_for(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.locks.lock().expect("conversation lock table poisoned");
        if let Some(existing) = table.get(&conversation_id).and_then(Weak::upgrade) {
            return existing;
        }
        table.retain(|_, weak| weak.strong_count() > 0);
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        table.insert(conversation_id, Arc::downgrade(&fresh));
        fresh
    }

    /// Full inbound pipeline: resolve-or-create, idempotent append, agent
    /// turn, provider send, outbound append. Degradations inside the turn
    /// (model, tools, send) never surface as errors; only store failures do.
    pub async fn handle_inbound(&self, inbound: NormalizedInbound) -> Result<InboundOutcome> {
        let number = self
            .store
            .resolve_store_number(&inbound.to)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("no tenant mapped for store number {}", inbound.to))
            })?;

        let conversation = self
            .store
            .resolve_or_create(NewConversation {
                tenant_id: number.tenant_id,
                campaign_id: number.campaign_id,
                customer_phone: inbound.from.clone(),
                store_phone: inbound.to.clone(),
            })
            .await?;

        let lock = self.lock_for(conversation.id);
        let _guard = lock.lock().await;

        let (message, created) = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation.id,
                direction: Direction::Inbound,
                content: inbound.body.clone(),
                status: MessageStatus::Delivered,
                channel_message_id: Some(inbound.channel_message_id.clone()),
                failure_reason: None,
            })
            .await?;

        if !created {
            debug!(
                conversation_id = %conversation.id,
                channel_message_id = %inbound.channel_message_id,
                "duplicate inbound delivery ignored"
            );
            return Ok(InboundOutcome {
                conversation_id: conversation.id,
                duplicate: true,
                reply_text: String::new(),
                used_tools: false,
                tools_executed: Vec::new(),
                outbound: None,
            });
        }

        self.store
            .touch_last_message(conversation.id, message.created_at)
            .await?;

        let status = ConversationStatus::parse(&conversation.status)
            .unwrap_or(ConversationStatus::Active);
        match status {
            ConversationStatus::Resolved | ConversationStatus::Archived => {
                // A customer writing back reopens the thread.
                self.store
                    .update_status(conversation.id, ConversationStatus::Active)
                    .await?;
            }
            ConversationStatus::Paused => {
                info!(
                    conversation_id = %conversation.id,
                    "conversation is paused, recording inbound without an automated reply"
                );
                return Ok(InboundOutcome {
                    conversation_id: conversation.id,
                    duplicate: false,
                    reply_text: String::new(),
                    used_tools: false,
                    tools_executed: Vec::new(),
                    outbound: None,
                });
            }
            ConversationStatus::Active => {}
        }

        let reply = self.orchestrator.run_turn(&conversation, &inbound.body).await;
        let outbound = self
            .send_and_record(
                &conversation,
                inbound.channel,
                &OutboundContent::Text(reply.response_text.clone()),
            )
            .await?;
        self.store
            .touch_last_message(conversation.id, outbound.created_at)
            .await?;

        Ok(InboundOutcome {
            conversation_id: conversation.id,
            duplicate: false,
            reply_text: reply.response_text,
            used_tools: reply.used_tools,
            tools_executed: reply.tools_executed,
            outbound: Some(outbound),
        })
    }

    /// Apply a provider delivery-status callback. Never touches the agent
    /// pipeline; an unknown channel message id is a recoverable miss.
    pub async fn handle_status_callback(&self, update: StatusUpdate) -> Result<()> {
        match self
            .store
            .update_message_status(
                &update.channel_message_id,
                update.status,
                update.failure_reason.clone(),
            )
            .await?
        {
            Some(message) => {
                debug!(
                    conversation_id = %message.conversation_id,
                    channel_message_id = %update.channel_message_id,
                    status = update.status.as_str(),
                    "applied delivery status"
                );
            }
            None => {
                warn!(
                    channel = update.channel.as_str(),
                    channel_message_id = %update.channel_message_id,
                    "status callback for unknown message"
                );
            }
        }
        Ok(())
    }

    /// Operator-initiated outbound message; bypasses the agent but shares
    /// the conversation's serialization and recording path.
    pub async fn handle_operator_send(
        &self,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<Message> {
        let conversation = self
            .store
            .get(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {} not found", conversation_id)))?;
        let number = self
            .store
            .resolve_store_number(&conversation.store_phone)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no channel mapping for store number {}",
                    conversation.store_phone
                ))
            })?;
        let channel = number.channel().ok_or_else(|| {
            Error::Internal(format!(
                "store number {} has unknown channel '{}'",
                number.phone, number.channel
            ))
        })?;

        let lock = self.lock_for(conversation.id);
        let _guard = lock.lock().await;

        let outbound = self
            .send_and_record(
                &conversation,
                channel,
                &OutboundContent::Text(text.to_string()),
            )
            .await?;
        self.store
            .touch_last_message(conversation.id, outbound.created_at)
            .await?;
        Ok(outbound)
    }

    /// Send through the channel provider and record the outbound message.
    /// A send failure is not an error at this level: the agent's text must
    /// not be lost, so the message is recorded with status `failed` and the
    /// reason. Only store failures propagate.
    async fn send_and_record(
        &self,
        conversation: &Conversation,
        channel: Channel,
        content: &OutboundContent,
    ) -> Result<Message> {
        let provider = self.provider_for(channel);
        let text = match content {
            OutboundContent::Text(text) => text.clone(),
            OutboundContent::Template { name, .. } => format!("[template:{}]", name),
        };

        let send_result = if provider.validate_address(&conversation.customer_phone) {
            self.send_with_retry(provider, conversation, content).await
        } else {
            Err(Error::Validation(format!(
                "invalid destination address {}",
                conversation.customer_phone
            )))
        };

        let new_message = match send_result {
            Ok(result) => {
                info!(
                    conversation_id = %conversation.id,
                    channel = channel.as_str(),
                    provider = result.provider_id,
                    channel_message_id = %result.channel_message_id,
                    "outbound message accepted by provider"
                );
                NewMessage {
                    conversation_id: conversation.id,
                    direction: Direction::Outbound,
                    content: text,
                    status: result.status,
                    channel_message_id: Some(result.channel_message_id),
                    failure_reason: None,
                }
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    channel = channel.as_str(),
                    error = %e,
                    "outbound send failed, recording message as failed"
                );
                NewMessage {
                    conversation_id: conversation.id,
                    direction: Direction::Outbound,
                    content: text,
                    status: MessageStatus::Failed,
                    channel_message_id: None,
                    failure_reason: Some(e.to_string()),
                }
            }
        };

        let (message, _) = self.store.append_message(new_message).await?;
        Ok(message)
    }

    /// One bounded retry with jittered backoff, and only for transport or
    /// provider-side failures; validation errors are final.
    async fn send_with_retry(
        &self,
        provider: &Arc<dyn MessageProvider>,
        conversation: &Conversation,
        content: &OutboundContent,
    ) -> Result<crate::providers::ProviderSendResult> {
        let first = provider
            .send(
                &conversation.customer_phone,
                &conversation.store_phone,
                content,
            )
            .await;
        match first {
            Err(e @ (Error::Connection(_) | Error::ProviderSend(_))) => {
                let jitter = rand::thread_rng().gen_range(0..250);
                let backoff = self.send_retry_backoff + Duration::from_millis(jitter);
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "send failed, retrying once"
                );
                tokio::time::sleep(backoff).await;
                provider
                    .send(
                        &conversation.customer_phone,
                        &conversation.store_phone,
                        content,
                    )
                    .await
            }
            other => other,
        }
    }
}
