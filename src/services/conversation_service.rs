use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::conversation::{
    Conversation, ConversationStatus, NewConversation, StoreNumber,
};
use crate::models::message::{Message, MessageStatus, NewMessage};

/// Durable state for conversations and their message log. The two writes
/// that absorb races — resolve-or-create and append-by-channel-message-id —
/// lean on unique indexes instead of external locking, because the backing
/// store may be sharded per tenant.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>>;

    async fn find_by_key(
        &self,
        tenant_id: Uuid,
        customer_phone: &str,
        store_phone: &str,
    ) -> Result<Option<Conversation>>;

    /// Look up the conversation for a natural key, creating it if absent.
    /// Safe under concurrent first contact: the loser of an insert race
    /// re-reads and returns the winner.
    async fn resolve_or_create(&self, new: NewConversation) -> Result<Conversation>;

    async fn update_status(&self, id: Uuid, status: ConversationStatus) -> Result<()>;

    async fn touch_last_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Append a message. Returns the stored row and whether this call
    /// created it; a duplicate `channel_message_id` returns the existing row
    /// with `created = false`.
    async fn append_message(&self, new: NewMessage) -> Result<(Message, bool)>;

    /// Apply a delivery-status update keyed by `channel_message_id`. Returns
    /// the message if it exists (whether or not the update advanced the
    /// status) and `None` for an unknown id, which callers treat as a
    /// recoverable miss.
    async fn update_message_status(
        &self,
        channel_message_id: &str,
        status: MessageStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<Message>>;

    async fn recent_messages(&self, conversation_id: Uuid, limit: i64) -> Result<Vec<Message>>;

    async fn list_by_tenant(
        &self,
        tenant_id: Uuid,
        status: Option<ConversationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>>;

    async fn list_by_campaign(
        &self,
        campaign_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>>;

    async fn resolve_store_number(&self, store_phone: &str) -> Result<Option<StoreNumber>>;
}

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            r#"SELECT * FROM conversations WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn find_by_key(
        &self,
        tenant_id: Uuid,
        customer_phone: &str,
        store_phone: &str,
    ) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE tenant_id = $1 AND customer_phone = $2 AND store_phone = $3
            "#,
        )
        .bind(tenant_id)
        .bind(customer_phone)
        .bind(store_phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn resolve_or_create(&self, new: NewConversation) -> Result<Conversation> {
        if let Some(existing) = self
            .find_by_key(new.tenant_id, &new.customer_phone, &new.store_phone)
            .await?
        {
            return Ok(existing);
        }

        let insert = sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (id, tenant_id, campaign_id, customer_phone, store_phone, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.campaign_id)
        .bind(&new.customer_phone)
        .bind(&new.store_phone)
        .fetch_one(&self.pool)
        .await;

        match insert {
            Ok(conversation) => Ok(conversation),
            Err(err) if is_unique_violation(&err) => self
                .find_by_key(new.tenant_id, &new.customer_phone, &new.store_phone)
                .await?
                .ok_or_else(|| {
                    Error::Internal(
                        "conversation disappeared after losing the insert race".to_string(),
                    )
                }),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_status(&self, id: Uuid, status: ConversationStatus) -> Result<()> {
        let result = sqlx::query(r#"UPDATE conversations SET status = $2 WHERE id = $1"#)
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("conversation {} not found", id)));
        }
        Ok(())
    }

    async fn touch_last_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = GREATEST(COALESCE(last_message_at, $2), $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_message(&self, new: NewMessage) -> Result<(Message, bool)> {
        let now = Utc::now();
        let sent_at = (new.status.rank() >= MessageStatus::Sent.rank()
            && new.status != MessageStatus::Failed)
            .then_some(now);
        let delivered_at = (new.status == MessageStatus::Delivered).then_some(now);
        let failed_at = (new.status == MessageStatus::Failed).then_some(now);

        let inserted = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, conversation_id, direction, content, status,
                                  channel_message_id, sent_at, delivered_at, failed_at, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (channel_message_id) WHERE channel_message_id IS NOT NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.conversation_id)
        .bind(new.direction.as_str())
        .bind(&new.content)
        .bind(new.status.as_str())
        .bind(&new.channel_message_id)
        .bind(sent_at)
        .bind(delivered_at)
        .bind(failed_at)
        .bind(&new.failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = inserted {
            return Ok((message, true));
        }

        // The insert was a no-op, so a row with this channel_message_id must
        // already exist: a duplicate webhook delivery.
        let channel_message_id = new.channel_message_id.as_deref().ok_or_else(|| {
            Error::Internal("message insert returned no row without a conflict key".to_string())
        })?;
        let existing = sqlx::query_as::<_, Message>(
            r#"SELECT * FROM messages WHERE channel_message_id = $1"#,
        )
        .bind(channel_message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing, false))
    }

    async fn update_message_status(
        &self,
        channel_message_id: &str,
        status: MessageStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<Message>> {
        let now = Utc::now();
        // The rank comparison makes the update a no-op for regressions and
        // replays, keeping transitions monotonic without a read-modify-write.
        sqlx::query(
            r#"
            UPDATE messages SET
                status = $2,
                failure_reason = COALESCE($3, failure_reason),
                sent_at = CASE WHEN $2 = 'sent' THEN COALESCE(sent_at, $4) ELSE sent_at END,
                delivered_at = CASE WHEN $2 = 'delivered' THEN COALESCE(delivered_at, $4) ELSE delivered_at END,
                read_at = CASE WHEN $2 = 'read' THEN COALESCE(read_at, $4) ELSE read_at END,
                failed_at = CASE WHEN $2 = 'failed' THEN COALESCE(failed_at, $4) ELSE failed_at END
            WHERE channel_message_id = $1
              AND (CASE status WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 WHEN 'delivered' THEN 2 ELSE 3 END)
                < (CASE $2 WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 WHEN 'delivered' THEN 2 ELSE 3 END)
            "#,
        )
        .bind(channel_message_id)
        .bind(status.as_str())
        .bind(&failure_reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let message = sqlx::query_as::<_, Message>(
            r#"SELECT * FROM messages WHERE channel_message_id = $1"#,
        )
        .bind(channel_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn recent_messages(&self, conversation_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let mut messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn list_by_tenant(
        &self,
        tenant_id: Uuid,
        status: Option<ConversationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(tenant_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(conversations)
    }

    async fn list_by_campaign(
        &self,
        campaign_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE campaign_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(conversations)
    }

    async fn resolve_store_number(&self, store_phone: &str) -> Result<Option<StoreNumber>> {
        let number = sqlx::query_as::<_, StoreNumber>(
            r#"SELECT phone, tenant_id, campaign_id, channel FROM store_numbers WHERE phone = $1"#,
        )
        .bind(store_phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(number)
    }
}
