use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::{
    cache::{MessageMetadata, MetadataCache, NoopCache},
    db::message::{Claim, ClaimToken, MessageStore},
    delivery::{Deliver, DeliveryError, NoopDelivery},
    error::Error,
    message::{CreateMessageRequest, Message},
    scheduler::Processor,
};

pub const DEFAULT_BATCH_SIZE: usize = 2;

/// Claims messages from the store, delivers them, and records the outcome.
#[derive(Clone)]
pub struct MessageService {
    store: MessageStore,
    delivery: Arc<dyn Deliver>,
    cache: Arc<dyn MetadataCache>,
    delivery_timeout: Duration,
    batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Skipped,
}

#[bon::bon]
impl MessageService {
    /// Fails when the store's claim lease is not longer than
    /// `delivery_timeout`, since a lease could then expire mid-delivery.
    #[builder]
    pub fn new(
        store: MessageStore,
        delivery: Option<Arc<dyn Deliver>>,
        cache: Option<Arc<dyn MetadataCache>>,
        #[builder(default = Duration::from_secs(30))] delivery_timeout: Duration,
        #[builder(default = DEFAULT_BATCH_SIZE)] batch_size: usize,
    ) -> Result<Self, Error> {
        if store.lease() <= delivery_timeout {
            return Err(Error::invalid_parameter(format!(
                "claim lease ({:?}) must be longer than the delivery timeout ({:?})",
                store.lease(),
                delivery_timeout
            )));
        }

        Ok(Self {
            store,
            delivery: delivery.unwrap_or_else(|| Arc::new(NoopDelivery)),
            cache: cache.unwrap_or_else(|| Arc::new(NoopCache)),
            delivery_timeout,
            batch_size,
        })
    }
}

impl MessageService {
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn create_message(&self, request: CreateMessageRequest) -> Result<Message, Error> {
        for (field, value) in [
            ("recipient", &request.recipient),
            ("content", &request.content),
            ("webhook_url", &request.webhook_url),
        ] {
            if value.trim().is_empty() {
                return Err(Error::invalid_parameter(format!("{field} is required")));
            }
        }

        let message = self.store.create(&request).await?;

        tracing::info!(
            message_id = message.id,
            recipient = %message.recipient,
            max_retries = message.max_retries,
            "message created"
        );

        Ok(message)
    }

    pub async fn get_message(&self, id: i64) -> Result<Message, Error> {
        self.store.get_by_id(id).await
    }

    pub async fn list_sent(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, u64), Error> {
        let (messages, total) = self.store.list_sent(offset, limit).await?;

        tracing::debug!(offset, limit, returned = messages.len(), total, "listed sent messages");

        Ok((messages, total))
    }

    /// Delivers up to `batch_size` pending (or still retryable) messages.
    /// Returns how many ended up sent.
    #[tracing::instrument(skip(self))]
    pub async fn process_pending(&self, batch_size: usize) -> Result<usize, Error> {
        let batch = self.store.claim_batch(batch_size).await?;

        if batch.is_empty() {
            tracing::debug!("no pending messages");
            return Ok(0);
        }

        tracing::info!(claimed = batch.len(), "processing pending messages");

        self.process_batch(batch).await
    }

    /// Redelivers up to `batch_size` failed messages that still have retry
    /// budget. Returns how many ended up sent.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed_messages(&self, batch_size: usize) -> Result<usize, Error> {
        let batch = self.store.claim_retryable(batch_size).await?;

        if batch.is_empty() {
            tracing::debug!("no failed messages to retry");
            return Ok(0);
        }

        tracing::info!(claimed = batch.len(), "retrying failed messages");

        self.process_batch(batch).await
    }

    async fn process_batch(&self, batch: Claim) -> Result<usize, Error> {
        let (token, messages) = batch.into_parts();

        let mut sent = 0;
        let mut failed = 0;

        for message in messages {
            let id = message.id;

            match self.process_one(message, token).await {
                Ok(Outcome::Sent) => sent += 1,
                Ok(Outcome::Failed) => failed += 1,
                Ok(Outcome::Skipped) => {}
                Err(e) => {
                    failed += 1;
                    tracing::error!(message_id = id, error = %e, "failed to record delivery outcome");
                }
            }
        }

        tracing::info!(sent, failed, "batch finished");

        Ok(sent)
    }

    /// Delivers one claimed message. The lease is renewed first so it covers
    /// the whole delivery; if another claimer took the row in the meantime the
    /// message is skipped.
    async fn process_one(&self, message: Message, token: ClaimToken) -> Result<Outcome, Error> {
        if !message.is_deliverable() {
            tracing::warn!(
                message_id = message.id,
                status = %message.status,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                "claimed message is not deliverable, releasing"
            );
            self.store.release(message.id, token).await?;
            return Ok(Outcome::Skipped);
        }

        if !self.store.renew(message.id, token).await? {
            tracing::warn!(message_id = message.id, "claim expired and was taken over, skipping");
            return Ok(Outcome::Skipped);
        }

        let deadline = Instant::now() + self.delivery_timeout;

        let res = match tokio::time::timeout_at(deadline, self.delivery.send(&message, deadline))
            .await
        {
            Ok(res) => res,
            Err(_) => Err(DeliveryError::Timeout),
        };

        if let Err(e) = res {
            tracing::warn!(
                message_id = message.id,
                retryable = e.is_retryable(),
                error = %e,
                "delivery failed"
            );
            self.store
                .mark_failed_claimed(message.id, token, &e.to_string())
                .await?;
            return Ok(Outcome::Failed);
        }

        self.store.mark_sent_claimed(message.id, token).await?;

        tracing::info!(message_id = message.id, "message sent");

        if let Err(e) = self
            .cache
            .put(MessageMetadata::sent(&message, Utc::now()))
            .await
        {
            tracing::warn!(message_id = message.id, error = %e, "failed to cache message metadata");
        }

        Ok(Outcome::Sent)
    }
}

impl Processor for MessageService {
    fn process_pending(&self) -> BoxFuture<'_, Result<usize, Error>> {
        Box::pin(MessageService::process_pending(self, self.batch_size))
    }

    fn retry_failed(&self) -> BoxFuture<'_, Result<usize, Error>> {
        Box::pin(self.retry_failed_messages(self.batch_size))
    }
}
