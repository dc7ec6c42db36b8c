//! Best-effort cache of delivery metadata.
//!
//! The store stays the source of truth. Writes are last-writer-wins per
//! message id, and callers ignore cache failures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::{error::Error, message::Message};

/// Snapshot of a delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    pub id: i64,
    pub recipient: String,
    pub status: String,
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub webhook_url: String,
}

impl MessageMetadata {
    pub fn sent(message: &Message, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: message.id,
            recipient: message.recipient.clone(),
            status: crate::message::MessageStatus::Sent.to_string(),
            sent_at,
            retry_count: message.retry_count,
            max_retries: message.max_retries,
            webhook_url: message.webhook_url.clone(),
        }
    }
}

pub trait MetadataCache: Send + Sync + 'static {
    fn put(&self, metadata: MessageMetadata) -> BoxFuture<'_, Result<(), Error>>;

    /// `Ok(None)` on a miss or an expired entry.
    fn get(&self, id: i64) -> BoxFuture<'_, Result<Option<MessageMetadata>, Error>>;
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl MetadataCache for NoopCache {
    fn put(&self, _metadata: MessageMetadata) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(future::ready(Ok(())))
    }

    fn get(&self, _id: i64) -> BoxFuture<'_, Result<Option<MessageMetadata>, Error>> {
        Box::pin(future::ready(Ok(None)))
    }
}

/// In-process cache with a fixed time-to-live per entry. Expired entries are
/// evicted by the cache's own housekeeping, whether or not they are read.
#[derive(Clone)]
pub struct InMemoryCache {
    entries: Cache<i64, MessageMetadata>,
}

impl InMemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Approximate; pending evictions are only reflected after housekeeping.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs pending evictions now instead of on the next cache operation.
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }
}

impl MetadataCache for InMemoryCache {
    fn put(&self, metadata: MessageMetadata) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.entries.insert(metadata.id, metadata).await;
            Ok(())
        })
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Result<Option<MessageMetadata>, Error>> {
        Box::pin(async move { Ok(self.entries.get(&id).await) })
    }
}
