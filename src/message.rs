//! Message types and status management for webhook delivery.
//!
//! A message is a single notification bound for one webhook endpoint. It is
//! created `Pending`, and each delivery cycle moves it to `Sent` or `Failed`.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Pending` status with `retry_count = 0`
//! 2. A successful delivery moves them to `Sent`, which is final
//! 3. A failed delivery moves them to `Failed` and bumps `retry_count`
//! 4. `Failed` messages are picked up again until `retry_count` reaches
//!    `max_retries`, after which they stay `Failed` with their last error

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Retry budget applied when a request does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Represents the current status of a message.
///
/// Legal transitions:
/// `Pending` -> `Sent`
/// `Pending` -> `Failed`
/// `Failed`  -> `Failed` (another failed cycle)
/// `Failed`  -> `Sent`
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text")]
pub enum MessageStatus {
    /// Waiting for its first delivery cycle
    #[serde(rename = "pending")]
    #[sqlx(rename = "pending")]
    #[strum(serialize = "pending")]
    Pending,
    /// Accepted by the endpoint
    #[serde(rename = "sent")]
    #[sqlx(rename = "sent")]
    #[strum(serialize = "sent")]
    Sent,
    /// Last delivery cycle failed; may be retried while budget remains
    #[serde(rename = "failed")]
    #[sqlx(rename = "failed")]
    #[strum(serialize = "failed")]
    Failed,
}

/// A notification and its delivery state.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Message {
    /// Database-assigned, strictly increasing identifier
    pub id: i64,
    pub recipient: String,
    pub content: String,
    /// Delivery target. Empty means "no target": delivery is a no-op success.
    pub webhook_url: String,

    pub status: MessageStatus,
    /// Number of failed delivery cycles so far
    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Message {
    /// Whether a failed message still has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.status == MessageStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the message is eligible for a delivery cycle at all.
    pub fn is_deliverable(&self) -> bool {
        self.status == MessageStatus::Pending || self.can_retry()
    }
}

/// Input for creating a message.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateMessageRequest {
    pub recipient: String,
    pub content: String,
    pub webhook_url: String,
    /// `None` or zero selects [`DEFAULT_MAX_RETRIES`].
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateMessageRequest {
    pub fn effective_max_retries(&self) -> u32 {
        match self.max_retries {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_RETRIES,
        }
    }
}
