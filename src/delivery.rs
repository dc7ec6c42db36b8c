//! Webhook delivery: one delivery cycle per call, with internal retries.
//!
//! A delivery cycle POSTs the message payload to its endpoint, classifies the
//! response, and retries retryable outcomes according to a [`BackoffPolicy`].
//! Only the classification leaves this module; callers see a
//! [`DeliveryError`] and ask it [`DeliveryError::is_retryable`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::time::Instant;
use url::Url;

use crate::message::Message;

pub mod backoff;

pub use backoff::{BackoffPolicy, JitterOffset};

const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Most of a response body kept for error messages.
const MAX_ERROR_BODY: usize = 1024;

/// Decodes at most [`MAX_ERROR_BODY`] bytes of `bytes`, replacing a
/// multi-byte character split by the cut.
fn body_prefix(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).into_owned()
}

/// Body POSTed to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub message_id: i64,
    pub recipient: String,
    pub content: String,
    /// The message's status at send time.
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// Time of this attempt. Not necessarily committed to the store.
    pub sent_at: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn for_attempt(message: &Message) -> Self {
        Self {
            message_id: message.id,
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            status: message.status.to_string(),
            created_at: message.created_at,
            sent_at: Utc::now(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeliveryError {
    #[snafu(display("webhook delivery failed with status {status}: {body}"))]
    Rejected { status: u16, body: String },

    #[snafu(display("webhook delivery failed with server error {status}: {body}"))]
    ServerError { status: u16, body: String },

    #[snafu(display("webhook delivery failed with unexpected status {status}: {body}"))]
    UnexpectedStatus { status: u16, body: String },

    #[snafu(display("HTTP request to {url} failed: {source}"))]
    Transport { url: String, source: reqwest::Error },

    #[snafu(display("invalid webhook URL {url}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("delivery timed out"))]
    Timeout,

    #[snafu(display("delivery deadline already passed"))]
    DeadlineExceeded,
}

impl DeliveryError {
    /// Server errors, transport failures and timeouts may succeed on a later
    /// attempt; 4xx responses and malformed targets never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServerError { .. }
            | Self::Transport { .. }
            | Self::Timeout
            | Self::DeadlineExceeded => true,

            Self::Rejected { .. } | Self::UnexpectedStatus { .. } | Self::InvalidUrl { .. } => {
                false
            }
        }
    }

    /// Maps an HTTP response status to a delivery outcome.
    pub fn classify(status: u16, body: String) -> Result<(), Self> {
        match status {
            200..=299 => Ok(()),
            400..=499 => Err(Self::Rejected { status, body }),
            500..=599 => Err(Self::ServerError { status, body }),
            _ => Err(Self::UnexpectedStatus { status, body }),
        }
    }
}

/// Something that can run a delivery cycle for a message.
pub trait Deliver: Send + Sync + 'static {
    /// Delivers `message`, giving up at `deadline`.
    fn send<'a>(
        &'a self,
        message: &'a Message,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Delivery that always succeeds without doing anything. Used when no
/// delivery client is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelivery;

impl Deliver for NoopDelivery {
    fn send<'a>(
        &'a self,
        message: &'a Message,
        _deadline: Instant,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            tracing::debug!(
                message_id = message.id,
                "no delivery client configured, skipping webhook"
            );
            Ok(())
        })
    }
}

/// HTTP webhook client.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    policy: BackoffPolicy,
}

impl WebhookClient {
    /// `request_timeout` bounds each individual HTTP attempt.
    pub fn new(policy: BackoffPolicy, request_timeout: Duration) -> Result<Self, crate::error::Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(crate::error::Error::internal)?;

        Ok(Self { http, policy })
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    #[tracing::instrument(skip(self, message), fields(message_id = message.id))]
    async fn deliver(&self, message: &Message, deadline: Instant) -> Result<(), DeliveryError> {
        if message.webhook_url.is_empty() {
            tracing::debug!("no webhook URL, skipping delivery");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(DeliveryError::DeadlineExceeded);
        }

        let url = Url::parse(&message.webhook_url).context(InvalidUrlSnafu {
            url: message.webhook_url.clone(),
        })?;

        match tokio::time::timeout_at(deadline, self.attempt_with_retries(&url, message)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(url = %url, "delivery cycle hit its deadline");
                Err(DeliveryError::Timeout)
            }
        }
    }

    async fn attempt_with_retries(&self, url: &Url, message: &Message) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let mut retry = 0;

        loop {
            let err = match self.attempt(url, &WebhookPayload::for_attempt(message)).await {
                Ok(()) => {
                    tracing::info!(url = %url, attempts = retry + 1, "webhook delivered");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(url = %url, error = %e, "webhook rejected");
                    return Err(e);
                }
                Err(e) => e,
            };

            let offset = self.policy.sample_jitter(&mut rand::thread_rng());

            let Some(wait) = self.policy.next_wait(retry, started.elapsed(), offset) else {
                tracing::warn!(
                    url = %url,
                    attempts = retry + 1,
                    error = %err,
                    "webhook delivery exhausted its retries"
                );
                return Err(err);
            };

            tracing::warn!(
                url = %url,
                attempt = retry + 1,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "webhook delivery failed, will retry"
            );

            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    async fn attempt(&self, url: &Url, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        tracing::debug!(url = %url, "sending webhook request");

        let mut resp = self
            .http
            .post(url.clone())
            .json(payload)
            .send()
            .await
            .context(TransportSnafu {
                url: url.to_string(),
            })?;

        let status = resp.status().as_u16();

        // Read only as much of the body as an error message can hold.
        let mut buf = Vec::new();
        while buf.len() < MAX_ERROR_BODY {
            match resp.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) | Err(_) => break,
            }
        }
        let body = body_prefix(&buf);

        tracing::debug!(url = %url, status, "webhook response received");

        DeliveryError::classify(status, body)
    }
}

impl Deliver for WebhookClient {
    fn send<'a>(
        &'a self,
        message: &'a Message,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(self.deliver(message, deadline))
    }
}
