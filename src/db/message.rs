//! Durable message storage and the claim protocol.
//!
//! SQLite has no row locks, so exclusivity is a lease: claiming a row stamps
//! `claimed_until` and a random `claim_token` in the same statement that
//! selects it, and other claimers skip rows whose lease is still live. The
//! statement is a single `UPDATE ... WHERE id IN (SELECT ...) RETURNING`,
//! which SQLite executes atomically under its database write lock, so
//! concurrent claimers (other connections, other pools, other processes)
//! always see disjoint rows.
//!
//! A claimer renews the lease with its token right before working on a row
//! and finishes with the `*_claimed` transitions, which also check the token.
//! If the lease ran out and someone else took the row, both fail with
//! [`Error::ClaimLost`] and leave the new owner's lease alone. Rows of a
//! claimer that died become eligible again once the lease expires.

use std::{ops::Deref, time::Duration};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    message::{CreateMessageRequest, Message, MessageStatus},
};

const COLUMNS: &str = "id, recipient, content, webhook_url, status, retry_count, max_retries, \
                       created_at, updated_at, sent_at, failed_at, error_message";

/// Default lease held by a claimer before its rows become claimable again.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

/// Identifies one claim. Only the holder of the current token may renew,
/// release or complete a claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(i64);

impl ClaimToken {
    fn generate() -> Self {
        Self(rand::random())
    }
}

/// Messages handed out by one claim, all leased under the same token.
#[derive(Debug)]
pub struct Claim {
    token: ClaimToken,
    messages: Vec<Message>,
}

impl Claim {
    pub fn token(&self) -> ClaimToken {
        self.token
    }

    pub fn into_parts(self) -> (ClaimToken, Vec<Message>) {
        (self.token, self.messages)
    }
}

impl Deref for Claim {
    type Target = [Message];

    fn deref(&self) -> &Self::Target {
        &self.messages
    }
}

impl IntoIterator for Claim {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

fn to_sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct MessageStore {
    db: SqlitePool,
    lease: Duration,
}

impl MessageStore {
    pub fn new(db: SqlitePool) -> Self {
        Self::with_lease(db, DEFAULT_CLAIM_LEASE)
    }

    pub fn with_lease(db: SqlitePool, lease: Duration) -> Self {
        Self { db, lease }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lease_until(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX))
    }

    /// Persists a new `pending` message. No validation happens here.
    pub async fn create(&self, req: &CreateMessageRequest) -> Result<Message, Error> {
        let now = Utc::now();

        let message = sqlx::query_as::<_, Message>(&format!(
            "
            INSERT INTO messages
                (recipient, content, webhook_url, status, retry_count, max_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)
            RETURNING {COLUMNS}
            "
        ))
        .bind(&req.recipient)
        .bind(&req.content)
        .bind(&req.webhook_url)
        .bind(MessageStatus::Pending)
        .bind(req.effective_max_retries())
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(message)
    }

    /// Claims up to `limit` pending or retryable messages, oldest created first.
    ///
    /// Rows leased by another claimer are skipped, never waited on.
    pub async fn claim_batch(&self, limit: usize) -> Result<Claim, Error> {
        let mut claim = self
            .claim_where(
                "status = 'pending' OR (status = 'failed' AND retry_count < max_retries)",
                "created_at ASC, id ASC",
                limit,
            )
            .await?;

        claim
            .messages
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(claim)
    }

    /// Claims up to `limit` failed messages with retry budget left, oldest
    /// failure first.
    pub async fn claim_retryable(&self, limit: usize) -> Result<Claim, Error> {
        let mut claim = self
            .claim_where(
                "status = 'failed' AND retry_count < max_retries",
                "failed_at ASC, id ASC",
                limit,
            )
            .await?;

        claim
            .messages
            .sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.id.cmp(&b.id)));

        Ok(claim)
    }

    async fn claim_where(&self, filter: &str, order: &str, limit: usize) -> Result<Claim, Error> {
        let token = ClaimToken::generate();

        if limit == 0 {
            return Ok(Claim {
                token,
                messages: Vec::new(),
            });
        }

        let now = Utc::now().timestamp_millis();

        // RETURNING does not preserve the subquery order; callers re-sort.
        let messages = sqlx::query_as::<_, Message>(&format!(
            "
            UPDATE messages
            SET claimed_until = ?1, claim_token = ?4
            WHERE id IN (
                SELECT id FROM messages
                WHERE ({filter})
                  AND (claimed_until IS NULL OR claimed_until <= ?2)
                ORDER BY {order}
                LIMIT ?3
            )
            RETURNING {COLUMNS}
            "
        ))
        .bind(self.lease_until(now))
        .bind(now)
        .bind(to_sql_int(limit))
        .bind(token.0)
        .fetch_all(&self.db)
        .await?;

        tracing::debug!(count = messages.len(), limit, "claimed messages");

        Ok(Claim { token, messages })
    }

    /// Extends the lease on a claimed message by a full lease period.
    ///
    /// Returns `false` when `token` no longer owns the row, in which case the
    /// caller must leave the message alone.
    pub async fn renew(&self, id: i64, token: ClaimToken) -> Result<bool, Error> {
        let now = Utc::now().timestamp_millis();

        let res = sqlx::query(
            "UPDATE messages SET claimed_until = ?1 WHERE id = ?2 AND claim_token = ?3",
        )
        .bind(self.lease_until(now))
        .bind(id)
        .bind(token.0)
        .execute(&self.db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Drops the lease on a claimed message without changing its state.
    pub async fn release(&self, id: i64, token: ClaimToken) -> Result<(), Error> {
        let res = sqlx::query(
            "
            UPDATE messages SET claimed_until = NULL, claim_token = NULL
            WHERE id = ?1 AND claim_token = ?2
            ",
        )
        .bind(id)
        .bind(token.0)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            self.get_by_id(id).await?;
            return Err(Error::ClaimLost { id });
        }

        Ok(())
    }

    /// Moves a message to `sent` and drops its lease.
    ///
    /// Repeating the call on a sent message succeeds and keeps the original
    /// `sent_at`.
    pub async fn mark_sent(&self, id: i64) -> Result<(), Error> {
        self.set_sent(id, None).await
    }

    /// Like [`MessageStore::mark_sent`], but only while `token` still owns the
    /// row.
    pub async fn mark_sent_claimed(&self, id: i64, token: ClaimToken) -> Result<(), Error> {
        self.set_sent(id, Some(token)).await
    }

    async fn set_sent(&self, id: i64, token: Option<ClaimToken>) -> Result<(), Error> {
        let now = Utc::now();

        let res = sqlx::query(
            "
            UPDATE messages
            SET sent_at = CASE
                    WHEN status = 'sent' AND sent_at IS NOT NULL THEN sent_at
                    ELSE ?1
                END,
                status = 'sent',
                updated_at = ?1,
                claimed_until = NULL,
                claim_token = NULL
            WHERE id = ?2 AND (?3 IS NULL OR claim_token = ?3)
            ",
        )
        .bind(now)
        .bind(id)
        .bind(token.map(|t| t.0))
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            self.get_by_id(id).await?;
            return Err(Error::ClaimLost { id });
        }

        Ok(())
    }

    /// Moves a message to `failed`, bumps `retry_count` and records the error.
    ///
    /// Sent messages are immutable and are rejected.
    pub async fn mark_failed(&self, id: i64, error_message: &str) -> Result<(), Error> {
        self.set_failed(id, None, error_message).await
    }

    /// Like [`MessageStore::mark_failed`], but only while `token` still owns
    /// the row.
    pub async fn mark_failed_claimed(
        &self,
        id: i64,
        token: ClaimToken,
        error_message: &str,
    ) -> Result<(), Error> {
        self.set_failed(id, Some(token), error_message).await
    }

    async fn set_failed(
        &self,
        id: i64,
        token: Option<ClaimToken>,
        error_message: &str,
    ) -> Result<(), Error> {
        let now = Utc::now();

        let res = sqlx::query(
            "
            UPDATE messages
            SET status = 'failed',
                retry_count = retry_count + 1,
                error_message = ?1,
                failed_at = ?2,
                updated_at = ?2,
                claimed_until = NULL,
                claim_token = NULL
            WHERE id = ?3 AND status != 'sent' AND (?4 IS NULL OR claim_token = ?4)
            ",
        )
        .bind(error_message)
        .bind(now)
        .bind(id)
        .bind(token.map(|t| t.0))
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            let existing = self.get_by_id(id).await?;
            if existing.status == MessageStatus::Sent {
                return Err(Error::invalid_parameter(format!(
                    "message {} is {} and cannot be marked failed",
                    existing.id, existing.status
                )));
            }
            return Err(Error::ClaimLost { id });
        }

        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Message, Error> {
        sqlx::query_as::<_, Message>(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    /// Sent messages, newest first, plus the total number of sent messages.
    pub async fn list_sent(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, u64), Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'sent'")
            .fetch_one(&self.db)
            .await?;

        let query = format!(
            "
            SELECT {COLUMNS} FROM messages
            WHERE status = 'sent'
            ORDER BY sent_at DESC, id DESC
            LIMIT ?1 OFFSET ?2
            "
        );

        let mut stream = sqlx::query_as::<_, Message>(&query)
            .bind(to_sql_int(limit))
            .bind(to_sql_int(offset))
            .fetch(&self.db);

        let mut messages = Vec::with_capacity(limit.min(100));

        while let Some(message) = stream.next().await.transpose()? {
            messages.push(message);
        }

        Ok((messages, total as u64))
    }

    /// Failed messages with retry budget left, oldest failure first. Does not
    /// claim anything.
    pub async fn list_retryable(&self, limit: usize) -> Result<Vec<Message>, Error> {
        Ok(sqlx::query_as::<_, Message>(&format!(
            "
            SELECT {COLUMNS} FROM messages
            WHERE status = 'failed' AND retry_count < max_retries
            ORDER BY failed_at ASC, id ASC
            LIMIT ?1
            "
        ))
        .bind(to_sql_int(limit))
        .fetch_all(&self.db)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::TempDir;

    use super::*;

    async fn setup() -> (MessageStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let pool = crate::db::connect(path.to_string_lossy()).await.unwrap();

        (MessageStore::new(pool), dir)
    }

    fn request(n: usize) -> CreateMessageRequest {
        CreateMessageRequest {
            recipient: format!("user{n}@example.com"),
            content: format!("message {n}"),
            webhook_url: "http://localhost/hook".to_owned(),
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let (store, _dir) = setup().await;

        let msg = store.create(&request(1)).await.unwrap();

        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert_eq!(msg.recipient, "user1@example.com");
        assert!(msg.sent_at.is_none());
        assert!(msg.failed_at.is_none());
        assert!(msg.error_message.is_none());

        let second = store.create(&request(2)).await.unwrap();
        assert!(second.id > msg.id);
    }

    #[tokio::test]
    async fn test_create_explicit_max_retries() {
        let (store, _dir) = setup().await;

        let mut req = request(1);
        req.max_retries = Some(7);

        assert_eq!(store.create(&req).await.unwrap().max_retries, 7);

        req.max_retries = Some(0);
        assert_eq!(store.create(&req).await.unwrap().max_retries, 3);
    }

    #[tokio::test]
    async fn test_get_by_id_not_found() {
        let (store, _dir) = setup().await;

        let err = store.get_by_id(42).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mark_sent() {
        let (store, _dir) = setup().await;
        let msg = store.create(&request(1)).await.unwrap();

        store.mark_sent(msg.id).await.unwrap();

        let sent = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        let first_sent_at = sent.sent_at.unwrap();

        // Repeating is allowed and does not move sent_at.
        store.mark_sent(msg.id).await.unwrap();
        let again = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(again.status, MessageStatus::Sent);
        assert_eq!(again.sent_at.unwrap(), first_sent_at);

        assert!(store.mark_sent(9999).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mark_failed_increments() {
        let (store, _dir) = setup().await;
        let msg = store.create(&request(1)).await.unwrap();

        store.mark_failed(msg.id, "first").await.unwrap();
        let failed = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("first"));
        let first_failed_at = failed.failed_at.unwrap();

        store.mark_failed(msg.id, "second").await.unwrap();
        let failed = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.error_message.as_deref(), Some("second"));
        assert!(failed.failed_at.unwrap() >= first_failed_at);

        assert!(store
            .mark_failed(9999, "nope")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_sent_is_immutable() {
        let (store, _dir) = setup().await;
        let msg = store.create(&request(1)).await.unwrap();

        store.mark_sent(msg.id).await.unwrap();

        let err = store.mark_failed(msg.id, "late failure").await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));

        let msg = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.retry_count, 0);
    }

    #[tokio::test]
    async fn test_claim_order_and_lease() {
        let (store, _dir) = setup().await;

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.create(&request(n)).await.unwrap().id);
        }

        let first = store.claim_batch(2).await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.id).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );

        // Leased rows are skipped.
        let second = store.claim_batch(10).await.unwrap();
        assert_eq!(
            second.iter().map(|m| m.id).collect::<Vec<_>>(),
            ids[2..].to_vec()
        );

        assert!(store.claim_batch(10).await.unwrap().is_empty());

        // Releasing hands the row back.
        store.release(ids[0], first.token()).await.unwrap();
        let third = store.claim_batch(10).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id, ids[0]);
    }

    #[tokio::test]
    async fn test_renew_requires_current_token() {
        let (store, _dir) = setup().await;
        let store = MessageStore::with_lease(store.db().clone(), Duration::from_millis(50));

        let msg = store.create(&request(1)).await.unwrap();

        let stale = store.claim_batch(1).await.unwrap();
        assert!(store.renew(msg.id, stale.token()).await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;

        // The lease ran out and another claimer took the row.
        let fresh = store.claim_batch(1).await.unwrap();
        assert_eq!(fresh.len(), 1);

        assert!(!store.renew(msg.id, stale.token()).await.unwrap());
        assert!(store.renew(msg.id, fresh.token()).await.unwrap());

        // The stale claimer cannot complete, release, or clear the new lease.
        let err = store
            .mark_sent_claimed(msg.id, stale.token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimLost { id } if id == msg.id));
        let err = store
            .mark_failed_claimed(msg.id, stale.token(), "late")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimLost { .. }));
        assert!(matches!(
            store.release(msg.id, stale.token()).await.unwrap_err(),
            Error::ClaimLost { .. }
        ));
        assert!(store.claim_batch(1).await.unwrap().is_empty());

        let current = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(current.status, MessageStatus::Pending);
        assert_eq!(current.retry_count, 0);

        store
            .mark_sent_claimed(msg.id, fresh.token())
            .await
            .unwrap();
        assert_eq!(
            store.get_by_id(msg.id).await.unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_list_sent_huge_offset() {
        let (store, _dir) = setup().await;

        let msg = store.create(&request(1)).await.unwrap();
        store.mark_sent(msg.id).await.unwrap();

        let (page, total) = store.list_sent(usize::MAX, 10).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_claim_skips_sent_and_exhausted() {
        let (store, _dir) = setup().await;

        let sent = store.create(&request(1)).await.unwrap();
        store.mark_sent(sent.id).await.unwrap();

        let mut req = request(2);
        req.max_retries = Some(1);
        let exhausted = store.create(&req).await.unwrap();
        store.mark_failed(exhausted.id, "boom").await.unwrap();

        let retryable = store.create(&request(3)).await.unwrap();
        store.mark_failed(retryable.id, "boom").await.unwrap();

        let pending = store.create(&request(4)).await.unwrap();

        let claimed: Vec<i64> = store
            .claim_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();

        assert_eq!(claimed, vec![retryable.id, pending.id]);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (store, _dir) = setup().await;
        let store = MessageStore::with_lease(store.db().clone(), Duration::from_millis(50));

        let msg = store.create(&request(1)).await.unwrap();

        assert_eq!(store.claim_batch(1).await.unwrap().len(), 1);
        assert!(store.claim_batch(1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;

        let reclaimed = store.claim_batch(1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, msg.id);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let (store, _dir) = setup().await;

        let mut req = request(1);
        req.max_retries = Some(2);
        let msg = store.create(&req).await.unwrap();

        store.mark_failed(msg.id, "one").await.unwrap();
        let listed = store.list_retryable(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].can_retry());

        store.mark_failed(msg.id, "two").await.unwrap();
        assert!(store.list_retryable(10).await.unwrap().is_empty());
        assert!(store.claim_retryable(10).await.unwrap().is_empty());
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        let msg = store.get_by_id(msg.id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.retry_count, 2);
        assert!(!msg.can_retry());
        assert_eq!(msg.error_message.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_claim_retryable_only_failed() {
        let (store, _dir) = setup().await;

        let pending = store.create(&request(1)).await.unwrap();
        let failed_a = store.create(&request(2)).await.unwrap();
        let failed_b = store.create(&request(3)).await.unwrap();

        store.mark_failed(failed_b.id, "b").await.unwrap();
        store.mark_failed(failed_a.id, "a").await.unwrap();

        let claimed: Vec<i64> = store
            .claim_retryable(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();

        // Oldest failure first.
        assert_eq!(claimed, vec![failed_b.id, failed_a.id]);
        assert!(!claimed.contains(&pending.id));
    }

    #[tokio::test]
    async fn test_list_sent_pagination() {
        let (store, _dir) = setup().await;

        for n in 0..25 {
            let msg = store.create(&request(n)).await.unwrap();
            store.mark_sent(msg.id).await.unwrap();
        }
        // Not counted.
        store.create(&request(99)).await.unwrap();

        let (page, total) = store.list_sent(10, 10).await.unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(total, 25);
        assert!(page.iter().all(|m| m.status == MessageStatus::Sent));

        let sent_at: Vec<_> = page.iter().map(|m| m.sent_at.unwrap()).collect();
        let mut sorted = sent_at.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sent_at, sorted);

        let (tail, total) = store.list_sent(20, 10).await.unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(total, 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let (store, _dir) = setup().await;

        for n in 0..40 {
            store.create(&request(n)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(3).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|m| m.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "message {id} claimed twice");
            }
        }

        assert_eq!(total, 40);
        assert_eq!(seen.len(), 40);
    }
}
