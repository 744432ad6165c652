//! Work queues with visibility timeouts, backed by SQLite.
//!
//! A dequeued message disappears for the visibility interval; if the consumer
//! does not acknowledge it in time it reappears, possibly to another
//! consumer. Acknowledgement requires the pop receipt issued at dequeue, so a
//! stale claim cannot delete a re-delivered message. There is no total
//! ordering guarantee, only an approximate arrival order.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::message::WorkMessage;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue gateway. All named queues share one table; the pipeline uses three
/// independent queues (validation, transfer, cleanup).
#[derive(Clone)]
pub struct WorkQueue {
    db: SqlitePool,
}

impl WorkQueue {
    pub async fn new(db: SqlitePool) -> QueueResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                 id TEXT PRIMARY KEY,
                 queue TEXT NOT NULL,
                 body TEXT NOT NULL,
                 enqueued_at INTEGER NOT NULL,
                 visible_at INTEGER NOT NULL,
                 dequeue_count INTEGER NOT NULL DEFAULT 0,
                 pop_receipt TEXT NOT NULL DEFAULT ''
             )",
        )
        .execute(&db)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_visible
             ON queue_messages (queue, visible_at, enqueued_at)",
        )
        .execute(&db)
        .await?;
        Ok(Self { db })
    }

    /// Append a message; returns its id.
    pub async fn enqueue(&self, queue: &str, body: &str) -> QueueResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, body, enqueued_at, visible_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(queue)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(id)
    }

    /// Claim up to `max` visible messages, hiding each for `visibility`.
    ///
    /// The whole batch is claimed in one statement, so concurrent consumers
    /// never receive the same delivery and a single call never claims a
    /// message twice, even with a zero visibility timeout. Every claim
    /// rotates the batch's pop receipt and bumps each message's dequeue
    /// count.
    pub async fn dequeue(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> QueueResult<Vec<WorkMessage>> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now + visibility.as_millis() as i64;
        let receipt = Uuid::new_v4().to_string();
        let messages = sqlx::query_as::<_, WorkMessage>(
            "UPDATE queue_messages
             SET visible_at = ?, dequeue_count = dequeue_count + 1, pop_receipt = ?
             WHERE id IN (
                 SELECT id FROM queue_messages
                 WHERE queue = ? AND visible_at <= ?
                 ORDER BY enqueued_at ASC, id ASC
                 LIMIT ?
             )
             RETURNING id, pop_receipt, body, dequeue_count",
        )
        .bind(visible_at)
        .bind(&receipt)
        .bind(queue)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(messages)
    }

    /// Acknowledge a delivery. Returns `false` when the receipt is stale or
    /// the message is already gone; both are benign for the caller.
    pub async fn delete(&self, queue: &str, id: &str, pop_receipt: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE queue = ? AND id = ? AND pop_receipt = ?",
        )
        .bind(queue)
        .bind(id)
        .bind(pop_receipt)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total messages in a queue, visible or not.
    pub async fn depth(&self, queue: &str) -> QueueResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
                .bind(queue)
                .fetch_one(&self.db)
                .await?;
        Ok(count)
    }
}
