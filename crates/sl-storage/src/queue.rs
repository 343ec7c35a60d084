//! Embedded message queue
//!
//! One durable FIFO queue per workflow, living in the same Postgres database
//! as the workflow state. Delivery uses a visibility timeout: reading a
//! message pushes its `vt` forward so no other reader sees it until the
//! timeout lapses or the claimer deletes it. VT expiry is the sole recovery
//! path for crashed workers.

use crate::pool::DbPool;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Row};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Queue failure taxonomy. `Transient` calls may be retried by the caller;
/// `Missing` means the queue must be (re-)created first.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("transient queue backend error: {0}")]
    Transient(String),

    #[error("missing queue: {0}")]
    Missing(String),
}

impl QueueError {
    fn from_sqlx(queue: &str, e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // Foreign-key violation on queue_name means the queue row is gone.
            if db.code().as_deref() == Some("23503") {
                return QueueError::Missing(queue.to_string());
            }
        }
        QueueError::Transient(e.to_string())
    }
}

/// A delivered message. `vt_expires_at` is the moment other readers may see
/// it again if it is not deleted first.
#[derive(Debug, Clone)]
pub struct QueueMessage<T> {
    pub msg_id: i64,
    pub body: T,
    pub enqueued_at: DateTime<Utc>,
    pub vt_expires_at: DateTime<Utc>,
}

/// Task payload carried on workflow queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i32,
}

/// Postgres-backed queue client.
///
/// Cheap to clone; all operations go through the shared pool. Enqueues that
/// must be atomic with scheduler transactions use the `*_in_tx` entry points.
#[derive(Clone)]
pub struct Queue {
    pool: DbPool,
}

impl Queue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Idempotently create a queue.
    #[instrument(skip(self))]
    pub async fn ensure(&self, queue: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO queues (queue_name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Enqueue a message; returns its monotone message id.
    ///
    /// On a missing queue the adapter ensures it and retries once.
    #[instrument(skip(self, body))]
    pub async fn enqueue<T: Serialize>(&self, queue: &str, body: &T) -> Result<i64, QueueError> {
        match self.enqueue_once(queue, body).await {
            Err(QueueError::Missing(_)) => {
                self.ensure(queue).await?;
                self.enqueue_once(queue, body).await
            }
            other => other,
        }
    }

    async fn enqueue_once<T: Serialize>(&self, queue: &str, body: &T) -> Result<i64, QueueError> {
        let payload =
            serde_json::to_value(body).map_err(|e| QueueError::Transient(e.to_string()))?;
        let msg_id: i64 = sqlx::query_scalar(
            "INSERT INTO queue_messages (queue_name, message) VALUES ($1, $2) RETURNING msg_id",
        )
        .bind(queue)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::from_sqlx(queue, e))?;

        debug!(queue = %queue, msg_id, "Enqueued message");
        Ok(msg_id)
    }

    /// Read up to `quantity` visible messages, long-polling for at most
    /// `max_poll` and sleeping `poll_interval` between attempts. Every
    /// returned message is invisible to other readers for `vt`.
    #[instrument(skip(self))]
    pub async fn read_with_poll<T: DeserializeOwned>(
        &self,
        queue: &str,
        vt: Duration,
        quantity: usize,
        max_poll: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<QueueMessage<T>>, QueueError> {
        let deadline = Instant::now() + max_poll;
        loop {
            let batch = self.read_batch(queue, vt, quantity).await?;
            if !batch.is_empty() || Instant::now() + poll_interval > deadline {
                return Ok(batch);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn read_batch<T: DeserializeOwned>(
        &self,
        queue: &str,
        vt: Duration,
        quantity: usize,
    ) -> Result<Vec<QueueMessage<T>>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages m
            SET vt = now() + make_interval(secs => $2),
                read_count = read_count + 1
            FROM (
                SELECT msg_id FROM queue_messages
                WHERE queue_name = $1 AND vt <= now()
                ORDER BY msg_id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) visible
            WHERE m.msg_id = visible.msg_id
            RETURNING m.msg_id, m.message, m.enqueued_at, m.vt
            "#,
        )
        .bind(queue)
        .bind(vt.as_secs_f64())
        .bind(quantity as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::from_sqlx(queue, e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let body: serde_json::Value = row.get("message");
            let body =
                serde_json::from_value(body).map_err(|e| QueueError::Transient(e.to_string()))?;
            messages.push(QueueMessage {
                msg_id: row.get("msg_id"),
                body,
                enqueued_at: row.get("enqueued_at"),
                vt_expires_at: row.get("vt"),
            });
        }

        debug!(queue = %queue, count = messages.len(), "Read messages");
        Ok(messages)
    }

    /// Acknowledge a message.
    #[instrument(skip(self))]
    pub async fn delete(&self, queue: &str, msg_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE queue_name = $1 AND msg_id = $2")
            .bind(queue)
            .bind(msg_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::from_sqlx(queue, e))?;
        Ok(())
    }

    /// Idempotent teardown: removes the queue and every message on it.
    #[instrument(skip(self))]
    pub async fn drop_queue(&self, queue: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queues WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Depth of a queue (visible and in-flight messages).
    #[instrument(skip(self))]
    pub async fn len(&self, queue: &str) -> Result<i64, QueueError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::from_sqlx(queue, e))
    }
}

/// Idempotently create a queue inside an open transaction.
pub async fn ensure_in_tx(conn: &mut PgConnection, queue: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO queues (queue_name) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(queue)
        .execute(conn)
        .await?;
    Ok(())
}

/// Enqueue inside an open transaction, so messages land atomically with the
/// scheduler's state changes. Ensures the queue row first; a failed statement
/// would otherwise poison the surrounding transaction.
pub async fn enqueue_in_tx(
    conn: &mut PgConnection,
    queue: &str,
    body: &TaskMessage,
) -> Result<i64, sqlx::Error> {
    ensure_in_tx(&mut *conn, queue).await?;
    let payload = serde_json::to_value(body).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query_scalar(
        "INSERT INTO queue_messages (queue_name, message) VALUES ($1, $2) RETURNING msg_id",
    )
    .bind(queue)
    .bind(&payload)
    .fetch_one(conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_message_round_trips_as_json() {
        let msg = TaskMessage {
            run_id: Uuid::from_u128(7),
            step_slug: "process".to_string(),
            task_index: 2,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["step_slug"], json!("process"));
        assert_eq!(value["task_index"], json!(2));
        let back: TaskMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
