//! pgmq (Postgres message queue) driver via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create / pgmq.create_unlogged,
//! pgmq.send, pgmq.read_with_poll, pgmq.delete (ack), pgmq.archive
//! (terminal reject) and pgmq.set_vt (requeue).
//!
//! Delivery counting comes from pgmq's `read_ct`, so attempt bookkeeping
//! survives consumer restarts without any application state. A delivery that
//! is never settled reappears once its visibility timeout lapses.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Driver, Session};
use crate::destination::QueueOptions;
use crate::error::{Error, Result};
use crate::message::{Message, ReceiptHandle};
use crate::telemetry::metrics;

/// pgmq caps queue names so that its derived table names stay valid.
const MAX_PGMQ_NAME_LEN: usize = 47;

/// Poll interval while waiting for messages, both server-side in
/// `pgmq.read_with_poll` and client-side below one second.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map a logical queue name to a pgmq identifier.
///
/// Lowercases and replaces every character outside `[a-z0-9_]` with `_`.
/// Distinct logical names can collide after mapping (`a.b` and `a_b`).
pub fn pgmq_queue_name(queue: &str) -> Result<String> {
    let mapped: String = queue
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if mapped.is_empty() || mapped.len() > MAX_PGMQ_NAME_LEN {
        return Err(Error::Config(format!(
            "queue name {queue:?} does not fit pgmq's {MAX_PGMQ_NAME_LEN}-character limit"
        )));
    }
    Ok(mapped)
}

/// Whole seconds of delivery delay, rounded up, as pgmq expects.
fn delay_seconds(delay_ms: Option<u64>) -> Result<i32> {
    let Some(ms) = delay_ms else {
        return Ok(0);
    };
    i32::try_from(ms.div_ceil(1000))
        .map_err(|_| Error::Other(format!("delivery delay of {ms}ms exceeds pgmq's limit")))
}

fn record_operation(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Postgres-backed [`Driver`].
#[derive(Clone)]
pub struct PgmqDriver {
    pool: PgPool,
    /// Seconds a received message stays invisible to other consumers.
    visibility_timeout: i32,
}

impl PgmqDriver {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, visibility_timeout: i32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            visibility_timeout,
        })
    }

    /// Install the pgmq extension if missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for PgmqDriver {
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let name = pgmq_queue_name(queue)?;
        if options.priority {
            debug!(queue, "pgmq has no priority delivery; declaring a plain queue");
        }
        let sql = if options.durable {
            "SELECT pgmq.create($1)"
        } else {
            "SELECT pgmq.create_unlogged($1)"
        };
        sqlx::query(sql).bind(&name).execute(&self.pool).await?;
        record_operation(queue, "create");
        Ok(())
    }

    async fn send(&self, queue: &str, message: &Message) -> Result<()> {
        let name = pgmq_queue_name(queue)?;
        let payload = serde_json::to_value(message)?;
        let delay_seconds = delay_seconds(message.headers.delay_ms)?;

        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&name)
            .bind(&payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        debug!(queue, msg_id = row.0, message_id = %message.id, "message enqueued");
        record_operation(queue, "send");
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(PgmqSession {
            pool: self.pool.clone(),
            visibility_timeout: self.visibility_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "pgmq"
    }
}

/// Session over a pgmq connection pool.
pub struct PgmqSession {
    pool: PgPool,
    visibility_timeout: i32,
}

type ReadRow = (i64, i32, serde_json::Value);

impl PgmqSession {
    /// Read at most one message without waiting past `deadline`.
    ///
    /// `pgmq.read_with_poll` only takes whole seconds, so it polls for the
    /// full seconds left; under one second remaining, a plain `pgmq.read`
    /// is used and the caller sleeps between attempts.
    async fn read_one(&self, name: &str, deadline: Instant) -> Result<Option<ReadRow>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let poll_seconds = i32::try_from(remaining.as_secs()).unwrap_or(i32::MAX);

        let row = if poll_seconds >= 1 {
            sqlx::query_as::<_, ReadRow>(
                "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, 1, $3, $4)",
            )
            .bind(name)
            .bind(self.visibility_timeout)
            .bind(poll_seconds)
            .bind(POLL_INTERVAL.as_millis() as i32)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, ReadRow>(
                "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
            )
            .bind(name)
            .bind(self.visibility_timeout)
            .fetch_optional(&self.pool)
            .await?
        };
        Ok(row)
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(pgmq_queue_name(queue)?)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_operation(queue, "archive");
        Ok(())
    }
}

#[async_trait]
impl Session for PgmqSession {
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        let name = pgmq_queue_name(queue)?;
        let deadline = Instant::now() + timeout;

        loop {
            let row = self.read_one(&name, deadline).await?;

            let Some((msg_id, read_ct, payload)) = row else {
                if Instant::now() >= deadline {
                    record_operation(queue, "read_empty");
                    return Ok(None);
                }
                tokio::time::sleep(
                    deadline
                        .saturating_duration_since(Instant::now())
                        .min(POLL_INTERVAL),
                )
                .await;
                continue;
            };
            record_operation(queue, "read");

            let mut message: Message = match serde_json::from_value(payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(queue, msg_id, error = %e, "undecodable payload, archiving");
                    self.archive(queue, msg_id).await?;
                    continue;
                }
            };

            if message.is_expired(chrono::Utc::now()) {
                debug!(queue, msg_id, message_id = %message.id, "message expired, archiving");
                self.archive(queue, msg_id).await?;
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            }

            let read_ct = u32::try_from(read_ct).unwrap_or(0);
            message.delivery_count = read_ct;
            message.redelivered = read_ct > 1;
            message.receipt = Some(ReceiptHandle {
                queue: queue.to_string(),
                id: msg_id,
            });
            return Ok(Some(message));
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        let receipt = message.receipt()?;
        let (deleted,): (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(pgmq_queue_name(&receipt.queue)?)
            .bind(receipt.id)
            .fetch_one(&self.pool)
            .await?;
        if !deleted {
            warn!(queue = %receipt.queue, msg_id = receipt.id, "acknowledged message was already gone");
        }
        record_operation(&receipt.queue, "delete");
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        let receipt = message.receipt()?;
        if requeue {
            sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, 0)")
                .bind(pgmq_queue_name(&receipt.queue)?)
                .bind(receipt.id)
                .execute(&self.pool)
                .await?;
            record_operation(&receipt.queue, "requeue");
            Ok(())
        } else {
            self.archive(&receipt.queue, receipt.id).await
        }
    }
}
