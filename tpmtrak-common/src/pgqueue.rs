//! # PgQueue
//!
//! A message queue implemented on top of a PostgreSQL table. Producers enqueue raw payloads,
//! workers dequeue them one at a time and complete them once handled.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of errors for operations with PgQueue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PgQueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid MessageStatus")]
    ParseMessageStatusError(String),
}

/// Enumeration of possible statuses for a Message.
/// Available: A message that is waiting in the queue to be picked up by a worker.
/// Completed: A message that was handled by a worker, whatever the outcome of handling it.
/// Running: A message that was picked up by a worker and is currently being handled.
#[derive(Debug, PartialEq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "message_status")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageStatus {
    Available,
    Completed,
    Running,
}

/// Allow casting MessageStatus from strings.
impl FromStr for MessageStatus {
    type Err = PgQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(MessageStatus::Available),
            "completed" => Ok(MessageStatus::Completed),
            "running" => Ok(MessageStatus::Running),
            invalid => Err(PgQueueError::ParseMessageStatusError(invalid.to_owned())),
        }
    }
}

/// A Message as stored in a PgQueue.
#[derive(sqlx::FromRow, Debug)]
pub struct Message {
    /// A unique id identifying a message row.
    pub id: i64,
    /// The queue this message belongs to.
    pub queue: String,
    /// The identifier the producer assigned to this message.
    pub message_id: String,
    /// The content type the producer declared for the body, if any.
    pub content_type: Option<String>,
    /// The raw payload.
    pub body: String,
    /// The current status of the message.
    pub status: MessageStatus,
    /// The number of times this message has been dequeued.
    pub attempt: i32,
    /// Workers that have dequeued this message.
    pub attempted_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A NewMessage to be enqueued into a PgQueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl NewMessage {
    pub fn new(message_id: &str, body: &str) -> Self {
        Self {
            message_id: message_id.to_owned(),
            content_type: None,
            body: body.to_owned(),
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }
}

/// A Message dequeued from a PgQueue, holding on to a connection pool to complete it.
#[derive(Debug)]
pub struct PgMessage {
    pub message: Message,
    pool: PgPool,
}

impl PgMessage {
    /// Mark this message as completed so no other worker picks it up.
    /// We take ownership of PgMessage as a message is only completed once.
    pub async fn complete(self) -> PgQueueResult<Message> {
        let base_query = r#"
UPDATE
    message_queue
SET
    completed_at = NOW(),
    status = 'completed'::message_status
WHERE
    queue = $1
    AND id = $2
RETURNING
    message_queue.*
        "#;

        let completed: Message = sqlx::query_as(base_query)
            .bind(&self.message.queue)
            .bind(self.message.id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(completed)
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, PgQueueError>;

impl PgQueue {
    /// Initialize a new PgQueue backed by table in PostgreSQL.
    ///
    /// # Arguments
    ///
    /// * `queue_name`: A name for the queue we are going to initialize.
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: The maximum number of connections kept in the pool.
    pub async fn new(queue_name: &str, url: &str, max_connections: u32) -> PgQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| PgQueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(queue_name, pool))
    }

    /// Initialize a new PgQueue backed by table in PostgreSQL, re-using an existing pool.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue the oldest available Message from this PgQueue, if there is one.
    ///
    /// # Arguments
    ///
    /// * `attempted_by`: An identifier of the worker dequeueing, appended to `attempted_by`.
    pub async fn dequeue(&self, attempted_by: &str) -> PgQueueResult<Option<PgMessage>> {
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        message_queue
    WHERE
        status = 'available'
        AND queue = $1
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    message_queue
SET
    last_attempt_started_at = NOW(),
    status = 'running'::message_status,
    attempt = message_queue.attempt + 1,
    attempted_by = array_append(message_queue.attempted_by, $2::text)
FROM
    available_in_queue
WHERE
    message_queue.id = available_in_queue.id
RETURNING
    message_queue.*
        "#;

        let message: Option<Message> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(message.map(|message| PgMessage {
            message,
            pool: self.pool.clone(),
        }))
    }

    /// Enqueue a Message into this PgQueue.
    /// We take ownership of NewMessage to enforce a specific NewMessage is only enqueued once.
    pub async fn enqueue(&self, message: NewMessage) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO message_queue
    (queue, message_id, content_type, body, status, attempt, created_at)
VALUES
    ($1, $2, $3, $4, 'available'::message_status, 0, NOW())
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(&message.message_id)
            .bind(&message.content_type)
            .bind(&message.body)
            .execute(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}
