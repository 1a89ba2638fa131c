use std::sync::Arc;
use std::time;

use tokio::sync;
use tokio::sync::mpsc;
use tpmtrak_common::health::HealthHandle;
use tpmtrak_common::pgqueue::{PgMessage, PgQueue};
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::sink::RecordSink;

/// A worker to poll `PgQueue` and spawn tasks to ingest messages when they become available.
pub struct IngestWorker<'p, S> {
    /// An identifier for this worker. Used to mark messages we have consumed.
    name: String,
    /// The queue we will be dequeuing messages from.
    queue: &'p PgQueue,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of messages being handled at the same time.
    max_concurrent_messages: usize,
    /// Shared by every processing task.
    handler: Arc<MessageHandler<S>>,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<'p, S: RecordSink + 'static> IngestWorker<'p, S> {
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        poll_interval: time::Duration,
        max_concurrent_messages: usize,
        handler: MessageHandler<S>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            poll_interval,
            max_concurrent_messages,
            handler: Arc::new(handler),
            liveness,
        }
    }

    /// Wait until a message becomes available in our queue.
    /// Returns early with the first error reported by a processing task.
    async fn wait_for_message(
        &self,
        failures: &mut mpsc::UnboundedReceiver<WorkerError>,
    ) -> Result<PgMessage, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            if let Ok(error) = failures.try_recv() {
                return Err(error);
            }

            self.liveness.report_healthy();

            if let Some(pg_message) = self.queue.dequeue(&self.name).await? {
                return Ok(pg_message);
            }
        }
    }

    /// Run this worker to continuously process any messages that become available.
    /// Only queue errors end the loop: ingestion failures are reported per message, while a
    /// message that could not be completed is sent back here and stops the worker.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_messages));
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let report_semaphore_utilization = || {
            metrics::gauge!("tpmtrak_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_messages as f64,
            );
        };

        info!(
            worker = %self.name,
            queue = self.queue.name(),
            configured = self.handler.is_configured(),
            "worker started"
        );

        loop {
            report_semaphore_utilization();
            let pg_message = self.wait_for_message(&mut failures_rx).await?;
            spawn_message_processing_task(
                self.handler.clone(),
                semaphore.clone(),
                failures_tx.clone(),
                pg_message,
            )
            .await;
        }
    }
}

/// Spawn a Tokio task to process a message once we successfully acquire a permit.
///
/// # Arguments
///
/// * `handler`: The handler turning the message body into a stored record.
/// * `semaphore`: A semaphore bounding concurrency. This function will panic if this semaphore is closed.
/// * `failures`: Where to report a message that could not be completed.
/// * `pg_message`: The message to process as dequeued from `tpmtrak_common::pgqueue::PgQueue`.
async fn spawn_message_processing_task<S: RecordSink + 'static>(
    handler: Arc<MessageHandler<S>>,
    semaphore: Arc<sync::Semaphore>,
    failures: mpsc::UnboundedSender<WorkerError>,
    pg_message: PgMessage,
) -> tokio::task::JoinHandle<()> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let labels = [("queue", pg_message.message.queue.clone())];

    metrics::counter!("tpmtrak_messages_total", &labels).increment(1);

    tokio::spawn(async move {
        let result = process_message(&*handler, pg_message).await;
        drop(permit);

        if let Err(error) = result {
            error!("failed to complete message: {}", error);
            if failures.send(error).is_err() {
                warn!("worker stopped before the failure could be reported");
            }
        }
    })
}

/// Ingest a message and complete it.
///
/// The message is completed whatever the outcome of ingesting it: failures are logged and
/// counted, never retried. Only failing to complete the message is returned as an error.
pub async fn process_message<S: RecordSink>(
    handler: &MessageHandler<S>,
    pg_message: PgMessage,
) -> Result<(), WorkerError> {
    let message = &pg_message.message;
    let labels = [("queue", message.queue.clone())];

    info!(
        message_id = %message.message_id,
        body = %message.body,
        content_type = message.content_type.as_deref().unwrap_or_default(),
        "received message"
    );

    let now = tokio::time::Instant::now();

    match handler.handle(&message.body).await {
        Ok(record) => {
            metrics::counter!("tpmtrak_messages_inserted", &labels).increment(1);
            info!(
                message_id = %message.message_id,
                record_id = record.id,
                instance_id = record.instance_id,
                "stored record"
            );
        }
        Err(ingest_error) => {
            let reason = ingest_error.reason();
            metrics::counter!(
                "tpmtrak_messages_rejected",
                "queue" => message.queue.clone(),
                "reason" => reason
            )
            .increment(1);
            error!(
                message_id = %message.message_id,
                reason, "error processing message: {}", ingest_error
            );
        }
    }

    metrics::histogram!("tpmtrak_message_processing_duration_seconds", &labels)
        .record(now.elapsed().as_secs_f64());

    pg_message.complete().await?;

    Ok(())
}
