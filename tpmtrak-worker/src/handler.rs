use tpmtrak_common::record::{self, ParsedRecord};

use crate::error::IngestError;
use crate::sink::RecordSink;

/// Turns one raw payload into a stored record.
///
/// The sink is `None` when no connection string was configured: every payload is then
/// rejected with `IngestError::ConfigurationError` before it is parsed.
pub struct MessageHandler<S> {
    sink: Option<S>,
}

impl<S: RecordSink> MessageHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn from_sink(sink: Option<S>) -> Self {
        Self { sink }
    }

    pub fn is_configured(&self) -> bool {
        self.sink.is_some()
    }

    /// Parse `body` and insert the resulting record, returning it once stored.
    pub async fn handle(&self, body: &str) -> Result<ParsedRecord, IngestError> {
        let sink = self.sink.as_ref().ok_or(IngestError::ConfigurationError)?;

        let record = record::parse(body)?;
        sink.insert(&record).await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tpmtrak_common::record::{RecordField, RecordParseError};

    use crate::error::SinkError;

    const ROUTINE_CHECK: &str =
        "START-501-ACTIVE-[7]-3-Routine check-12-20240601-090000-20240601-170000-END";

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<ParsedRecord>>,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn insert(&self, record: &ParsedRecord) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn insert(&self, _: &ParsedRecord) -> Result<(), SinkError> {
            Err(SinkError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolTimedOut,
            })
        }
    }

    #[tokio::test]
    async fn test_handle_inserts_parsed_record() {
        let handler = MessageHandler::new(MemorySink::default());

        let record = handler.handle(ROUTINE_CHECK).await.expect("failed to handle");

        assert_eq!(record.id, 501);
        let sink = handler.sink.as_ref().unwrap();
        assert_eq!(*sink.records.lock().unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_missing_sink_short_circuits() {
        let handler: MessageHandler<MemorySink> = MessageHandler::from_sink(None);

        assert!(!handler.is_configured());
        assert!(matches!(
            handler.handle(ROUTINE_CHECK).await,
            Err(IngestError::ConfigurationError)
        ));
        // Malformed payloads are not even looked at.
        assert!(matches!(
            handler.handle("START-1-2-3-END").await,
            Err(IngestError::ConfigurationError)
        ));
    }

    #[tokio::test]
    async fn test_parse_failures_skip_the_sink() {
        let handler = MessageHandler::new(MemorySink::default());

        assert!(matches!(
            handler.handle("START-1-2-3-END").await,
            Err(IngestError::ParseError(RecordParseError::MalformedFormat(3)))
        ));
        assert!(matches!(
            handler
                .handle("START-501-ACTIVE-[abc]-3-Routine check-12-20240601-090000-20240601-170000-END")
                .await,
            Err(IngestError::ParseError(RecordParseError::FieldParseError {
                field: RecordField::FieldOne,
                ..
            }))
        ));

        let sink = handler.sink.as_ref().unwrap();
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_a_persistence_error() {
        let handler = MessageHandler::new(FailingSink);

        assert!(matches!(
            handler.handle(ROUTINE_CHECK).await,
            Err(IngestError::PersistenceError(SinkError::QueryError { .. }))
        ));
    }
}
