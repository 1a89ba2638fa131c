use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tpmtrak_common::pgqueue::PgQueueError;
use tpmtrak_common::record::RecordParseError;

/// Enumeration of errors that can occur while a `RecordSink` stores a record.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Enumeration of reasons a single message could not be ingested.
/// None of these stops the worker: the message is reported and completed regardless.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("SQL_CONNECTION_STRING is not set")]
    ConfigurationError,
    #[error(transparent)]
    ParseError(#[from] RecordParseError),
    #[error("failed to store record: {0}")]
    PersistenceError(#[from] SinkError),
}

impl IngestError {
    /// A short label to tag metrics with.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::ConfigurationError => "configuration",
            IngestError::ParseError(RecordParseError::MalformedFormat(_)) => "malformed_format",
            IngestError::ParseError(RecordParseError::FieldParseError { .. }) => "field_parse",
            IngestError::PersistenceError(_) => "persistence",
        }
    }
}

/// Enumeration of errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("a queue error occurred while consuming messages: {0}")]
    QueueError(#[from] PgQueueError),
    #[error("failed to set up the record sink: {0}")]
    SinkError(#[from] SinkError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpmtrak_common::record::RecordField;

    #[test]
    fn test_reason_labels() {
        assert_eq!(IngestError::ConfigurationError.reason(), "configuration");
        assert_eq!(
            IngestError::from(RecordParseError::MalformedFormat(3)).reason(),
            "malformed_format"
        );
        assert_eq!(
            IngestError::from(RecordParseError::FieldParseError {
                field: RecordField::Id,
                value: "x".to_owned(),
            })
            .reason(),
            "field_parse"
        );
        assert_eq!(
            IngestError::from(SinkError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolTimedOut,
            })
            .reason(),
            "persistence"
        );
    }

    #[test]
    fn test_parse_errors_display_transparently() {
        let error = IngestError::from(RecordParseError::MalformedFormat(3));

        assert_eq!(
            error.to_string(),
            "message format is incorrect: expected 10 tokens but found 3"
        );
    }
}
