use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tpmtrak_common::record::{ParsedRecord, RecordField};

use crate::config::TableName;
use crate::error::SinkError;

/// Columns written by `PgRecordSink`, in bind order.
const COLUMNS: [RecordField; 8] = [
    RecordField::Id,
    RecordField::Status,
    RecordField::FieldOne,
    RecordField::FieldTwo,
    RecordField::Description,
    RecordField::InstanceId,
    RecordField::StartDateTime,
    RecordField::EndDateTime,
];

/// Destination of successfully parsed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert(&self, record: &ParsedRecord) -> Result<(), SinkError>;
}

/// Stores records in a PostgreSQL table, one parameterized INSERT per record.
#[derive(Clone)]
pub struct PgRecordSink {
    pool: PgPool,
    insert_query: String,
}

impl PgRecordSink {
    /// Build a sink over a lazily connected pool: connection failures surface on the first
    /// insert, not here.
    pub fn new(url: &str, max_connections: u32, table: &TableName) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| SinkError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, table))
    }

    pub fn new_from_pool(pool: PgPool, table: &TableName) -> Self {
        Self {
            pool,
            insert_query: build_insert(table),
        }
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn insert(&self, record: &ParsedRecord) -> Result<(), SinkError> {
        sqlx::query(&self.insert_query)
            .bind(record.id)
            .bind(&record.status)
            .bind(record.field_one)
            .bind(record.field_two)
            .bind(&record.description)
            .bind(record.instance_id)
            .bind(record.start_date_time)
            .bind(record.end_date_time)
            .execute(&self.pool)
            .await
            .map_err(|error| SinkError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// Build the INSERT statement for `table`. Only the table name is interpolated, every
/// value is bound.
fn build_insert(table: &TableName) -> String {
    let columns: Vec<String> = COLUMNS
        .iter()
        .map(|field| format!("\"{}\"", field.column()))
        .collect();
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("${i}")).collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        columns.join(", "),
        placeholders.join(", ")
    )
}
