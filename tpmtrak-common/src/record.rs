use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use thiserror::Error;

/// Marker producers prepend to every payload.
pub const START_MARKER: &str = "START-";
/// Marker producers append to every payload.
pub const END_MARKER: &str = "-END";
/// Separator between payload tokens.
pub const DELIMITER: char = '-';
/// Number of tokens a payload must have once its markers are stripped.
pub const TOKEN_COUNT: usize = 10;
/// Format of a timestamp after its date and time tokens are joined with `DELIMITER`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const DATE_DIGITS: usize = 8;
const TIME_DIGITS: usize = 6;

/// Enumeration of the fields of a `ParsedRecord`, used to report which one failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Id,
    Status,
    FieldOne,
    FieldTwo,
    Description,
    InstanceId,
    StartDateTime,
    EndDateTime,
}

impl RecordField {
    /// Name of the column this field is stored in.
    pub fn column(&self) -> &'static str {
        match self {
            RecordField::Id => "Id",
            RecordField::Status => "Status",
            RecordField::FieldOne => "Field1",
            RecordField::FieldTwo => "Field2",
            RecordField::Description => "Description",
            RecordField::InstanceId => "InstanceId",
            RecordField::StartDateTime => "StartDateTime",
            RecordField::EndDateTime => "EndDateTime",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

/// Enumeration of reasons a payload cannot be turned into a `ParsedRecord`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("message format is incorrect: expected {} tokens but found {0}", TOKEN_COUNT)]
    MalformedFormat(usize),
    #[error("failed to parse {field} from {value:?}")]
    FieldParseError { field: RecordField, value: String },
}

impl RecordParseError {
    fn field(field: RecordField, value: &str) -> Self {
        RecordParseError::FieldParseError {
            field,
            value: value.to_owned(),
        }
    }
}

/// A record as delivered by a producer, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub id: i32,
    pub status: String,
    pub field_one: i32,
    pub field_two: i32,
    pub description: String,
    pub instance_id: i32,
    pub start_date_time: NaiveDateTime,
    pub end_date_time: NaiveDateTime,
}

impl FromStr for ParsedRecord {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a raw payload of the form
/// `START-<id>-<status>-[<field1>]-<field2>-<description>-<instance>-<yyyyMMdd>-<HHmmss>-<yyyyMMdd>-<HHmmss>-END`.
///
/// Tokens are assigned strictly by position: a `-` inside a free text field shifts every
/// following token, which either misassigns fields or fails the token count check.
/// Parsing is all-or-nothing, the first field that fails aborts the whole payload.
pub fn parse(raw: &str) -> Result<ParsedRecord, RecordParseError> {
    let body = strip_markers(raw);
    let tokens: Vec<&str> = body.split(DELIMITER).collect();

    let [
        id,
        status,
        field_one,
        field_two,
        description,
        instance_id,
        start_date,
        start_time,
        end_date,
        end_time,
    ]: [&str; TOKEN_COUNT] = tokens
        .as_slice()
        .try_into()
        .map_err(|_| RecordParseError::MalformedFormat(tokens.len()))?;

    Ok(ParsedRecord {
        id: parse_integer(RecordField::Id, id, id)?,
        status: status.to_owned(),
        field_one: parse_integer(RecordField::FieldOne, strip_brackets(field_one), field_one)?,
        field_two: parse_integer(RecordField::FieldTwo, field_two, field_two)?,
        description: description.to_owned(),
        instance_id: parse_integer(RecordField::InstanceId, instance_id, instance_id)?,
        start_date_time: parse_timestamp(RecordField::StartDateTime, start_date, start_time)?,
        end_date_time: parse_timestamp(RecordField::EndDateTime, end_date, end_time)?,
    })
}

/// Remove a leading `START_MARKER` and a trailing `END_MARKER`, each only if present.
fn strip_markers(raw: &str) -> &str {
    let raw = raw.strip_prefix(START_MARKER).unwrap_or(raw);
    raw.strip_suffix(END_MARKER).unwrap_or(raw)
}

/// Remove at most one leading `[` and at most one trailing `]`.
fn strip_brackets(token: &str) -> &str {
    let token = token.strip_prefix('[').unwrap_or(token);
    token.strip_suffix(']').unwrap_or(token)
}

/// Parse a base-10 `i32`, tolerating surrounding whitespace and a leading sign.
/// `raw` is the untouched token reported back on failure.
fn parse_integer(field: RecordField, token: &str, raw: &str) -> Result<i32, RecordParseError> {
    token
        .trim()
        .parse::<i32>()
        .map_err(|_| RecordParseError::field(field, raw))
}

fn parse_timestamp(
    field: RecordField,
    date: &str,
    time: &str,
) -> Result<NaiveDateTime, RecordParseError> {
    let joined = format!("{date}{DELIMITER}{time}");

    // chrono accepts single digit months, days and hours: require fixed widths first.
    if !is_digits(date, DATE_DIGITS) || !is_digits(time, TIME_DIGITS) {
        return Err(RecordParseError::field(field, &joined));
    }

    let timestamp = NaiveDateTime::parse_from_str(&joined, TIMESTAMP_FORMAT)
        .map_err(|_| RecordParseError::field(field, &joined))?;

    // chrono represents a :60 second as a leap second instead of rejecting it.
    if timestamp.nanosecond() >= 1_000_000_000 {
        return Err(RecordParseError::field(field, &joined));
    }

    Ok(timestamp)
}

fn is_digits(token: &str, len: usize) -> bool {
    token.len() == len && token.bytes().all(|b| b.is_ascii_digit())
}
