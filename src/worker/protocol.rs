//! Protocol types for driver/worker communication.
//!
//! Every cross-thread operation is a plain-data frame: one JSON object per
//! line (NDJSON). No closures or live references ever cross the boundary, so
//! a frame can always be encoded and decoded without loss.
//!
//! Each command carries a request id that the worker echoes in every event it
//! produces for that command. The driver correlates replies by id, never by
//! event kind, so several calls of the same kind may be outstanding at once.

use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// Values
// ============================================================================

/// A single SQL value as it travels across the protocol.
///
/// Encoded as the plain JSON value (`null`, number, string, byte array),
/// except non-finite reals, which JSON cannot carry as numbers:
/// `{"real":"inf"}`, `{"real":"-inf"}` and `{"real":"nan"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

const NON_FINITE_KEY: &str = "real";

fn non_finite_name(v: f64) -> &'static str {
    if v.is_nan() {
        "nan"
    } else if v > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Integer(v) => serializer.serialize_i64(*v),
            Self::Real(v) if v.is_finite() => serializer.serialize_f64(*v),
            Self::Real(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NON_FINITE_KEY, non_finite_name(*v))?;
                map.end()
            }
            Self::Text(v) => serializer.serialize_str(v),
            Self::Blob(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SqlValueVisitor)
    }
}

struct SqlValueVisitor;

impl<'de> Visitor<'de> for SqlValueVisitor {
    type Value = SqlValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, a number, a string, a byte array or a non-finite real")
    }

    fn visit_unit<E: de::Error>(self) -> Result<SqlValue, E> {
        Ok(SqlValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<SqlValue, E> {
        Ok(SqlValue::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<SqlValue, E> {
        Ok(SqlValue::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SqlValue, E> {
        Ok(SqlValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SqlValue, E> {
        i64::try_from(v)
            .map(SqlValue::Integer)
            .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &"a 64-bit signed integer"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<SqlValue, E> {
        Ok(SqlValue::Real(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SqlValue, E> {
        Ok(SqlValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<SqlValue, E> {
        Ok(SqlValue::Text(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SqlValue, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(SqlValue::Blob(bytes))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SqlValue, A::Error> {
        let (key, name): (String, String) = map
            .next_entry()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        if key != NON_FINITE_KEY {
            return Err(de::Error::unknown_field(&key, &[NON_FINITE_KEY]));
        }
        let value = match name.as_str() {
            "inf" => f64::INFINITY,
            "-inf" => f64::NEG_INFINITY,
            "nan" => f64::NAN,
            other => {
                return Err(de::Error::invalid_value(
                    de::Unexpected::Str(other),
                    &"inf, -inf or nan",
                ))
            }
        };
        Ok(SqlValue::Real(value))
    }
}

impl SqlValue {
    /// Returns the integer payload, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text payload, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Integer(v.into())
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Fully materialized result of an `Exec` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Result column names, in select order.
    pub columns: Vec<String>,
    /// Result rows; each row has one value per column.
    pub rows: Vec<Vec<SqlValue>>,
    /// Last inserted rowid (mutating statements only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
    /// Number of rows changed (mutating statements only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl RowSet {
    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at `(row, column name)`.
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One batch of streamed rows (one `StreamRow` event).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

// ============================================================================
// Commands (driver -> worker)
// ============================================================================

/// Rows a stream may run ahead of its consumer.
pub const DEFAULT_STREAM_WINDOW: usize = 64;

fn default_stream_window() -> usize {
    DEFAULT_STREAM_WINDOW
}

/// A command sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Open (or reuse) the embedded database.
    Init { file_name: String, durable: bool },
    /// Run one statement and materialize its result.
    Exec {
        is_select: bool,
        sql: String,
        #[serde(default)]
        params: Vec<SqlValue>,
    },
    /// Close the embedded database.
    Close,
    /// Run a row-returning statement, one `StreamRow` event per row. The
    /// worker sends at most `window` rows beyond those acknowledged.
    StreamStart {
        sql: String,
        #[serde(default)]
        params: Vec<SqlValue>,
        #[serde(default = "default_stream_window")]
        window: usize,
    },
    /// The consumer of stream `id` took `rows` more rows; grants as many
    /// new credits. Not answered.
    StreamAck { rows: usize },
    /// The consumer of stream `id` went away. Not answered.
    StreamCancel,
    /// Apply a batch of statements in order, reporting progress.
    LoadBulk {
        file_name: String,
        durable: bool,
        statements: Vec<String>,
    },
    /// Hash the full database content.
    Fingerprint,
}

/// Discriminant of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Init,
    Exec,
    Close,
    StreamStart,
    StreamAck,
    StreamCancel,
    LoadBulk,
    Fingerprint,
}

impl CommandKind {
    /// The single event kind that closes out this command. Stream control
    /// frames have none.
    pub fn terminal(self) -> Option<EventKind> {
        match self {
            Self::Init => Some(EventKind::InitDone),
            Self::Exec => Some(EventKind::ExecResult),
            Self::Close => Some(EventKind::CloseDone),
            Self::StreamStart => Some(EventKind::StreamEnd),
            Self::LoadBulk => Some(EventKind::LoadDone),
            Self::Fingerprint => Some(EventKind::FingerprintDone),
            Self::StreamAck | Self::StreamCancel => None,
        }
    }

    /// Flow-control frames that refer to a running stream by its request id.
    pub fn is_stream_control(self) -> bool {
        matches!(self, Self::StreamAck | Self::StreamCancel)
    }

    /// The non-terminal event kind this command may emit before its terminal one.
    pub fn intermediate(self) -> Option<EventKind> {
        match self {
            Self::StreamStart => Some(EventKind::StreamRow),
            Self::LoadBulk => Some(EventKind::LoadProgress),
            _ => None,
        }
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Init { .. } => CommandKind::Init,
            Self::Exec { .. } => CommandKind::Exec,
            Self::Close => CommandKind::Close,
            Self::StreamStart { .. } => CommandKind::StreamStart,
            Self::StreamAck { .. } => CommandKind::StreamAck,
            Self::StreamCancel => CommandKind::StreamCancel,
            Self::LoadBulk { .. } => CommandKind::LoadBulk,
            Self::Fingerprint => CommandKind::Fingerprint,
        }
    }
}

// ============================================================================
// Events (worker -> driver)
// ============================================================================

/// Kind of an event emitted by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InitDone,
    ExecResult,
    CloseDone,
    StreamRow,
    StreamEnd,
    LoadProgress,
    LoadDone,
    FingerprintDone,
}

impl EventKind {
    /// Whether this event closes out its command.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::StreamRow | Self::LoadProgress)
    }
}

/// Data carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Rows(RowSet),
    Batch(RowBatch),
    Progress(u8),
    Applied(usize),
    Fingerprint(String),
}

/// Error information attached to a failed terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (see [`codes`]).
    pub code: String,
    /// Human-readable message, usually the engine's native one.
    pub message: String,
    /// 0-based index of the failing statement in a bulk load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_index: Option<usize>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            statement_index: None,
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Request envelope sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Request id, unique per driver.
    pub id: u64,
    pub command: Command,
}

/// Event envelope received from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Id of the request this event belongs to.
    pub id: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    /// Populated on failure, absent on success.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl EventEnvelope {
    pub fn ok(id: u64, kind: EventKind, data: Option<Payload>) -> Self {
        Self {
            id,
            kind,
            data,
            error: None,
        }
    }

    pub fn failed(id: u64, kind: EventKind, error: ErrorInfo) -> Self {
        Self {
            id,
            kind,
            data: None,
            error: Some(error),
        }
    }
}

/// Encode a frame as a single NDJSON line (without the trailing newline).
pub fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a single NDJSON line.
pub fn decode<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

// ============================================================================
// Error codes
// ============================================================================

/// Error codes shipped in [`ErrorInfo::code`].
pub mod codes {
    pub const SQLITE: &str = "SQLITE_ERROR";
    pub const NOT_OPEN: &str = "NOT_OPEN";
    pub const FILE_MISMATCH: &str = "FILE_MISMATCH";
    pub const STATEMENT_FAILED: &str = "STATEMENT_FAILED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// The worker panicked while running the command.
    pub const WORKER_PANIC: &str = "WORKER_PANIC";
}
