//! Neutral schema and row representation shared by discovery,
//! extraction and ingestion.
//!
//! A [`DataSetDefinition`] decouples what a series looks like from the
//! engine it was discovered in. Its column order is semantically
//! significant: it fixes the projection order of the extraction query
//! and therefore the positional layout of every [`Row`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Engine-independent column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// UTF-8 text.
    Text,
    /// Timestamp with timezone.
    Timestamp,
}

impl DataType {
    /// Lowercase name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a column plays within its series.
///
/// The role matters during discovery: only fields can carry conflicting
/// native types across shards, and only the time column partitions the
/// destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// The leading timestamp column.
    Time,
    /// A dimension (indexed label) column.
    Tag,
    /// A measured value column.
    Field,
}

/// One column of a discovered series.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Neutral data type.
    pub data_type: DataType,
    /// Role within the series.
    pub role: ColumnRole,
}

impl ColumnInfo {
    /// Creates a new column description.
    pub fn new(name: impl Into<String>, data_type: DataType, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            data_type,
            role,
        }
    }
}

/// Discovered definition of one series.
///
/// Immutable after discovery; shared between the coordinator, the query
/// builder, the producer and the row converter via `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetDefinition {
    /// Series (measure) name.
    pub name: String,
    /// Columns in extraction order: time, then tags, then fields.
    pub columns: Vec<ColumnInfo>,
}

impl DataSetDefinition {
    /// Names of the columns, in definition order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The time column of the series.
    ///
    /// Discovery always places exactly one, so a missing time column
    /// means the definition was constructed by hand and is invalid.
    #[must_use]
    pub fn time_column(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.role == ColumnRole::Time)
    }
}

impl fmt::Display for DataSetDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", column.name, column.data_type)?;
        }
        write!(f, ")")
    }
}

/// One decoded cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Boolean value.
    Boolean(bool),
    /// Text value.
    Text(String),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
    /// Absent value.
    Null,
}

/// One extracted row, positionally aligned to the columns of its
/// [`DataSetDefinition`].
pub type Row = Vec<FieldValue>;

/// A discovered definition paired with the channel its rows arrive on.
///
/// The channel is bounded (backpressure boundary between extraction and
/// ingestion). The producer owns the only sender and closes the channel
/// exactly once by dropping it; the ingest side owns this receiver.
#[derive(Debug)]
pub struct Bundle {
    /// Definition the rows are aligned to.
    pub data_def: Arc<DataSetDefinition>,
    /// Receiving side of the row channel.
    pub rows: mpsc::Receiver<Row>,
}
