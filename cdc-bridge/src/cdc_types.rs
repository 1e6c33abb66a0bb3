//! A module containing types describing change events and their positions.
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one logical stream of changes, e.g. a replicated server or a table.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SourcePartition(String);

impl SourcePartition {
    pub fn new(partition: impl Into<String>) -> SourcePartition {
        SourcePartition(partition.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourcePartition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position token of a connector, e.g. binlog file and byte position.
/// The core never interprets it; only the connector that produced it does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOffset(BTreeMap<String, serde_json::Value>);

impl SourceOffset {
    pub fn new() -> SourceOffset {
        SourceOffset::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|value| value.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|value| value.as_bool())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Last delivered position of a single partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub partition: SourcePartition,
    pub offset: SourceOffset,
}

impl OffsetRecord {
    pub fn new(partition: SourcePartition, offset: SourceOffset) -> OffsetRecord {
        OffsetRecord { partition, offset }
    }
}

impl fmt::Display for OffsetRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} @ {{{}}}", self.partition, self.offset)
    }
}

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    /// A row read by the initial snapshot.
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operation::Create => write!(f, "Create"),
            Operation::Read => write!(f, "Read"),
            Operation::Update => write!(f, "Update"),
            Operation::Delete => write!(f, "Delete"),
        }
    }
}

/// Value of a single column in a row image.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact numeric kept in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        ColumnValue::Int(value.into())
    }
}

impl From<u64> for ColumnValue {
    fn from(value: u64) -> Self {
        ColumnValue::UInt(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Bool(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

/// State of a row before or after a change, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    fields: BTreeMap<String, ColumnValue>,
}

impl RowImage {
    pub fn new() -> RowImage {
        RowImage::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: ColumnValue) {
        self.fields.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.fields.get(column)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ColumnValue)> for RowImage {
    fn from_iter<T: IntoIterator<Item = (K, ColumnValue)>>(iter: T) -> Self {
        RowImage {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub connector: String,
    pub version: String,
    /// Logical name of the captured server.
    pub name: String,
    pub database: String,
    /// Schema or log position the change was read from.
    pub schema: String,
    pub table: String,
}

/// A single row-level change emitted by a connector.
///
/// The constructors guarantee that at least one image is present:
/// inserts and snapshot reads carry only the after image,
/// deletes carry only the before image and updates carry both.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    partition: SourcePartition,
    offset: SourceOffset,
    operation: Operation,
    before: Option<RowImage>,
    after: Option<RowImage>,
    metadata: SourceMetadata,
    timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(
        partition: SourcePartition,
        offset: SourceOffset,
        metadata: SourceMetadata,
        after: RowImage,
    ) -> ChangeEvent {
        ChangeEvent::with_images(
            partition,
            offset,
            Operation::Create,
            None,
            Some(after),
            metadata,
        )
    }

    pub fn read(
        partition: SourcePartition,
        offset: SourceOffset,
        metadata: SourceMetadata,
        after: RowImage,
    ) -> ChangeEvent {
        ChangeEvent::with_images(partition, offset, Operation::Read, None, Some(after), metadata)
    }

    pub fn update(
        partition: SourcePartition,
        offset: SourceOffset,
        metadata: SourceMetadata,
        before: RowImage,
        after: RowImage,
    ) -> ChangeEvent {
        ChangeEvent::with_images(
            partition,
            offset,
            Operation::Update,
            Some(before),
            Some(after),
            metadata,
        )
    }

    pub fn delete(
        partition: SourcePartition,
        offset: SourceOffset,
        metadata: SourceMetadata,
        before: RowImage,
    ) -> ChangeEvent {
        ChangeEvent::with_images(
            partition,
            offset,
            Operation::Delete,
            Some(before),
            None,
            metadata,
        )
    }

    fn with_images(
        partition: SourcePartition,
        offset: SourceOffset,
        operation: Operation,
        before: Option<RowImage>,
        after: Option<RowImage>,
        metadata: SourceMetadata,
    ) -> ChangeEvent {
        ChangeEvent {
            partition,
            offset,
            operation,
            before,
            after,
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Overrides the event time, e.g. with the commit time reported by the source.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn partition(&self) -> &SourcePartition {
        &self.partition
    }

    pub fn offset(&self) -> &SourceOffset {
        &self.offset
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn before(&self) -> Option<&RowImage> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&RowImage> {
        self.after.as_ref()
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn offset_record(&self) -> OffsetRecord {
        OffsetRecord::new(self.partition.clone(), self.offset.clone())
    }
}
