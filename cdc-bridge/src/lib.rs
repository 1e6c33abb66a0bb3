pub mod cdc_types;
pub mod checkpoints;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod mapper;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod source_reader;

// The test module should be visible only if test feature is enabled.
// Test feature is disabled by default.
#[cfg(all(test, not(feature = "test")))]
mod test_utilities;

#[cfg(feature = "test")]
pub mod test_utilities;

pub use crate::config::ConnectorConfiguration;
pub use crate::error::{MappingError, SourceError};
pub use crate::mapper::{JsonRecordMapper, RecordMapper};
pub use crate::source_reader::{ReadOutcome, SourceReader, SourceReaderBuilder};
