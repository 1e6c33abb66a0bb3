//! Errors surfaced by the source adapter.
use thiserror::Error;

use crate::cdc_types::OffsetRecord;

/// A single record could not be transformed into the output type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to map record at {offset}: {reason}")]
pub struct MappingError {
    pub offset: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(offset: impl ToString, reason: impl Into<String>) -> MappingError {
        MappingError {
            offset: offset.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by [`SourceReader`](crate::source_reader::SourceReader)
/// and [`EmbeddedEngineRunner`](crate::engine::EmbeddedEngineRunner).
///
/// Fatal variants carry the last acknowledged offset,
/// so it is visible how far ingestion progressed before the failure.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Bad or missing configuration. Not retried; the caller must fix it and restart.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The connector could not reach the source or did not start in time.
    #[error("engine failed to start: {reason}{}", describe(.last_offset))]
    EngineStart {
        reason: String,
        last_offset: Option<OffsetRecord>,
    },

    /// The connector died mid-stream. Reopening resumes from the last persisted offset.
    #[error("engine fault: {reason}{}", describe(.last_offset))]
    EngineFault {
        reason: String,
        last_offset: Option<OffsetRecord>,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Offsets could not be loaded or persisted.
    #[error("offset store failure: {reason}{}", describe(.last_offset))]
    OffsetStore {
        reason: String,
        last_offset: Option<OffsetRecord>,
    },
}

fn describe(last_offset: &Option<OffsetRecord>) -> String {
    match last_offset {
        Some(offset) => format!(" (last offset: {offset})"),
        None => " (no offset delivered yet)".to_string(),
    }
}

impl SourceError {
    pub fn configuration(reason: impl Into<String>) -> SourceError {
        SourceError::Configuration(reason.into())
    }

    pub(crate) fn engine_start(reason: &anyhow::Error, last_offset: Option<OffsetRecord>) -> Self {
        SourceError::EngineStart {
            reason: format!("{reason:#}"),
            last_offset,
        }
    }

    pub(crate) fn engine_fault(reason: &anyhow::Error, last_offset: Option<OffsetRecord>) -> Self {
        SourceError::EngineFault {
            reason: format!("{reason:#}"),
            last_offset,
        }
    }

    pub(crate) fn offset_store(reason: &anyhow::Error, last_offset: Option<OffsetRecord>) -> Self {
        SourceError::OffsetStore {
            reason: format!("{reason:#}"),
            last_offset,
        }
    }

    /// Last offset acknowledged before a fatal error.
    pub fn last_offset(&self) -> Option<&OffsetRecord> {
        match self {
            SourceError::EngineStart { last_offset, .. }
            | SourceError::EngineFault { last_offset, .. }
            | SourceError::OffsetStore { last_offset, .. } => last_offset.as_ref(),
            SourceError::Configuration(_) | SourceError::Mapping(_) => None,
        }
    }

    /// Whether reopening the reader with backoff may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SourceError::EngineStart { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc_types::{SourceOffset, SourcePartition};

    #[test]
    fn fatal_errors_report_last_offset() {
        let offset = OffsetRecord::new(
            SourcePartition::new("server=a"),
            SourceOffset::new().with("pos", 120u64),
        );
        let err = SourceError::engine_fault(
            &anyhow::anyhow!("connection lost"),
            Some(offset.clone()),
        );

        assert_eq!(err.last_offset(), Some(&offset));
        assert_eq!(
            err.to_string(),
            "engine fault: connection lost (last offset: server=a @ {pos=120})"
        );
        assert!(!err.is_retriable());
    }

    #[test]
    fn start_errors_are_retriable() {
        let err = SourceError::engine_start(&anyhow::anyhow!("timed out"), None);
        assert!(err.is_retriable());
        assert_eq!(
            err.to_string(),
            "engine failed to start: timed out (no offset delivered yet)"
        );
        assert!(!SourceError::configuration("missing host").is_retriable());
    }
}
