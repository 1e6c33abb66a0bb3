//! Pull-based reading of change events with checkpointable progress.
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cdc_types::OffsetRecord;
use crate::checkpoints::{representative, InMemoryOffsetStore, OffsetMap, OffsetStore};
use crate::config::ConnectorConfiguration;
use crate::connector::ConnectorRegistry;
use crate::engine::{Dequeued, EmbeddedEngineRunner, EngineOptions};
use crate::error::SourceError;
use crate::mapper::{JsonRecordMapper, RecordMapper};

const DEFAULT_STREAM_ID: &str = "default";

/// What a single pull returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Record(T),
    /// No record arrived within the poll timeout. Pulling again is fine.
    Pending,
    /// The reader finished and will not return records anymore.
    EndOfStream,
}

impl<T> ReadOutcome<T> {
    pub fn into_record(self) -> Option<T> {
        match self {
            ReadOutcome::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ReadOutcome::EndOfStream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Starting,
    Running,
    /// The record limit was reached; the next pull ends the stream.
    Draining,
    Faulted,
    Stopped,
}

/// Counts emitted records against an optional limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundedCounter {
    emitted: u64,
    limit: Option<u64>,
}

impl BoundedCounter {
    pub fn new(limit: Option<u64>) -> BoundedCounter {
        BoundedCounter { emitted: 0, limit }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.emitted))
    }

    /// True exactly when a limit is set and that many records were emitted.
    pub fn is_complete(&self) -> bool {
        self.limit.map_or(false, |limit| self.emitted >= limit)
    }

    fn record(&mut self) {
        self.emitted += 1;
    }
}

/// Closes a [`SourceReader`] from another task.
///
/// A pull waiting for data returns end-of-stream once the handle is closed.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// End the stream after this many records.
    pub max_records: Option<u64>,
    /// How long a pull waits for data before returning [`ReadOutcome::Pending`].
    /// Waits indefinitely if not set.
    pub poll_timeout: Option<Duration>,
    pub engine: EngineOptions,
}

/// Exposes the change events of an embedded connector as a pull-based
/// sequence of records.
///
/// The offset of a returned record is persisted once the record is
/// acknowledged: explicitly through [`ack`](Self::ack), by pulling the next
/// record, or by closing the reader. Records handed out but never acknowledged
/// are delivered again after a restart.
pub struct SourceReader<M: RecordMapper = JsonRecordMapper> {
    stream_id: String,
    config: ConnectorConfiguration,
    registry: ConnectorRegistry,
    store: Arc<dyn OffsetStore>,
    mapper: M,
    options: ReaderOptions,

    state: ReaderState,
    runner: Option<EmbeddedEngineRunner>,
    counter: BoundedCounter,
    unacknowledged: Vec<OffsetRecord>,
    acknowledged: OffsetMap,
    last_offset: Option<OffsetRecord>,
    fault: Option<SourceError>,
    skipped: u64,
    close_signal: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

impl<M: RecordMapper> SourceReader<M> {
    fn new(
        stream_id: String,
        config: ConnectorConfiguration,
        registry: ConnectorRegistry,
        store: Arc<dyn OffsetStore>,
        mapper: M,
        options: ReaderOptions,
    ) -> SourceReader<M> {
        let (close_signal, closed) = watch::channel(false);
        SourceReader {
            stream_id,
            config,
            registry,
            store,
            mapper,
            counter: BoundedCounter::new(options.max_records),
            options,
            state: ReaderState::Idle,
            runner: None,
            unacknowledged: vec![],
            acknowledged: OffsetMap::new(),
            last_offset: None,
            fault: None,
            skipped: 0,
            close_signal: Arc::new(close_signal),
            closed,
        }
    }

    /// Loads the stream's offsets and starts the connector from them.
    ///
    /// A failed open leaves the reader idle, so it can be retried.
    pub async fn open(&mut self) -> Result<(), SourceError> {
        if self.state != ReaderState::Idle {
            return Err(SourceError::configuration(format!(
                "cannot open a reader in state {:?}",
                self.state
            )));
        }
        self.state = ReaderState::Starting;
        info!(stream = %self.stream_id, "Opening source reader");

        match self.start().await {
            Ok(runner) => {
                info!(
                    stream = %self.stream_id,
                    engine = %runner.instance_id(),
                    "Source reader started"
                );
                self.runner = Some(runner);
                // The connector reached the source within the start timeout.
                self.state = ReaderState::Running;
                Ok(())
            }
            Err(err) => {
                warn!(stream = %self.stream_id, "Failed to open source reader: {}", err);
                self.state = ReaderState::Idle;
                Err(err)
            }
        }
    }

    async fn start(&mut self) -> Result<EmbeddedEngineRunner, SourceError> {
        let resume = self
            .store
            .load(&self.stream_id)
            .await
            .map_err(|e| SourceError::offset_store(&e, self.last_offset.clone()))?;
        for record in resume.values() {
            debug!(stream = %self.stream_id, "Resuming from {}", record);
        }
        if let Some(latest) = representative(&resume) {
            self.last_offset = Some(latest);
        }
        self.acknowledged = resume.clone();

        EmbeddedEngineRunner::start(&self.config, resume, &self.registry, &self.options.engine)
            .await
    }

    /// Acknowledges the previously returned record and pulls the next one,
    /// waiting at most the configured poll timeout.
    pub async fn next(&mut self) -> Result<ReadOutcome<M::Output>, SourceError> {
        self.next_within(self.options.poll_timeout).await
    }

    /// Like [`next`](Self::next) but returns [`ReadOutcome::Pending`] right away
    /// when no event is queued.
    pub async fn try_next(&mut self) -> Result<ReadOutcome<M::Output>, SourceError> {
        self.next_within(Some(Duration::ZERO)).await
    }

    pub async fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<ReadOutcome<M::Output>, SourceError> {
        self.next_within(Some(timeout)).await
    }

    async fn next_within(
        &mut self,
        wait: Option<Duration>,
    ) -> Result<ReadOutcome<M::Output>, SourceError> {
        match self.state {
            ReaderState::Idle => {
                return Err(SourceError::configuration("reader is not open"));
            }
            ReaderState::Stopped => return Ok(ReadOutcome::EndOfStream),
            ReaderState::Faulted => return Err(self.current_fault()),
            ReaderState::Starting | ReaderState::Running | ReaderState::Draining => {}
        }

        if self.counter.is_complete() {
            info!(
                stream = %self.stream_id,
                "Record limit of {} reached",
                self.counter.emitted()
            );
            self.close().await?;
            return Ok(ReadOutcome::EndOfStream);
        }

        self.ack().await?;

        loop {
            let Some(runner) = self.runner.as_mut() else {
                return Ok(ReadOutcome::EndOfStream);
            };

            match runner.dequeue(&mut self.closed, wait).await {
                Dequeued::Event(event) => {
                    self.unacknowledged.push(event.offset_record());

                    match self.mapper.map(&event) {
                        Ok(record) => {
                            self.counter.record();
                            if self.counter.is_complete() {
                                self.state = ReaderState::Draining;
                            }
                            return Ok(ReadOutcome::Record(record));
                        }
                        Err(err) => {
                            warn!(stream = %self.stream_id, "Skipping record: {}", err);
                            self.skipped += 1;
                        }
                    }
                }
                Dequeued::Timeout => return Ok(ReadOutcome::Pending),
                Dequeued::Closed => {
                    self.close().await?;
                    return Ok(ReadOutcome::EndOfStream);
                }
                Dequeued::Exhausted => {
                    let outcome = runner.wait().await;
                    return match outcome {
                        Ok(()) => {
                            info!(stream = %self.stream_id, "Connector finished");
                            self.close().await?;
                            Ok(ReadOutcome::EndOfStream)
                        }
                        Err(err) => {
                            let fault = SourceError::engine_fault(&err, self.last_offset.clone());
                            error!(stream = %self.stream_id, "{}", fault);
                            Err(self.fail(fault))
                        }
                    };
                }
            }
        }
    }

    /// Persists the offsets of everything handed out so far.
    pub async fn ack(&mut self) -> Result<(), SourceError> {
        for record in std::mem::take(&mut self.unacknowledged) {
            if let Err(err) = self.store.persist(&self.stream_id, &record).await {
                let fault = SourceError::offset_store(&err, self.last_offset.clone());
                error!(stream = %self.stream_id, "{}", fault);
                return Err(self.fail(fault));
            }
            debug!(stream = %self.stream_id, "Acknowledged {}", record);
            self.acknowledged
                .insert(record.partition.clone(), record.clone());
            self.last_offset = Some(record);
        }
        Ok(())
    }

    /// Acknowledges the last returned record and stops the connector.
    /// Closing an already closed reader does nothing.
    pub async fn close(&mut self) -> Result<(), SourceError> {
        if self.state == ReaderState::Stopped {
            return Ok(());
        }
        self.close_signal.send_replace(true);

        let acked = match self.state {
            ReaderState::Faulted => Ok(()),
            _ => self.ack().await,
        };
        if let Some(runner) = self.runner.as_mut() {
            runner.stop().await;
        }

        self.state = ReaderState::Stopped;
        info!(
            stream = %self.stream_id,
            "Source reader closed after {} records",
            self.counter.emitted()
        );
        acked
    }

    fn fail(&mut self, fault: SourceError) -> SourceError {
        self.state = ReaderState::Faulted;
        self.fault = Some(fault.clone());
        fault
    }

    fn current_fault(&self) -> SourceError {
        self.fault.clone().unwrap_or_else(|| SourceError::EngineFault {
            reason: "reader faulted".to_string(),
            last_offset: self.last_offset.clone(),
        })
    }

    /// Acknowledged offsets of every partition, for hosts keeping their own checkpoints.
    pub fn checkpoint(&self) -> OffsetMap {
        self.acknowledged.clone()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            signal: Arc::clone(&self.close_signal),
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn counter(&self) -> BoundedCounter {
        self.counter
    }

    /// Number of records skipped because they could not be mapped.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn last_offset(&self) -> Option<&OffsetRecord> {
        self.last_offset.as_ref()
    }

    pub fn engine_id(&self) -> Option<Uuid> {
        self.runner.as_ref().map(EmbeddedEngineRunner::instance_id)
    }

    /// Turns the reader into a stream of records, opening it if needed.
    /// The stream ends after the first error and closes the reader when it ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<M::Output, SourceError>> {
        stream::unfold(Some(self), |reader| async move {
            let Some(mut reader) = reader else {
                return None;
            };
            if reader.state() == ReaderState::Idle {
                if let Err(err) = reader.open().await {
                    return Some((Err(err), None));
                }
            }

            loop {
                match reader.next().await {
                    Ok(ReadOutcome::Record(record)) => return Some((Ok(record), Some(reader))),
                    Ok(ReadOutcome::Pending) => continue,
                    Ok(ReadOutcome::EndOfStream) => {
                        return match reader.close().await {
                            Ok(()) => None,
                            Err(err) => Some((Err(err), None)),
                        }
                    }
                    Err(err) => {
                        let _ = reader.close().await;
                        return Some((Err(err), None));
                    }
                }
            }
        })
    }
}

/// Builds a [`SourceReader`].
///
/// ```no_run
/// # use cdc_bridge::config::ConnectorConfiguration;
/// # use cdc_bridge::source_reader::SourceReaderBuilder;
/// # async fn f() -> Result<(), cdc_bridge::error::SourceError> {
/// let config = ConnectorConfiguration::create()
///     .with_connector_class("mysql")
///     .with_host_name("localhost")
///     .with_port(3306)
///     .with_username("debezium")
///     .with_password("dbz")
///     .with_connection_property("database.server.id", "184054");
///
/// let mut reader = SourceReaderBuilder::new()
///     .stream_id("inventory")
///     .configuration(config)
///     .max_records(30)
///     .build()?;
/// reader.open().await?;
/// # Ok(())
/// # }
/// ```
pub struct SourceReaderBuilder<M: RecordMapper = JsonRecordMapper> {
    stream_id: String,
    config: Option<ConnectorConfiguration>,
    registry: ConnectorRegistry,
    store: Option<Arc<dyn OffsetStore>>,
    mapper: M,
    options: ReaderOptions,
}

impl SourceReaderBuilder<JsonRecordMapper> {
    pub fn new() -> SourceReaderBuilder<JsonRecordMapper> {
        SourceReaderBuilder {
            stream_id: DEFAULT_STREAM_ID.to_string(),
            config: None,
            registry: ConnectorRegistry::default(),
            store: None,
            mapper: JsonRecordMapper,
            options: ReaderOptions::default(),
        }
    }
}

impl Default for SourceReaderBuilder<JsonRecordMapper> {
    fn default() -> Self {
        SourceReaderBuilder::new()
    }
}

impl<M: RecordMapper> SourceReaderBuilder<M> {
    /// Name the offsets are stored under.
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    pub fn configuration(mut self, config: ConnectorConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Defaults to an [`InMemoryOffsetStore`].
    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mapper<N: RecordMapper>(self, mapper: N) -> SourceReaderBuilder<N> {
        SourceReaderBuilder {
            stream_id: self.stream_id,
            config: self.config,
            registry: self.registry,
            store: self.store,
            mapper,
            options: self.options,
        }
    }

    pub fn max_records(mut self, max_records: u64) -> Self {
        self.options.max_records = Some(max_records);
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.options.engine.queue_capacity = queue_capacity;
        self
    }

    pub fn start_timeout(mut self, start_timeout: Duration) -> Self {
        self.options.engine.start_timeout = start_timeout;
        self
    }

    pub fn stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.options.engine.stop_timeout = stop_timeout;
        self
    }

    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.options.poll_timeout = Some(poll_timeout);
        self
    }

    pub fn build(self) -> Result<SourceReader<M>, SourceError> {
        let config = self
            .config
            .ok_or_else(|| SourceError::configuration("connector configuration is required"))?;
        if self.stream_id.trim().is_empty() {
            return Err(SourceError::configuration("stream id must not be empty"));
        }
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryOffsetStore::new()));

        Ok(SourceReader::new(
            self.stream_id,
            config,
            self.registry,
            store,
            self.mapper,
            self.options,
        ))
    }
}
