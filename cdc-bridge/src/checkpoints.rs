//! A module representing the logic behind saving progress.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cdc_types::{OffsetRecord, SourcePartition};

/// Offsets of every partition of a stream, keyed by partition.
pub type OffsetMap = HashMap<SourcePartition, OffsetRecord>;

/// One offset out of `offsets` to report alongside an error, picked by
/// partition name so the choice is stable. It is not the most recent offset
/// when several partitions are tracked.
pub(crate) fn representative(offsets: &OffsetMap) -> Option<OffsetRecord> {
    offsets
        .values()
        .max_by(|a, b| a.partition.cmp(&b.partition))
        .cloned()
}

/// Customizable trait responsible for saving offsets.
///
/// The store always holds the offset of the last delivered and acknowledged
/// event of each partition, never one that is still in flight.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Loads offsets saved for the given stream. Returns an empty map for a fresh start.
    async fn load(&self, stream_id: &str) -> anyhow::Result<OffsetMap>;
    /// Saves the offset of one partition. Saving the same value again must be harmless.
    async fn persist(&self, stream_id: &str, record: &OffsetRecord) -> anyhow::Result<()>;
}

/// Keeps offsets in memory. Suitable for tests and for hosts that
/// snapshot offsets through [`checkpoint`](crate::source_reader::SourceReader::checkpoint).
#[derive(Default)]
pub struct InMemoryOffsetStore {
    streams: Mutex<HashMap<String, OffsetMap>>,
    writes: AtomicUsize,
}

impl InMemoryOffsetStore {
    pub fn new() -> InMemoryOffsetStore {
        InMemoryOffsetStore::default()
    }

    /// Number of `persist` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, stream_id: &str) -> anyhow::Result<OffsetMap> {
        Ok(self
            .streams
            .lock()
            .await
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist(&self, stream_id: &str, record: &OffsetRecord) -> anyhow::Result<()> {
        self.streams
            .lock()
            .await
            .entry(stream_id.to_string())
            .or_default()
            .insert(record.partition.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Saves offsets as JSON files, one per stream, in a directory:
/// ```text
/// offset_dir/
///   <stream_id>.json
/// ```
/// Files are replaced atomically (temporary file + rename).
pub struct FileOffsetStore {
    dir: PathBuf,
    fsync: bool,
    cache: Mutex<HashMap<String, OffsetMap>>,
}

impl FileOffsetStore {
    /// Creates the store, creating `dir` if it does not exist.
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        FileOffsetStore::with_options(dir, true).await
    }

    pub async fn with_options(dir: impl Into<PathBuf>, fsync: bool) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create offset directory {}", dir.display()))?;

        Ok(FileOffsetStore {
            dir,
            fsync,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, stream_id: &str) -> anyhow::Result<PathBuf> {
        if stream_id.is_empty()
            || stream_id.contains('/')
            || stream_id.contains('\\')
            || stream_id.starts_with('.')
        {
            bail!("invalid stream id {stream_id:?}");
        }
        Ok(self.dir.join(format!("{stream_id}.json")))
    }

    async fn read_file(&self, stream_id: &str) -> anyhow::Result<OffsetMap> {
        let path = self.file_path(stream_id)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(OffsetMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let records: Vec<OffsetRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("corrupted offset file {}", path.display()))?;

        Ok(records
            .into_iter()
            .map(|record| (record.partition.clone(), record))
            .collect())
    }

    async fn write_file(&self, stream_id: &str, offsets: &OffsetMap) -> anyhow::Result<()> {
        let path = self.file_path(stream_id)?;
        let temp_path = path.with_extension("json.tmp");

        let mut records: Vec<&OffsetRecord> = offsets.values().collect();
        records.sort_by(|a, b| a.partition.cmp(&b.partition));
        let json = serde_json::to_vec_pretty(&records)?;

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, stream_id: &str) -> anyhow::Result<OffsetMap> {
        let mut cache = self.cache.lock().await;
        if let Some(offsets) = cache.get(stream_id) {
            return Ok(offsets.clone());
        }

        let offsets = self.read_file(stream_id).await?;
        cache.insert(stream_id.to_string(), offsets.clone());
        Ok(offsets)
    }

    async fn persist(&self, stream_id: &str, record: &OffsetRecord) -> anyhow::Result<()> {
        let mut cache = self.cache.lock().await;
        let mut offsets = match cache.get(stream_id) {
            Some(offsets) => offsets.clone(),
            None => self.read_file(stream_id).await?,
        };
        offsets.insert(record.partition.clone(), record.clone());

        // Cache is updated only once the file is in place.
        self.write_file(stream_id, &offsets).await?;
        cache.insert(stream_id.to_string(), offsets);

        debug!("Saved offset for stream {}: {}", stream_id, record);
        Ok(())
    }
}
