//! Cross-source job deduplication backed by a persisted seen-ID set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidflow-dedup";

/// One previously-seen job identifier. The `source` is where the ID was
/// first observed and is never overwritten by later sightings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub job_id: String,
    pub first_seen: DateTime<Utc>,
    pub source: String,
}

/// Backing storage for the seen-ID set.
#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<SeenRecord>>;
    async fn append(&self, records: &[SeenRecord]) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

/// JSON-file store. The whole record list lives in one file; writes go
/// through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct JsonSeenStore {
    path: PathBuf,
}

impl JsonSeenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomic(&self, records: &[SeenRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(records).context("serializing seen records")?;
        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp seen file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp seen file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp seen file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

#[async_trait]
impl SeenStore for JsonSeenStore {
    async fn load(&self) -> anyhow::Result<Vec<SeenRecord>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        }
    }

    async fn append(&self, records: &[SeenRecord]) -> anyhow::Result<()> {
        let mut all = self.load().await?;
        all.extend_from_slice(records);
        self.write_atomic(&all).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.write_atomic(&[]).await
    }
}

/// In-memory store for tests and mock runs.
#[derive(Debug, Default)]
pub struct MemorySeenStore {
    records: Mutex<Vec<SeenRecord>>,
}

impl MemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    async fn load(&self) -> anyhow::Result<Vec<SeenRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn append(&self, records: &[SeenRecord]) -> anyhow::Result<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.records.lock().await.clear();
        Ok(())
    }
}

/// Membership tests and batch partitioning over a [`SeenStore`].
pub struct Deduplicator {
    store: Box<dyn SeenStore>,
}

impl Deduplicator {
    pub fn new(store: Box<dyn SeenStore>) -> Self {
        Self { store }
    }

    pub async fn is_seen(&self, job_id: &str) -> anyhow::Result<bool> {
        let index = self.index().await?;
        Ok(index.contains_key(job_id))
    }

    /// Record a sighting. Returns true if the ID was newly added; an
    /// already-present record (including its source) is left untouched.
    pub async fn mark_seen(&self, job_id: &str, source: &str) -> anyhow::Result<bool> {
        let index = self.index().await?;
        if index.contains_key(job_id) {
            return Ok(false);
        }
        self.store
            .append(&[SeenRecord {
                job_id: job_id.to_string(),
                first_seen: Utc::now(),
                source: source.to_string(),
            }])
            .await?;
        Ok(true)
    }

    pub async fn source_of(&self, job_id: &str) -> anyhow::Result<Option<String>> {
        let index = self.index().await?;
        Ok(index.get(job_id).map(|r| r.source.clone()))
    }

    /// Partition raw job records into (new, duplicates).
    ///
    /// A record's ID may live under `job_id`, `id`, or `uid`. Both the
    /// persisted set and IDs already seen earlier in this same batch count
    /// as duplicates, so a repeated ID within one batch resolves to one new
    /// record and one duplicate. With `mark_new`, all newly-discovered IDs
    /// are persisted in a single batch write after partitioning.
    pub async fn partition_batch(
        &self,
        jobs: &[Value],
        mark_new: bool,
    ) -> anyhow::Result<(Vec<Value>, Vec<Value>)> {
        let index = self.index().await?;
        let mut seen_in_batch: HashSet<String> = HashSet::new();
        let now = Utc::now();

        let mut new_jobs = Vec::new();
        let mut duplicates = Vec::new();
        let mut to_persist = Vec::new();

        for job in jobs {
            let Some(job_id) = record_id(job) else {
                let title = job.get("title").and_then(Value::as_str).unwrap_or("unknown");
                warn!(title, "job record missing ID, skipping");
                continue;
            };

            if index.contains_key(&job_id) || seen_in_batch.contains(&job_id) {
                duplicates.push(job.clone());
            } else {
                seen_in_batch.insert(job_id.clone());
                to_persist.push(SeenRecord {
                    job_id,
                    first_seen: now,
                    source: job
                        .get("source")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                });
                new_jobs.push(job.clone());
            }
        }

        if mark_new && !to_persist.is_empty() {
            self.store.append(&to_persist).await?;
        }

        Ok((new_jobs, duplicates))
    }

    /// Bulk-clear the persisted set. Test/ops utility only.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.store.clear().await
    }

    async fn index(&self) -> anyhow::Result<HashMap<String, SeenRecord>> {
        let records = self.store.load().await?;
        let mut index = HashMap::with_capacity(records.len());
        for record in records {
            // First record for an ID wins.
            index.entry(record.job_id.clone()).or_insert(record);
        }
        Ok(index)
    }
}

fn record_id(job: &Value) -> Option<String> {
    ["job_id", "id", "uid"]
        .iter()
        .find_map(|key| job.get(*key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
