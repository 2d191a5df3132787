//! Acquisition dedup and queueing for shared (non-live) content.
//!
//! Many tenants can ask for the same canonical item at once; only one
//! acquisition may be in flight per item. The store's partial unique index
//! is the arbiter: losing the insert race is success, because the content is
//! queued either way. Store and cache are both allowed to be down: the
//! request path then answers `Queued` with a default priority of 1.

pub mod quality;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, CacheKeys, FastCache};

pub use quality::{QualityTable, TargetQuality};
pub use store::{
    AcquisitionEntry, AcquisitionFilter, AcquisitionStatus, NewAcquisition,
    SqliteAcquisitionStore, SqliteAcquisitionStoreBuilder, StoreError, StoreResult,
};
pub use worker::{
    AcquisitionHandler, CommandExecutor, FfmpegAcquisitionHandler, HandlerError, SourceResolver,
    StaticSourceResolver, SystemCommandExecutor, WorkerPool,
};

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("acquisition store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("acquisition store task failed: {0}")]
    Join(String),
    #[error("invalid target quality {0:?}")]
    InvalidQuality(String),
    #[error("canonical identifier must not be empty")]
    EmptyIdentifier,
    #[error("malformed acquisition job: {0}")]
    MalformedJob(#[from] serde_json::Error),
}

pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquisitionOutcome {
    /// Already acquired; serve it.
    Available,
    /// Somebody's acquisition is running; poll again later.
    Processing { status: AcquisitionStatus },
    /// Waiting for a worker. `priority` is the aggregate demand seen so far.
    Queued { priority: i64 },
}

/// Message published for workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionJob {
    pub job_id: Uuid,
    pub entry_id: i64,
    pub canonical_id: String,
    pub content_type: String,
    pub target_quality: TargetQuality,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
}

impl AcquisitionJob {
    pub fn to_json(&self) -> AcquisitionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> AcquisitionResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Rebuilds a job from its durable row, for workers that find queued
    /// work the cache never delivered.
    pub fn from_entry(entry: &AcquisitionEntry, quality: &QualityTable) -> Self {
        let target_quality = entry
            .target_quality
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| quality.resolve(&entry.content_type));
        let job_id = entry
            .job_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self {
            job_id,
            entry_id: entry.id,
            canonical_id: entry.canonical_id.clone(),
            content_type: entry.content_type.clone(),
            target_quality,
            priority: entry.priority,
            queued_at: entry.queued_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionEngine {
    store: SqliteAcquisitionStore,
    cache: Arc<dyn FastCache>,
    keys: CacheKeys,
    quality: QualityTable,
    timeout: Duration,
}

impl AcquisitionEngine {
    pub fn new(
        store: SqliteAcquisitionStore,
        cache: Arc<dyn FastCache>,
        keys: CacheKeys,
        quality: QualityTable,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            keys,
            quality,
            timeout,
        }
    }

    pub fn store(&self) -> &SqliteAcquisitionStore {
        &self.store
    }

    pub fn quality(&self) -> &QualityTable {
        &self.quality
    }

    pub async fn check_and_queue_acquisition(
        &self,
        canonical_id: &str,
        content_type: &str,
    ) -> AcquisitionResult<AcquisitionOutcome> {
        let canonical_id = canonical_id.trim();
        if canonical_id.is_empty() {
            return Err(AcquisitionError::EmptyIdentifier);
        }

        let lookup = canonical_id.to_string();
        let latest = match self
            .with_store(move |store| store.latest_for(&lookup))
            .await
        {
            Ok(latest) => latest,
            Err(err) => {
                warn!(canonical_id, error = %err, "acquisition store unavailable; answering best effort");
                return Ok(AcquisitionOutcome::Queued { priority: 1 });
            }
        };

        match latest.as_ref().map(|entry| entry.status) {
            Some(AcquisitionStatus::Complete) => Ok(AcquisitionOutcome::Available),
            Some(status) if status.is_in_progress() => {
                Ok(AcquisitionOutcome::Processing { status })
            }
            Some(AcquisitionStatus::Queued) => {
                let priority = self.bump_demand(canonical_id).await;
                self.mirror_priority(canonical_id, priority).await;
                Ok(AcquisitionOutcome::Queued { priority })
            }
            _ => {
                let priority = self.bump_demand(canonical_id).await;
                self.enqueue(canonical_id, content_type, priority).await;
                Ok(AcquisitionOutcome::Queued { priority })
            }
        }
    }

    async fn enqueue(&self, canonical_id: &str, content_type: &str, priority: i64) {
        let target_quality = self.quality.resolve(content_type);
        let job_id = Uuid::new_v4();
        let queued_at = Utc::now().trunc_subsecs(0);
        let entry = NewAcquisition {
            canonical_id: canonical_id.to_string(),
            content_type: content_type.to_string(),
            priority,
            target_quality: target_quality.to_string(),
            job_id: job_id.to_string(),
            queued_at,
        };
        match self
            .with_store(move |store| store.insert_if_absent(&entry))
            .await
        {
            Ok(Some(entry_id)) => {
                let job = AcquisitionJob {
                    job_id,
                    entry_id,
                    canonical_id: canonical_id.to_string(),
                    content_type: content_type.to_string(),
                    target_quality,
                    priority,
                    queued_at,
                };
                info!(canonical_id, entry_id, %target_quality, priority, "acquisition queued");
                self.publish(&job).await;
            }
            Ok(None) => {
                debug!(canonical_id, "acquisition already queued by a concurrent request");
                self.mirror_priority(canonical_id, priority).await;
            }
            Err(err) => {
                warn!(canonical_id, error = %err, "failed to record acquisition; answering best effort");
            }
        }
    }

    /// Increments the demand counter. Any cache failure yields priority 1.
    async fn bump_demand(&self, canonical_id: &str) -> i64 {
        let key = self.keys.demand(canonical_id);
        match tokio::time::timeout(self.timeout, self.cache.incr(&key)).await {
            Ok(Ok(value)) => value.max(1),
            Ok(Err(err)) => {
                warn!(canonical_id, error = %err, "demand counter unavailable");
                1
            }
            Err(_) => {
                warn!(canonical_id, "demand counter timed out");
                1
            }
        }
    }

    async fn mirror_priority(&self, canonical_id: &str, priority: i64) {
        let id = canonical_id.to_string();
        if let Err(err) = self
            .with_store(move |store| store.update_priority(&id, priority))
            .await
        {
            debug!(canonical_id, error = %err, "priority mirror skipped");
        }
    }

    async fn publish(&self, job: &AcquisitionJob) {
        let payload = match job.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(canonical_id = %job.canonical_id, error = %err, "failed to encode job");
                return;
            }
        };
        let queue = self.keys.acquisition_jobs();
        match tokio::time::timeout(self.timeout, self.cache.push_job(&queue, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(canonical_id = %job.canonical_id, error = %err, "job publish failed; workers will pick it up from the store")
            }
            Err(_) => {
                warn!(canonical_id = %job.canonical_id, "job publish timed out; workers will pick it up from the store")
            }
        }
    }

    /// Runs a store call off the async runtime, bounded by the timeout.
    pub(crate) async fn with_store<T, F>(&self, call: F) -> AcquisitionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteAcquisitionStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || call(&store));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_error)) => Err(AcquisitionError::Join(join_error.to_string())),
            Err(_) => Err(AcquisitionError::Timeout(self.timeout)),
        }
    }
}
