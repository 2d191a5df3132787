use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iptv_core::acquisition::AcquisitionFilter;
use iptv_core::cache::CacheResult;
use iptv_core::{
    AcquisitionEngine, AcquisitionHandler, AcquisitionJob, AcquisitionOutcome, AcquisitionStatus,
    CacheError, CacheKeys, FastCache, HandlerError, MemoryCache, QualityTable,
    SqliteAcquisitionStore, TargetQuality, WorkerPool,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct UnreachableCache;

#[async_trait]
impl FastCache for UnreachableCache {
    async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn incr(&self, _key: &str) -> CacheResult<i64> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn push_job(&self, _queue: &str, _payload: &str) -> CacheResult<()> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn pop_job(&self, _queue: &str) -> CacheResult<Option<String>> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

fn store(dir: &Path) -> SqliteAcquisitionStore {
    let store = SqliteAcquisitionStore::new(dir.join("iptv.sqlite")).unwrap();
    store.initialize().unwrap();
    store
}

fn engine(store: SqliteAcquisitionStore, cache: Arc<dyn FastCache>) -> AcquisitionEngine {
    AcquisitionEngine::new(
        store,
        cache,
        CacheKeys::default(),
        QualityTable::default(),
        Duration::from_secs(2),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_first_requests_queue_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MemoryCache::new());
    let first = engine(store(dir.path()), cache.clone());
    let second = engine(store(dir.path()), cache.clone());

    let (a, b) = tokio::join!(
        first.check_and_queue_acquisition("tmdb:603", "movie"),
        second.check_and_queue_acquisition("tmdb:603", "movie"),
    );
    let mut priorities = Vec::new();
    for outcome in [a.unwrap(), b.unwrap()] {
        match outcome {
            AcquisitionOutcome::Queued { priority } => priorities.push(priority),
            other => panic!("expected queued, got {other:?}"),
        }
    }
    priorities.sort();
    assert_eq!(priorities, vec![1, 2]);

    let demand = cache
        .get(&CacheKeys::default().demand("tmdb:603"))
        .await
        .unwrap();
    assert_eq!(demand.as_deref(), Some("2"));

    let entries = first.store().list(&AcquisitionFilter::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AcquisitionStatus::Queued);
    assert_eq!(entries[0].priority, 2);
    assert_eq!(cache.queue_len(&CacheKeys::default().acquisition_jobs()), 1);
}

#[tokio::test]
async fn unreachable_store_still_answers_queued() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAcquisitionStore::builder()
        .path(dir.path().join("missing").join("iptv.sqlite"))
        .create_if_missing(false)
        .build()
        .unwrap();
    let engine = engine(store, Arc::new(MemoryCache::new()));
    for _ in 0..3 {
        let outcome = engine
            .check_and_queue_acquisition("tmdb:603", "movie")
            .await
            .unwrap();
        assert_eq!(outcome, AcquisitionOutcome::Queued { priority: 1 });
    }
}

#[tokio::test]
async fn unreachable_cache_defaults_priority() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(UnreachableCache));
    for _ in 0..2 {
        let outcome = engine
            .check_and_queue_acquisition("mbid:1", "music")
            .await
            .unwrap();
        assert_eq!(outcome, AcquisitionOutcome::Queued { priority: 1 });
    }
    let entries = engine.store().list(&AcquisitionFilter::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target_quality.as_deref(), Some("lossless"));
}

#[tokio::test]
async fn status_drives_the_answer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("tmdb:1", "movie")
        .await
        .unwrap();
    let entry = engine.store().latest_for("tmdb:1").unwrap().unwrap();

    engine
        .store()
        .mark_status(entry.id, AcquisitionStatus::Transcoding)
        .unwrap();
    assert_eq!(
        engine
            .check_and_queue_acquisition("tmdb:1", "movie")
            .await
            .unwrap(),
        AcquisitionOutcome::Processing {
            status: AcquisitionStatus::Transcoding
        }
    );

    engine
        .store()
        .mark_status(entry.id, AcquisitionStatus::Complete)
        .unwrap();
    assert_eq!(
        engine
            .check_and_queue_acquisition("tmdb:1", "movie")
            .await
            .unwrap(),
        AcquisitionOutcome::Available
    );
}

#[tokio::test]
async fn failed_acquisition_is_queued_again() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("tmdb:2", "series")
        .await
        .unwrap();
    let failed = engine.store().latest_for("tmdb:2").unwrap().unwrap();
    engine.store().record_failure(failed.id, "origin 404").unwrap();

    let outcome = engine
        .check_and_queue_acquisition("tmdb:2", "series")
        .await
        .unwrap();
    assert_eq!(outcome, AcquisitionOutcome::Queued { priority: 2 });
    let latest = engine.store().latest_for("tmdb:2").unwrap().unwrap();
    assert_ne!(latest.id, failed.id);
    assert_eq!(latest.status, AcquisitionStatus::Queued);
    assert_eq!(engine.store().list(&AcquisitionFilter::default()).unwrap().len(), 2);
}

#[tokio::test]
async fn empty_identifier_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    assert!(engine.check_and_queue_acquisition("  ", "movie").await.is_err());
}

struct FakeHandler {
    fail_download: bool,
    calls: AtomicUsize,
    out: PathBuf,
}

#[async_trait]
impl AcquisitionHandler for FakeHandler {
    async fn download(&self, job: &AcquisitionJob) -> Result<PathBuf, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_download {
            return Err(HandlerError::SourceNotFound(job.canonical_id.clone()));
        }
        Ok(self.out.join("staged.mkv"))
    }

    async fn transcode(
        &self,
        job: &AcquisitionJob,
        _staged: &Path,
    ) -> Result<PathBuf, HandlerError> {
        Ok(self.out.join(format!("{}.{}", job.job_id, job.target_quality)))
    }
}

fn pool(engine: AcquisitionEngine, handler: Arc<FakeHandler>) -> WorkerPool {
    WorkerPool::new(engine, handler, 2, Duration::from_millis(20))
}

#[tokio::test]
async fn worker_moves_job_to_complete() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    let handler = Arc::new(FakeHandler {
        fail_download: false,
        calls: AtomicUsize::new(0),
        out: dir.path().to_path_buf(),
    });
    let pool = pool(engine.clone(), handler.clone());

    engine
        .check_and_queue_acquisition("pod:9", "podcast")
        .await
        .unwrap();
    let job = pool.next_job().await.unwrap();
    assert_eq!(job.target_quality, TargetQuality::Copy);

    assert_eq!(
        pool.process(&job).await.unwrap(),
        Some(AcquisitionStatus::Complete)
    );
    // The same job delivered twice is only worked once.
    assert_eq!(pool.process(&job).await.unwrap(), None);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let entry = engine.store().latest_for("pod:9").unwrap().unwrap();
    assert_eq!(entry.status, AcquisitionStatus::Complete);
    assert_eq!(entry.attempts, 1);
    assert_eq!(
        engine
            .check_and_queue_acquisition("pod:9", "podcast")
            .await
            .unwrap(),
        AcquisitionOutcome::Available
    );
}

#[tokio::test]
async fn handler_failure_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    let pool = pool(
        engine.clone(),
        Arc::new(FakeHandler {
            fail_download: true,
            calls: AtomicUsize::new(0),
            out: dir.path().to_path_buf(),
        }),
    );
    engine
        .check_and_queue_acquisition("tmdb:3", "movie")
        .await
        .unwrap();
    let job = pool.next_job().await.unwrap();
    assert_eq!(
        pool.process(&job).await.unwrap(),
        Some(AcquisitionStatus::Failed)
    );
    let entry = engine.store().latest_for("tmdb:3").unwrap().unwrap();
    assert_eq!(entry.status, AcquisitionStatus::Failed);
    assert!(entry.failure_reason.unwrap().contains("tmdb:3"));
}

#[tokio::test]
async fn workers_find_queued_rows_without_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(UnreachableCache));
    engine
        .check_and_queue_acquisition("tmdb:4", "movie")
        .await
        .unwrap();
    let handler = Arc::new(FakeHandler {
        fail_download: false,
        calls: AtomicUsize::new(0),
        out: dir.path().to_path_buf(),
    });
    let pool = Arc::new(pool(engine.clone(), handler));

    let cancel = CancellationToken::new();
    let running = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let entry = engine.store().latest_for("tmdb:4").unwrap().unwrap();
        if entry.status == AcquisitionStatus::Complete {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("workers stop promptly")
        .unwrap();
}

#[tokio::test]
async fn dispatch_follows_aggregate_demand() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("low", "movie")
        .await
        .unwrap();
    for _ in 0..3 {
        engine
            .check_and_queue_acquisition("hot", "movie")
            .await
            .unwrap();
    }
    let pool = pool(
        engine.clone(),
        Arc::new(FakeHandler {
            fail_download: false,
            calls: AtomicUsize::new(0),
            out: dir.path().to_path_buf(),
        }),
    );

    let first = pool.next_job().await.unwrap();
    assert_eq!(first.canonical_id, "hot");
    assert_eq!(first.priority, 3);
    assert_eq!(
        pool.process(&first).await.unwrap(),
        Some(AcquisitionStatus::Complete)
    );
    let second = pool.next_job().await.unwrap();
    assert_eq!(second.canonical_id, "low");
}

struct SlowDownload {
    delay: Duration,
}

#[async_trait]
impl AcquisitionHandler for SlowDownload {
    async fn download(&self, _job: &AcquisitionJob) -> Result<PathBuf, HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(PathBuf::from("staged.mkv"))
    }

    async fn transcode(
        &self,
        _job: &AcquisitionJob,
        staged: &Path,
    ) -> Result<PathBuf, HandlerError> {
        Ok(staged.to_path_buf())
    }
}

#[tokio::test]
async fn shutdown_interrupts_running_job_and_requeues_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("tmdb:5", "movie")
        .await
        .unwrap();
    let pool = Arc::new(WorkerPool::new(
        engine.clone(),
        Arc::new(SlowDownload {
            delay: Duration::from_secs(30),
        }),
        1,
        Duration::from_millis(20),
    ));

    let cancel = CancellationToken::new();
    let running = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let entry = engine.store().latest_for("tmdb:5").unwrap().unwrap();
        if entry.status == AcquisitionStatus::Downloading {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never claimed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(3), running)
        .await
        .expect("workers stop while a download is running")
        .unwrap();

    let entry = engine.store().latest_for("tmdb:5").unwrap().unwrap();
    assert_eq!(entry.status, AcquisitionStatus::Queued);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn abandoned_in_flight_rows_are_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("tmdb:6", "movie")
        .await
        .unwrap();
    let entry = engine.store().latest_for("tmdb:6").unwrap().unwrap();
    engine
        .store()
        .transition(entry.id, AcquisitionStatus::Queued, AcquisitionStatus::Downloading)
        .unwrap();

    let handler = Arc::new(SlowDownload {
        delay: Duration::ZERO,
    });
    let patient = WorkerPool::new(engine.clone(), handler.clone(), 1, Duration::from_millis(20));
    assert_eq!(patient.reclaim_stale().await.unwrap(), 0);
    assert!(matches!(
        engine
            .check_and_queue_acquisition("tmdb:6", "movie")
            .await
            .unwrap(),
        AcquisitionOutcome::Processing { .. }
    ));

    let eager = WorkerPool::new(engine.clone(), handler, 1, Duration::from_millis(20))
        .with_stale_after(Duration::ZERO);
    assert_eq!(eager.reclaim_stale().await.unwrap(), 1);
    assert!(matches!(
        engine
            .check_and_queue_acquisition("tmdb:6", "movie")
            .await
            .unwrap(),
        AcquisitionOutcome::Queued { .. }
    ));
    let job = eager.next_job().await.unwrap();
    assert_eq!(job.entry_id, entry.id);
}

struct ReclaimedMidDownload {
    store: SqliteAcquisitionStore,
    transcodes: AtomicUsize,
}

#[async_trait]
impl AcquisitionHandler for ReclaimedMidDownload {
    async fn download(&self, job: &AcquisitionJob) -> Result<PathBuf, HandlerError> {
        self.store.requeue(job.entry_id).unwrap();
        Ok(PathBuf::from("staged.mkv"))
    }

    async fn transcode(
        &self,
        _job: &AcquisitionJob,
        staged: &Path,
    ) -> Result<PathBuf, HandlerError> {
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        Ok(staged.to_path_buf())
    }
}

#[tokio::test]
async fn lost_claim_skips_transcode() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(store(dir.path()), Arc::new(MemoryCache::new()));
    engine
        .check_and_queue_acquisition("tmdb:7", "movie")
        .await
        .unwrap();
    let handler = Arc::new(ReclaimedMidDownload {
        store: engine.store().clone(),
        transcodes: AtomicUsize::new(0),
    });
    let pool = WorkerPool::new(engine.clone(), handler.clone(), 1, Duration::from_millis(20));

    let job = pool.next_job().await.unwrap();
    assert_eq!(pool.process(&job).await.unwrap(), None);
    assert_eq!(handler.transcodes.load(Ordering::SeqCst), 0);
    let entry = engine.store().latest_for("tmdb:7").unwrap().unwrap();
    assert_eq!(entry.status, AcquisitionStatus::Queued);
}

#[test]
fn quality_table_is_data_driven() {
    let table = QualityTable::new(TargetQuality::Resolution(720))
        .with("music", TargetQuality::Lossless)
        .with("audiobook", TargetQuality::Copy);
    assert_eq!(table.resolve("audiobook"), TargetQuality::Copy);
    assert_eq!(table.resolve("MUSIC"), TargetQuality::Lossless);
    assert_eq!(table.resolve("documentary"), TargetQuality::Resolution(720));
}
