use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcquisitionEngine, AcquisitionJob, AcquisitionResult, AcquisitionStatus, TargetQuality};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no source available for {0}")]
    SourceNotFound(String),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.output().await
    }
}

/// Finds where a piece of shared content can be fetched from.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, job: &AcquisitionJob) -> Result<String, HandlerError>;
}

/// Substitutes `{id}` and `{type}` into a fixed URL template.
#[derive(Debug, Clone)]
pub struct StaticSourceResolver {
    template: String,
}

impl StaticSourceResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl SourceResolver for StaticSourceResolver {
    async fn resolve(&self, job: &AcquisitionJob) -> Result<String, HandlerError> {
        let source = self
            .template
            .replace("{id}", &job.canonical_id)
            .replace("{type}", &job.content_type);
        if source.trim().is_empty() {
            return Err(HandlerError::SourceNotFound(job.canonical_id.clone()));
        }
        Ok(source)
    }
}

/// The two phases of an acquisition.
#[async_trait]
pub trait AcquisitionHandler: Send + Sync {
    /// Fetches the source into staging and returns the staged file.
    async fn download(&self, job: &AcquisitionJob) -> Result<PathBuf, HandlerError>;

    /// Produces the target-quality output from the staged file.
    async fn transcode(&self, job: &AcquisitionJob, staged: &Path)
        -> Result<PathBuf, HandlerError>;
}

pub struct FfmpegAcquisitionHandler {
    ffmpeg: PathBuf,
    staging_dir: PathBuf,
    library_dir: PathBuf,
    resolver: Arc<dyn SourceResolver>,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for FfmpegAcquisitionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegAcquisitionHandler")
            .field("ffmpeg", &self.ffmpeg)
            .field("staging_dir", &self.staging_dir)
            .field("library_dir", &self.library_dir)
            .finish()
    }
}

impl FfmpegAcquisitionHandler {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        library_dir: impl Into<PathBuf>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            staging_dir: staging_dir.into(),
            library_dir: library_dir.into(),
            resolver,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn output_path(&self, job: &AcquisitionJob) -> PathBuf {
        let stem = file_stem(&job.canonical_id);
        let name = match job.target_quality {
            TargetQuality::Lossless => format!("{stem}.flac"),
            TargetQuality::Copy => format!("{stem}.mkv"),
            TargetQuality::Resolution(height) => format!("{stem}_{height}p.mp4"),
        };
        self.library_dir.join(name)
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<(), HandlerError> {
        let mut command = Command::new(&self.ffmpeg);
        command.args(&args).kill_on_drop(true);
        let output = self.executor.run(&mut command).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .trim()
            .chars()
            .rev()
            .take(512)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Err(HandlerError::CommandFailure {
            command: self.ffmpeg.display().to_string(),
            status: output.status.code(),
            stderr: tail,
        })
    }
}

#[async_trait]
impl AcquisitionHandler for FfmpegAcquisitionHandler {
    async fn download(&self, job: &AcquisitionJob) -> Result<PathBuf, HandlerError> {
        let source = self.resolver.resolve(job).await?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staging_dir.join(format!("{}.mkv", job.job_id));
        self.run_ffmpeg(vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            source,
            "-map".into(),
            "0".into(),
            "-c".into(),
            "copy".into(),
            staged.to_string_lossy().to_string(),
        ])
        .await?;
        Ok(staged)
    }

    async fn transcode(
        &self,
        job: &AcquisitionJob,
        staged: &Path,
    ) -> Result<PathBuf, HandlerError> {
        tokio::fs::create_dir_all(&self.library_dir).await?;
        let output = self.output_path(job);
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            staged.to_string_lossy().to_string(),
        ];
        match job.target_quality {
            TargetQuality::Lossless => {
                args.extend(["-vn".into(), "-c:a".into(), "flac".into()]);
            }
            TargetQuality::Copy => {
                args.extend(["-map".into(), "0".into(), "-c".into(), "copy".into()]);
            }
            TargetQuality::Resolution(height) => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    "-crf".into(),
                    "20".into(),
                    "-vf".into(),
                    format!("scale=-2:{height}"),
                    "-c:a".into(),
                    "aac".into(),
                    "-b:a".into(),
                    "160k".into(),
                    "-movflags".into(),
                    "+faststart".into(),
                ]);
            }
        }
        args.push(output.to_string_lossy().to_string());
        self.run_ffmpeg(args).await?;
        if let Err(err) = tokio::fs::remove_file(staged).await {
            debug!(path = %staged.display(), error = %err, "staged file not removed");
        }
        Ok(output)
    }
}

fn file_stem(canonical_id: &str) -> String {
    canonical_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Works queued acquisitions in aggregate-demand order.
///
/// The store decides what runs next. Messages on the cache queue only
/// announce that work exists; each dispatch drains one so the queue stays
/// bounded.
pub struct WorkerPool {
    engine: AcquisitionEngine,
    handler: Arc<dyn AcquisitionHandler>,
    workers: usize,
    poll_interval: Duration,
    stale_after: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        engine: AcquisitionEngine,
        handler: Arc<dyn AcquisitionHandler>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            handler,
            workers: workers.max(1),
            poll_interval,
            stale_after: Duration::from_secs(6 * 3600),
        }
    }

    /// Age after which an in-flight row is assumed abandoned. Must exceed
    /// the longest legitimate acquisition.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Runs every worker until `cancel` fires. Jobs interrupted by the
    /// cancellation go back to the queue.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(workers = self.workers, "acquisition workers started");
        let loops = (0..self.workers).map(|worker| self.worker_loop(worker, cancel.clone()));
        tokio::join!(
            futures::future::join_all(loops),
            self.reclaim_loop(cancel.clone())
        );
        info!("acquisition workers stopped");
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let job = match self.next_job().await {
                Some(job) => job,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };
            match self.claim(&job).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(worker, canonical_id = %job.canonical_id, error = %err, "failed to claim acquisition");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            }
            tokio::select! {
                result = self.work_claimed(&job) => {
                    if let Err(err) = result {
                        warn!(worker, canonical_id = %job.canonical_id, error = %err, "acquisition job failed to update store");
                    }
                }
                _ = cancel.cancelled() => {
                    self.release(&job).await;
                    break;
                }
            }
        }
    }

    /// Periodically hands abandoned in-flight rows back to the queue, once
    /// at start and then every `stale_after`.
    async fn reclaim_loop(&self, cancel: CancellationToken) {
        let period = self.stale_after.max(self.poll_interval).max(Duration::from_secs(1));
        loop {
            if let Err(err) = self.reclaim_stale().await {
                debug!(error = %err, "stale acquisition sweep skipped");
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    pub async fn reclaim_stale(&self) -> AcquisitionResult<usize> {
        let age = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = chrono::Utc::now() - age;
        let reclaimed = self
            .engine
            .with_store(move |store| store.reclaim_stale(cutoff))
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "requeued stale acquisitions");
        }
        Ok(reclaimed)
    }

    /// Highest-demand queued entry, or `None` when nothing is queued or the
    /// store is unreachable.
    pub async fn next_job(&self) -> Option<AcquisitionJob> {
        let pending = match self
            .engine
            .with_store(|store| store.pending_by_priority(1))
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                debug!(error = %err, "acquisition store unavailable");
                return None;
            }
        };
        self.drain_notification().await;
        pending
            .first()
            .map(|entry| AcquisitionJob::from_entry(entry, &self.engine.quality))
    }

    async fn drain_notification(&self) {
        let queue = self.engine.keys.acquisition_jobs();
        match tokio::time::timeout(self.engine.timeout, self.engine.cache.pop_job(&queue)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(error = %err, "job queue unavailable"),
            Err(_) => debug!("job queue timed out"),
        }
    }

    /// Drives one job through its states. Returns the final status, or
    /// `None` when another worker had already claimed the entry.
    pub async fn process(&self, job: &AcquisitionJob) -> AcquisitionResult<Option<AcquisitionStatus>> {
        if !self.claim(job).await? {
            return Ok(None);
        }
        self.work_claimed(job).await
    }

    async fn claim(&self, job: &AcquisitionJob) -> AcquisitionResult<bool> {
        let id = job.entry_id;
        let claimed = self
            .engine
            .with_store(move |store| {
                store.transition(id, AcquisitionStatus::Queued, AcquisitionStatus::Downloading)
            })
            .await?;
        if !claimed {
            debug!(canonical_id = %job.canonical_id, entry_id = id, "job already claimed");
        }
        Ok(claimed)
    }

    async fn release(&self, job: &AcquisitionJob) {
        let id = job.entry_id;
        match self.engine.with_store(move |store| store.requeue(id)).await {
            Ok(true) => info!(canonical_id = %job.canonical_id, entry_id = id, "interrupted acquisition requeued"),
            Ok(false) => {}
            Err(err) => {
                warn!(canonical_id = %job.canonical_id, entry_id = id, error = %err, "interrupted acquisition left in flight")
            }
        }
    }

    async fn work_claimed(
        &self,
        job: &AcquisitionJob,
    ) -> AcquisitionResult<Option<AcquisitionStatus>> {
        let id = job.entry_id;
        info!(canonical_id = %job.canonical_id, entry_id = id, "acquisition downloading");

        let staged = match self.handler.download(job).await {
            Ok(staged) => staged,
            Err(err) => return self.fail(job, err).await,
        };

        let still_ours = self
            .engine
            .with_store(move |store| {
                store.transition(
                    id,
                    AcquisitionStatus::Downloading,
                    AcquisitionStatus::Transcoding,
                )
            })
            .await?;
        if !still_ours {
            warn!(canonical_id = %job.canonical_id, entry_id = id, "acquisition changed hands during download; abandoning");
            return Ok(None);
        }
        debug!(canonical_id = %job.canonical_id, entry_id = id, "acquisition transcoding");

        let output = match self.handler.transcode(job, &staged).await {
            Ok(output) => output,
            Err(err) => return self.fail(job, err).await,
        };

        self.engine
            .with_store(move |store| store.mark_status(id, AcquisitionStatus::Complete))
            .await?;
        info!(
            canonical_id = %job.canonical_id,
            entry_id = id,
            output = %output.display(),
            "acquisition complete"
        );
        Ok(Some(AcquisitionStatus::Complete))
    }

    async fn fail(
        &self,
        job: &AcquisitionJob,
        err: HandlerError,
    ) -> AcquisitionResult<Option<AcquisitionStatus>> {
        warn!(canonical_id = %job.canonical_id, entry_id = job.entry_id, error = %err, "acquisition failed");
        let id = job.entry_id;
        let reason = err.to_string();
        self.engine
            .with_store(move |store| store.record_failure(id, &reason))
            .await?;
        Ok(Some(AcquisitionStatus::Failed))
    }
}
