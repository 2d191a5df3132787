//! Per-channel transcoder supervision.
//!
//! Every active channel owns one task that launches the transcoder through a
//! [`ProcessRunner`], waits for it and applies the restart policy: exponential
//! backoff between attempts and at most `max_restarts` restarts inside a
//! sliding `restart_window`. A channel that exhausts its budget is parked in
//! [`ChannelState::Degraded`] until an operator calls `reset_channel`.

pub mod backoff;
pub mod disk;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod variant;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::IptvConfig;
use crate::keys::{validate_channel, KeyError, KeyManager};

pub use backoff::{Backoff, RestartBudget};
pub use disk::{DiskMonitor, DiskUsageSample};
pub use metrics::SupervisorMetrics;
pub use progress::{parse_speed, Progress, ProgressParser};
pub use runner::{
    LaunchSpec, ProcessExit, ProcessLauncher, ProcessRunner, SystemLauncher, TelemetrySink,
};
pub use variant::{build_transcode_args, validate_variants, HlsSettings, Variant, VariantKind};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid variants: {0}")]
    InvalidVariants(String),
    #[error("invalid channel identifier {0:?}")]
    InvalidChannel(String),
    #[error("key provisioning failed: {0}")]
    Keys(#[from] KeyError),
    #[error("channel {0} is degraded and must be reset first")]
    ChannelDegraded(String),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Degraded,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Restarting => "restarting",
            ChannelState::Degraded => "degraded",
        }
    }

    /// States in which a channel task is alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChannelState::Starting | ChannelState::Running | ChannelState::Restarting
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub state: ChannelState,
    pub variants: Vec<String>,
    pub restarts_in_window: u32,
    pub total_restarts: u64,
    pub speed_ratio: Option<f64>,
    pub dropped_frames: u64,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ffmpeg: PathBuf,
    pub segments_dir: PathBuf,
    pub hls: HlsSettings,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub healthy_reset: Duration,
    pub stop_grace: Duration,
    pub cpu_sample_interval: Duration,
    pub rotation_lead: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &IptvConfig) -> Self {
        let section = &config.supervisor;
        Self {
            ffmpeg: PathBuf::from(&section.ffmpeg),
            segments_dir: config.resolve_path(&config.paths.segments_dir),
            hls: HlsSettings {
                log_level: section.log_level.clone(),
                segment_duration: section.hls_segment_duration.get(),
                list_size: section.hls_list_size,
            },
            max_restarts: section.max_restarts,
            restart_window: section.restart_window.get(),
            backoff_initial: section.backoff_initial.get(),
            backoff_max: section.backoff_max.get(),
            healthy_reset: section.healthy_reset.get(),
            stop_grace: section.stop_grace.get(),
            cpu_sample_interval: config.monitor.metrics_interval.get(),
            rotation_lead: config.keys.rotation_lead.get(),
        }
    }
}

struct ChannelRecord {
    status: ChannelStatus,
    budget: RestartBudget,
}

type SharedRecord = Arc<Mutex<ChannelRecord>>;

struct ChannelEntry {
    record: SharedRecord,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    settings: SupervisorSettings,
    keys: Arc<KeyManager>,
    launcher: Arc<dyn ProcessLauncher>,
    metrics: SupervisorMetrics,
    clock: SharedClock,
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

/// Cheap to clone; clones share the same channel table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        keys: Arc<KeyManager>,
        metrics: SupervisorMetrics,
        clock: SharedClock,
        launcher: Option<Arc<dyn ProcessLauncher>>,
    ) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(SystemLauncher));
        Self {
            inner: Arc::new(Inner {
                settings,
                keys,
                launcher,
                metrics,
                clock,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn metrics(&self) -> &SupervisorMetrics {
        &self.inner.metrics
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.inner.keys
    }

    /// Starts the channel's transcoder. A channel that is already starting,
    /// running or restarting is left alone and its status returned.
    pub async fn start_channel(
        &self,
        channel: &str,
        source_url: &str,
        variants: Vec<Variant>,
    ) -> SupervisorResult<ChannelStatus> {
        validate_channel(channel).map_err(|_| SupervisorError::InvalidChannel(channel.into()))?;
        validate_variants(&variants)?;

        let (record, cancel) = {
            let mut channels = lock(&self.inner.channels);
            if let Some(entry) = channels.get(channel) {
                let state = lock(&entry.record).status.state;
                if state.is_active() {
                    debug!(channel, %state, "channel already active");
                    return Ok(self.inner.snapshot(&entry.record));
                }
                if state == ChannelState::Degraded {
                    return Err(SupervisorError::ChannelDegraded(channel.into()));
                }
            }
            let record = match channels.remove(channel) {
                Some(previous) => previous.record,
                None => Arc::new(Mutex::new(ChannelRecord {
                    status: empty_status(channel),
                    budget: RestartBudget::new(
                        self.inner.settings.max_restarts,
                        self.inner.settings.restart_window,
                    ),
                })),
            };
            {
                let mut guard = lock(&record);
                guard.status.state = ChannelState::Starting;
                guard.status.variants = variants.iter().map(|v| v.name.clone()).collect();
                guard.status.last_error = None;
                guard.status.pid = None;
            }
            let cancel = CancellationToken::new();
            channels.insert(
                channel.to_string(),
                ChannelEntry {
                    record: record.clone(),
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            (record, cancel)
        };
        self.inner.refresh_gauges();

        let launch = match self.inner.prepare_launch(channel, source_url, &variants).await {
            Ok(launch) => launch,
            Err(err) => {
                {
                    let mut guard = lock(&record);
                    guard.status.state = ChannelState::Stopped;
                    guard.status.last_error = Some(err.to_string());
                }
                self.inner.metrics.record_failure(channel);
                self.inner.refresh_gauges();
                error!(channel, error = %err, "channel start aborted");
                return Err(err);
            }
        };

        self.inner.metrics.set_variant_count(channel, variants.len());
        let run = ChannelRun {
            channel: channel.to_string(),
            variants,
            launch,
            record: record.clone(),
        };
        {
            // A stop issued while the launch was being prepared wins.
            let mut channels = lock(&self.inner.channels);
            match channels.get_mut(channel) {
                Some(entry) if !cancel.is_cancelled() => {
                    entry.task = Some(tokio::spawn(run_channel(self.inner.clone(), run, cancel)));
                }
                _ => {
                    drop(channels);
                    debug!(channel, "channel stopped before launch");
                    {
                        let mut guard = lock(&record);
                        if guard.status.state != ChannelState::Degraded {
                            guard.status.state = ChannelState::Stopped;
                        }
                        guard.status.pid = None;
                    }
                    self.inner.refresh_gauges();
                    return Ok(self.inner.snapshot(&record));
                }
            }
        }
        info!(channel, "channel started");
        Ok(self.inner.snapshot(&record))
    }

    /// Stops the channel's transcoder. Unknown or already stopped channels
    /// are a no-op; a degraded channel stays degraded.
    pub async fn stop_channel(&self, channel: &str) -> SupervisorResult<()> {
        let (record, cancel, task) = {
            let mut channels = lock(&self.inner.channels);
            let Some(entry) = channels.get_mut(channel) else {
                return Ok(());
            };
            (entry.record.clone(), entry.cancel.clone(), entry.task.take())
        };
        cancel.cancel();
        if let Some(task) = task {
            if let Err(join_error) = task.await {
                warn!(channel, %join_error, "channel task ended abnormally");
            }
        }
        {
            let mut guard = lock(&record);
            if guard.status.state != ChannelState::Degraded {
                guard.status.state = ChannelState::Stopped;
            }
            guard.status.pid = None;
        }
        self.inner.refresh_gauges();
        info!(channel, "channel stopped");
        Ok(())
    }

    /// Operator intervention: returns a degraded channel to `stopped` and
    /// clears its restart window.
    pub fn reset_channel(&self, channel: &str) -> SupervisorResult<ChannelStatus> {
        let record = {
            let channels = lock(&self.inner.channels);
            channels
                .get(channel)
                .map(|entry| entry.record.clone())
                .ok_or_else(|| SupervisorError::UnknownChannel(channel.into()))?
        };
        {
            let mut guard = lock(&record);
            if guard.status.state == ChannelState::Degraded {
                guard.status.state = ChannelState::Stopped;
                guard.status.last_error = None;
                guard.budget.clear();
                info!(channel, "degraded channel reset");
            }
        }
        self.inner.refresh_gauges();
        Ok(self.inner.snapshot(&record))
    }

    pub fn status(&self, channel: &str) -> Option<ChannelStatus> {
        let channels = lock(&self.inner.channels);
        channels
            .get(channel)
            .map(|entry| self.inner.snapshot(&entry.record))
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        let channels = lock(&self.inner.channels);
        let mut statuses: Vec<_> = channels
            .values()
            .map(|entry| self.inner.snapshot(&entry.record))
            .collect();
        statuses.sort_by(|a, b| a.channel.cmp(&b.channel));
        statuses
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.inner.channels).keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop_channel(&id).await {
                warn!(channel = %id, error = %err, "failed to stop channel");
            }
        }
    }

    /// Provisions tomorrow's key for every active channel.
    pub async fn provision_next_keys(&self) -> usize {
        let mut provisioned = 0;
        for channel in self.active_channel_ids() {
            match self.inner.keys.rotate_key(&channel).await {
                Ok(_) => provisioned += 1,
                Err(err) => warn!(channel = %channel, error = %err, "key pre-provisioning failed"),
            }
        }
        provisioned
    }

    /// Rewrites the key-info descriptor of every active channel so the running
    /// transcoder picks up the current day's key on its next rekey.
    pub async fn refresh_key_info(&self) -> usize {
        let mut refreshed = 0;
        for channel in self.active_channel_ids() {
            match self.inner.keys.write_key_info(&channel).await {
                Ok(_) => refreshed += 1,
                Err(err) => warn!(channel = %channel, error = %err, "key info refresh failed"),
            }
        }
        refreshed
    }

    /// Runs until cancelled: `rotation_lead` before each UTC midnight the
    /// next keys are provisioned, and right after it the descriptors are
    /// rewritten.
    pub async fn run_key_rotation(&self, cancel: CancellationToken) {
        loop {
            let now = self.inner.clock.now();
            let boundary = next_utc_midnight(now);
            let lead = chrono::Duration::from_std(self.inner.settings.rotation_lead)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
            let provision_at = boundary - lead;

            if !sleep_until(&cancel, now, provision_at).await {
                return;
            }
            let provisioned = self.provision_next_keys().await;
            info!(provisioned, day = %boundary.date_naive(), "next day keys provisioned");

            let now = self.inner.clock.now();
            if !sleep_until(&cancel, now, boundary + chrono::Duration::seconds(1)).await {
                return;
            }
            let refreshed = self.refresh_key_info().await;
            info!(refreshed, "key info rotated");
        }
    }

    fn active_channel_ids(&self) -> Vec<String> {
        let channels = lock(&self.inner.channels);
        let mut ids: Vec<String> = channels
            .iter()
            .filter(|(_, entry)| lock(&entry.record).status.state.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Inner {
    async fn prepare_launch(
        &self,
        channel: &str,
        source_url: &str,
        variants: &[Variant],
    ) -> SupervisorResult<LaunchSpec> {
        let key_info = self.keys.write_key_info(channel).await?;
        let output_dir = self.settings.segments_dir.join(channel);
        for variant in variants {
            let dir = output_dir.join(&variant.name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| SupervisorError::Io { source, path: dir })?;
        }
        let args = build_transcode_args(
            &self.settings.hls,
            source_url,
            variants,
            Some(&key_info.descriptor_path),
            &output_dir,
        );
        Ok(LaunchSpec {
            program: self.settings.ffmpeg.clone(),
            args,
            stop_grace: self.settings.stop_grace,
            cpu_sample_interval: self.settings.cpu_sample_interval,
        })
    }

    fn snapshot(&self, record: &SharedRecord) -> ChannelStatus {
        let mut guard = lock(record);
        let now = self.clock.now();
        let used = guard.budget.used(now);
        let mut status = guard.status.clone();
        status.restarts_in_window = used;
        status
    }

    fn refresh_gauges(&self) {
        let channels = lock(&self.channels);
        let (mut active, mut degraded) = (0, 0);
        for entry in channels.values() {
            match lock(&entry.record).status.state {
                state if state.is_active() => active += 1,
                ChannelState::Degraded => degraded += 1,
                _ => {}
            }
        }
        self.metrics.set_active_channels(active);
        self.metrics.set_degraded_channels(degraded);
    }
}

struct ChannelRun {
    channel: String,
    variants: Vec<Variant>,
    launch: LaunchSpec,
    record: SharedRecord,
}

async fn run_channel(inner: Arc<Inner>, run: ChannelRun, cancel: CancellationToken) {
    let channel = run.channel.as_str();
    let mut backoff = Backoff::new(inner.settings.backoff_initial, inner.settings.backoff_max);

    loop {
        let sink = Arc::new(ChannelTelemetry::new(
            channel,
            &run.variants,
            inner.metrics.clone(),
            run.record.clone(),
        ));
        let started = tokio::time::Instant::now();
        let exit = match ProcessRunner::start(inner.launcher.as_ref(), &run.launch, sink.clone()) {
            Ok(mut runner) => {
                {
                    let mut guard = lock(&run.record);
                    guard.status.state = ChannelState::Running;
                    guard.status.pid = runner.pid();
                    guard.status.started_at = Some(inner.clock.now());
                }
                inner.refresh_gauges();
                debug!(channel, pid = runner.pid(), "transcoder launched");

                let exit = tokio::select! {
                    exit = runner.wait() => Some(exit),
                    _ = cancel.cancelled() => None,
                };
                match exit {
                    Some(exit) => exit,
                    None => {
                        runner.stop();
                        let _ = runner.wait().await;
                        mark_stopped(&run.record);
                        return;
                    }
                }
            }
            Err(err) => ProcessExit::WaitFailed(format!("launch failed: {err}")),
        };

        if cancel.is_cancelled() {
            mark_stopped(&run.record);
            return;
        }

        inner.metrics.record_failure(channel);
        let reason = failure_reason(&exit, sink.last_stderr());
        if started.elapsed() >= inner.settings.healthy_reset {
            backoff.reset();
        }

        let now = inner.clock.now();
        let granted = {
            let mut guard = lock(&run.record);
            guard.status.pid = None;
            guard.status.last_exit_code = exit.code();
            guard.status.last_error = Some(reason.clone());
            let granted = guard.budget.try_consume(now);
            if granted {
                guard.status.state = ChannelState::Restarting;
                guard.status.total_restarts += 1;
            } else {
                guard.status.state = ChannelState::Degraded;
            }
            granted
        };

        if !granted {
            inner.refresh_gauges();
            error!(
                channel,
                max_restarts = inner.settings.max_restarts,
                reason = %reason,
                "restart budget exhausted; channel degraded"
            );
            return;
        }

        inner.metrics.record_restart(channel, run.variants.len());
        inner.refresh_gauges();
        let delay = backoff.next_delay();
        warn!(
            channel,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "transcoder exited; restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                mark_stopped(&run.record);
                return;
            }
        }

        if let Err(err) = inner.keys.write_key_info(channel).await {
            warn!(channel, error = %err, "key info refresh before restart failed");
        }
    }
}

fn mark_stopped(record: &SharedRecord) {
    let mut guard = lock(record);
    guard.status.state = ChannelState::Stopped;
    guard.status.pid = None;
}

fn failure_reason(exit: &ProcessExit, last_stderr: Option<String>) -> String {
    let base = match exit {
        ProcessExit::Exited { code: Some(code) } => format!("exited with status {code}"),
        ProcessExit::Exited { code: None } => "terminated by signal".to_string(),
        ProcessExit::Stopped => "stopped".to_string(),
        ProcessExit::WaitFailed(reason) => reason.clone(),
    };
    match last_stderr {
        Some(line) => format!("{base}: {line}"),
        None => base,
    }
}

fn empty_status(channel: &str) -> ChannelStatus {
    ChannelStatus {
        channel: channel.to_string(),
        state: ChannelState::Stopped,
        variants: Vec::new(),
        restarts_in_window: 0,
        total_restarts: 0,
        speed_ratio: None,
        dropped_frames: 0,
        pid: None,
        last_exit_code: None,
        last_error: None,
        started_at: None,
    }
}

/// Routes one process's telemetry into the channel record and metrics.
/// Process-wide counters are split across variants by encode weight.
struct ChannelTelemetry {
    channel: String,
    variants: Vec<String>,
    weights: Vec<f64>,
    metrics: SupervisorMetrics,
    record: SharedRecord,
    last_drop_total: Mutex<u64>,
    last_stderr: Mutex<Option<String>>,
}

impl ChannelTelemetry {
    fn new(
        channel: &str,
        variants: &[Variant],
        metrics: SupervisorMetrics,
        record: SharedRecord,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            variants: variants.iter().map(|v| v.name.clone()).collect(),
            weights: variants.iter().map(Variant::weight).collect(),
            metrics,
            record,
            last_drop_total: Mutex::new(0),
            last_stderr: Mutex::new(None),
        }
    }

    fn last_stderr(&self) -> Option<String> {
        lock(&self.last_stderr).clone()
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn on_progress(&self, progress: &Progress) {
        if let Some(speed) = progress.speed {
            self.metrics.set_speed_ratio(&self.channel, speed);
            lock(&self.record).status.speed_ratio = Some(speed);
            if speed < 1.0 {
                debug!(channel = %self.channel, speed, "transcoder behind realtime");
            }
        }
        if let Some(total) = progress.drop_frames {
            let delta = {
                let mut last = lock(&self.last_drop_total);
                let delta = total.saturating_sub(*last);
                *last = total;
                delta
            };
            if delta > 0 {
                for (variant, frames) in self.variants.iter().zip(apportion(delta, &self.weights)) {
                    self.metrics
                        .add_dropped_frames(&self.channel, variant, frames);
                }
                lock(&self.record).status.dropped_frames += delta;
            }
        }
    }

    fn on_cpu_seconds(&self, seconds: f64) {
        let total: f64 = self.weights.iter().sum();
        if total <= 0.0 {
            return;
        }
        for (variant, weight) in self.variants.iter().zip(&self.weights) {
            self.metrics
                .add_cpu_seconds(&self.channel, variant, seconds * weight / total);
        }
    }

    fn on_stderr(&self, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            *lock(&self.last_stderr) = Some(line.to_string());
        }
    }
}

/// Splits `total` across `weights` with the largest-remainder method so the
/// parts always sum to `total`.
pub fn apportion(total: u64, weights: &[f64]) -> Vec<u64> {
    let sum: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if weights.is_empty() || sum <= 0.0 {
        return vec![0; weights.len()];
    }
    let exact: Vec<f64> = weights
        .iter()
        .map(|w| total as f64 * w.max(0.0) / sum)
        .collect();
    let mut parts: Vec<u64> = exact.iter().map(|x| x.floor() as u64).collect();
    let mut remaining = total.saturating_sub(parts.iter().sum());
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    for idx in order.into_iter().cycle() {
        if remaining == 0 {
            break;
        }
        parts[idx] += 1;
        remaining -= 1;
    }
    parts
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// Sleeps until `target` (measured against `now`). Returns false when
/// cancelled first.
async fn sleep_until(cancel: &CancellationToken, now: DateTime<Utc>, target: DateTime<Utc>) -> bool {
    let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = cancel.cancelled() => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
