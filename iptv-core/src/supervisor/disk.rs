//! Segment directory disk usage sampling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::metrics::SupervisorMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsageSample {
    pub path: PathBuf,
    pub segment_bytes: u64,
    pub total_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub used_percent: Option<f64>,
    pub warning: bool,
}

#[derive(Debug, Clone)]
pub struct DiskMonitor {
    segments_dir: PathBuf,
    interval: Duration,
    warning_percent: f64,
    metrics: SupervisorMetrics,
}

impl DiskMonitor {
    pub fn new(
        segments_dir: impl Into<PathBuf>,
        interval: Duration,
        warning_percent: u8,
        metrics: SupervisorMetrics,
    ) -> Self {
        Self {
            segments_dir: segments_dir.into(),
            interval,
            warning_percent: f64::from(warning_percent),
            metrics,
        }
    }

    pub fn sample(&self) -> DiskUsageSample {
        let segment_bytes = directory_size(&self.segments_dir);
        let capacity = filesystem_capacity(&self.segments_dir);
        let (total_bytes, available_bytes) = match capacity {
            Some((total, available)) => (Some(total), Some(available)),
            None => (None, None),
        };
        let used_percent = capacity.map(|(total, available)| used_percent(total, available));
        let warning = used_percent
            .map(|percent| percent >= self.warning_percent)
            .unwrap_or(false);
        DiskUsageSample {
            path: self.segments_dir.clone(),
            segment_bytes,
            total_bytes,
            available_bytes,
            used_percent,
            warning,
        }
    }

    /// Takes a sample on the blocking pool; directory walks and mount
    /// enumeration must stay off the async workers.
    pub async fn sample_blocking(&self) -> Option<DiskUsageSample> {
        let monitor = self.clone();
        match tokio::task::spawn_blocking(move || monitor.sample()).await {
            Ok(sample) => Some(sample),
            Err(join_error) => {
                warn!(%join_error, "disk sampling task failed");
                None
            }
        }
    }

    /// Samples every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let sampled = tokio::select! {
                _ = cancel.cancelled() => return,
                sampled = self.sample_blocking() => sampled,
            };
            if let Some(sample) = sampled {
                self.report(&sample);
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn report(&self, sample: &DiskUsageSample) {
        let label = self.segments_dir.to_string_lossy();
        match sample.used_percent {
            Some(percent) => {
                self.metrics.set_disk_used_percent(&label, percent);
                if sample.warning {
                    warn!(
                        path = %self.segments_dir.display(),
                        used_percent = %format!("{percent:.1}"),
                        segment_bytes = sample.segment_bytes,
                        "segment storage above warning threshold"
                    );
                } else {
                    debug!(path = %self.segments_dir.display(), used_percent = percent, "segment storage sampled");
                }
            }
            None => debug!(path = %self.segments_dir.display(), "filesystem capacity unknown"),
        }
    }
}

pub fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    used as f64 / total as f64 * 100.0
}

fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Total and available bytes of the filesystem holding `path`, picked by the
/// longest matching mount point.
fn filesystem_capacity(path: &Path) -> Option<(u64, u64)> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.total_space(), disk.available_space()))
}
