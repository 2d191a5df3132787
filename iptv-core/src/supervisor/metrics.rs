use prometheus::{
    CounterVec, Encoder, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Supervisor collectors registered on a registry owned by this instance, so
/// several supervisors can coexist in one process.
#[derive(Clone)]
pub struct SupervisorMetrics {
    registry: Registry,
    active_channels: IntGauge,
    degraded_channels: IntGauge,
    restarts: IntCounterVec,
    active_variants: IntGaugeVec,
    cpu_seconds: CounterVec,
    dropped_frames: IntCounterVec,
    speed_ratio: GaugeVec,
    failures: IntCounterVec,
    disk_used_percent: GaugeVec,
}

impl std::fmt::Debug for SupervisorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorMetrics").finish_non_exhaustive()
    }
}

impl SupervisorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new_custom(Some("iptv".to_string()), None)?)
    }

    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let active_channels =
            IntGauge::new("active_channels", "Channels with a running transcoder")?;
        let degraded_channels = IntGauge::new(
            "degraded_channels",
            "Channels that exhausted their restart budget",
        )?;
        let restarts = IntCounterVec::new(
            Opts::new("channel_restarts_total", "Transcoder restarts per channel"),
            &["channel"],
        )?;
        let active_variants = IntGaugeVec::new(
            Opts::new("channel_active_variants", "Variants produced by the current run"),
            &["channel"],
        )?;
        let cpu_seconds = CounterVec::new(
            Opts::new("transcoder_cpu_seconds_total", "CPU seconds consumed per variant"),
            &["channel", "variant"],
        )?;
        let dropped_frames = IntCounterVec::new(
            Opts::new("transcoder_dropped_frames_total", "Dropped frames per variant"),
            &["channel", "variant"],
        )?;
        let speed_ratio = GaugeVec::new(
            Opts::new(
                "transcoder_speed_ratio",
                "Encoding speed relative to realtime (1.0 = realtime)",
            ),
            &["channel"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("transcoder_failures_total", "Transcoder exits that were not requested"),
            &["channel"],
        )?;
        let disk_used_percent = GaugeVec::new(
            Opts::new("segment_disk_used_percent", "Filesystem utilisation of the segment directory"),
            &["path"],
        )?;

        registry.register(Box::new(active_channels.clone()))?;
        registry.register(Box::new(degraded_channels.clone()))?;
        registry.register(Box::new(restarts.clone()))?;
        registry.register(Box::new(active_variants.clone()))?;
        registry.register(Box::new(cpu_seconds.clone()))?;
        registry.register(Box::new(dropped_frames.clone()))?;
        registry.register(Box::new(speed_ratio.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(disk_used_percent.clone()))?;

        Ok(Self {
            registry,
            active_channels,
            degraded_channels,
            restarts,
            active_variants,
            cpu_seconds,
            dropped_frames,
            speed_ratio,
            failures,
            disk_used_percent,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_active_channels(&self, count: usize) {
        self.active_channels.set(count as i64);
    }

    pub fn set_degraded_channels(&self, count: usize) {
        self.degraded_channels.set(count as i64);
    }

    pub fn record_restart(&self, channel: &str, variant_count: usize) {
        self.restarts.with_label_values(&[channel]).inc();
        self.set_variant_count(channel, variant_count);
    }

    pub fn set_variant_count(&self, channel: &str, variant_count: usize) {
        self.active_variants
            .with_label_values(&[channel])
            .set(variant_count as i64);
    }

    pub fn record_failure(&self, channel: &str) {
        self.failures.with_label_values(&[channel]).inc();
    }

    pub fn add_cpu_seconds(&self, channel: &str, variant: &str, seconds: f64) {
        if seconds > 0.0 {
            self.cpu_seconds
                .with_label_values(&[channel, variant])
                .inc_by(seconds);
        }
    }

    pub fn add_dropped_frames(&self, channel: &str, variant: &str, frames: u64) {
        if frames > 0 {
            self.dropped_frames
                .with_label_values(&[channel, variant])
                .inc_by(frames);
        }
    }

    pub fn set_speed_ratio(&self, channel: &str, speed: f64) {
        self.speed_ratio.with_label_values(&[channel]).set(speed);
    }

    pub fn set_disk_used_percent(&self, path: &str, percent: f64) {
        self.disk_used_percent.with_label_values(&[path]).set(percent);
    }

    pub fn restarts(&self, channel: &str) -> u64 {
        self.restarts.with_label_values(&[channel]).get()
    }

    pub fn dropped_frames(&self, channel: &str, variant: &str) -> u64 {
        self.dropped_frames
            .with_label_values(&[channel, variant])
            .get()
    }

    pub fn speed_ratio(&self, channel: &str) -> f64 {
        self.speed_ratio.with_label_values(&[channel]).get()
    }

    pub fn active_channels(&self) -> i64 {
        self.active_channels.get()
    }

    /// Prometheus text exposition of every collector.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}
