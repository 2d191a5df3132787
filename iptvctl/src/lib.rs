use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use iptv_core::config::parse_duration;
use iptv_core::{
    load_iptv_config, system_clock, AcquisitionEngine, AcquisitionEntry, AcquisitionError,
    AcquisitionFilter, AcquisitionOutcome, AcquisitionStatus, CacheError, CacheKeys,
    CatalogError, ChannelDefinition, ConfigError, DeliverySigner, DiskMonitor, DiskUsageSample,
    FastCache, FfmpegAcquisitionHandler, IptvConfig, KeyError, KeyInfo, KeyManager, KeyRecord,
    MemoryCache, QualityTable, RedisCache, SignedUrl, SigningError, SqliteAcquisitionStore,
    SqliteChannelCatalog, StaticSourceResolver, StoreError, Supervisor, SupervisorError,
    SupervisorMetrics, SupervisorSettings, WorkerPool,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("key error: {0}")]
    Keys(#[from] KeyError),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("acquisition store error: {0}")]
    Store(#[from] StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("signature rejected")]
    SignatureRejected,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "IPTV core control interface", long_about = None)]
pub struct Cli {
    /// Path to iptv.toml
    #[arg(long, default_value = "configs/iptv.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs channels, acquisition workers and key rotation until Ctrl-C
    Serve,
    /// Signs a delivery path
    Sign(SignArgs),
    /// Checks a signed delivery request
    Verify(VerifyArgs),
    /// Channel key operations
    #[command(subcommand)]
    Key(KeyCommands),
    /// Acquisition queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Lists enabled channels from the catalog
    Channels,
    /// Samples segment storage usage once
    Disk,
    /// Prints the last exported metrics snapshot
    Metrics,
    /// Prints a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct SignArgs {
    /// Path to sign, e.g. /streams/news/index.m3u8
    #[arg(long)]
    pub path: String,
    /// Lifetime such as "15m"; defaults to delivery.default_ttl
    #[arg(long)]
    pub ttl: Option<String>,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[arg(long)]
    pub path: String,
    /// Unix expiry carried by the URL
    #[arg(long)]
    pub expires: i64,
    #[arg(long)]
    pub sig: String,
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Shows today's key for a channel, creating it if needed
    Current(KeyArgs),
    /// Provisions tomorrow's key
    Rotate(KeyArgs),
    /// Writes the key-info descriptor the transcoder reads
    Info(KeyArgs),
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    #[arg(long)]
    pub channel: String,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Checks an item and queues it when missing
    Check(QueueCheckArgs),
    /// Lists acquisition entries
    List(QueueListArgs),
}

#[derive(Args, Debug)]
pub struct QueueCheckArgs {
    /// Canonical identifier of the content
    #[arg(long)]
    pub id: String,
    /// Content type, e.g. movie, music, podcast
    #[arg(long = "type")]
    pub content_type: String,
}

#[derive(Args, Debug)]
pub struct QueueListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "iptvctl", &mut std::io::stdout());
        return Ok(());
    }
    init_tracing(&cli.log_level);
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(&context, &cli))
}

async fn dispatch(context: &AppContext, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve => context.serve().await?,
        Commands::Sign(args) => {
            let signed = context.sign(args)?;
            render(&signed, cli.format)?;
        }
        Commands::Verify(args) => {
            let report = context.verify(args)?;
            render(&report, cli.format)?;
            if !report.valid {
                return Err(AppError::SignatureRejected);
            }
        }
        Commands::Key(KeyCommands::Current(args)) => {
            let key = context.key_current(&args.channel).await?;
            render(&key, cli.format)?;
        }
        Commands::Key(KeyCommands::Rotate(args)) => {
            let key = context.key_rotate(&args.channel).await?;
            render(&key, cli.format)?;
        }
        Commands::Key(KeyCommands::Info(args)) => {
            let info = context.key_info(&args.channel).await?;
            render(&info, cli.format)?;
        }
        Commands::Queue(QueueCommands::Check(args)) => {
            let check = context.queue_check(args).await?;
            render(&check, cli.format)?;
        }
        Commands::Queue(QueueCommands::List(args)) => {
            let list = context.queue_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Channels => {
            let channels = context.channels()?;
            render(&channels, cli.format)?;
        }
        Commands::Disk => {
            let sample = context.disk_sample()?;
            render(&sample, cli.format)?;
        }
        Commands::Metrics => {
            let report = context.metrics()?;
            render(&report, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: IptvConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_iptv_config(&cli.config)?;
        Ok(Self { config })
    }

    fn database_path(&self) -> PathBuf {
        self.config.resolve_path(&self.config.paths.database)
    }

    fn metrics_path(&self) -> PathBuf {
        self.config.resolve_path(&self.config.paths.metrics_file)
    }

    fn cache_keys(&self) -> CacheKeys {
        CacheKeys::new(self.config.cache.key_prefix.clone())
    }

    fn cache(&self) -> Result<Arc<dyn FastCache>> {
        match &self.config.cache.redis_url {
            Some(url) => Ok(Arc::new(RedisCache::open(
                url,
                self.config.cache.timeout.get(),
            )?)),
            None => {
                warn!("no redis_url configured; using the in-process cache");
                Ok(Arc::new(MemoryCache::new()))
            }
        }
    }

    fn signer(&self) -> Result<DeliverySigner> {
        let delivery = &self.config.delivery;
        Ok(DeliverySigner::new(
            delivery.base_url.clone(),
            delivery.resolve_secret()?,
            delivery.default_ttl.get(),
        )?)
    }

    fn key_manager(&self, cache: Arc<dyn FastCache>) -> Result<KeyManager> {
        Ok(KeyManager::new(
            self.config.resolve_path(&self.config.paths.keys_dir),
            self.config.keys.cache_ttl.get(),
            cache,
            self.cache_keys(),
            self.signer()?,
            system_clock(),
        ))
    }

    fn acquisition_store(&self) -> Result<SqliteAcquisitionStore> {
        let path = self.database_path();
        ensure_parent(&path)?;
        let store = SqliteAcquisitionStore::new(&path)?;
        store.initialize()?;
        Ok(store)
    }

    fn catalog(&self) -> Result<SqliteChannelCatalog> {
        let path = self.database_path();
        ensure_parent(&path)?;
        let catalog = SqliteChannelCatalog::new(&path)?;
        catalog.initialize()?;
        Ok(catalog)
    }

    fn engine(&self, cache: Arc<dyn FastCache>) -> Result<AcquisitionEngine> {
        let section = &self.config.acquisition;
        Ok(AcquisitionEngine::new(
            self.acquisition_store()?,
            cache,
            self.cache_keys(),
            QualityTable::from_config(section)?,
            section.store_timeout.get(),
        ))
    }

    fn disk_monitor(&self, metrics: SupervisorMetrics) -> DiskMonitor {
        DiskMonitor::new(
            self.config.resolve_path(&self.config.paths.segments_dir),
            self.config.monitor.disk_interval.get(),
            self.config.monitor.disk_warning_percent,
            metrics,
        )
    }

    fn sign(&self, args: &SignArgs) -> Result<SignedUrl> {
        let ttl = args.ttl.as_deref().map(parse_duration).transpose()?;
        Ok(self.signer()?.sign_path(&args.path, ttl)?)
    }

    fn verify(&self, args: &VerifyArgs) -> Result<VerifyReport> {
        let valid = self.signer()?.validate(&args.path, args.expires, &args.sig);
        Ok(VerifyReport {
            path: args.path.clone(),
            expires_at: args.expires,
            valid,
        })
    }

    async fn key_current(&self, channel: &str) -> Result<KeyView> {
        let keys = self.key_manager(self.cache()?)?;
        let record = keys.get_current_key(channel).await?;
        Ok(KeyView::new(&record, self.config.keys.cache_ttl.get()))
    }

    async fn key_rotate(&self, channel: &str) -> Result<KeyView> {
        let keys = self.key_manager(self.cache()?)?;
        let record = keys.rotate_key(channel).await?;
        Ok(KeyView::new(&record, self.config.keys.cache_ttl.get()))
    }

    async fn key_info(&self, channel: &str) -> Result<KeyInfo> {
        let keys = self.key_manager(self.cache()?)?;
        Ok(keys.write_key_info(channel).await?)
    }

    async fn queue_check(&self, args: &QueueCheckArgs) -> Result<QueueCheck> {
        let engine = self.engine(self.cache()?)?;
        let outcome = engine
            .check_and_queue_acquisition(&args.id, &args.content_type)
            .await?;
        Ok(QueueCheck {
            canonical_id: args.id.trim().to_string(),
            outcome,
        })
    }

    fn queue_list(&self, args: &QueueListArgs) -> Result<QueueList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<AcquisitionStatus>)
            .transpose()?;
        let rows = self.acquisition_store()?.list(&AcquisitionFilter {
            status,
            limit: Some(args.limit),
        })?;
        Ok(QueueList { rows })
    }

    fn channels(&self) -> Result<ChannelList> {
        let rows = self.catalog()?.active_channels()?;
        Ok(ChannelList { rows })
    }

    fn disk_sample(&self) -> Result<DiskUsageSample> {
        let metrics = SupervisorMetrics::new().map_err(SupervisorError::from)?;
        Ok(self.disk_monitor(metrics).sample())
    }

    fn metrics(&self) -> Result<MetricsReport> {
        let path = self.metrics_path();
        match fs::read_to_string(&path) {
            Ok(body) => Ok(MetricsReport {
                source: path.display().to_string(),
                body,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let metrics = SupervisorMetrics::new().map_err(SupervisorError::from)?;
                Ok(MetricsReport {
                    source: "empty registry".to_string(),
                    body: metrics.render().map_err(SupervisorError::from)?,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        for dir in [
            &self.config.paths.segments_dir,
            &self.config.paths.keys_dir,
            &self.config.paths.staging_dir,
            &self.config.paths.library_dir,
        ] {
            fs::create_dir_all(self.config.resolve_path(dir))?;
        }
        ensure_parent(&self.metrics_path())?;

        let cache = self.cache()?;
        let metrics = SupervisorMetrics::new().map_err(SupervisorError::from)?;
        let keys = Arc::new(self.key_manager(cache.clone())?);
        let supervisor = Supervisor::new(
            SupervisorSettings::from_config(&self.config),
            keys,
            metrics.clone(),
            system_clock(),
            None,
        );

        let cancel = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        for channel in self.catalog()?.active_channels()? {
            match supervisor
                .start_channel(&channel.slug, &channel.source_url, channel.variants)
                .await
            {
                Ok(status) => info!(channel = %channel.slug, state = %status.state, "channel started"),
                Err(err) => error!(channel = %channel.slug, error = %err, "channel failed to start"),
            }
        }

        let section = &self.config.acquisition;
        let resolver = Arc::new(StaticSourceResolver::new(section.source_template.clone()));
        let handler = Arc::new(FfmpegAcquisitionHandler::new(
            &self.config.supervisor.ffmpeg,
            self.config.resolve_path(&self.config.paths.staging_dir),
            self.config.resolve_path(&self.config.paths.library_dir),
            resolver,
        ));
        let pool = WorkerPool::new(
            self.engine(cache)?,
            handler,
            section.workers,
            section.poll_interval.get(),
        )
        .with_stale_after(section.stale_after.get());
        let token = cancel.clone();
        tasks.push(("workers", tokio::spawn(async move { pool.run(token).await })));

        let monitor = self.disk_monitor(metrics.clone());
        let token = cancel.clone();
        tasks.push(("disk", tokio::spawn(async move { monitor.run(token).await })));

        let rotation = supervisor.clone();
        let token = cancel.clone();
        tasks.push((
            "key-rotation",
            tokio::spawn(async move { rotation.run_key_rotation(token).await }),
        ));

        let exporter = MetricsExporter {
            metrics: metrics.clone(),
            path: self.metrics_path(),
            interval: self.config.monitor.metrics_interval.get(),
        };
        let token = cancel.clone();
        tasks.push(("metrics", tokio::spawn(async move { exporter.run(token).await })));

        info!(
            node = %self.config.system.node_name,
            channels = supervisor.statuses().len(),
            "iptv core running"
        );
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");

        cancel.cancel();
        supervisor.stop_all().await;
        for (name, task) in tasks {
            if let Err(err) = task.await {
                warn!(task = name, error = %err, "background task ended abnormally");
            }
        }
        write_metrics(&metrics, &self.metrics_path())?;
        info!("iptv core stopped");
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Periodically writes the registry in text exposition format so the
/// collector and `iptvctl metrics` can read it without a listener.
struct MetricsExporter {
    metrics: SupervisorMetrics,
    path: PathBuf,
    interval: Duration,
}

impl MetricsExporter {
    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = write_metrics(&self.metrics, &self.path) {
                warn!(path = %self.path.display(), error = %err, "metrics export failed");
            }
        }
    }
}

fn write_metrics(metrics: &SupervisorMetrics, path: &Path) -> Result<()> {
    let body = metrics.render().map_err(SupervisorError::from)?;
    let staging = path.with_extension("tmp");
    fs::write(&staging, body)?;
    fs::rename(&staging, path)?;
    Ok(())
}

impl DisplayFallback for SignedUrl {
    fn display(&self) -> String {
        format!("{}\nexpires_at={}", self.url, self.expires_at)
    }
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    path: String,
    expires_at: i64,
    valid: bool,
}

impl DisplayFallback for VerifyReport {
    fn display(&self) -> String {
        let verdict = if self.valid { "valid" } else { "rejected" };
        format!("{} {verdict}", self.path)
    }
}

/// Key metadata only; the key bytes never leave the key directory.
#[derive(Debug, Serialize)]
struct KeyView {
    channel: String,
    day: NaiveDate,
    created_at: DateTime<Utc>,
    retained_until: DateTime<Utc>,
    path: PathBuf,
}

impl KeyView {
    fn new(record: &KeyRecord, retention: Duration) -> Self {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(48));
        Self {
            channel: record.channel.clone(),
            day: record.day,
            created_at: record.created_at,
            retained_until: record.created_at + retention,
            path: record.path.clone(),
        }
    }
}

impl DisplayFallback for KeyView {
    fn display(&self) -> String {
        format!(
            "{channel} day={day} created={created} retained_until={until}\n{path}",
            channel = self.channel,
            day = self.day,
            created = self.created_at.to_rfc3339(),
            until = self.retained_until.to_rfc3339(),
            path = self.path.display(),
        )
    }
}

impl DisplayFallback for KeyInfo {
    fn display(&self) -> String {
        format!(
            "{channel} day={day}\ndescriptor={descriptor}",
            channel = self.channel,
            day = self.day,
            descriptor = self.descriptor_path.display(),
        )
    }
}

#[derive(Debug, Serialize)]
struct QueueCheck {
    canonical_id: String,
    #[serde(flatten)]
    outcome: AcquisitionOutcome,
}

impl DisplayFallback for QueueCheck {
    fn display(&self) -> String {
        match &self.outcome {
            AcquisitionOutcome::Available => format!("{}: available", self.canonical_id),
            AcquisitionOutcome::Processing { status } => {
                format!("{}: processing ({status})", self.canonical_id)
            }
            AcquisitionOutcome::Queued { priority } => {
                format!("{}: queued priority={priority}", self.canonical_id)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct QueueList {
    rows: Vec<AcquisitionEntry>,
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Queue empty".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                let quality = entry.target_quality.as_deref().unwrap_or("-");
                let mut line = format!(
                    "#{id} {canonical} type={kind} status={status} priority={priority} quality={quality} attempts={attempts}",
                    id = entry.id,
                    canonical = entry.canonical_id,
                    kind = entry.content_type,
                    status = entry.status,
                    priority = entry.priority,
                    attempts = entry.attempts,
                );
                if let Some(reason) = &entry.failure_reason {
                    line.push_str(&format!(" reason={reason}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ChannelList {
    rows: Vec<ChannelDefinition>,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No enabled channels".to_string();
        }
        self.rows
            .iter()
            .map(|channel| {
                let variants = channel
                    .variants
                    .iter()
                    .map(|variant| variant.name.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "{slug} | {name} | variants={variants}",
                    slug = channel.slug,
                    name = channel.display_name.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for DiskUsageSample {
    fn display(&self) -> String {
        let used = self
            .used_percent
            .map(|value| format!("{value:.1}%"))
            .unwrap_or_else(|| "unknown".to_string());
        let flag = if self.warning { " [WARN]" } else { "" };
        format!(
            "{path}: segments={bytes}B used={used}{flag}",
            path = self.path.display(),
            bytes = self.segment_bytes,
        )
    }
}

#[derive(Debug, Serialize)]
struct MetricsReport {
    source: String,
    body: String,
}

impl DisplayFallback for MetricsReport {
    fn display(&self) -> String {
        self.body.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let config_path = root.join("iptv.toml");
        let template = fs::read_to_string("../configs/iptv.toml").unwrap();
        let config = template
            .replace("/var/lib/iptv", &root.display().to_string())
            .replace("redis_url = \"redis://127.0.0.1:6379/0\"\n", "");
        fs::write(&config_path, config).unwrap();

        let cli = Cli::try_parse_from([
            "iptvctl",
            "--config",
            config_path.to_str().unwrap(),
            "metrics",
        ])
        .unwrap();
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from([
            "iptvctl", "--format", "json", "queue", "check", "--id", "tt1", "--type", "movie",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Queue(QueueCommands::Check(args)) => {
                assert_eq!(args.id, "tt1");
                assert_eq!(args.content_type, "movie");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn signed_path_verifies_and_tamper_is_rejected() {
        let (_temp, context) = prepare_test_context();
        let signed = context
            .sign(&SignArgs {
                path: "/streams/news/index.m3u8".into(),
                ttl: Some("5m".into()),
            })
            .unwrap();
        let sig = signed.url.rsplit("sig=").next().unwrap().to_string();

        let report = context
            .verify(&VerifyArgs {
                path: signed.path.clone(),
                expires: signed.expires_at,
                sig: sig.clone(),
            })
            .unwrap();
        assert!(report.valid);

        let tampered = context
            .verify(&VerifyArgs {
                path: "/streams/sports/index.m3u8".into(),
                expires: signed.expires_at,
                sig,
            })
            .unwrap();
        assert!(!tampered.valid);
    }

    #[tokio::test]
    async fn key_commands_materialise_files() {
        let (temp, context) = prepare_test_context();
        let current = context.key_current("news").await.unwrap();
        assert!(current.path.starts_with(temp.path().join("keys")));
        assert!(current.path.exists());

        let next = context.key_rotate("news").await.unwrap();
        assert_eq!(next.day, current.day.succ_opt().unwrap());

        let info = context.key_info("news").await.unwrap();
        let descriptor = fs::read_to_string(&info.descriptor_path).unwrap();
        assert!(descriptor.contains(&info.uri));
        assert!(descriptor.contains(&current.path.display().to_string()));
    }

    #[tokio::test]
    async fn queue_check_then_list() {
        let (_temp, context) = prepare_test_context();
        let check = context
            .queue_check(&QueueCheckArgs {
                id: "mbid:1".into(),
                content_type: "music".into(),
            })
            .await
            .unwrap();
        assert_eq!(check.outcome, AcquisitionOutcome::Queued { priority: 1 });

        let list = context
            .queue_list(&QueueListArgs {
                status: Some("queued".into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].target_quality.as_deref(), Some("lossless"));

        let bad = context.queue_list(&QueueListArgs {
            status: Some("exploded".into()),
            limit: 10,
        });
        assert!(matches!(bad, Err(AppError::Store(_))));
    }

    #[test]
    fn metrics_falls_back_to_empty_registry_then_reads_export() {
        let (_temp, context) = prepare_test_context();
        let report = context.metrics().unwrap();
        assert_eq!(report.source, "empty registry");

        let metrics = SupervisorMetrics::new().unwrap();
        metrics.record_restart("news", 2);
        let path = context.metrics_path();
        ensure_parent(&path).unwrap();
        write_metrics(&metrics, &path).unwrap();

        let report = context.metrics().unwrap();
        assert_eq!(report.source, path.display().to_string());
        assert!(report.body.contains("news"));
    }

    #[test]
    fn channels_lists_nothing_on_fresh_catalog() {
        let (_temp, context) = prepare_test_context();
        let list = context.channels().unwrap();
        assert!(list.rows.is_empty());
        assert_eq!(list.display(), "No enabled channels");
    }
}
