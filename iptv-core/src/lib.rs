pub mod acquisition;
pub mod cache;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod sqlite;
pub mod supervisor;

pub use acquisition::{
    AcquisitionEngine, AcquisitionEntry, AcquisitionError, AcquisitionFilter, AcquisitionHandler,
    AcquisitionJob, AcquisitionOutcome, AcquisitionResult, AcquisitionStatus, CommandExecutor,
    FfmpegAcquisitionHandler, HandlerError, NewAcquisition, QualityTable, SourceResolver,
    SqliteAcquisitionStore, SqliteAcquisitionStoreBuilder, StaticSourceResolver, StoreError,
    SystemCommandExecutor, TargetQuality, WorkerPool,
};
pub use cache::{CacheError, CacheKeys, CacheResult, FastCache, MemoryCache, RedisCache};
pub use catalog::{
    CatalogError, ChannelDefinition, SqliteChannelCatalog, SqliteChannelCatalogBuilder,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_iptv_config, HumanDuration, IptvConfig};
pub use delivery::{
    key_path, sign_url, stream_path, validate_signature, validate_signature_at, DeliverySigner,
    SignedUrl, SigningError,
};
pub use error::{ConfigError, Result};
pub use keys::{KeyError, KeyInfo, KeyManager, KeyRecord, KeyResult, KEY_LEN};
pub use supervisor::{
    ChannelState, ChannelStatus, DiskMonitor, DiskUsageSample, LaunchSpec, ProcessExit,
    ProcessLauncher, ProcessRunner, Supervisor, SupervisorError, SupervisorMetrics,
    SupervisorResult, SupervisorSettings, SystemLauncher, TelemetrySink, Variant, VariantKind,
};
