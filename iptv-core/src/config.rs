use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IptvConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub supervisor: SupervisorSection,
    pub monitor: MonitorSection,
    pub keys: KeysSection,
    pub delivery: DeliverySection,
    #[serde(default)]
    pub cache: CacheSection,
    pub acquisition: AcquisitionSection,
}

impl IptvConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Checks everything that must hold before the first pipeline starts.
    pub fn validate(&self) -> Result<()> {
        self.delivery.resolve_secret()?;
        if self.supervisor.max_restarts == 0 {
            return Err(ConfigError::invalid(
                "supervisor.max_restarts",
                "must be at least 1",
            ));
        }
        if self.supervisor.backoff_initial.0 > self.supervisor.backoff_max.0 {
            return Err(ConfigError::invalid(
                "supervisor.backoff_initial",
                "must not exceed supervisor.backoff_max",
            ));
        }
        if self.monitor.disk_warning_percent == 0 || self.monitor.disk_warning_percent > 100 {
            return Err(ConfigError::invalid(
                "monitor.disk_warning_percent",
                "must be between 1 and 100",
            ));
        }
        if self.acquisition.workers == 0 {
            return Err(ConfigError::invalid(
                "acquisition.workers",
                "must be at least 1",
            ));
        }
        if self.delivery.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("delivery.base_url", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub segments_dir: String,
    pub keys_dir: String,
    pub staging_dir: String,
    pub library_dir: String,
    pub database: String,
    pub metrics_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    pub ffmpeg: String,
    pub max_restarts: u32,
    pub restart_window: HumanDuration,
    pub backoff_initial: HumanDuration,
    pub backoff_max: HumanDuration,
    pub healthy_reset: HumanDuration,
    pub stop_grace: HumanDuration,
    pub hls_segment_duration: HumanDuration,
    pub hls_list_size: u32,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub disk_interval: HumanDuration,
    pub disk_warning_percent: u8,
    pub metrics_interval: HumanDuration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysSection {
    pub cache_ttl: HumanDuration,
    pub rotation_lead: HumanDuration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    pub base_url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    pub default_ttl: HumanDuration,
}

impl DeliverySection {
    /// Resolves the signing secret from the inline value, the environment or a file,
    /// in that order.
    pub fn resolve_secret(&self) -> Result<Vec<u8>> {
        let secret = if let Some(inline) = &self.secret {
            inline.clone().into_bytes()
        } else if let Some(var) = &self.secret_env {
            std::env::var(var)
                .map_err(|_| ConfigError::MissingSecret(format!("environment variable {var}")))?
                .into_bytes()
        } else if let Some(path) = &self.secret_file {
            std::fs::read(path).map_err(|source| ConfigError::Io {
                source,
                path: path.clone(),
            })?
        } else {
            return Err(ConfigError::MissingSecret("delivery.secret".into()));
        };
        let trimmed = trim_ascii(&secret);
        if trimmed.is_empty() {
            return Err(ConfigError::MissingSecret("delivery secret is empty".into()));
        }
        Ok(trimmed.to_vec())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout: default_cache_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_cache_timeout() -> HumanDuration {
    HumanDuration(Duration::from_millis(250))
}

fn default_key_prefix() -> String {
    "iptv".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSection {
    pub workers: usize,
    pub store_timeout: HumanDuration,
    pub poll_interval: HumanDuration,
    pub default_quality: String,
    /// Where shared content is fetched from; `{id}` and `{type}` are
    /// substituted per job.
    #[serde(default = "default_source_template")]
    pub source_template: String,
    /// In-flight rows untouched for this long are handed back to the queue.
    #[serde(default = "default_stale_after")]
    pub stale_after: HumanDuration,
    #[serde(default)]
    pub quality: BTreeMap<String, String>,
}

fn default_source_template() -> String {
    "{id}".to_string()
}

fn default_stale_after() -> HumanDuration {
    HumanDuration(Duration::from_secs(6 * 3600))
}

/// A `std::time::Duration` written in configuration as `"250ms"`, `"30s"`, `"5m"`,
/// `"48h"` or `"1d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn get(&self) -> Duration {
        self.0
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        parse_duration(&value).map(HumanDuration)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

pub fn parse_duration(raw: &str) -> Result<Duration> {
    let value = raw.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::invalid(raw, "missing unit (ms, s, m, h, d)"))?;
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(ConfigError::invalid(raw, "missing amount"));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid(raw, "amount out of range"))?;
    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => {
            return Err(ConfigError::invalid(
                raw,
                format!("unknown unit {other:?}"),
            ))
        }
    };
    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(raw, "amount out of range"))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

pub fn load_iptv_config<P: AsRef<Path>>(path: P) -> Result<IptvConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/iptv.toml")
    }

    #[test]
    fn load_fixture_config() {
        let config = load_iptv_config(fixture()).expect("config should parse");
        assert_eq!(config.system.node_name, "iptv-edge-01");
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(
            config.supervisor.restart_window.get(),
            Duration::from_secs(300)
        );
        assert_eq!(config.keys.cache_ttl.get(), Duration::from_secs(48 * 3600));
        assert_eq!(config.acquisition.quality.get("music").unwrap(), "lossless");
        config.validate().expect("fixture config is valid");
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3 weeks").is_err());
    }

    #[test]
    fn oversized_duration_is_rejected() {
        let err = parse_duration("999999999999999999d").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(parse_duration("18446744073709551615s").is_ok());
        assert!(parse_duration("18446744073709551615m").is_err());
    }

    #[test]
    fn malformed_duration_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptv.toml");
        let content = std::fs::read_to_string(fixture())
            .unwrap()
            .replace("restart_window = \"5m\"", "restart_window = \"five minutes\"");
        std::fs::write(&path, content).unwrap();
        let err = load_iptv_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_secret_is_fatal() {
        let mut config = load_iptv_config(fixture()).unwrap();
        config.delivery.secret = None;
        config.delivery.secret_env = Some("IPTV_TEST_SECRET_THAT_IS_NOT_SET".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(_)));

        config.delivery.secret = Some("   ".into());
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingSecret(_)
        ));
    }
}
