//! Per-channel, per-UTC-day encryption keys.
//!
//! Lookup order is cache, then the key file on disk, then generation. The
//! key file is written with create-if-absent semantics under a per-channel
//! lock so two concurrent first requests always agree on the bytes.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheKeys, FastCache};
use crate::clock::SharedClock;
use crate::delivery::{DeliverySigner, SigningError};

pub const KEY_LEN: usize = 16;
const KEY_INFO_FILE: &str = "current.keyinfo";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("io error writing key material at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("key file {0} is corrupt")]
    Corrupt(PathBuf),
    #[error("invalid channel identifier {0:?}")]
    InvalidChannel(String),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
}

pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub channel: String,
    pub day: NaiveDate,
    pub key: [u8; KEY_LEN],
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

impl KeyRecord {
    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }
}

/// What the transcoder reads: the key URI and the on-disk key path.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub channel: String,
    pub day: NaiveDate,
    pub uri: String,
    pub key_path: PathBuf,
    pub descriptor_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedKey {
    key: String,
    created_at: i64,
}

pub struct KeyManager {
    keys_dir: PathBuf,
    cache_ttl: Duration,
    cache: Arc<dyn FastCache>,
    cache_keys: CacheKeys,
    signer: DeliverySigner,
    clock: SharedClock,
    generation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys_dir", &self.keys_dir)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl KeyManager {
    pub fn new(
        keys_dir: impl Into<PathBuf>,
        cache_ttl: Duration,
        cache: Arc<dyn FastCache>,
        cache_keys: CacheKeys,
        signer: DeliverySigner,
        clock: SharedClock,
    ) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            cache_ttl,
            cache,
            cache_keys,
            signer,
            clock,
            generation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    pub async fn get_current_key(&self, channel: &str) -> KeyResult<KeyRecord> {
        let today = self.clock.today();
        self.get_or_create(channel, today).await
    }

    /// Provisions tomorrow's key ahead of the UTC day boundary. Today's key is
    /// left untouched.
    pub async fn rotate_key(&self, channel: &str) -> KeyResult<KeyRecord> {
        let today = self.clock.today();
        let tomorrow = today.succ_opt().unwrap_or(today);
        let record = self.get_or_create(channel, tomorrow).await?;
        info!(channel, day = %tomorrow, "next key provisioned");
        Ok(record)
    }

    /// Materialises today's key file and the descriptor the transcoder
    /// consumes. Must succeed before a pipeline starts.
    pub async fn write_key_info(&self, channel: &str) -> KeyResult<KeyInfo> {
        let record = self.get_current_key(channel).await?;
        let retention = i64::try_from(self.cache_ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = record.created_at.timestamp().saturating_add(retention);
        let uri = self.signer.sign_key(channel, record.day, expires_at)?.url;
        let descriptor_path = self.channel_dir(channel)?.join(KEY_INFO_FILE);
        let contents = format!("{}\n{}\n", uri, record.path.display());
        write_atomic(&descriptor_path, contents.as_bytes())?;
        debug!(channel, day = %record.day, "key info written");
        Ok(KeyInfo {
            channel: channel.to_string(),
            day: record.day,
            uri,
            key_path: record.path,
            descriptor_path,
        })
    }

    pub fn key_info_path(&self, channel: &str) -> KeyResult<PathBuf> {
        Ok(self.channel_dir(channel)?.join(KEY_INFO_FILE))
    }

    /// Serves key bytes to the delivery boundary. Never generates: a key that
    /// is neither cached nor on disk within its retention is reported absent.
    pub async fn key_for_request(
        &self,
        channel: &str,
        day: NaiveDate,
    ) -> KeyResult<Option<KeyRecord>> {
        if let Some(record) = self.cached_key(channel, day).await? {
            return Ok(Some(record));
        }
        let Some(record) = self.read_disk(channel, day)? else {
            return Ok(None);
        };
        let retained_until = record.created_at
            + chrono::Duration::from_std(self.cache_ttl).unwrap_or(chrono::Duration::hours(48));
        if self.clock.now() >= retained_until {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Looks only at the cache tier.
    pub async fn cached_key(&self, channel: &str, day: NaiveDate) -> KeyResult<Option<KeyRecord>> {
        let path = self.key_path(channel, day)?;
        let cache_key = self.cache_keys.key_material(channel, day);
        let raw = match self.cache.get(&cache_key).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(channel, %error, "key cache lookup failed");
                return Ok(None);
            }
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        let decoded = serde_json::from_str::<CachedKey>(&raw)
            .ok()
            .and_then(|cached| {
                let bytes = hex::decode(&cached.key).ok()?;
                let key: [u8; KEY_LEN] = bytes.try_into().ok()?;
                let created_at = DateTime::<Utc>::from_timestamp(cached.created_at, 0)?;
                Some((key, created_at))
            });
        match decoded {
            Some((key, created_at)) => Ok(Some(KeyRecord {
                channel: channel.to_string(),
                day,
                key,
                created_at,
                path,
            })),
            None => {
                warn!(channel, day = %day, "ignoring malformed cached key");
                Ok(None)
            }
        }
    }

    async fn get_or_create(&self, channel: &str, day: NaiveDate) -> KeyResult<KeyRecord> {
        if let Some(record) = self.cached_key(channel, day).await? {
            return Ok(record);
        }
        if let Some(record) = self.read_disk(channel, day)? {
            self.store_in_cache(&record).await;
            return Ok(record);
        }

        let lock = self.generation_lock(channel);
        let _guard = lock.lock().await;
        if let Some(record) = self.read_disk(channel, day)? {
            self.store_in_cache(&record).await;
            return Ok(record);
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let path = self.key_path(channel, day)?;
        let record = match self.persist_new_key(&path, &key)? {
            true => {
                info!(channel, day = %day, "generated encryption key");
                KeyRecord {
                    channel: channel.to_string(),
                    day,
                    key,
                    created_at: self.clock.now(),
                    path,
                }
            }
            // Another process won the create; adopt its bytes.
            false => self
                .read_disk(channel, day)?
                .ok_or_else(|| KeyError::Corrupt(path.clone()))?,
        };
        self.store_in_cache(&record).await;
        Ok(record)
    }

    async fn store_in_cache(&self, record: &KeyRecord) {
        let cached = CachedKey {
            key: record.key_hex(),
            created_at: record.created_at.timestamp(),
        };
        let Ok(payload) = serde_json::to_string(&cached) else {
            return;
        };
        let remaining = self.remaining_retention(record.created_at);
        if remaining.is_zero() {
            return;
        }
        let cache_key = self.cache_keys.key_material(&record.channel, record.day);
        if let Err(error) = self.cache.set_ex(&cache_key, &payload, remaining).await {
            warn!(channel = %record.channel, %error, "failed to cache key material");
        }
    }

    fn remaining_retention(&self, created_at: DateTime<Utc>) -> Duration {
        let elapsed = (self.clock.now() - created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.cache_ttl.saturating_sub(elapsed)
    }

    fn read_disk(&self, channel: &str, day: NaiveDate) -> KeyResult<Option<KeyRecord>> {
        let path = self.key_path(channel, day)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(KeyError::Io { source, path }),
        };
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::Corrupt(path.clone()))?;
        let created_at = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::now()));
        Ok(Some(KeyRecord {
            channel: channel.to_string(),
            day,
            key,
            created_at: created_at.min(self.clock.now()),
            path,
        }))
    }

    /// Returns false when the file already existed.
    fn persist_new_key(&self, path: &Path, key: &[u8; KEY_LEN]) -> KeyResult<bool> {
        let dir = path.parent().unwrap_or(&self.keys_dir);
        let io_err = |source| KeyError::Io {
            source,
            path: path.to_path_buf(),
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(key).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_err(err.error)),
        }
    }

    fn generation_lock(&self, channel: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .generation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn channel_dir(&self, channel: &str) -> KeyResult<PathBuf> {
        validate_channel(channel)?;
        Ok(self.keys_dir.join(channel))
    }

    fn key_path(&self, channel: &str, day: NaiveDate) -> KeyResult<PathBuf> {
        Ok(self
            .channel_dir(channel)?
            .join(format!("{}.key", day.format("%Y-%m-%d"))))
    }
}

/// Channel slugs become directory names.
pub(crate) fn validate_channel(channel: &str) -> KeyResult<()> {
    let valid = !channel.is_empty()
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeyError::InvalidChannel(channel.to_string()))
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> KeyResult<()> {
    let io_err = |source| KeyError::Io {
        source,
        path: path.to_path_buf(),
    };
    let dir = path.parent().ok_or_else(|| {
        io_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor path has no parent",
        ))
    })?;
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}
