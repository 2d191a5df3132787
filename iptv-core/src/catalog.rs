//! Read-only view over the channel configuration tables.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::sqlite::configure_connection;
use crate::supervisor::{Variant, VariantKind};

const CHANNELS_SCHEMA: &str = include_str!("../../sql/channels.sql");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to open channel catalog {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to query channel catalog: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("channel catalog path not configured")]
    MissingStore,
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDefinition {
    pub slug: String,
    pub display_name: Option<String>,
    pub source_url: String,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone)]
pub struct SqliteChannelCatalogBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteChannelCatalogBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteChannelCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<SqliteChannelCatalog> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteChannelCatalog { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteChannelCatalog {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteChannelCatalog {
    pub fn builder() -> SqliteChannelCatalogBuilder {
        SqliteChannelCatalogBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        SqliteChannelCatalogBuilder::new().path(path).build()
    }

    fn open(&self) -> CatalogResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    /// Creates the tables if absent. Rows are owned by the channel admin.
    pub fn initialize(&self) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CHANNELS_SCHEMA)?;
        Ok(())
    }

    /// Enabled channels with their variants in configured order. Channels
    /// without a usable variant are skipped.
    pub fn active_channels(&self) -> CatalogResult<Vec<ChannelDefinition>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT slug, display_name, source_url FROM channels WHERE enabled = 1 ORDER BY slug",
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(ChannelDefinition {
                    slug: row.get(0)?,
                    display_name: row.get(1)?,
                    source_url: row.get(2)?,
                    variants: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut variant_stmt = conn.prepare(
            "SELECT name, kind, bitrate_kbps, width, height FROM channel_variants
             WHERE channel = ?1 ORDER BY position ASC, name ASC",
        )?;
        let mut definitions = Vec::with_capacity(channels.len());
        for mut channel in channels {
            let mut rows = variant_stmt.query(params![&channel.slug])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let Ok(kind) = kind.parse::<VariantKind>() else {
                    warn!(channel = %channel.slug, variant = %name, kind = %kind, "unknown variant kind");
                    continue;
                };
                channel.variants.push(Variant {
                    name,
                    kind,
                    bitrate_kbps: row.get(2)?,
                    width: row.get(3)?,
                    height: row.get(4)?,
                });
            }
            if channel.variants.is_empty() {
                warn!(channel = %channel.slug, "enabled channel has no variants");
                continue;
            }
            definitions.push(channel);
        }
        Ok(definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(catalog: &SqliteChannelCatalog) {
        let conn = catalog.open().unwrap();
        conn.execute_batch(
            "INSERT INTO channels (slug, display_name, source_url, enabled) VALUES
                ('news', 'News 24', 'srt://origin/news', 1),
                ('radio', NULL, 'http://origin/radio', 1),
                ('archive', NULL, 'http://origin/archive', 0),
                ('empty', NULL, 'http://origin/empty', 1);
             INSERT INTO channel_variants (channel, name, kind, bitrate_kbps, width, height, position) VALUES
                ('news', '480p', 'video', 1400, 854, 480, 1),
                ('news', '1080p', 'video', 5000, 1920, 1080, 0),
                ('radio', 'aac', 'audio_only', 128, NULL, NULL, 0),
                ('archive', 'src', 'copy', NULL, NULL, NULL, 0);",
        )
        .unwrap();
    }

    #[test]
    fn lists_enabled_channels_with_ordered_variants() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SqliteChannelCatalog::new(dir.path().join("iptv.sqlite")).unwrap();
        catalog.initialize().unwrap();
        seed(&catalog);

        let channels = catalog.active_channels().unwrap();
        let slugs: Vec<_> = channels.iter().map(|c| c.slug.as_str()).collect();
        assert_eq!(slugs, vec!["news", "radio"]);

        let news = &channels[0];
        assert_eq!(news.display_name.as_deref(), Some("News 24"));
        let names: Vec<_> = news.variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["1080p", "480p"]);
        assert_eq!(news.variants[0], Variant::video("1080p", 5000, 1920, 1080));
        assert_eq!(channels[1].variants[0], Variant::audio_only("aac", 128));
    }

    #[test]
    fn initialize_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SqliteChannelCatalog::new(dir.path().join("iptv.sqlite")).unwrap();
        catalog.initialize().unwrap();
        catalog.initialize().unwrap();
        assert!(catalog.active_channels().unwrap().is_empty());
    }
}
