//! Database configuration via `synapsedb.toml`.
//!
//! Same model as the teacher's `strata.toml`: on first open, a default
//! file is created next to the data directory; to change settings, edit
//! the file and reopen.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use synapse_index::HnswConfig;
use synapse_quant::QuantizerKind;
use synapse_sync::ConflictStrategy;

use crate::error::{DbError, DbResult};

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "synapsedb.toml";

/// HNSW section of [`DatabaseConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswSettings {
    /// Whether a shard builds an approximate index at all. When `false`
    /// every search is a brute-force scan regardless of shard size.
    pub enabled: bool,
    /// Neighbours kept per node above layer 0.
    pub m: usize,
    /// Neighbours kept per node at layer 0.
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub min_vectors_for_index: usize,
    /// Automatically rebuild the index once a shard crosses
    /// `min_vectors_for_index`, rather than requiring an explicit call.
    pub auto_rebuild: bool,
}

impl Default for HnswSettings {
    fn default() -> Self {
        let defaults = HnswConfig::default();
        HnswSettings {
            enabled: true,
            m: defaults.m,
            m0: defaults.m0,
            ef_construction: defaults.ef_construction,
            ef_search: defaults.ef_search,
            min_vectors_for_index: defaults.min_vectors_for_index,
            auto_rebuild: true,
        }
    }
}

impl HnswSettings {
    pub fn to_hnsw_config(self) -> HnswConfig {
        HnswConfig {
            m: self.m,
            m0: self.m0,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            min_vectors_for_index: self.min_vectors_for_index,
            max_level_cap: HnswConfig::default().max_level_cap,
        }
    }
}

/// Quantizer section of [`DatabaseConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizerSettings {
    pub kind: QuantizerKind,
    /// Codeword width for the scalar codec (4, 8 or 16), or per-subvector
    /// centroid bits for the product codec. Ignored by `none`/`binary`.
    pub bits: u8,
    /// Number of subvector codebooks for the product codec. Ignored by
    /// every other kind.
    pub subvectors: usize,
}

impl Default for QuantizerSettings {
    fn default() -> Self {
        QuantizerSettings {
            kind: QuantizerKind::None,
            bits: 8,
            subvectors: 8,
        }
    }
}

/// Query-result cache section of [`DatabaseConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            max_size: 1_000,
            ttl_ms: 30_000,
        }
    }
}

/// Cross-node sync section of [`DatabaseConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// `"last-write-wins"`, `"first-write-wins"`, `"merge"` or `"manual"`.
    pub conflict_strategy: String,
    pub batch_size: usize,
    /// `"none"` or `"packed"`.
    pub compression: String,
    /// Auto-sync period; `0` disables the periodic timer.
    pub sync_interval_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Persist each `(shard, peer)` session watermark across restarts via
    /// the `sync_session` table. When `false`, every sync starts from
    /// scratch (`from_change_id = 0`).
    pub persist_session: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            conflict_strategy: "last-write-wins".to_string(),
            batch_size: 256,
            compression: "none".to_string(),
            sync_interval_ms: 0,
            max_retries: 3,
            retry_backoff_ms: 0,
            persist_session: true,
        }
    }
}

impl SyncSettings {
    pub fn conflict_strategy(&self) -> DbResult<ConflictStrategy> {
        match self.conflict_strategy.as_str() {
            "last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
            "first-write-wins" => Ok(ConflictStrategy::FirstWriteWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(DbError::Config(format!(
                "invalid sync.conflict_strategy '{other}'; expected one of \
                 last-write-wins, first-write-wins, merge, manual"
            ))),
        }
    }

    pub fn compression(&self) -> DbResult<synapse_sync::Compression> {
        match self.compression.as_str() {
            "none" => Ok(synapse_sync::Compression::None),
            "packed" => Ok(synapse_sync::Compression::Packed),
            other => Err(DbError::Config(format!(
                "invalid sync.compression '{other}'; expected 'none' or 'packed'"
            ))),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Top-level configuration for a [`crate::Database`], loaded from
/// `synapsedb.toml` or constructed in-process for an in-memory database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Data directory. `None` (together with `in_memory = true`) opens a
    /// substrate backed by no file at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub in_memory: bool,
    /// Embedding dimension every shard in this database is fixed to.
    pub dimension: u32,
    pub hnsw: HnswSettings,
    pub quantizer: QuantizerSettings,
    pub cache: CacheSettings,
    pub sync: SyncSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: None,
            in_memory: true,
            dimension: 768,
            hnsw: HnswSettings::default(),
            quantizer: QuantizerSettings::default(),
            cache: CacheSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// An in-memory database of the given `dimension`, every other
    /// section left at its default.
    pub fn in_memory(dimension: u32) -> Self {
        DatabaseConfig {
            dimension,
            ..Default::default()
        }
    }

    /// A disk-backed database rooted at `path`, every other section left
    /// at its default.
    pub fn at_path(path: impl Into<PathBuf>, dimension: u32) -> Self {
        DatabaseConfig {
            path: Some(path.into()),
            in_memory: false,
            dimension,
            ..Default::default()
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> String {
        let config = DatabaseConfig { in_memory: false, ..Default::default() };
        let body = toml::to_string_pretty(&config).expect("default config always serializes");
        format!(
            "# synapsedb configuration\n\
             #\n\
             # Edit this file and reopen the database to change settings.\n\
             # `path`/`in_memory` are fixed at creation time and ignored here.\n\
             {body}"
        )
    }

    /// Read and parse config from a file path, eagerly validating the
    /// sections that parse to a richer type (`sync.conflict_strategy`,
    /// `sync.compression`).
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DatabaseConfig = toml::from_str(&content)
            .map_err(|e| DbError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.sync.conflict_strategy()?;
        config.sync.compression()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> DbResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to `path`.
    pub fn write_to_file(&self, path: &Path) -> DbResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DbError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = DatabaseConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: DatabaseConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.dimension, config.dimension);
        assert_eq!(parsed.hnsw.m, config.hnsw.m);
    }

    #[test]
    fn default_toml_parses_and_validates() {
        let parsed = toml::from_str::<DatabaseConfig>(&DatabaseConfig::default_toml()).unwrap();
        assert!(parsed.sync.conflict_strategy().is_ok());
        assert!(parsed.sync.compression().is_ok());
    }

    #[test]
    fn invalid_conflict_strategy_is_rejected() {
        let mut config = DatabaseConfig::default();
        config.sync.conflict_strategy = "yolo".to_string();
        assert!(config.sync.conflict_strategy().is_err());
    }

    #[test]
    fn write_default_does_not_overwrite_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "dimension = 42\n").unwrap();

        DatabaseConfig::write_default_if_missing(&path).unwrap();
        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.dimension, 42);
    }

    #[test]
    fn write_to_file_then_from_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = DatabaseConfig::in_memory(16);
        config.write_to_file(&path).unwrap();

        let loaded = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(loaded.dimension, 16);
    }

    #[test]
    fn from_file_with_missing_fields_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.dimension, DatabaseConfig::default().dimension);
    }
}
