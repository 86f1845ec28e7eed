use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::storage::writer::DEFAULT_WRITER_PARTITIONS;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Number of writer tasks the append pool partitions chains across.
    pub writer_partitions: usize,
    /// Expected transactions per subset, used to size the bloom filters.
    pub bloom_expected_items: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/chain"),
            writer_partitions: DEFAULT_WRITER_PARTITIONS,
            bloom_expected_items: default_bloom_expected_items(),
        }
    }
}

fn default_bloom_expected_items() -> usize {
    8_192
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Hard deadline for a whole mining workflow.
    pub global_timeout_ms: u64,
    /// Per-peer timeout while gathering the transaction context.
    pub context_request_timeout_ms: u64,
    /// Slack added per cross-validator to the coordinator's confirmation
    /// waiting budget.
    pub coordinator_grace_ms: u64,
    /// Deadline for the replication fan-out.
    pub replication_timeout_ms: u64,
    /// Storage confirmations required before the attestation is sent;
    /// `None` requires every elected chain replica.
    pub storage_confirmation_quorum: Option<usize>,
    /// Tolerated clock drift when cross-validating a stamp timestamp.
    pub timestamp_tolerance_ms: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            global_timeout_ms: default_global_timeout_ms(),
            context_request_timeout_ms: default_context_request_timeout_ms(),
            coordinator_grace_ms: default_coordinator_grace_ms(),
            replication_timeout_ms: default_replication_timeout_ms(),
            storage_confirmation_quorum: None,
            timestamp_tolerance_ms: default_timestamp_tolerance_ms(),
        }
    }
}

fn default_global_timeout_ms() -> u64 {
    5_000
}

fn default_context_request_timeout_ms() -> u64 {
    1_000
}

fn default_coordinator_grace_ms() -> u64 {
    500
}

fn default_replication_timeout_ms() -> u64 {
    4_000
}

fn default_timestamp_tolerance_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub key_path: PathBuf,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mining: MiningConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.storage.db_path)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("./keys/node.toml"),
            storage: StorageConfig::default(),
            mining: MiningConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_survives_disk_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        let mut config = NodeConfig::default();
        config.mining.storage_confirmation_quorum = Some(2);
        config.storage.writer_partitions = 8;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.storage.writer_partitions, 8);
        assert_eq!(loaded.mining.storage_confirmation_quorum, Some(2));
        assert_eq!(loaded.mining.coordinator_grace_ms, 500);
    }

    #[test]
    fn defaults_require_every_replica() {
        let config = MiningConfig::default();
        assert_eq!(config.storage_confirmation_quorum, None);
        assert_eq!(config.global_timeout_ms, 5_000);
    }
}
