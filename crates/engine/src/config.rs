use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trinity_core::TiePolicy;

use crate::error::EngineError;

pub const CLIENT_ID_ENV: &str = "TRINITY_CLIENT_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Fixed client id; a persisted or random one is used when absent.
    pub client_id: Option<String>,
    pub storage: StorageConfig,
    /// Named shards. Empty means a single `default` shard built from `storage`.
    pub shards: Vec<ShardConfig>,
    pub entity_cache: bool,
    pub state_vector_tie: TiePolicy,
    pub default_skip_index: bool,
    pub query_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            storage: StorageConfig::Memory,
            shards: Vec::new(),
            entity_cache: true,
            state_vector_tie: TiePolicy::Higher,
            default_skip_index: false,
            query_cache: true,
        }
    }
}

impl DbConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::Sqlite { path: path.into() },
            ..Self::default()
        }
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        toml::from_str(contents).map_err(|e| config_error(format!("failed to parse config: {e}")))
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
        let mut config: DbConfig = toml::from_str(&contents)
            .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`DbConfig::load`], falling back to defaults when the file is missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return config;
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var(CLIENT_ID_ENV)
            && !id.trim().is_empty()
        {
            self.client_id = Some(id.trim().to_string());
        }
    }

    /// Shards to open, in declaration order.
    pub fn shard_layout(&self) -> Vec<ShardConfig> {
        if self.shards.is_empty() {
            return vec![ShardConfig {
                name: trinity_storage::DEFAULT_SHARD.to_string(),
                storage: self.storage.clone(),
            }];
        }
        self.shards.clone()
    }
}

fn config_error(message: String) -> EngineError {
    EngineError::Config(message)
}
