use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the address tracker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration
    pub storage: StorageConfig,
    /// History limits
    pub history: HistoryConfig,
    /// Feature toggles
    pub features: FeatureConfig,
    /// Geolocation provider configuration
    pub lookup: LookupConfig,
    /// Output configuration
    pub output: OutputConfig,
}

/// Which storage backend holds the profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Relational,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selector: "file" or "relational"
    pub kind: StorageKind,
    /// Flat file backend settings
    pub file: FileStorageConfig,
    /// Relational backend settings
    pub relational: RelationalStorageConfig,
}

/// Flat file backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    /// Path to the JSON document holding every profile
    pub path: PathBuf,
}

/// Relational (SQLite) backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalStorageConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Prefix prepended to every table name
    pub table_prefix: String,
    /// Number of pre-established pooled connections
    pub pool_size: u32,
    /// How long to wait for a pooled connection before opening an extra one
    pub acquire_timeout_secs: u64,
}

/// History limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of address records kept per user
    pub max_size: usize,
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Record an address whenever a user connects
    pub auto_log_on_join: bool,
    /// Look up location and ISP for addresses not yet in the history
    pub query_location: bool,
    /// Treat an address already in the history as recorded and skip the lookup
    pub check_duplicate_address: bool,
}

/// Geolocation provider selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupProvider {
    None,
    Http,
    Maxmind,
}

/// Geolocation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub provider: LookupProvider,
    pub http: HttpLookupConfig,
    pub maxmind: MaxMindLookupConfig,
}

/// HTTP provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpLookupConfig {
    pub url: String,
    pub key: String,
    /// Connect and read timeout in milliseconds
    pub timeout_ms: u64,
}

/// MaxMind provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxMindLookupConfig {
    /// GeoLite2-City database
    pub city_db: PathBuf,
    /// GeoLite2-ASN database, used for the ISP field
    pub asn_db: Option<PathBuf>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "console", "json" or "jsonl"
    pub format: String,
    /// Append lookup results to this file instead of stdout
    pub file_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            kind: StorageKind::File,
            file: FileStorageConfig::default(),
            relational: RelationalStorageConfig::default(),
        }
    }
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            path: PathBuf::from("data/iplog.json"),
        }
    }
}

impl Default for RelationalStorageConfig {
    fn default() -> Self {
        RelationalStorageConfig {
            path: PathBuf::from("data/iplog.db"),
            table_prefix: "iplog_".to_string(),
            pool_size: 5,
            acquire_timeout_secs: 5,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig { max_size: 100 }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            auto_log_on_join: true,
            query_location: true,
            check_duplicate_address: true,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            provider: LookupProvider::Http,
            http: HttpLookupConfig::default(),
            maxmind: MaxMindLookupConfig::default(),
        }
    }
}

impl Default for HttpLookupConfig {
    fn default() -> Self {
        HttpLookupConfig {
            url: "https://api.ipplus360.com/ip/geo/v1/street/biz/".to_string(),
            key: String::new(),
            timeout_ms: 5000,
        }
    }
}

impl Default for MaxMindLookupConfig {
    fn default() -> Self {
        MaxMindLookupConfig {
            city_db: PathBuf::from("GeoLite2-City.mmdb"),
            asn_db: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "console".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a file and validate it
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings no backend or provider can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.max_size == 0 {
            return Err(ConfigError::Invalid(
                "history.max_size must be at least 1".to_string(),
            ));
        }

        if self.storage.kind == StorageKind::Relational {
            let relational = &self.storage.relational;
            if relational.pool_size == 0 {
                return Err(ConfigError::Invalid(
                    "storage.relational.pool_size must be at least 1".to_string(),
                ));
            }
            if !relational
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConfigError::Invalid(format!(
                    "storage.relational.table_prefix '{}' may only contain ASCII letters, digits and '_'",
                    relational.table_prefix
                )));
            }
        }

        if self.features.query_location && self.lookup.provider == LookupProvider::Http {
            if self.lookup.http.key.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "lookup.http.key is required when the http provider is enabled".to_string(),
                ));
            }
            if self.lookup.http.timeout_ms == 0 {
                return Err(ConfigError::Invalid(
                    "lookup.http.timeout_ms must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}
