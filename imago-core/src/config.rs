//! Engine configuration: TOML file plus `IMAGO_`-prefixed environment
//! overrides, validated once at startup.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ImagoError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory://".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    /// Broker-side message TTL; expired messages route to the DLQ.
    pub message_ttl_ms: u64,
    /// Reject-with-requeue attempts before dead-lettering.
    pub retry_max: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "memory://".into(),
            message_ttl_ms: 86_400_000,
            retry_max: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub key_prefix: String,
    pub thumb_ttl_days: u32,
    /// Collections per rebuild batch.
    pub rebuild_batch_size: usize,
    pub reconcile_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idx:".into(),
            thumb_ttl_days: 30,
            rebuild_batch_size: 100,
            reconcile_interval_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheFolderConfig {
    pub path: PathBuf,
    pub priority: i32,
    pub max_size_bytes: u64,
}

/// Target box and encode quality for one derivative rendition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DerivativeTarget {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl DerivativeTarget {
    pub const THUMBNAIL: DerivativeTarget = DerivativeTarget {
        width: 300,
        height: 300,
        quality: 85,
    };

    pub const VIEW_CACHE: DerivativeTarget = DerivativeTarget {
        width: 1200,
        height: 1200,
        quality: 90,
    };
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub scan: usize,
    pub image: usize,
    pub thumbnail: usize,
    pub cache: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan: 2,
            image: 4,
            thumbnail: 4,
            cache: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagoConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub cache_folders: Vec<CacheFolderConfig>,
    pub thumbnail: Option<DerivativeTarget>,
    pub view_cache: Option<DerivativeTarget>,
    pub workers: WorkerConfig,
    pub monitor: MonitorConfig,
}

impl ImagoConfig {
    /// Loads configuration from an optional TOML file layered under
    /// `IMAGO_*` environment variables (`IMAGO_BROKER__RETRY_MAX=5`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("imago").required(false));
        }
        builder = builder.add_source(Environment::with_prefix("IMAGO").separator("__"));

        let config: ImagoConfig = builder
            .build()
            .map_err(|e| ImagoError::Validation(format!("failed to read configuration: {e}")))?
            .try_deserialize()
            .map_err(|e| ImagoError::Validation(format!("invalid configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn thumbnail_target(&self) -> DerivativeTarget {
        self.thumbnail.unwrap_or(DerivativeTarget::THUMBNAIL)
    }

    pub fn view_cache_target(&self) -> DerivativeTarget {
        self.view_cache.unwrap_or(DerivativeTarget::VIEW_CACHE)
    }

    fn validate(&self) -> Result<()> {
        for target in [self.thumbnail_target(), self.view_cache_target()] {
            if target.width == 0 || target.height == 0 {
                return Err(ImagoError::Validation(
                    "derivative target dimensions must be non-zero".into(),
                ));
            }
            if target.quality == 0 || target.quality > 100 {
                return Err(ImagoError::Validation(
                    "derivative quality must be in 1..=100".into(),
                ));
            }
        }
        if self.broker.retry_max == 0 {
            return Err(ImagoError::Validation("broker.retry_max must be ≥ 1".into()));
        }
        if self.index.rebuild_batch_size == 0 {
            return Err(ImagoError::Validation(
                "index.rebuild_batch_size must be ≥ 1".into(),
            ));
        }
        for folder in &self.cache_folders {
            if folder.max_size_bytes == 0 {
                return Err(ImagoError::Validation(format!(
                    "cache folder {} has zero capacity",
                    folder.path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ImagoConfig::default();
        config.validate().unwrap();
        assert_eq!(config.broker.retry_max, 3);
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.thumbnail_target().width, 300);
        assert_eq!(config.view_cache_target().quality, 90);
    }

    #[test]
    fn zero_quality_is_rejected() {
        let config = ImagoConfig {
            thumbnail: Some(DerivativeTarget {
                width: 300,
                height: 300,
                quality: 0,
            }),
            ..ImagoConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
