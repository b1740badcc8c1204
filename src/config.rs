use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;
use crate::soil::DEFAULT_SOIL_URL;
use crate::store::Store;
use crate::vegetation::DEFAULT_VEGETATION_URL;

pub const CONFIG_FILE: &str = "agro-backfill.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub vegetation_url: Option<String>,
    #[serde(default)]
    pub soil_url: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub defaults: Option<RunDefaultsEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RunDefaultsEntry {
    #[serde(default)]
    pub period_days: Option<u32>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub include_soil: Option<bool>,
    #[serde(default)]
    pub soil_scale: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDefaults {
    pub period_days: u32,
    pub collection: String,
    pub include_soil: bool,
    pub soil_scale: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            period_days: 10,
            collection: "SENTINEL2".to_string(),
            include_soil: false,
            soil_scale: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store_root: Utf8PathBuf,
    pub vegetation_url: String,
    pub soil_url: String,
    pub request_timeout: Duration,
    pub defaults: RunDefaults,
}

/// Environment values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub store_root: Option<String>,
    pub vegetation_url: Option<String>,
    pub soil_url: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            store_root: read("AGRO_BACKFILL_STORE"),
            vegetation_url: read("AGRO_BACKFILL_VEGETATION_URL"),
            soil_url: read("AGRO_BACKFILL_SOIL_URL"),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `agro-backfill.json` from the working directory if it
    /// exists. Only an explicitly named file is required to exist.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BackfillError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| BackfillError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| BackfillError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, EnvOverrides::from_env())
    }

    pub fn resolve_config(
        config: Config,
        env: EnvOverrides,
    ) -> Result<ResolvedConfig, BackfillError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let store_root = match env.store_root.or(config.store_root) {
            Some(root) => Utf8PathBuf::from(root),
            None => Store::default_root()?,
        };

        let timeout_secs = config.request_timeout_secs.unwrap_or(120);
        if timeout_secs == 0 {
            return Err(BackfillError::ConfigParse(
                "request_timeout_secs must be positive".to_string(),
            ));
        }

        let fallback = RunDefaults::default();
        let entry = config.defaults.unwrap_or_default();
        let defaults = RunDefaults {
            period_days: entry.period_days.unwrap_or(fallback.period_days),
            collection: entry.collection.unwrap_or(fallback.collection),
            include_soil: entry.include_soil.unwrap_or(fallback.include_soil),
            soil_scale: entry.soil_scale.unwrap_or(fallback.soil_scale),
        };
        if defaults.period_days == 0 {
            return Err(BackfillError::ConfigParse(
                "defaults.period_days must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            store_root,
            vegetation_url: env
                .vegetation_url
                .or(config.vegetation_url)
                .unwrap_or_else(|| DEFAULT_VEGETATION_URL.to_string()),
            soil_url: env
                .soil_url
                .or(config.soil_url)
                .unwrap_or_else(|| DEFAULT_SOIL_URL.to_string()),
            request_timeout: Duration::from_secs(timeout_secs),
            defaults,
        })
    }
}
