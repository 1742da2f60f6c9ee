use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaggerError;

pub const CONFIG_FILE_VAR: &str = "AUTOTAGGER_CONFIG";

/// Start-up settings. Read once; nothing is reconfigured at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model_path: PathBuf,
    pub tags_path: PathBuf,
    pub gpu_parallelism: usize,
    pub batch_size: usize,
    pub image_size: u32,
    pub host: String,
    pub port: u16,
    pub max_upload_mb: u64,
    pub max_inflight: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model.pt"),
            tags_path: PathBuf::from("data/tags.json"),
            gpu_parallelism: 4,
            batch_size: 64,
            image_size: 224,
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_mb: 32,
            max_inflight: 8,
        }
    }
}

impl AppConfig {
    /// Load from the optional YAML file named by `AUTOTAGGER_CONFIG`, then apply
    /// environment overrides (including a `.env` file when present).
    pub fn load() -> Result<Self, TaggerError> {
        dotenv::dotenv().ok();

        let yaml = match env::var(CONFIG_FILE_VAR) {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                TaggerError::Config(format!("failed to read config file {}: {}", path, e))
            })?),
            Err(_) => None,
        };

        Self::from_sources(yaml.as_deref(), |key| env::var(key).ok())
    }

    pub fn from_sources<F>(yaml: Option<&str>, lookup: F) -> Result<Self, TaggerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match yaml {
            Some(text) => serde_yaml::from_str(text)
                .map_err(|e| TaggerError::Config(format!("invalid config file: {}", e)))?,
            None => AppConfig::default(),
        };

        override_from(&lookup, "MODEL_PATH", &mut config.model_path)?;
        override_from(&lookup, "TAGS_PATH", &mut config.tags_path)?;
        override_from(&lookup, "GPU_PARALLELISM", &mut config.gpu_parallelism)?;
        override_from(&lookup, "BATCH_SIZE", &mut config.batch_size)?;
        override_from(&lookup, "IMAGE_SIZE", &mut config.image_size)?;
        override_from(&lookup, "HOST", &mut config.host)?;
        override_from(&lookup, "PORT", &mut config.port)?;
        override_from(&lookup, "MAX_UPLOAD_MB", &mut config.max_upload_mb)?;
        override_from(&lookup, "MAX_INFLIGHT", &mut config.max_inflight)?;

        config.normalize()
    }

    fn normalize(mut self) -> Result<Self, TaggerError> {
        if self.gpu_parallelism < 1 {
            log::warn!(
                "GPU_PARALLELISM={} is below 1; using a single replica",
                self.gpu_parallelism
            );
            self.gpu_parallelism = 1;
        }
        if self.batch_size < 1 {
            return Err(TaggerError::Config("batch_size must be at least 1".into()));
        }
        if self.image_size < 1 {
            return Err(TaggerError::Config("image_size must be at least 1".into()));
        }
        self.max_upload_mb = self.max_upload_mb.max(1);
        self.max_inflight = self.max_inflight.max(1);
        Ok(self)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), TaggerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *target = raw
            .parse()
            .map_err(|e| TaggerError::Config(format!("invalid {}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}
