use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::coords::CoordinateRemap;
use crate::encoder::EncoderConfig;
use crate::error::ConfigError;

/// Everything the generation pipeline can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Threads evaluating rules in parallel.
    pub worker_threads: usize,
    pub cache: CacheConfig,
    pub encoder: EncoderConfig,
    pub coordinates: CoordinateRemap,
    /// Shapes with a smaller total area are rejected at submission.
    pub min_shape_area: f64,
    /// Completed outcomes handed to the host per drain call.
    pub max_completions_per_drain: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            cache: CacheConfig::default(),
            encoder: EncoderConfig::default(),
            coordinates: CoordinateRemap::identity(),
            min_shape_area: 1e-4,
            max_completions_per_drain: 8,
        }
    }
}

impl BridgeConfig {
    /// Reads a `.ron` or `.json` file, picked by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "ron" => Self::from_ron_str(&content),
            "json" => Self::from_json_str(&content),
            _ => Err(ConfigError::UnsupportedFormat(extension)),
        }
    }

    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.max_completions_per_drain == 0 {
            return Err(ConfigError::Invalid("max_completions_per_drain must be at least 1".into()));
        }
        if !(self.min_shape_area.is_finite() && self.min_shape_area >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "min_shape_area must be a non-negative number, got {}",
                self.min_shape_area
            )));
        }
        self.cache.validate()?;
        self.encoder.validate()?;
        self.coordinates.validate()
    }
}
