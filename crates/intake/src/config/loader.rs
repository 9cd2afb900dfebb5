use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::schema::{ConfigFormat, IntakeConfig, CONFIG_VERSION};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IntakeConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .map(ConfigFormat::from_extension)
        .unwrap_or(ConfigFormat::Json);

    load_config_from_str(&content, format)
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<IntakeConfig, ConfigError> {
    let config: IntakeConfig = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

/// `<platform config dir>/intake/config.json`, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("intake").join("config.json"))
}

pub fn validate_config(config: &IntakeConfig) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.owner_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ConfigError::Validation {
            message: "owner_id must not be blank".to_string(),
        });
    }

    let scheduler = &config.scheduler;
    if scheduler.max_concurrent == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.max_concurrent must be at least 1".to_string(),
        });
    }
    if scheduler.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.event_capacity must be at least 1".to_string(),
        });
    }

    let rec = &config.recommendation;
    if !is_positive(rec.limits.ocr_ai_max_mb) || !is_positive(rec.limits.ai_vision_max_mb) {
        return Err(ConfigError::Validation {
            message: "Method size limits must be positive".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for model in &rec.models {
        if model.id.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "Model id must not be empty".to_string(),
            });
        }
        if !seen.insert(model.id.as_str()) {
            return Err(ConfigError::DuplicateModel {
                id: model.id.clone(),
            });
        }
        if !(1..=10).contains(&model.accuracy) {
            return Err(ConfigError::Validation {
                message: format!("Model '{}' accuracy must be between 1 and 10", model.id),
            });
        }
        if !is_positive(model.max_file_size_mb) {
            return Err(ConfigError::Validation {
                message: format!("Model '{}' max_file_size_mb must be positive", model.id),
            });
        }
    }

    // Empty catalog and unknown default model
    rec.catalog()?;

    if rec.fallback_triggers.iter().any(|t| t.trim().is_empty()) {
        return Err(ConfigError::Validation {
            message: "Fallback triggers must not be empty".to_string(),
        });
    }

    Ok(())
}

// False for NaN as well as zero and negatives.
fn is_positive(value: f64) -> bool {
    value > 0.0
}
