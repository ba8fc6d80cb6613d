//! Engine configuration persistence

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use super::EngineConfig;
use super::error::EngineError;

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_slice(&data).context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON, replacing the file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(&json)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        file.sync_all().context("Failed to sync config")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move config into {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("engine name must not be empty".to_string()));
        }
        Ok(())
    }
}
