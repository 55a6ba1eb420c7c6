//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::executor::RetryConfig;
use crate::trading::{presets, RiskConfig, StrategyConfig};

pub const DEFAULT_STATE_FILE: &str = "trading_state.json";

/// Everything the engine needs at startup. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub retry: RetryConfig,

    /// Snapshot file for the position store
    pub state_file: PathBuf,

    /// Confirm trades without placing them
    pub dry_run: bool,

    /// Buffered notification events per subscriber
    pub notification_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            strategy: StrategyConfig::default(),
            retry: RetryConfig::default(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            dry_run: true,
            notification_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&body).map_err(|e| {
            EngineError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Replace the active strategy with a preset.
    pub fn with_preset(mut self, id: &str) -> Result<Self> {
        let preset = presets::by_id(id)
            .ok_or_else(|| EngineError::Configuration(format!("unknown strategy preset '{}'", id)))?;
        self.strategy = preset.config;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        self.strategy.validate()?;
        self.retry.validate()?;
        if self.state_file.as_os_str().is_empty() {
            return Err(EngineError::Configuration(
                "state_file must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
