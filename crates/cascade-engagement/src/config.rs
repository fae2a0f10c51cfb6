//! Pipeline configuration.
//!
//! ```toml
//! dashboard_interval_secs = 60
//! tick_period_ms = 1000
//! auto_refresh = true
//!
//! [engine]
//! max_concurrent_refreshes = 4
//! history_capacity = 32
//! retained_versions = 2
//! ```

use cascade_kernel::{ConfigError, EngineConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of the engagement pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Refresh period of the dashboard table
    pub dashboard_interval_secs: u64,
    /// Period of the background ticker
    pub tick_period_ms: u64,
    /// Propagate every ingest and reference-data load immediately
    pub auto_refresh: bool,
    /// Engine settings
    pub engine: EngineConfig,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With engine settings
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// With dashboard refresh period
    #[must_use]
    pub fn with_dashboard_interval(mut self, interval: Duration) -> Self {
        self.dashboard_interval_secs = interval.as_secs();
        self
    }

    /// With ticker period
    #[must_use]
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With auto-refresh on or off
    #[must_use]
    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    /// Dashboard refresh period
    #[must_use]
    pub fn dashboard_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard_interval_secs)
    }

    /// Ticker period
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.dashboard_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dashboard_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_period_ms",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dashboard_interval_secs: 60,
            tick_period_ms: 1000,
            auto_refresh: true,
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_engine_section_parses() {
        let config = PipelineConfig::from_toml_str(
            "dashboard_interval_secs = 300\n[engine]\nmax_concurrent_refreshes = 2\n",
        )
        .unwrap();
        assert_eq!(config.dashboard_interval(), Duration::from_secs(300));
        assert_eq!(config.engine.max_concurrent_refreshes, 2);
        assert_eq!(config.engine.history_capacity, 32);
        assert!(config.auto_refresh);
    }

    #[test]
    fn zero_interval_rejected() {
        let err = PipelineConfig::new()
            .with_dashboard_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("dashboard_interval_secs"));
    }

    #[test]
    fn engine_errors_surface_through_pipeline_validation() {
        let config = PipelineConfig::new().with_engine(EngineConfig::new().with_workers(0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "max_concurrent_refreshes"
        ));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&PipelineConfig::default()).unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "auto_refresh = false\ntick_period_ms = 250\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(!config.auto_refresh);
        assert_eq!(config.tick_period(), Duration::from_millis(250));
    }
}
