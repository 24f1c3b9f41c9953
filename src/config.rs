//! Orchestrator configuration.
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields the reference timings. Durations are stored as integer
//! milliseconds or seconds, matching how operators write them in YAML.
//!
//! # Environment Variables
//!
//! - `TURNPACE_CONFIG` — path to a YAML config file (optional)
//! - `TURNPACE_WINDOW_MS` — override the coalescing window
//! - `TURNPACE_ACTIVITY_TTL_SECS` — override the activity TTL
//! - `TURNPACE_IRRITATION_COOLDOWN_SECS` — override the re-arm cool-down

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub aggregator: AggregatorConfig,
    pub pacing: PacingConfig,
    pub activity: ActivityConfig,
    pub persuasion: PersuasionConfig,
    pub acknowledgement: AcknowledgementConfig,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
    /// How long shutdown waits for running turns (0 = 30 s).
    pub shutdown_grace_secs: u64,
}

/// Turn aggregator (debounce) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Quiescence window W.
    pub window_ms: u64,
    /// Max gap M between consecutive fragments that may still be merged.
    pub max_interval_ms: u64,
    /// Flush immediately once this many fragments are buffered.
    pub max_fragments: usize,
    /// Never defer a flush longer than this after the first fragment.
    pub max_wait_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            max_interval_ms: 5_000,
            max_fragments: 10,
            max_wait_ms: 15_000,
        }
    }
}

impl AggregatorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Delay model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub reading_wpm: f64,
    pub typing_chars_per_sec: f64,
    /// Relative jitter applied to the total, e.g. `0.18` for ±18%.
    pub jitter: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Outgoing texts up to this many characters use the short band.
    pub short_text_chars: usize,
    pub short_min_delay_ms: u64,
    pub short_max_delay_ms: u64,
    /// Fixed offset used to derive the user's local hour. `None` uses the
    /// host's local time zone.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            reading_wpm: 230.0,
            typing_chars_per_sec: 7.0,
            jitter: 0.18,
            min_delay_ms: 800,
            max_delay_ms: 8_000,
            short_text_chars: 30,
            short_min_delay_ms: 1_500,
            short_max_delay_ms: 3_000,
            utc_offset_minutes: None,
        }
    }
}

impl PacingConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Activity window tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl ActivityConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Persuasion sequencer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersuasionConfig {
    /// Offsets from arm time, one per level, strictly increasing.
    pub level_offsets_secs: Vec<u64>,
    /// How long re-arming stays suppressed after an irritation apology.
    pub irritation_cooldown_secs: u64,
    /// Engagement at or above this caps escalation at the medium tier.
    pub high_engagement: f32,
    /// Engagement at or above this caps escalation at the high tier.
    pub mid_engagement: f32,
}

impl Default for PersuasionConfig {
    fn default() -> Self {
        Self {
            level_offsets_secs: vec![90, 180, 360, 600, 900, 1_320, 1_800],
            irritation_cooldown_secs: 6 * 60 * 60,
            high_engagement: 0.7,
            mid_engagement: 0.4,
        }
    }
}

impl PersuasionConfig {
    pub fn level_offsets(&self) -> Vec<Duration> {
        self.level_offsets_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn irritation_cooldown(&self) -> Duration {
        Duration::from_secs(self.irritation_cooldown_secs)
    }
}

/// "I'm here" acknowledgement sent while a slow reply is being generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcknowledgementConfig {
    /// Acknowledgement text. `None` disables acknowledgements.
    pub text: Option<String>,
    /// Only acknowledge when generation takes longer than this.
    pub after_ms: u64,
}

impl Default for AcknowledgementConfig {
    fn default() -> Self {
        Self {
            text: None,
            after_ms: 4_000,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a YAML document. Missing fields fall back to defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Load from `TURNPACE_CONFIG` (if set) and apply env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TURNPACE_CONFIG") {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        if let Some(ms) = env_u64("TURNPACE_WINDOW_MS")? {
            config.aggregator.window_ms = ms;
        }
        if let Some(secs) = env_u64("TURNPACE_ACTIVITY_TTL_SECS")? {
            config.activity.ttl_secs = secs;
        }
        if let Some(secs) = env_u64("TURNPACE_IRRITATION_COOLDOWN_SECS")? {
            config.persuasion.irritation_cooldown_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agg = &self.aggregator;
        if agg.window_ms == 0 {
            return Err(ConfigError::invalid("aggregator.window_ms", "must be positive"));
        }
        if agg.max_interval_ms < agg.window_ms {
            return Err(ConfigError::invalid(
                "aggregator.max_interval_ms",
                format!(
                    "max interval ({}ms) must not be shorter than the window ({}ms)",
                    agg.max_interval_ms, agg.window_ms
                ),
            ));
        }
        if agg.max_fragments == 0 {
            return Err(ConfigError::invalid("aggregator.max_fragments", "must be at least 1"));
        }

        let pacing = &self.pacing;
        if !(0.0..=0.5).contains(&pacing.jitter) {
            return Err(ConfigError::invalid("pacing.jitter", "must lie in [0.0, 0.5]"));
        }
        if pacing.reading_wpm <= 0.0 || pacing.typing_chars_per_sec <= 0.0 {
            return Err(ConfigError::invalid("pacing", "rates must be positive"));
        }
        if pacing.min_delay_ms > pacing.max_delay_ms {
            return Err(ConfigError::invalid("pacing.min_delay_ms", "exceeds max_delay_ms"));
        }
        if pacing.short_min_delay_ms > pacing.short_max_delay_ms
            || pacing.short_min_delay_ms < pacing.min_delay_ms
            || pacing.short_max_delay_ms > pacing.max_delay_ms
        {
            return Err(ConfigError::invalid(
                "pacing.short_*_delay_ms",
                "short band must be ordered and lie within [min_delay_ms, max_delay_ms]",
            ));
        }

        if self.activity.ttl_secs == 0 {
            return Err(ConfigError::invalid("activity.ttl_secs", "must be positive"));
        }

        let offsets = &self.persuasion.level_offsets_secs;
        if offsets.is_empty() {
            return Err(ConfigError::invalid("persuasion.level_offsets_secs", "must not be empty"));
        }
        if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::invalid(
                "persuasion.level_offsets_secs",
                "offsets must be strictly increasing",
            ));
        }
        Ok(())
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        if self.shutdown_grace_secs == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(self.shutdown_grace_secs)
        }
    }

    pub(crate) fn event_capacity(&self) -> usize {
        if self.event_capacity == 0 {
            256
        } else {
            self.event_capacity
        }
    }
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.aggregator.window(), Duration::from_secs(3));
        assert_eq!(config.aggregator.max_interval(), Duration::from_secs(5));
        assert_eq!(config.activity.ttl(), Duration::from_secs(300));
        assert_eq!(config.persuasion.level_offsets().len(), 7);
        assert_eq!(config.persuasion.level_offsets()[0], Duration::from_secs(90));
        assert_eq!(config.persuasion.level_offsets()[6], Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = OrchestratorConfig::from_yaml_str("").unwrap();
        assert_eq!(config.aggregator.window_ms, 3_000);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_shutdown_grace_from_yaml() {
        let config = OrchestratorConfig::from_yaml_str("shutdown_grace_secs: 5\n").unwrap();
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "aggregator:\n  window_ms: 2000\npersuasion:\n  irritation_cooldown_secs: 60\n";
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.aggregator.window_ms, 2_000);
        assert_eq!(config.aggregator.max_interval_ms, 5_000);
        assert_eq!(config.persuasion.irritation_cooldown_secs, 60);
        assert_eq!(config.pacing.max_delay_ms, 8_000);
    }

    #[test]
    fn test_rejects_interval_shorter_than_window() {
        let yaml = "aggregator:\n  window_ms: 6000\n  max_interval_ms: 5000\n";
        let err = OrchestratorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("max_interval_ms"));
    }

    #[test]
    fn test_rejects_unordered_offsets() {
        let yaml = "persuasion:\n  level_offsets_secs: [90, 60]\n";
        assert!(OrchestratorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_excessive_jitter() {
        let yaml = "pacing:\n  jitter: 0.9\n";
        assert!(OrchestratorConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "activity:\n  ttl_secs: 120").unwrap();
        let config = OrchestratorConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.activity.ttl_secs, 120);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = OrchestratorConfig::from_yaml_file("/nonexistent/turnpace.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/turnpace.yaml"));
    }
}
