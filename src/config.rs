use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Pause inserted between two passes of a repeating playback.
    #[serde(default = "default_repeat_delay", with = "duration_ms")]
    pub repeat_delay: Duration,

    #[serde(default = "default_speed")]
    pub default_speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            repeat_delay: default_repeat_delay(),
            default_speed: default_speed(),
        }
    }
}

/// Rule matching policy.
///
/// The reported confidence of a rule evaluation is a heuristic, not derived
/// from recognition scores. It is kept configurable so consumers can tune it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_matched_confidence")]
    pub matched_confidence: f64,

    #[serde(default = "default_unmatched_confidence")]
    pub unmatched_confidence: f64,

    /// A rule condition must reference at least one key starting with one of these.
    #[serde(default = "default_required_namespaces")]
    pub required_namespaces: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            matched_confidence: default_matched_confidence(),
            unmatched_confidence: default_unmatched_confidence(),
            required_namespaces: default_required_namespaces(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_cycle_interval", with = "duration_ms")]
    pub cycle_interval: Duration,

    /// Upper bound for one capture or one template recognition.
    #[serde(default = "default_recognition_timeout", with = "duration_ms")]
    pub recognition_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval: default_cycle_interval(),
            recognition_timeout: default_recognition_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            playback: PlaybackConfig::default(),
            rules: RulesConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "event_buffer_size",
                message: "must be greater than 0".to_string(),
            });
        }
        if !(self.playback.default_speed.is_finite() && self.playback.default_speed > 0.0) {
            return Err(ConfigError::Invalid {
                field: "playback.default_speed",
                message: format!("must be positive, got {}", self.playback.default_speed),
            });
        }
        for (field, value) in [
            ("rules.matched_confidence", self.rules.matched_confidence),
            ("rules.unmatched_confidence", self.rules.unmatched_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("must be within [0, 1], got {}", value),
                });
            }
        }
        if self.orchestrator.cycle_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "orchestrator.cycle_interval",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    Ok(serde_json::from_str(s)?)
}

fn default_event_buffer_size() -> usize {
    64
}

fn default_repeat_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_speed() -> f64 {
    1.0
}

fn default_matched_confidence() -> f64 {
    0.9
}

fn default_unmatched_confidence() -> f64 {
    0.1
}

fn default_required_namespaces() -> Vec<String> {
    vec!["recognition.".to_string(), "variable.".to_string()]
}

fn default_cycle_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_recognition_timeout() -> Duration {
    Duration::from_millis(2000)
}

// Durationはミリ秒の整数で読み書きする
pub(crate) mod duration_ms {
    use serde::{ser, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).map_err(ser::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
