use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level viewer configuration. Every section has defaults, so a document
/// containing only `version = 1` is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewerConfig {
    pub version: u32,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    /// RGBA colour used for the letterbox area around the composited image.
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
    /// Delay between redraw attempts while the tree is not ready yet.
    #[serde(
        default = "default_retry_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_interval: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            clear_color: default_clear_color(),
            retry_interval: default_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecoderConfig {
    #[serde(default = "default_initial_pts")]
    pub initial_pts: u64,
    #[serde(default = "default_pts_step")]
    pub pts_step: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            initial_pts: default_initial_pts(),
            pts_step: default_pts_step(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_true")]
    pub start_paused: bool,
    #[serde(default = "default_true")]
    pub looping: bool,
    /// Used for the final sample when a track reports no duration.
    #[serde(
        default = "default_frame_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub fallback_frame_duration: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_paused: true,
            looping: true,
            fallback_frame_duration: default_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_clear_color() -> [f32; 4] {
    [0.0, 0.0, 0.0, 0.0]
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(4)
}

fn default_initial_pts() -> u64 {
    10
}

fn default_pts_step() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_frame_duration() -> Duration {
    Duration::from_millis(33)
}

fn default_filter() -> String {
    "info".to_string()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            display: DisplayConfig::default(),
            decoder: DecoderConfig::default(),
            playback: PlaybackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: ViewerConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        // pts 0 is reserved for frames that are decoded but never presented
        if self.decoder.initial_pts == 0 {
            return Err(ConfigError::Invalid(
                "decoder.initial_pts must be greater than zero".into(),
            ));
        }

        if self.decoder.pts_step == 0 {
            return Err(ConfigError::Invalid(
                "decoder.pts_step must be greater than zero".into(),
            ));
        }

        if self.display.retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "display.retry_interval must be greater than zero".into(),
            ));
        }

        for (index, component) in self.display.clear_color.iter().enumerate() {
            if !(0.0..=1.0).contains(component) {
                return Err(ConfigError::Invalid(format!(
                    "display.clear_color[{index}] must be within [0, 1], got {component}"
                )));
            }
        }

        if self.playback.fallback_frame_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "playback.fallback_frame_duration must be greater than zero".into(),
            ));
        }

        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter may not be empty".into()));
        }

        Ok(())
    }
}
