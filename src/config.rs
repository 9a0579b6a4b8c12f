//! Application and consumer configuration
//!
//! Loaded from TOML; every field has a default so a partial (or missing)
//! file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::SAMPLES_PER_FRAME;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{Name, StreamInfo};

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name prefix under which streams are published
    pub application_prefix: String,
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_filter: String,
    pub consumer: ConsumerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application_prefix: DEFAULT_APPLICATION_PREFIX.to_string(),
            log_filter: "info".to_string(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.consumer.validate()?;
        config.prefix()?;
        Ok(config)
    }

    /// Platform config location (`.../ndnptt/consumer.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "ndnptt", "ndnptt")
            .map(|dirs| dirs.config_dir().join("consumer.toml"))
    }

    pub fn prefix(&self) -> Result<Name> {
        let name = Name::from_uri(&self.application_prefix)?;
        if name.is_empty() {
            return Err(Error::Config("application_prefix must not be empty".into()));
        }
        Ok(name)
    }
}

/// Stream consumer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Frames buffered before frame 0 plays
    pub jitter_buffer_size: u64,
    pub tick_interval_ms: u64,
    /// Request lifetime used while the playback deadline is unknown
    pub default_interest_lifetime_ms: u64,
    /// Static congestion window ceiling
    pub max_cwnd: usize,
    pub min_rto_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            jitter_buffer_size: DEFAULT_JITTER_BUFFER_SIZE,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            default_interest_lifetime_ms: DEFAULT_INTEREST_LIFETIME_MS,
            max_cwnd: DEFAULT_MAX_CWND,
            min_rto_ms: DEFAULT_MIN_RTO_MS,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        if self.default_interest_lifetime_ms == 0 {
            return Err(Error::Config(
                "default_interest_lifetime_ms must be positive".into(),
            ));
        }
        if self.max_cwnd == 0 {
            return Err(Error::Config("max_cwnd must be positive".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn default_interest_lifetime(&self) -> Duration {
        Duration::from_millis(self.default_interest_lifetime_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    /// Derive the timing of one stream from its announced parameters
    pub fn timing(&self, info: &StreamInfo) -> Result<StreamTiming> {
        if info.frames_per_segment == 0 {
            return Err(Error::Config(format!(
                "stream {} announces zero frames per segment",
                info.name
            )));
        }
        let rate = info.producer_sampling_rate as u64;
        let frame_duration_ms = if rate == 0 {
            0
        } else {
            SAMPLES_PER_FRAME * 1000 / rate
        };
        if frame_duration_ms == 0 {
            return Err(Error::Config(format!(
                "stream {} sampling rate {} gives a sub-millisecond frame",
                info.name, info.producer_sampling_rate
            )));
        }
        Ok(StreamTiming {
            frames_per_segment: info.frames_per_segment,
            frame_duration_ms,
            segment_duration_ms: info.frames_per_segment * SAMPLES_PER_FRAME * 1000 / rate,
            jitter_delay: Duration::from_millis(self.jitter_buffer_size * frame_duration_ms),
        })
    }
}

/// Timing constants of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    pub frames_per_segment: u64,
    pub frame_duration_ms: u64,
    pub segment_duration_ms: u64,
    /// Delay between play start and the deadline of frame 0
    pub jitter_delay: Duration,
}

impl StreamTiming {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    /// Offset of `frame`'s deadline from the deadline of frame 0
    pub fn frame_offset(&self, frame: u64) -> Duration {
        Duration::from_millis(frame.saturating_mul(self.frame_duration_ms))
    }
}
