//! Stream tuning with environment variable support.
//!
//! This module provides [`StreamConfig`] for loading and validating channel
//! watermarks and pipe buffer sizes from JSON files and environment
//! variables.
//!
//! ## Environment Variables
//!
//! - `BYTEPIPE_LOW_WATER`: Override the channel low watermark (bytes)
//! - `BYTEPIPE_HIGH_WATER`: Override the channel high watermark (bytes)
//! - `BYTEPIPE_INTERVAL_MICROS`: Override the forced callback interval
//! - `BYTEPIPE_BUFFER_SIZE`: Override the pipe read size
//! - `BYTEPIPE_BOX_SIZE`: Override the plaintext size of a sealed box
//! - `BYTEPIPE_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, DEFAULT_HIGH_WATER, DEFAULT_INTERVAL, DEFAULT_LOW_WATER};
use crate::cipher_filter::BlockCipherFilter;
use crate::pipe::DEFAULT_BUFFER_SIZE;

/// Environment variable names for configuration overrides
pub const ENV_LOW_WATER: &str = "BYTEPIPE_LOW_WATER";
pub const ENV_HIGH_WATER: &str = "BYTEPIPE_HIGH_WATER";
pub const ENV_INTERVAL_MICROS: &str = "BYTEPIPE_INTERVAL_MICROS";
pub const ENV_BUFFER_SIZE: &str = "BYTEPIPE_BUFFER_SIZE";
pub const ENV_BOX_SIZE: &str = "BYTEPIPE_BOX_SIZE";
pub const ENV_CONFIG_PATH: &str = "BYTEPIPE_CONFIG";

/// Intervals above this make cancellation sluggish on large transfers
const SLOW_INTERVAL_MICROS: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub max_interval_micros: u64,
    pub buffer_size: usize,
    pub box_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            max_interval_micros: DEFAULT_INTERVAL.as_micros() as u64,
            buffer_size: DEFAULT_BUFFER_SIZE,
            box_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl StreamConfig {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: StreamConfig =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                StreamConfig::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env(ENV_LOW_WATER, &mut self.low_water)?;
        override_from_env(ENV_HIGH_WATER, &mut self.high_water)?;
        override_from_env(ENV_INTERVAL_MICROS, &mut self.max_interval_micros)?;
        override_from_env(ENV_BUFFER_SIZE, &mut self.buffer_size)?;
        override_from_env(ENV_BOX_SIZE, &mut self.box_size)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.low_water == 0 || self.high_water == 0 {
            anyhow::bail!("watermarks must be greater than zero");
        }
        if self.low_water > self.high_water {
            anyhow::bail!(
                "low_water ({}) cannot exceed high_water ({})",
                self.low_water,
                self.high_water
            );
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size cannot be zero");
        }
        if self.box_size == 0 {
            anyhow::bail!("box_size cannot be zero");
        }

        if self.max_interval_micros > SLOW_INTERVAL_MICROS {
            warn!(
                interval_micros = self.max_interval_micros,
                "callback interval is long - cancellation will be observed late"
            );
        }

        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            low_water: self.low_water,
            high_water: self.high_water,
            interval: Duration::from_micros(self.max_interval_micros),
        }
    }

    /// Read size that keeps an opening pipe aligned to sealed boxes.
    pub fn sealed_box_size(&self) -> usize {
        BlockCipherFilter::sealed_len(self.box_size)
    }
}

fn override_from_env<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = env::var(name) {
        let value = raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {}={}", name, raw))?;
        debug!(variable = name, value = %value, "overriding from environment");
        *slot = value;
    }
    Ok(())
}
