use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "covflow.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub extract: ExtractConfig,
    pub threshold: ThresholdConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractConfig {
    /// Packages buffered between the scanner and the consumer
    pub channel_capacity: usize,
    /// Give up on the report after this many seconds
    pub timeout_seconds: Option<u64>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Minimum whole-number percentage every file must reach
    pub min_percent: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load an explicit config, or `covflow.toml` from the working directory if present
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.extract.channel_capacity == 0 {
            anyhow::bail!("extract.channel_capacity must be at least 1");
        }

        if let Some(min) = self.threshold.min_percent {
            if min > 100 {
                anyhow::bail!("threshold.min_percent must be between 0 and 100, got {}", min);
            }
        }

        if self.extract.timeout_seconds == Some(0) {
            anyhow::bail!("extract.timeout_seconds must be greater than 0");
        }

        Ok(())
    }
}
