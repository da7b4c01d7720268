/*!
 * Configuration types for partwise
 */

use crate::core::chunker::{MAX_PARTS, MAX_PART_SIZE};
use crate::core::retry::RetryPolicy;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How a transfer is split into parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartSizing {
    /// Fixed part size in bytes; the last part holds the remainder
    Size(u64),
    /// Fixed number of parts
    Count(u32),
}

impl Default for PartSizing {
    fn default() -> Self {
        PartSizing::Size(default_part_size())
    }
}

impl PartSizing {
    /// Reject sizes and counts no planner can honour
    pub fn validate(&self) -> Result<()> {
        match *self {
            PartSizing::Size(0) => Err(TransferError::InvalidArgument(
                "part size must be positive".to_string(),
            )),
            PartSizing::Size(size) if size > MAX_PART_SIZE => {
                Err(TransferError::InvalidArgument(format!(
                    "part size {} exceeds the maximum of {} bytes",
                    size, MAX_PART_SIZE
                )))
            }
            PartSizing::Count(0) => Err(TransferError::InvalidArgument(
                "part count must be positive".to_string(),
            )),
            PartSizing::Count(count) if count > MAX_PARTS => {
                Err(TransferError::InvalidArgument(format!(
                    "part count {} exceeds the limit of {}",
                    count, MAX_PARTS
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Where and whether transfer progress is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Persist progress so a failed transfer can resume
    pub enabled: bool,

    /// Exact checkpoint file path
    pub path: Option<PathBuf>,

    /// Directory for derived checkpoint file names (used when `path` is unset)
    pub dir: Option<PathBuf>,
}

impl CheckpointConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: Some(path.into()),
            dir: None,
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: None,
            dir: Some(dir.into()),
        }
    }
}

/// Main configuration for transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Part size or part count
    #[serde(default)]
    pub part_sizing: PartSizing,

    /// Number of concurrent part workers (0 or 1 = sequential)
    #[serde(default = "default_routines")]
    pub routines: usize,

    /// Checkpoint settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Maximum bandwidth in bytes per second (0 = unlimited)
    #[serde(default)]
    pub max_bandwidth: u64,

    /// Token bucket capacity in bytes (default: a tenth of a second of traffic)
    #[serde(default)]
    pub bandwidth_burst: Option<u64>,

    /// Compare the end-to-end CRC-64 against the one the remote advertises
    #[serde(default = "default_true")]
    pub verify_checksum: bool,

    /// Include a content hash in a local source's identity
    #[serde(default)]
    pub hash_source_content: bool,

    /// Per-part retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_sizing: PartSizing::default(),
            routines: default_routines(),
            checkpoint: CheckpointConfig::default(),
            max_bandwidth: 0,
            bandwidth_burst: None,
            verify_checksum: true,
            hash_source_content: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: TransferConfig = toml::from_str(&contents)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded transfer configuration");
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| TransferError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that would make planning fail
    pub fn validate(&self) -> Result<()> {
        self.part_sizing.validate()?;
        self.retry.validate()?;
        if self.bandwidth_burst == Some(0) {
            return Err(TransferError::InvalidArgument(
                "bandwidth burst must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_sizing = PartSizing::Size(bytes);
        self
    }

    pub fn with_part_count(mut self, count: u32) -> Self {
        self.part_sizing = PartSizing::Count(count);
        self
    }

    pub fn with_routines(mut self, routines: usize) -> Self {
        self.routines = routines;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_max_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.max_bandwidth = bytes_per_sec;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Log level for diagnostic output
    pub level: LogLevel,

    /// Log file path (None = stdout)
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024 // 8 MB
}

fn default_routines() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.part_sizing, PartSizing::Size(8 * 1024 * 1024));
        assert_eq!(config.routines, 3);
        assert!(!config.checkpoint.enabled);
        assert!(config.verify_checksum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        assert!(TransferConfig::default().with_part_size(0).validate().is_err());
        assert!(TransferConfig::default()
            .with_part_size(MAX_PART_SIZE + 1)
            .validate()
            .is_err());
        assert!(TransferConfig::default().with_part_count(0).validate().is_err());
        assert!(TransferConfig::default()
            .with_part_count(MAX_PARTS + 1)
            .validate()
            .is_err());
        assert!(TransferConfig::default().with_part_count(MAX_PARTS).validate().is_ok());
    }

    #[test]
    fn test_loaded_jitter_is_validated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jitter.toml");
        std::fs::write(&path, "[retry]\njitter_factor = -2.0\n").unwrap();
        assert!(matches!(
            TransferConfig::from_file(&path),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partwise.toml");
        let config = TransferConfig::default()
            .with_part_count(5)
            .with_routines(8)
            .with_checkpoint(CheckpointConfig::in_dir(dir.path()))
            .with_max_bandwidth(1_000_000);
        config.to_file(&path).unwrap();

        let loaded = TransferConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransferConfig = toml::from_str(
            r#"
            routines = 6
            part_sizing = { size = 1048576 }

            [checkpoint]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.routines, 6);
        assert_eq!(config.part_sizing, PartSizing::Size(1_048_576));
        assert!(config.checkpoint.enabled);
        assert!(config.checkpoint.path.is_none());
        assert!(config.verify_checksum);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "routines = \"many\"").unwrap();
        assert!(matches!(
            TransferConfig::from_file(&path),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
