//! Runtime configuration

use crate::decode::PayloadFormat;
use crate::error::{Result, VolError};
use crate::grid::DEFAULT_CELL_SIZE;
use crate::window::{DisplayRange, DEFAULT_WINDOW_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the orchestrating caller retries transient transfer failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per cell including the first
    pub max_attempts: usize,
    /// Delay before retry n is `n * base_backoff_ms`
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 0,
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 500,
        }
    }
}

/// Settings shared by the ingest pipeline and the viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolgridConfig {
    /// Side length of a remote grid cell
    pub cell_size: u64,
    /// Side length of the viewer's in-memory cube
    pub window_size: u64,
    /// Transfers in flight at once during download
    pub max_concurrent_transfers: usize,
    /// Per-request timeout for remote sources
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub payload_format: PayloadFormat,
    pub display: DisplayRange,
}

impl Default for VolgridConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            max_concurrent_transfers: 4,
            request_timeout_secs: 300,
            retry: RetryPolicy::default(),
            payload_format: PayloadFormat::default(),
            display: DisplayRange::default(),
        }
    }
}

impl VolgridConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VolError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| VolError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the pipeline or viewer unusable
    pub fn validate(&self) -> Result<()> {
        if self.cell_size == 0 {
            return Err(VolError::Configuration("cell_size must be non-zero".to_string()));
        }
        if self.window_size == 0 {
            return Err(VolError::Configuration("window_size must be non-zero".to_string()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(VolError::Configuration(
                "max_concurrent_transfers must be non-zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(VolError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = VolgridConfig::default();
        assert_eq!(config.cell_size, 500);
        assert_eq!(config.window_size, 301);
        assert_eq!(config.payload_format, PayloadFormat::Tiff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volgrid.json");
        std::fs::write(
            &path,
            r#"{
                "window_size": 201,
                "retry": { "max_attempts": 2 },
                "payload_format": { "kind": "raw", "compression": "deflate" }
            }"#,
        )
        .unwrap();

        let config = VolgridConfig::from_file(&path).unwrap();
        assert_eq!(config.window_size, 201);
        assert_eq!(config.cell_size, 500);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_backoff_ms, 500);
        assert_eq!(
            config.payload_format,
            PayloadFormat::Raw {
                compression: CompressionMethod::Deflate
            }
        );
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volgrid.json");
        std::fs::write(&path, r#"{ "cell_size": 0 }"#).unwrap();
        assert!(matches!(
            VolgridConfig::from_file(&path),
            Err(VolError::Configuration(_))
        ));
    }

    #[test]
    fn test_inverted_display_range_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volgrid.json");
        std::fs::write(&path, r#"{ "display": { "low": 230, "high": 100 } }"#).unwrap();
        assert!(matches!(
            VolgridConfig::from_file(&path),
            Err(VolError::Configuration(_))
        ));
    }

    #[test]
    fn test_linear_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(1500));
    }
}
