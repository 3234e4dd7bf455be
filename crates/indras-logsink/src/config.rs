//! Configuration types for the rotating log sink

use serde::{Deserialize, Serialize};

/// Rotation and compression settings for a [`RotationManager`](crate::RotationManager)
///
/// `max_size`, `max_files` and `blocking` seed the manager's runtime policy and
/// can be changed later through its setters. The remaining fields apply to
/// every appender the manager opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Size in bytes the active file must exceed to trigger a rotation
    pub max_size: u64,
    /// Number of compressed archives to retain (values below 1 act as 1)
    pub max_files: u32,
    /// Rotate on the writing task instead of a background task
    pub blocking: bool,
    /// Capacity of the per-appender compression queue, in chunks
    pub channel_capacity: usize,
    /// Gzip compression level (0-9)
    pub compression_level: u32,
    /// Flush files to stable storage when an appender closes
    pub sync_on_close: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024, // 10MB
            max_files: 5,
            blocking: true,
            channel_capacity: 1024,
            compression_level: 6,
            sync_on_close: true,
        }
    }
}

impl RotationConfig {
    /// Create a config for development (small files, fast compression)
    pub fn development() -> Self {
        Self {
            max_size: 1024 * 1024, // 1MB
            max_files: 3,
            compression_level: 1,
            sync_on_close: false,
            ..Default::default()
        }
    }

    /// Create a config for production (large files, background rotation)
    pub fn production() -> Self {
        Self {
            max_size: 100 * 1024 * 1024, // 100MB
            max_files: 30,
            blocking: false,
            channel_capacity: 4096,
            compression_level: 6,
            sync_on_close: true,
        }
    }

    /// Set the rotation threshold
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the archive retention count
    pub fn with_max_files(mut self, max_files: u32) -> Self {
        self.max_files = max_files;
        self
    }

    /// Choose between blocking and background rotation
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Set the gzip compression level
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RotationConfig::default();
        assert_eq!(config.max_size, 10 * 1024 * 1024);
        assert_eq!(config.max_files, 5);
        assert!(config.blocking);
        assert!(config.channel_capacity > 0);
    }

    #[test]
    fn test_presets() {
        let dev = RotationConfig::development();
        assert!(dev.blocking);
        assert_eq!(dev.compression_level, 1);

        let prod = RotationConfig::production();
        assert!(!prod.blocking);
        assert!(prod.max_size > dev.max_size);
        assert!(prod.sync_on_close);
    }

    #[test]
    fn test_builder_methods() {
        let config = RotationConfig::default()
            .with_max_size(32)
            .with_max_files(2)
            .with_blocking(false)
            .with_compression_level(42);
        assert_eq!(config.max_size, 32);
        assert_eq!(config.max_files, 2);
        assert!(!config.blocking);
        assert_eq!(config.compression_level, 9);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RotationConfig =
            serde_json::from_str(r#"{"max_size": 4096, "blocking": false}"#).unwrap();
        assert_eq!(config.max_size, 4096);
        assert!(!config.blocking);
        assert_eq!(config.max_files, RotationConfig::default().max_files);
    }
}
