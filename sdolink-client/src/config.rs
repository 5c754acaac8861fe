use std::{path::Path, time::Duration};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Error returned when loading a client configuration
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// Path of the file
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML, or does not match the expected layout
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying error
        source: toml::de::Error,
    },
    /// A field has a value outside of its valid range
    #[snafu(display("Invalid value for {field}: {message}"))]
    InvalidValue {
        /// Name of the field
        field: &'static str,
        /// Description of the problem
        message: String,
    },
}

/// Timing and transfer mode settings for an [`SdoClient`](crate::SdoClient)
///
/// All fields have defaults, so a TOML file only needs to list the fields it changes:
///
/// ```toml
/// timeout_ms = 500
/// retries = 1
/// prefer_block = true
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SdoClientConfig {
    /// How long to wait for each response before retransmitting, in milliseconds
    pub timeout_ms: u64,
    /// How many times an unanswered request is retransmitted during one transfer
    ///
    /// The budget is shared by all round trips of the transfer.
    pub retries: u32,
    /// Sleep between polls of the receiver, in microseconds
    pub poll_interval_us: u64,
    /// Number of segments per block requested for block uploads (1..=127). Block downloads use
    /// the block size chosen by the server.
    pub block_size: u8,
    /// Whether to use CRC on block transfers
    pub use_crc: bool,
    /// Use block transfer for large objects
    pub prefer_block: bool,
    /// Size at which downloads switch to block transfer when `prefer_block` is set. Also sent to
    /// the server as protocol switch threshold for block uploads.
    pub block_threshold: usize,
}

impl Default for SdoClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            retries: 3,
            poll_interval_us: 500,
            block_size: 127,
            use_crc: true,
            prefer_block: false,
            block_threshold: 64,
        }
    }
}

impl SdoClientConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SdoClientConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<SdoClientConfig, ConfigError> {
        let config: SdoClientConfig = toml::from_str(s).context(TomlDeserializationSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all fields are within their valid range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > 127 {
            return InvalidValueSnafu {
                field: "block_size",
                message: format!("{} is not in 1..=127", self.block_size),
            }
            .fail();
        }
        if self.timeout_ms == 0 {
            return InvalidValueSnafu {
                field: "timeout_ms",
                message: "must be greater than 0",
            }
            .fail();
        }
        Ok(())
    }

    /// Response timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = SdoClientConfig::load_from_str("").unwrap();
        assert_eq!(SdoClientConfig::default(), config);
        assert_eq!(Duration::from_secs(1), config.timeout());
    }

    #[test]
    fn test_load_config() {
        let config = SdoClientConfig::load_from_str(
            r#"
            timeout_ms = 250
            retries = 0
            block_size = 16
            use_crc = false
            prefer_block = true
            "#,
        )
        .unwrap();

        assert_eq!(250, config.timeout_ms);
        assert_eq!(0, config.retries);
        assert_eq!(16, config.block_size);
        assert!(!config.use_crc);
        assert!(config.prefer_block);
        assert_eq!(500, config.poll_interval_us);
        assert_eq!(64, config.block_threshold);
    }

    #[test]
    fn test_invalid_config() {
        let result = SdoClientConfig::load_from_str("block_size = 128");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "block_size",
                ..
            })
        ));

        let result = SdoClientConfig::load_from_str("timeout = 5");
        assert!(matches!(
            result,
            Err(ConfigError::TomlDeserialization { .. })
        ));

        let result = SdoClientConfig::load_from_file("/nonexistent/sdolink.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
