//! Network tuning knobs shared by hosts, connections and the router.

use crate::error::{TypesError, TypesResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest frame accepted by default (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Smallest `max_frame_size` accepted by [`NetworkConfig::validate`].
const MIN_FRAME_SIZE: u32 = 1024;

/// Timeouts and limits for the network layer.
///
/// Every field has a default, so a partial TOML table is enough:
///
/// ```toml
/// io_timeout_ms = 5000
/// max_frame_size = 1048576
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Rolling deadline applied to each send and receive.
    pub io_timeout_ms: u64,
    /// Deadline for establishing a TCP connection.
    pub dial_timeout_ms: u64,
    /// Deadline for the TLS and identity handshakes combined.
    pub handshake_timeout_ms: u64,
    /// Largest frame body accepted from a peer, in bytes.
    pub max_frame_size: u32,
    /// Pause after a failed `accept` before trying again.
    pub accept_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 60_000,
            dial_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backoff_ms: 1_000,
        }
    }
}

impl NetworkConfig {
    /// Parse from TOML and validate.
    pub fn from_toml_str(text: &str) -> TypesResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| TypesError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TypesResult<()> {
        for (name, value) in [
            ("io_timeout_ms", self.io_timeout_ms),
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ] {
            if value == 0 {
                return Err(TypesError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(TypesError::Config(format!(
                "max_frame_size must be at least {MIN_FRAME_SIZE} bytes, got {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.io_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NetworkConfig::from_toml_str("io_timeout_ms = 250\n").unwrap();
        assert_eq!(config.io_timeout_ms, 250);
        assert_eq!(config.dial_timeout_ms, 10_000);
        assert_eq!(config.accept_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let err = NetworkConfig::from_toml_str("handshake_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("handshake_timeout_ms"));
    }

    #[test]
    fn test_validate_rejects_tiny_frames() {
        let config = NetworkConfig {
            max_frame_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            NetworkConfig::from_toml_str("io_timeout_ms = \"soon\""),
            Err(TypesError::Config(_))
        ));
    }
}
