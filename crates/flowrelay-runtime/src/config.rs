//! Driver configuration

use std::time::Duration;

use flowrelay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// Room reserved in each frame for transfer headers and delivery tags
pub const FRAME_OVERHEAD: usize = 1024;

/// Configuration for the TCP driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Largest encoded frame accepted from a peer
    pub max_frame_size: usize,
    /// Port used when a hostname carries none
    pub default_port: u16,
    /// Close connections that send nothing for this long (`None` = never)
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            default_port: 5672,
            idle_timeout_secs: None,
        }
    }
}

impl DriverConfig {
    /// Short idle timeout so that stalled peers cannot hang a test
    pub fn testing() -> Self {
        Self {
            idle_timeout_secs: Some(5),
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve `host` or `host:port` to a socket address string
    pub fn socket_address(&self, host: &str) -> String {
        if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, self.default_port)
        }
    }

    /// Check the driver settings against the engine's largest transfer payload
    pub fn validate(&self, max_frame_payload: usize) -> Result<()> {
        if self.default_port == 0 {
            return Err(RelayError::config_error("default_port must not be 0"));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(RelayError::config_error(
                "idle_timeout_secs must be at least 1 when set",
            ));
        }
        if max_frame_payload.saturating_add(FRAME_OVERHEAD) > self.max_frame_size {
            return Err(RelayError::config_error(format!(
                "max_frame_size {} cannot carry {} byte transfer payloads",
                self.max_frame_size, max_frame_payload
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_fits_default_engine() {
        let engine = flowrelay_core::EngineConfig::default();
        assert!(DriverConfig::default()
            .validate(engine.max_frame_payload)
            .is_ok());
    }

    #[test]
    fn test_frame_size_must_cover_payload() {
        let config = DriverConfig {
            max_frame_size: 2048,
            ..DriverConfig::default()
        };
        assert!(config.validate(4096).is_err());
    }

    #[test]
    fn test_socket_address_uses_default_port() {
        let config = DriverConfig::default();
        assert_eq!(config.socket_address("localhost"), "localhost:5672");
        assert_eq!(config.socket_address("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn test_idle_timeout_conversion() {
        assert_eq!(DriverConfig::default().idle_timeout(), None);
        assert_eq!(
            DriverConfig::testing().idle_timeout(),
            Some(Duration::from_secs(5))
        );
    }
}
