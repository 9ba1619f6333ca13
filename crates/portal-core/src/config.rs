//! Portal configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8020
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Main portal configuration.
///
/// Loaded from `MCP_PORTAL_*` environment variables with sensible defaults;
/// the config dir is where the manual server document lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the gateway-owned manual source file.
    pub config_dir: PathBuf,
    /// Default per-server connection timeout in seconds.
    #[serde(default = "PortalConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Default per-server retry cap.
    #[serde(default = "PortalConfig::default_max_retries")]
    pub max_retries: u32,
}

impl PortalConfig {
    pub(crate) fn default_timeout_seconds() -> u64 {
        30
    }

    pub(crate) fn default_max_retries() -> u32 {
        3
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let config_dir = std::env::var("MCP_PORTAL_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".mcp-portal")
            });

        Self {
            host: std::env::var("MCP_PORTAL_HOST").unwrap_or_else(|_| default_host()),
            port: std::env::var("MCP_PORTAL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_port),
            log_level: std::env::var("MCP_PORTAL_LOG_LEVEL")
                .unwrap_or_else(|_| default_log_level()),
            config_dir,
            timeout_seconds: Self::default_timeout_seconds(),
            max_retries: Self::default_max_retries(),
        }
    }

    /// Listen address in `host:port` form.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            config_dir: PathBuf::from(".mcp-portal"),
            timeout_seconds: Self::default_timeout_seconds(),
            max_retries: Self::default_max_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PortalConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8020);
        assert_eq!(config.bind_addr(), "0.0.0.0:8020");
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PortalConfig =
            serde_json::from_str(r#"{"port": 9000, "config_dir": "/tmp/portal"}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.config_dir, PathBuf::from("/tmp/portal"));
    }
}
