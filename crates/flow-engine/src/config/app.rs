//! HTTP server configuration for the control plane.

use serde::Deserialize;

/// Server configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOW_`:
/// - `FLOW_HOST`: Server bind address (default: "0.0.0.0")
/// - `FLOW_PORT`: Server port (default: 8090)
/// - `FLOW_DEBUG`: Enable debug mode (default: false)
/// - `FLOW_SERVER_NAME`: Server name for identification
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "flow-control-plane".to_string()
}

impl AppConfig {
    /// Load configuration from `FLOW_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOW_").from_env::<AppConfig>()
    }

    /// Address suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8090);
        assert!(!config.debug);
        assert_eq!(config.bind_address(), "0.0.0.0:8090");
    }
}
