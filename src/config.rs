use crate::error::ProxyError;
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_timeout_secs() -> Option<u64> {
    Some(30)
}

/// PEM key/certificate pair for the proxy's own listener.
///
/// Required when the mirrored target is https; the proxy then terminates
/// TLS itself so the client talks to it over the same protocol family the
/// upstream uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    pub key: String,
    pub cert: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream origin to mirror, as an absolute URL.
    pub target: String,
    /// Externally visible hostname clients use to reach the proxy. Rewritten
    /// links and redirects point here.
    #[serde(default = "default_host")]
    pub host: String,
    /// Externally visible port, part of the proxy identity alongside `host`.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// When set, overrides the outbound `User-Agent` toward the upstream.
    #[serde(default)]
    pub user_agent_header: Option<String>,
    /// When set, overrides the `Host` header sent upstream. Defaults to the
    /// upstream's own authority so virtual-host routing keeps working.
    #[serde(default)]
    pub host_header: Option<String>,
    /// Upstream round-trip timeout. The transport has no idle timeout of its
    /// own beyond this.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: "http://127.0.0.1:3000".to_string(),
            host: default_host(),
            port: default_port(),
            ssl: None,
            user_agent_header: None,
            host_header: None,
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config file {}: {}", path, e)))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"target": "https://example.com"}"#).unwrap();
        assert_eq!(config.target, "https://example.com");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert!(config.ssl.is_none());
        assert!(config.user_agent_header.is_none());
        assert_eq!(config.upstream_timeout_secs, Some(30));
    }

    #[test]
    fn test_full_config_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "target": "https://example.com",
                "host": "mirror.local",
                "port": 9443,
                "ssl": {{"key": "/tmp/key.pem", "cert": "/tmp/cert.pem"}},
                "user_agent_header": "mirrorgate-probe",
                "host_header": "override.example.com"
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "mirror.local");
        assert_eq!(config.port, 9443);
        assert_eq!(config.ssl.as_ref().unwrap().key, "/tmp/key.pem");
        assert_eq!(config.user_agent_header.as_deref(), Some("mirrorgate-probe"));
        assert_eq!(config.host_header.as_deref(), Some("override.example.com"));
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::from_file("/nonexistent/mirrorgate.json");
        assert!(result.is_err());
    }
}
