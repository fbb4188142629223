use crate::error::ProxyError;
use url::Url;

/// Resolved upstream origin, derived once at startup from the configured
/// target URL. Immutable for the server's lifetime.
#[derive(Debug, Clone)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub is_secure: bool,
}

impl Target {
    pub fn resolve(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::Config(format!(
                "Target must be an http or https URL, got scheme '{}'",
                scheme
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("Target URL '{}' has no host", raw)))?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::Config(format!("Target URL '{}' has no port", raw)))?;

        Ok(Self {
            is_secure: scheme == "https",
            scheme,
            host,
            port,
        })
    }

    /// Host, plus port when it differs from the scheme default. This is what
    /// appears in URLs that reference the upstream.
    pub fn authority(&self) -> String {
        let default_port = if self.is_secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }
}

/// The externally visible identity of the proxy itself, as clients address
/// it. Rewritten links, redirects, and the canonical `host:port` string all
/// derive from this.
#[derive(Debug, Clone)]
pub struct ProxyIdentity {
    pub host: String,
    pub port: u16,
}

impl ProxyIdentity {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Canonical `host:port`, always carrying the port.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_http_target() {
        let target = Target::resolve("http://example.com").unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert!(!target.is_secure);
        assert_eq!(target.authority(), "example.com");
        assert_eq!(target.origin(), "http://example.com");
    }

    #[test]
    fn test_resolve_https_target_with_port() {
        let target = Target::resolve("https://example.com:8443/ignored/path").unwrap();
        assert_eq!(target.scheme, "https");
        assert_eq!(target.port, 8443);
        assert!(target.is_secure);
        assert_eq!(target.authority(), "example.com:8443");
    }

    #[test]
    fn test_default_port_omitted_from_authority() {
        let target = Target::resolve("https://example.com").unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(target.authority(), "example.com");
    }

    #[test]
    fn test_malformed_target_is_config_error() {
        assert!(Target::resolve("not a url").is_err());
        assert!(Target::resolve("ftp://example.com").is_err());
    }

    #[test]
    fn test_proxy_identity_always_carries_port() {
        let identity = ProxyIdentity::new("localhost", 80);
        assert_eq!(identity.host_port(), "localhost:80");
    }
}
