use crate::config::Config;
use crate::error::ProxyError;
use crate::headers::strip_hop_by_hop;
use crate::rewrite::ProxyBody;
use crate::target::Target;
use http::header::{ACCEPT_ENCODING, HOST, USER_AGENT};
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::{Duration, timeout};

const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Forwards prepared requests to the resolved upstream and hands the raw
/// response back to the pipeline.
///
/// Certificate verification toward the upstream is disabled: the proxy is a
/// sanctioned mirror in front of a site under test, not a trust boundary.
pub struct UpstreamDispatcher {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    target: Target,
    host_header: HeaderValue,
    user_agent: Option<HeaderValue>,
    timeout_duration: Duration,
}

impl UpstreamDispatcher {
    pub fn new(config: &Config, target: Target) -> Result<Self, ProxyError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| {
                ProxyError::Config(format!("Failed to build upstream TLS connector: {}", e))
            })?;
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let connector = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector);

        // Virtual hosting at the upstream resolves against this value, so it
        // defaults to the upstream's own authority unless overridden.
        let host_value = config
            .host_header
            .clone()
            .unwrap_or_else(|| target.authority());
        let host_header = HeaderValue::from_str(&host_value)
            .map_err(|e| ProxyError::Config(format!("Invalid host header '{}': {}", host_value, e)))?;

        let user_agent = match &config.user_agent_header {
            Some(ua) => Some(HeaderValue::from_str(ua).map_err(|e| {
                ProxyError::Config(format!("Invalid user agent header '{}': {}", ua, e))
            })?),
            None => None,
        };

        let timeout_duration = Duration::from_secs(
            config
                .upstream_timeout_secs
                .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
        );

        Ok(Self {
            client,
            target,
            host_header,
            user_agent,
            timeout_duration,
        })
    }

    pub async fn dispatch(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        let req = self.prepare(req)?;

        let response = timeout(self.timeout_duration, self.client.request(req))
            .await
            .map_err(|_| {
                ProxyError::Connection(format!(
                    "Upstream request timed out after {}s",
                    self.timeout_duration.as_secs()
                ))
            })?
            .map_err(|e| ProxyError::Connection(format!("Upstream request failed: {}", e)))?;

        Ok(response)
    }

    /// Retargets the request at the upstream origin and applies the fixed
    /// outbound header set. Compression is refused end to end so the body
    /// stage always sees plain text.
    fn prepare(&self, mut req: Request<ProxyBody>) -> Result<Request<ProxyBody>, ProxyError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let uri: Uri = format!("{}{}", self.target.origin(), path_and_query)
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::Uri(e.to_string()))?;
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        headers.insert(HOST, self.host_header.clone());
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if let Some(user_agent) = &self.user_agent {
            headers.insert(USER_AGENT, user_agent.clone());
        }
        strip_hop_by_hop(headers);

        Ok(req)
    }
}
