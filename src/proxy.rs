use crate::config::Config;
use crate::dispatch::UpstreamDispatcher;
use crate::error::{ErrorSink, LogSink, ProxyError};
use crate::headers::{is_rewritable, transform_response_headers};
use crate::middleware::{Intercepted, RequestInterceptor, decode_request_body, handle_legacy_ie};
use crate::rewrite::{ProxyBody, RewriteBody, full_body};
use crate::rules::{RewriteRule, RuleSet};
use crate::target::{ProxyIdentity, Target};
use http::header::{CACHE_CONTROL, CONTENT_LENGTH};
use http::{Response, StatusCode};
use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Loads the proxy's own TLS material from PEM files. Any failure here is a
/// fatal configuration error, surfaced before the listener binds.
fn create_tls_config(key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
    let mut key_file = BufReader::new(
        File::open(key_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
    );
    let mut cert_file = BufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut key_file)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))
}

/// Everything one exchange needs, shared read-only across all connections.
struct Pipeline {
    target: Target,
    identity: ProxyIdentity,
    rules: Arc<RuleSet>,
    dispatcher: UpstreamDispatcher,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    sink: Arc<dyn ErrorSink>,
}

impl Pipeline {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.process(req).await {
            Ok(response) => response,
            Err(err) => {
                self.sink.report(&err);
                error_response(&err)
            }
        }
    }

    async fn process(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let req = match &self.interceptor {
            Some(interceptor) => match interceptor.handle(req).await {
                Intercepted::Handled(response) => return Ok(response),
                Intercepted::Continue(req) => req,
            },
            None => req,
        };

        let mut req = req;
        handle_legacy_ie(&mut req);
        let req = decode_request_body(req).await?;

        debug!("{} {} -> {}", req.method(), req.uri(), self.target.origin());
        let upstream = self.dispatcher.dispatch(req).await?;
        Ok(self.relay(upstream))
    }

    /// Applies the header transform and decides how the body travels back:
    /// rewritable responses stream through the rule set, everything else is
    /// relayed byte-for-byte.
    fn relay(&self, upstream: Response<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = upstream.into_parts();

        // Decided against the original headers; the transform below strips
        // the compression marker this check looks at.
        let rewritable = is_rewritable(&parts.headers);

        transform_response_headers(&mut parts.status, &mut parts.headers, &self.target, &self.identity);

        if rewritable {
            // The rewritten length is unknowable up front; drop the stale
            // declaration and let the connection re-frame the stream.
            parts.headers.remove(CONTENT_LENGTH);
            let body = RewriteBody::new(body, self.rules.clone());
            Response::from_parts(parts, body.boxed())
        } else {
            Response::from_parts(parts, body.map_err(ProxyError::from).boxed())
        }
    }
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(CACHE_CONTROL, "no-cache")
        .body(full_body(format!("Proxy Error: {}", err)))
        .unwrap()
}

/// A configured mirroring proxy, ready to serve.
///
/// `init` resolves the target, builds the rule set, and loads TLS material;
/// all configuration errors surface here, before anything binds. The
/// listener speaks TLS exactly when the mirrored target is https.
pub struct MirrorServer {
    pipeline: Arc<Pipeline>,
    tls: Option<TlsAcceptor>,
    port: u16,
}

impl MirrorServer {
    pub fn init(
        config: Config,
        additional_rules: Vec<Box<dyn RewriteRule>>,
        interceptor: Option<Arc<dyn RequestInterceptor>>,
        sink: Option<Arc<dyn ErrorSink>>,
    ) -> Result<Self, ProxyError> {
        let target = Target::resolve(&config.target)?;
        let identity = ProxyIdentity::new(&config.host, config.port);
        let rules = Arc::new(RuleSet::build(
            &target,
            &identity.host_port(),
            additional_rules,
        ));

        let tls = if target.is_secure {
            let ssl = config.ssl.as_ref().ok_or_else(|| {
                ProxyError::Config(
                    "An https target requires ssl.key and ssl.cert for the proxy's own listener"
                        .to_string(),
                )
            })?;
            let tls_config = create_tls_config(&ssl.key, &ssl.cert)?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        let dispatcher = UpstreamDispatcher::new(&config, target.clone())?;
        let sink = sink.unwrap_or_else(|| Arc::new(LogSink));

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                target,
                identity,
                rules,
                dispatcher,
                interceptor,
                sink,
            }),
            tls,
            port: config.port,
        })
    }

    /// Binds the configured port on all interfaces and serves until the
    /// process stops.
    pub async fn listen(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        self.serve_on(listener).await
    }

    /// Serves an externally bound listener. Hosting processes that manage
    /// their own sockets use this instead of [`listen`](Self::listen).
    pub async fn serve_on(self, listener: TcpListener) -> Result<(), ProxyError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!(
            "Mirroring {} at {}://{}",
            self.pipeline.target.origin(),
            scheme,
            self.pipeline.identity.host_port()
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let pipeline = self.pipeline.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            serve_connection(TokioIo::new(tls_stream), pipeline).await;
                        }
                        Err(e) => {
                            pipeline.sink.report(&ProxyError::Connection(format!(
                                "TLS handshake with {} failed: {}",
                                remote_addr, e
                            )));
                        }
                    },
                    None => serve_connection(TokioIo::new(stream), pipeline).await,
                }
            });
        }
    }
}

async fn serve_connection<I>(io: I, pipeline: Arc<Pipeline>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service_pipeline = pipeline.clone();
    let service = service_fn(move |req| {
        let pipeline = service_pipeline.clone();
        async move { Ok::<_, Infallible>(pipeline.handle(req).await) }
    });

    if let Err(e) = ServerBuilder::new().serve_connection(io, service).await {
        // Client disconnects mid-stream land here; the exchange is already
        // torn down, so reporting is all that is left to do.
        pipeline
            .sink
            .report(&ProxyError::Connection(format!("Error serving connection: {}", e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_http_target() {
        let config = Config {
            target: "http://example.com".to_string(),
            ..Config::default()
        };
        let server = MirrorServer::init(config, Vec::new(), None, None).unwrap();
        assert!(server.tls.is_none());
    }

    #[test]
    fn test_init_rejects_malformed_target() {
        let config = Config {
            target: "not a url".to_string(),
            ..Config::default()
        };
        assert!(MirrorServer::init(config, Vec::new(), None, None).is_err());
    }

    #[test]
    fn test_init_https_target_requires_ssl_material() {
        let config = Config {
            target: "https://example.com".to_string(),
            ssl: None,
            ..Config::default()
        };
        let result = MirrorServer::init(config, Vec::new(), None, None);
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_init_https_target_with_unreadable_ssl_files() {
        let config = Config {
            target: "https://example.com".to_string(),
            ssl: Some(crate::config::SslConfig {
                key: "/nonexistent/key.pem".to_string(),
                cert: "/nonexistent/cert.pem".to_string(),
            }),
            ..Config::default()
        };
        assert!(MirrorServer::init(config, Vec::new(), None, None).is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&ProxyError::Connection("refused".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-cache");
    }
}
