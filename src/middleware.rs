use crate::error::ProxyError;
use crate::rewrite::{ProxyBody, full_body};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, USER_AGENT};
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use std::io::Read;

/// Outcome of a caller-supplied interception step.
pub enum Intercepted {
    /// The interceptor produced the full response; the proxy performs no
    /// further work on this exchange.
    Handled(Response<ProxyBody>),
    /// Proceed with normal proxying.
    Continue(Request<Incoming>),
}

/// Optional short-circuit run before any other per-request processing.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> Intercepted;
}

/// Cache-defeating normalization for legacy Internet Explorer clients.
///
/// IE 8 and older serve stale copies through intermediary HTTP stacks even
/// when the response forbids caching, so each request gets a unique query
/// parameter appended before it goes upstream.
pub fn handle_legacy_ie<B>(req: &mut Request<B>) {
    let major = req
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .and_then(msie_major);
    match major {
        Some(major) if major < 9 => {}
        _ => return,
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let separator = if path_and_query.contains('?') { '&' } else { '?' };
    let busted = format!(
        "{}{}cachebust={}",
        path_and_query,
        separator,
        Utc::now().timestamp_millis()
    );
    if let Ok(uri) = busted.parse::<Uri>() {
        *req.uri_mut() = uri;
    }
}

fn msie_major(user_agent: &str) -> Option<u32> {
    let rest = &user_agent[user_agent.find("MSIE ")? + 5..];
    let digits: &str = rest.split(|c: char| !c.is_ascii_digit()).next()?;
    digits.parse().ok()
}

/// Inbound request-body normalization: a gzip- or deflate-encoded request
/// body is decoded before dispatch so the upstream always receives plain
/// bytes, mirroring the `Accept-Encoding: identity` contract on the
/// response side. Unencoded bodies stream through untouched.
pub async fn decode_request_body<B>(req: Request<B>) -> Result<Request<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<ProxyError>,
{
    let encoding = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());

    let gzip = match encoding.as_deref() {
        Some("gzip") => true,
        Some("deflate") => false,
        _ => return Ok(req.map(|body| body.map_err(Into::into).boxed())),
    };

    let (mut parts, body) = req.into_parts();
    let encoded = body
        .collect()
        .await
        .map_err(Into::into)?
        .to_bytes();
    let decoded = if gzip {
        inflate_gzip(&encoded)?
    } else {
        inflate_deflate(&encoded)?
    };

    parts.headers.remove(CONTENT_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, http::HeaderValue::from(decoded.len()));
    Ok(Request::from_parts(parts, full_body(decoded)))
}

fn inflate_gzip(data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ProxyError::Http(format!("Failed to decode gzip request body: {}", e)))?;
    Ok(out)
}

fn inflate_deflate(data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    // Deflate on the wire is usually zlib-wrapped, but some agents send the
    // raw stream.
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ProxyError::Http(format!("Failed to decode deflate request body: {}", e)))?;
    Ok(out)
}
