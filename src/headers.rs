use crate::target::{ProxyIdentity, Target};
use http::header::{
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION,
    STRICT_TRANSPORT_SECURITY,
};
use http::StatusCode;
use url::Url;

static X_ZIPPED: HeaderName = HeaderName::from_static("x-zipped");
static ACCEPT_BYTES: HeaderName = HeaderName::from_static("accept-bytes");

/// Response-header normalization, applied once per proxied response after
/// the upstream headers arrive and before any body byte is relayed.
///
/// Every step is a best-effort header edit: a missing or malformed header is
/// a no-op for that step, never an error. The order is load-bearing: the
/// redirect rewrite must see the 301-to-302 normalization, and the encoding
/// cleanup must run before the body stage consults the headers.
pub fn transform_response_headers(
    status: &mut StatusCode,
    headers: &mut HeaderMap,
    target: &Target,
    identity: &ProxyIdentity,
) {
    // Permanent redirects are downgraded so clients re-request through the
    // proxy on every visit instead of caching the upstream's redirect.
    if *status == StatusCode::MOVED_PERMANENTLY {
        *status = StatusCode::FOUND;
    }

    if *status == StatusCode::FOUND {
        let rewritten = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| rewrite_location(location, target, identity));
        if let Some(location) = rewritten {
            if let Ok(value) = HeaderValue::from_str(&location) {
                headers.insert(LOCATION, value);
            }
        }
    }

    // The proxy serves whichever protocol the mirrored site uses; a pinned
    // transport policy from the upstream would break the next visit.
    headers.remove(STRICT_TRANSPORT_SECURITY);

    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    if is_html(headers) && is_gzip_or_deflate(headers) {
        headers.remove(CONTENT_ENCODING);
        headers.remove(&ACCEPT_BYTES);
        headers.insert(X_ZIPPED.clone(), HeaderValue::from_static("true"));
    }

    strip_hop_by_hop(headers);
}

/// Absolute locations pointing at the upstream host are retargeted at the
/// proxy identity; relative and foreign locations pass through untouched.
fn rewrite_location(location: &str, target: &Target, identity: &ProxyIdentity) -> Option<String> {
    let mut url = Url::parse(location).ok()?;
    if url.host_str()? != target.host {
        return None;
    }
    url.set_host(Some(&identity.host)).ok()?;
    url.set_port(Some(identity.port)).ok()?;
    Some(url.to_string())
}

/// Whether the body stage may run the rewrite rules over this response:
/// HTML that is not carrying a compression marker.
pub fn is_rewritable(headers: &HeaderMap) -> bool {
    is_html(headers) && !is_compressed(headers)
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn is_gzip_or_deflate(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            value == "gzip" || value == "deflate"
        })
        .unwrap_or(false)
}

fn is_compressed(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| !value.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false)
}

/// Removes connection-scoped headers before relaying in either direction.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    headers.remove("connection");
    headers.remove("keep-alive");
    headers.remove("proxy-authenticate");
    headers.remove("proxy-authorization");
    headers.remove("te");
    headers.remove("trailers");
    headers.remove("transfer-encoding");
    headers.remove("upgrade");
}
