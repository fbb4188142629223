use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl From<std::convert::Infallible> for ProxyError {
    fn from(v: std::convert::Infallible) -> Self {
        match v {}
    }
}

/// Receiver for non-fatal transport and proxy errors.
///
/// The server never retries a failed exchange; every error is reported here
/// exactly once and the affected connection is torn down.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &ProxyError);
}

/// Default sink: forwards errors to the `log` facade at warn level.
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, err: &ProxyError) {
        warn!("{}", err);
    }
}
