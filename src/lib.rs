pub mod config;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod rewrite;
pub mod rules;
pub mod target;

pub use config::{Config, SslConfig};
pub use error::{ErrorSink, LogSink, ProxyError};
pub use middleware::{Intercepted, RequestInterceptor};
pub use proxy::MirrorServer;
pub use rules::{RewriteRule, RuleSet};
