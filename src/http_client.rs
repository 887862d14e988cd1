//! Shared HTTP client construction for the source, analyzer, and sink adapters.
//!
//! Every adapter builds its `reqwest::Client` here so timeout, user-agent,
//! compression, and proxy behaviour stay consistent across the pipeline.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy};
use tracing::warn;

/// Default HTTP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default HTTP read timeout (5 minutes, sized for multi-megabyte bodies).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/mediarelay";

/// Connect and overall request timeouts for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// TCP/TLS connect bound.
    pub connect: Duration,
    /// Whole-request bound.
    pub read: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl HttpTimeouts {
    /// Uses the same bound for connect and read.
    #[must_use]
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            connect: timeout,
            read: timeout,
        }
    }
}

/// Default User-Agent for all outgoing requests.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mediarelay/{version} (+{PROJECT_UA_URL})")
}

/// Builds a client with the shared timeouts, user agent and compression.
///
/// Proxy discovery is tried in decreasing order of ambition: the platform's
/// system settings, then only the `*_PROXY` environment variables, then no
/// proxy at all. A mode is abandoned only if the builder panics inside it;
/// a regular build error is returned as is. `role` only appears in logs.
///
/// # Errors
///
/// Returns the `reqwest` build error of the first mode that did not panic.
pub fn build_http_client(role: &str, timeouts: HttpTimeouts) -> Result<Client, reqwest::Error> {
    for mode in [ProxyMode::System, ProxyMode::Environment] {
        let builder = base_builder(timeouts);
        match catch_unwind(AssertUnwindSafe(move || mode.apply(builder).build())) {
            Ok(built) => return built,
            Err(_) => warn!(role, ?mode, "client builder panicked during proxy setup"),
        }
    }
    ProxyMode::Disabled.apply(base_builder(timeouts)).build()
}

fn base_builder(timeouts: HttpTimeouts) -> ClientBuilder {
    Client::builder()
        .user_agent(default_user_agent())
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.read)
        .gzip(true)
}

#[derive(Debug, Clone, Copy)]
enum ProxyMode {
    System,
    Environment,
    Disabled,
}

impl ProxyMode {
    fn apply(self, builder: ClientBuilder) -> ClientBuilder {
        match self {
            Self::System => builder,
            Self::Disabled => builder.no_proxy(),
            Self::Environment => [
                proxy_from_env("HTTPS_PROXY").and_then(|url| Proxy::https(url).ok()),
                proxy_from_env("HTTP_PROXY").and_then(|url| Proxy::http(url).ok()),
            ]
            .into_iter()
            .flatten()
            .fold(builder.no_proxy(), ClientBuilder::proxy),
        }
    }
}

/// First non-blank value among `var`, its lowercase form and `ALL_PROXY`.
fn proxy_from_env(var: &str) -> Option<String> {
    [var.to_string(), var.to_lowercase(), "ALL_PROXY".into(), "all_proxy".into()]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
