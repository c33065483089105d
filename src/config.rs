use std::env;
use std::net::SocketAddr;

use crate::error::{Result, RevolveError};
use crate::proxy::rotation::{RequestsPerProxy, RotationStrategy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address for the SOCKS5 frontend (default: 0.0.0.0:33333)
    pub listen_addr: String,
    /// Inline list of upstream proxy URLs
    pub proxies: Vec<String>,
    /// Path to a file of upstream proxy URLs, one per line
    pub proxy_file: Option<String>,
    /// Rotation strategy (random or sequential)
    pub strategy: RotationStrategy,
    /// Exclude dead proxies from rotation instead of retrying them
    pub skip_dead: bool,
    /// Requests served per proxy before rotating
    pub requests_per: RequestsPerProxy,
    /// Retry dials until one succeeds or every proxy is dead
    pub just_do_it: bool,
    /// Skip TLS certificate verification for HTTPS upstream proxies
    pub trust_proxy: bool,
    /// Milliseconds to wait between retries in persistent mode
    pub retry_delay_ms: u64,
    /// Seconds allowed for a complete upstream dial
    pub dial_timeout_secs: u64,
    /// Enable the terminal metrics display
    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let listen_addr = get_env_or("REVOLVE_LISTEN_ADDR", "0.0.0.0:33333");
        listen_addr.parse::<SocketAddr>().map_err(|_| {
            RevolveError::InvalidConfig(format!(
                "REVOLVE_LISTEN_ADDR is not a valid socket address: {}",
                listen_addr
            ))
        })?;

        let proxies = get_env_or("REVOLVE_PROXIES", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let proxy_file = match env::var("REVOLVE_PROXY_FILE") {
            Ok(path) if !path.trim().is_empty() => Some(path),
            _ => None,
        };

        Ok(Config {
            listen_addr,
            proxies,
            proxy_file,
            strategy: RotationStrategy::from_str(&get_env_or("REVOLVE_STRATEGY", "sequential")),
            skip_dead: get_env_or("REVOLVE_SKIP_DEAD", "false").parse().unwrap_or(false),
            requests_per: parse_requests_per(&get_env_or("REVOLVE_REQUESTS_PER_PROXY", "1")),
            just_do_it: get_env_or("REVOLVE_JUST_DO_IT", "false").parse().unwrap_or(false),
            trust_proxy: get_env_or("REVOLVE_TRUST_PROXY", "true").parse().unwrap_or(true),
            retry_delay_ms: get_env_or("REVOLVE_RETRY_DELAY_MS", "100").parse().unwrap_or(100),
            dial_timeout_secs: get_env_or("REVOLVE_DIAL_TIMEOUT", "10").parse().unwrap_or(10),
            metrics_enabled: get_env_or("REVOLVE_METRICS", "true").parse().unwrap_or(true),
        })
    }
}

/// Parse the requests-per-proxy knob: a count, or "auto" to stay on the
/// current proxy for as long as it is alive.
fn parse_requests_per(raw: &str) -> RequestsPerProxy {
    if raw.eq_ignore_ascii_case("auto") {
        return RequestsPerProxy::Auto;
    }
    match raw.parse::<u32>() {
        Ok(n) if n >= 1 => RequestsPerProxy::Count(n),
        _ => RequestsPerProxy::Count(1),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
