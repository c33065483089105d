//! Revolve - Rotating SOCKS5 Egress
//!
//! A local SOCKS5 server that tunnels every client connection through a
//! rotating pool of upstream proxies.
//!
//! ## Features
//!
//! - Random and sequential rotation with optional per-proxy stickiness
//! - HTTP CONNECT, TLS-wrapped CONNECT, SOCKS4 and SOCKS5 upstreams
//! - Failure-aware pool handling (keep retrying dead proxies, or excise them)
//! - Bounded and persistent dial retry modes
//! - Live terminal metrics

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{Result, RevolveError};
