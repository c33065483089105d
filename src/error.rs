use thiserror::Error;

use crate::proxy::socks;

/// Unified error type for the Revolve application
#[derive(Error, Debug)]
pub enum RevolveError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Endpoint parsing errors
    #[error("Invalid proxy URL: {0}")]
    InvalidProxyUrl(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    // Pool errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("All proxies are dead")]
    AllProxiesDead,

    // Upstream dial errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Operation timed out")]
    Timeout,

    // Client protocol errors
    #[error("Unsupported SOCKS command: {0:#04x}")]
    CommandNotSupported(u8),

    #[error("Unsupported address type: {0:#04x}")]
    AddressTypeNotSupported(u8),

    #[error("Malformed client request: {0}")]
    ClientProtocol(String),

    // Lifecycle
    #[error("Server is shutting down")]
    Cancelled,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Revolve operations
pub type Result<T> = std::result::Result<T, RevolveError>;

impl RevolveError {
    /// SOCKS5 reply code that best describes this error to the client.
    pub fn reply_code(&self) -> u8 {
        match self {
            // Command/address rejections have dedicated codes
            RevolveError::CommandNotSupported(_) => socks::REPLY_COMMAND_NOT_SUPPORTED,
            RevolveError::AddressTypeNotSupported(_) => socks::REPLY_ADDRESS_NOT_SUPPORTED,

            // Upstream dial failures, including an exhausted pool
            RevolveError::ProxyConnectionFailed(_)
            | RevolveError::Timeout
            | RevolveError::AllProxiesDead
            | RevolveError::NoProxiesAvailable => socks::REPLY_HOST_UNREACHABLE,

            // Everything else is a general failure
            RevolveError::InvalidConfig(_)
            | RevolveError::InvalidProxyUrl(_)
            | RevolveError::UnsupportedScheme(_)
            | RevolveError::ClientProtocol(_)
            | RevolveError::Cancelled
            | RevolveError::Io(_) => socks::REPLY_GENERAL_FAILURE,
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RevolveError {
    fn from(err: url::ParseError) -> Self {
        RevolveError::InvalidProxyUrl(err.to_string())
    }
}
