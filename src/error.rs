// src/error.rs - Error taxonomy for the gateway core
use thiserror::Error;

/// Main proxy error type.
///
/// Everything below the gateway-startup level is scoped to a single
/// connection: handshake, routing, dial and relay failures never terminate
/// the pool or affect another connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Gateway startup errors
    #[error("Failed to bind to address '{address}': {reason}")]
    Bind { address: String, reason: String },

    // Per-connection protocol errors
    #[error("Invalid PROXY protocol header: {reason}")]
    ProtocolHeader { reason: String },

    #[error("Malformed handshake: {reason}")]
    MalformedHandshake { reason: String },

    #[error("Handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    // Routing errors
    #[error("No route for domain '{domain}'")]
    NoRoute { domain: String },

    // Backend dial errors
    #[error("Failed to dial backend '{server}': {reason}")]
    Dial { server: String, reason: String },

    #[error("Dial to backend '{server}' timed out after {timeout_ms}ms")]
    DialTimeout { server: String, timeout_ms: u64 },

    // Relay errors
    #[error("Relay I/O error: {message}")]
    RelayIo { message: String },

    // Pool errors
    #[error("Connection pool is closed")]
    PoolClosed,

    // Status emulation errors
    #[error("Status response error: {message}")]
    Status { message: String },

    // Plain I/O errors without a more specific category
    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a bind error for a gateway listen address.
    pub fn bind(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-handshake error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHandshake {
            reason: reason.into(),
        }
    }

    /// Create a status emulation error.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Whether this error is contained to a single connection.
    ///
    /// Connection-scoped errors are logged and emitted as events but must
    /// never propagate past the worker that processed the connection.
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(self, Self::Config { .. } | Self::Bind { .. })
    }

    /// Short machine-readable tag used in events and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Bind { .. } => "bind",
            Self::ProtocolHeader { .. } => "proxy_protocol_header",
            Self::MalformedHandshake { .. } => "malformed_handshake",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::NoRoute { .. } => "no_route",
            Self::Dial { .. } => "dial",
            Self::DialTimeout { .. } => "dial_timeout",
            Self::RelayIo { .. } => "relay_io",
            Self::PoolClosed => "pool_closed",
            Self::Status { .. } => "status",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_scoped_classification() {
        assert!(!ProxyError::bind("0.0.0.0:25565", "in use").is_connection_scoped());
        assert!(!ProxyError::config("bad").is_connection_scoped());
        assert!(ProxyError::malformed("truncated varint").is_connection_scoped());
        assert!(ProxyError::PoolClosed.is_connection_scoped());
        assert!(ProxyError::NoRoute {
            domain: "a.example.com".to_string()
        }
        .is_connection_scoped());
    }

    #[test]
    fn test_error_kind_tags() {
        let err = ProxyError::HandshakeTimeout { timeout_ms: 1000 };
        assert_eq!(err.kind(), "handshake_timeout");
        assert!(err.to_string().contains("1000ms"));
    }
}
