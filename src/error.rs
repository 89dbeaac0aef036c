//! # Error Handling
//!
//! Error types for the two halves of the client: decoding a signal file and
//! talking to the haptic controller.
//!
//! ## Two propagation paths:
//! - **Decode-time errors** (`OversizeInput`, `DecodeFailure`, `ChannelCountMismatch`)
//!   are returned to whoever called `decode`, with the source name attached.
//! - **Transport-time errors** (`TransportDisconnect`, `MalformedInboundMessage`)
//!   never reach the caller of `send_control` / `send_pcm`. They end the current
//!   connection instance and the reconnect loop takes over.
//!
//! ## Rust Concepts:
//! - **enum with struct variants**: each failure carries exactly the context needed to diagnose it
//! - **Display + std::error::Error**: lets `AppError` flow into `anyhow::Error` with `?`
//! - **From trait**: converts library errors into our taxonomy automatically

use std::fmt;

/// Every failure the client can report.
///
/// ## Usage Example:
/// ```rust
/// # use haptic_link::error::AppError;
/// let err = AppError::OversizeInput { source_name: "buzz.wav".to_string(), size: 6_000_000, limit: 5_000_000 };
/// assert!(err.to_string().contains("buzz.wav"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Input blob is larger than the soft size cap; no decode was attempted
    OversizeInput {
        source_name: String,
        size: u64,
        limit: u64,
    },

    /// The decode facility rejected the bytes (corrupt container, unsupported codec)
    DecodeFailure {
        source_name: String,
        cause: String,
    },

    /// Decoded audio is not mono. Multi-channel files are rejected, never down-mixed.
    ChannelCountMismatch {
        source_name: String,
        observed: u16,
    },

    /// Connection dropped (network error or clean close)
    TransportDisconnect(String),

    /// Inbound text frame was not valid JSON
    MalformedInboundMessage(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Anything else (task join failures, serialization of outbound frames)
    Internal(String),
}

impl AppError {
    /// True for the decode-time variants that a caller of `decode` can see.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            AppError::OversizeInput { .. }
                | AppError::DecodeFailure { .. }
                | AppError::ChannelCountMismatch { .. }
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::OversizeInput { source_name, size, limit } => write!(
                f,
                "File '{}' is {} bytes, size should be at most {} bytes",
                source_name, size, limit
            ),
            AppError::DecodeFailure { source_name, cause } => write!(
                f,
                "Failed to load PCM data from file '{}': {}",
                source_name, cause
            ),
            AppError::ChannelCountMismatch { source_name, observed } => write!(
                f,
                "Audio file '{}' is not mono ({} channels)",
                source_name, observed
            ),
            AppError::TransportDisconnect(msg) => write!(f, "Transport disconnected: {}", msg),
            AppError::MalformedInboundMessage(msg) => write!(f, "Malformed inbound message: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Only inbound parsing goes through serde_json in a way that can fail at runtime,
/// so a JSON error is always a malformed inbound frame.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::MalformedInboundMessage(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::TransportDisconnect(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
