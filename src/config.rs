//! # Configuration Management
//!
//! Loads client settings from, in priority order (highest first):
//! 1. Environment variables with the `HAPTIC` prefix (`HAPTIC_LINK__ENDPOINT=ws://...`)
//! 2. A TOML file (`config.toml` by default, optional)
//! 3. Built-in defaults (the `Default` impl below)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are serialized into the config builder as defaults
//!   and deserialized back out after all sources are merged
//! - **Builder pattern**: `config::Config::builder()` chains sources together

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Fixed sample rate the controller expects, in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 8000;

/// Soft cap on signal file size (bounds memory and decode latency).
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 5_000_000;

/// Wait between a CLOSED transition and the next connection attempt.
///
/// Fixed and retried forever with no backoff growth. This is a simplicity
/// choice carried over from the controller protocol, do not swap it for
/// exponential backoff without changing the link contract.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Controller endpoint used when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "wss://pbcon3.genhaptics.tealasu.org/ws";

/// Path the controller serves its socket on, for same-origin deployments.
pub const SOCKET_PATH: &str = "/ws";

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub audio: AudioConfig,
}

/// Settings for the persistent controller connection.
///
/// ## Fields:
/// - `endpoint`: full `ws://` or `wss://` URL of the controller socket
/// - `reconnect_delay_ms`: fixed wait after every disconnect before reconnecting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub endpoint: String,
    pub reconnect_delay_ms: u64,
}

/// Settings for signal decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Target sample rate in Hz (the controller assumes this rate for every PCM frame)
    pub sample_rate: u32,
    /// Largest accepted input file, in bytes
    pub max_input_bytes: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Build a link config pointing at the socket served by the same host as `origin`.
    ///
    /// `https://host` becomes `wss://host/ws`, anything else becomes `ws://host/ws`.
    /// Any path on the origin is discarded.
    ///
    /// ## Example:
    /// ```rust
    /// # use haptic_link::config::LinkConfig;
    /// let link = LinkConfig::same_origin("https://study.example.org/index.html");
    /// assert_eq!(link.endpoint, "wss://study.example.org/ws");
    /// ```
    pub fn same_origin(origin: &str) -> Self {
        let (scheme, rest) = match origin.split_once("://") {
            Some(("https", rest)) => ("wss", rest),
            Some((_, rest)) => ("ws", rest),
            None => ("ws", origin),
        };
        let host = rest.split('/').next().unwrap_or_default();

        Self {
            endpoint: format!("{}://{}{}", scheme, host, SOCKET_PATH),
            ..Self::default()
        }
    }

    /// Reconnect delay as a `Duration`.
    pub fn reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl AppConfig {
    /// Load configuration from `config.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from the named file (extension optional, file optional).
    ///
    /// ## Environment Variable Examples:
    /// - `HAPTIC_LINK__ENDPOINT=ws://127.0.0.1:9000/ws`
    /// - `HAPTIC_LINK__RECONNECT_DELAY_MS=500`
    /// - `HAPTIC_AUDIO__MAX_INPUT_BYTES=10000000`
    pub fn load_from(name: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(name).required(false))
            .add_source(
                config::Environment::with_prefix("HAPTIC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.link.endpoint.trim();
        if endpoint.is_empty() {
            return Err(anyhow::anyhow!("Link endpoint cannot be empty"));
        }

        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Link endpoint must use ws:// or wss://, got '{}'",
                endpoint
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.max_input_bytes == 0 {
            return Err(anyhow::anyhow!("Max input size must be greater than 0"));
        }

        Ok(())
    }
}
