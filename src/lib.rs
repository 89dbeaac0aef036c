//! # Haptic Link
//!
//! Client side of the haptic study rig: decode signal files into mono PCM and
//! stream them to the remote haptic-actuator controller over a persistent,
//! auto-reconnecting WebSocket.
//!
//! ## Application Architecture:
//! - **config**: settings from `config.toml`, `HAPTIC_*` environment variables and defaults
//! - **error**: the error taxonomy shared by decoding and the link
//! - **audio**: `AudioDecoder`, `PcmBuffer`, `SourceBlob`
//! - **websocket**: `DeviceLink`, the controller connection and its reconnect loop
//! - **signal**: load-and-send pipeline with user-facing status

pub mod audio;      // Decoding and sample buffers (audio/ directory)
pub mod config;     // Configuration management (config.rs)
pub mod error;      // Error handling types (error.rs)
pub mod signal;     // Signal load-and-send pipeline (signal.rs)
pub mod websocket;  // Controller connection (websocket.rs)

pub use audio::{AudioDecoder, PcmBuffer, SourceBlob};
pub use error::{AppError, AppResult};
pub use signal::{SignalLoader, SignalStatus};
pub use websocket::{ConnectionState, ControlMessage, DeviceLink, InboundMessage, LinkStatus};
