//! # Signal Loading
//!
//! Glue between the caller and the two components: decode a signal file, hand
//! the samples to the controller link, and report a status the UI can show.

use crate::audio::{AudioDecoder, SourceBlob};
use crate::websocket::DeviceLink;
use std::path::Path;
use tracing::{error, info};

/// What happened to a signal load, as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalStatus {
    Loading,
    /// Decoded and handed to the link (delivery itself is not acknowledged)
    Loaded { samples: usize },
    Failed(String),
}

impl SignalStatus {
    /// Human-readable status line.
    pub fn message(&self) -> &'static str {
        match self {
            SignalStatus::Loading => "Loading signal ...",
            SignalStatus::Loaded { .. } => "Signal loaded",
            SignalStatus::Failed(_) => "Could not load signal",
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, SignalStatus::Loaded { .. })
    }
}

/// Decodes signal files and sends them to the controller.
#[derive(Clone)]
pub struct SignalLoader {
    decoder: AudioDecoder,
    link: DeviceLink,
}

impl SignalLoader {
    pub fn new(decoder: AudioDecoder, link: DeviceLink) -> Self {
        Self { decoder, link }
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    /// Decode `blob` and send it as one PCM frame.
    ///
    /// Returns `Loaded` once the buffer has been handed to the link, or `Failed`
    /// with the decode error. Transport problems are never reported here.
    pub async fn load_and_send(&self, blob: &SourceBlob) -> SignalStatus {
        info!("{} ({})", SignalStatus::Loading.message(), blob.name());

        match self.decoder.decode(blob).await {
            Ok(pcm) => {
                let samples = pcm.len();
                self.link.send_pcm(pcm);
                SignalStatus::Loaded { samples }
            }
            Err(err) => {
                error!("Failed to load PCM from {}: {}", blob.name(), err);
                SignalStatus::Failed(err.to_string())
            }
        }
    }

    /// Read a file from disk, then `load_and_send` it.
    ///
    /// Files over the decoder's size cap are refused from their metadata
    /// without being read.
    pub async fn load_and_send_path(&self, path: impl AsRef<Path>) -> SignalStatus {
        let max_bytes = self.decoder.config().max_input_bytes;
        match SourceBlob::from_path(path, max_bytes).await {
            Ok(blob) => self.load_and_send(&blob).await,
            Err(err) => {
                error!("{}", err);
                SignalStatus::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::tests::wav_bytes;
    use crate::config::{AudioConfig, LinkConfig};
    use crate::websocket::ConnectionState;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    /// Link pointed at a port nobody listens on.
    async fn offline_link() -> DeviceLink {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);
        DeviceLink::connect(LinkConfig {
            endpoint,
            reconnect_delay_ms: 2000,
        })
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(SignalStatus::Loading.message(), "Loading signal ...");
        assert_eq!(SignalStatus::Loaded { samples: 1 }.message(), "Signal loaded");
        assert_eq!(SignalStatus::Failed("x".into()).message(), "Could not load signal");
    }

    #[tokio::test]
    async fn test_stereo_signal_reports_failure() {
        let loader = SignalLoader::new(AudioDecoder::symphonia(AudioConfig::default()), offline_link().await);
        let blob = SourceBlob::new("stereo.wav", wav_bytes(2, 8000, &[1, 2, 3, 4]));

        let status = loader.load_and_send(&blob).await;
        match status {
            SignalStatus::Failed(reason) => assert!(reason.contains("not mono")),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_reports_failure() {
        let loader = SignalLoader::new(AudioDecoder::symphonia(AudioConfig::default()), offline_link().await);
        let status = loader.load_and_send_path("/nonexistent/signal_9.wav").await;
        assert_eq!(status.message(), "Could not load signal");
    }

    #[tokio::test]
    async fn test_oversize_file_reports_failure() {
        let decoder = AudioDecoder::symphonia(AudioConfig {
            sample_rate: 8000,
            max_input_bytes: 1000,
        });
        let loader = SignalLoader::new(decoder, offline_link().await);
        let path = std::env::temp_dir().join(format!("haptic-link-large-{}.wav", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(1001).unwrap();
        drop(file);

        let status = loader.load_and_send_path(&path).await;
        match status {
            SignalStatus::Failed(reason) => assert!(reason.contains("1001 bytes")),
            other => panic!("unexpected status: {other:?}"),
        }

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_loaded_signal_reaches_controller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let link = DeviceLink::connect(LinkConfig {
            endpoint: format!("ws://{}/ws", listener.local_addr().unwrap()),
            reconnect_delay_ms: 2000,
        });
        let loader = SignalLoader::new(AudioDecoder::symphonia(AudioConfig::default()), link.clone());

        let (stream, _) = timeout(Duration::from_secs(10), listener.accept()).await.unwrap().unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let getinfo = ws.next().await.unwrap().unwrap();
        assert!(matches!(getinfo, Message::Text(_)));

        let mut status = link.status();
        timeout(Duration::from_secs(10), status.wait_for(|s| s.state == ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();

        let blob = SourceBlob::new("three.wav", wav_bytes(1, 8000, &[0, 1000, -1000]));
        let result = loader.load_and_send(&blob).await;
        assert_eq!(result, SignalStatus::Loaded { samples: 3 });
        assert!(result.is_loaded());

        match timeout(Duration::from_secs(10), ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Binary(bytes) => assert_eq!(bytes.len(), 12),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}
