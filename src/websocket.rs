//! # Controller Link
//!
//! Keeps one logical connection to the haptic controller alive for the whole
//! process, reconnecting forever after every disconnect.
//!
//! ## Connection Lifecycle:
//! 1. **Connecting**: a new connection instance is being established
//! 2. **Open**: the instance becomes the *current* connection and a
//!    `{"cmd":"getinfo"}` control message is sent straight away
//! 3. **Closing**: the controller sent a close frame, or we are dropping the
//!    instance after a malformed inbound frame
//! 4. **Closed**: the instance is retired; after a fixed delay (2s by default)
//!    the loop goes back to step 1 with a brand-new instance
//!
//! There is no backoff growth, no retry limit and no terminal state.
//!
//! ## Message Format:
//! - **Client → Controller**: JSON text control frames, or one raw binary frame
//!   per signal (little-endian f32 samples, no header)
//! - **Controller → Client**: JSON text frames, forwarded as-is to the single
//!   registered listener
//!
//! ## Current Connection:
//! Each instance owns an outbound queue. The supervisor publishes that queue as
//! the current connection only once the instance is open and its read loop is
//! bound, and withdraws it before reporting `Closed`. Sends always go through
//! whatever is current at that moment, so nothing can be sent on (or delivered
//! from) a retired instance. Delivery is best-effort: frames sent while no
//! instance is open, or queued when an instance drops, are lost.

use crate::audio::buffer::PcmBuffer;
use crate::config::LinkConfig;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

/// Structured command sent to the controller, e.g. `{"cmd":"getinfo"}`.
///
/// Extra fields are flattened next to `cmd` in the JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub cmd: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ControlMessage {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Request controller state. Sent automatically on every open.
    pub fn get_info() -> Self {
        Self::new("getinfo")
    }

    /// Add a field next to `cmd`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Serialize to the text payload of a control frame.
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("control message serialization: {}", e)))
    }
}

/// Message received from the controller. The structure is controller-defined,
/// so the parsed JSON is kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage(serde_json::Value);

impl InboundMessage {
    /// Parse a text frame. Anything that is not valid JSON is a `MalformedInboundMessage`.
    pub fn parse(text: &str) -> AppResult<Self> {
        Ok(Self(serde_json::from_str(text)?))
    }

    /// The `cmd` field, when the controller sent one.
    pub fn cmd(&self) -> Option<&str> {
        self.0.get("cmd").and_then(|v| v.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything the link can send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Control(ControlMessage),
    Pcm(PcmBuffer),
}

impl OutboundMessage {
    /// Frame the message for the wire: control messages become text frames,
    /// PCM becomes one binary frame of raw sample bytes.
    pub fn into_frame(self) -> AppResult<Message> {
        match self {
            OutboundMessage::Control(message) => Ok(Message::Text(message.to_json()?)),
            OutboundMessage::Pcm(buffer) => Ok(Message::Binary(buffer.to_le_bytes())),
        }
    }
}

/// Lifecycle state of the current connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Connection instance number, 1 for the first attempt
    pub generation: u64,
    /// Most recent transport or protocol fault, kept until the next one
    pub last_fault: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Callback invoked for every inbound message.
pub type InboundListener = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// The connection instance sends currently go to.
struct CurrentConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

/// State shared between the handles and the supervisor task.
struct LinkShared {
    config: LinkConfig,
    current: RwLock<Option<CurrentConnection>>,
    listener: RwLock<Option<InboundListener>>,
    status: watch::Sender<LinkStatus>,
}

/// Handle to the persistent controller connection.
///
/// Cloning is cheap and every clone talks to the same connection.
///
/// ## Usage Example:
/// ```rust,no_run
/// # use haptic_link::{config::LinkConfig, websocket::{ControlMessage, DeviceLink}};
/// # async fn demo() {
/// let link = DeviceLink::connect(LinkConfig::default());
/// link.register_listener(|msg| println!("controller said {}", msg));
/// link.send_control(ControlMessage::new("stop"));
/// # }
/// ```
#[derive(Clone)]
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

impl DeviceLink {
    /// Start the connection loop on the current tokio runtime and return a handle.
    ///
    /// The loop runs for the rest of the process; there is no shutdown.
    pub fn connect(config: LinkConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectionState::Connecting,
            generation: 0,
            last_fault: None,
            changed_at: Utc::now(),
        });

        let shared = Arc::new(LinkShared {
            config,
            current: RwLock::new(None),
            listener: RwLock::new(None),
            status,
        });

        tokio::spawn(supervise(Arc::clone(&shared)));

        Self { shared }
    }

    /// Send a control message over the current connection. Fire-and-forget.
    pub fn send_control(&self, message: ControlMessage) {
        self.send(OutboundMessage::Control(message));
    }

    /// Send a signal as a single binary frame. Fire-and-forget.
    ///
    /// The frame is the raw sample bytes only (`buffer.len() * 4` bytes).
    pub fn send_pcm(&self, buffer: PcmBuffer) {
        self.send(OutboundMessage::Pcm(buffer));
    }

    /// Frame `message` and queue it on the current connection instance.
    ///
    /// Dropped with a warning when no instance is open.
    pub fn send(&self, message: OutboundMessage) {
        match encode(message) {
            Ok(frame) => self.shared.transmit(frame),
            Err(err) => error!("Dropping outbound message: {}", err),
        }
    }

    /// Install the inbound listener, replacing any previous one.
    pub fn register_listener<F>(&self, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let mut slot = self.shared.listener.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(callback));
    }

    /// Watch the link state. The receiver sees every later transition.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }
}

impl LinkShared {
    fn set_state(&self, state: ConnectionState, generation: u64, fault: Option<String>) {
        debug!("Link instance {} -> {}", generation, state);
        self.status.send_modify(|status| {
            status.state = state;
            status.generation = generation;
            if fault.is_some() {
                status.last_fault = fault;
            }
            status.changed_at = Utc::now();
        });
    }

    /// Publish `outbound` as the current connection.
    fn install(&self, generation: u64, outbound: mpsc::UnboundedSender<Message>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(CurrentConnection { generation, outbound });
    }

    /// Withdraw the instance if it is still current.
    fn retire(&self, generation: u64) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map(|c| c.generation) == Some(generation) {
            *current = None;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(|c| c.generation) == Some(generation)
    }

    fn transmit(&self, frame: Message) {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(conn) => {
                if conn.outbound.send(frame).is_err() {
                    warn!("Connection {} is shutting down, frame dropped", conn.generation);
                }
            }
            None => warn!("No open connection to the controller, frame dropped"),
        }
    }

    /// Parse one text frame and hand it to the listener.
    fn dispatch(&self, generation: u64, text: &str) -> AppResult<()> {
        let message = InboundMessage::parse(text)?;
        info!("Received message => {}", message);

        if !self.is_current(generation) {
            debug!("Ignoring message from retired connection {}", generation);
            return Ok(());
        }

        // Clone the Arc out so the callback runs without holding the lock.
        let listener = self
            .listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(message);
        }
        Ok(())
    }

    /// Drive one open connection instance until it ends.
    ///
    /// Returns `Ok(())` on a clean close and the fault otherwise.
    async fn run_connection<S>(&self, stream: S, generation: u64) -> AppResult<()>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel();
        info!("Connected to server");

        // getinfo is queued before the instance becomes reachable, so it is
        // always the first frame on the wire.
        let hello = encode(OutboundMessage::Control(ControlMessage::get_info()))?;
        outbound
            .send(hello)
            .map_err(|e| AppError::Internal(format!("outbound queue closed: {}", e)))?;

        self.install(generation, outbound);
        self.set_state(ConnectionState::Open, generation, None);

        loop {
            tokio::select! {
                frame = queue.recv() => match frame {
                    Some(frame) => sink.send(frame).await?,
                    None => return Ok(()),
                },
                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = self.dispatch(generation, &text) {
                            self.set_state(ConnectionState::Closing, generation, None);
                            let _ = sink.close().await;
                            return Err(err);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame from controller", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Controller closed connection {}: {:?}", generation, frame);
                        self.set_state(ConnectionState::Closing, generation, None);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Frame an outbound message, logging what is about to go out.
fn encode(message: OutboundMessage) -> AppResult<Message> {
    if let OutboundMessage::Pcm(buffer) = &message {
        info!(
            "Sending {} samples ({}s) to devices...",
            buffer.len(),
            buffer.duration_seconds()
        );
    }

    let frame = message.into_frame()?;
    if let Message::Text(text) = &frame {
        info!("Sending message => {}", text);
    }
    Ok(frame)
}

/// Reconnect loop: connect, run until the instance ends, wait, repeat forever.
async fn supervise(shared: Arc<LinkShared>) {
    let delay = shared.config.reconnect_delay();
    let mut generation = 0u64;

    loop {
        generation += 1;
        shared.set_state(ConnectionState::Connecting, generation, None);
        debug!("Connecting to {} (instance {})", shared.config.endpoint, generation);

        let outcome = match tokio_tungstenite::connect_async(shared.config.endpoint.as_str()).await {
            Ok((stream, _response)) => shared.run_connection(stream, generation).await,
            Err(err) => Err(AppError::from(err)),
        };

        shared.retire(generation);

        let fault = match outcome {
            Ok(()) => None,
            Err(err @ AppError::MalformedInboundMessage(_)) => {
                error!("Controller sent a malformed message, dropping connection: {}", err);
                Some(err.to_string())
            }
            Err(err) => {
                warn!("Connection {} lost: {}", generation, err);
                Some(err.to_string())
            }
        };
        shared.set_state(ConnectionState::Closed, generation, fault);

        info!(
            "Disconnected from server... Waiting {} ms before reconnecting...",
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::tests::mono_wav_of_size;
    use crate::audio::{AudioDecoder, SourceBlob};
    use crate::config::AudioConfig;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;

    const WAIT: Duration = Duration::from_secs(10);

    async fn bind(reconnect_delay_ms: u64) -> (TcpListener, LinkConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = LinkConfig {
            endpoint: format!("ws://{}/ws", addr),
            reconnect_delay_ms,
        };
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Message {
        loop {
            let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
                return frame;
            }
        }
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        match next_frame(ws).await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn wait_open(link: &DeviceLink, generation: u64) {
        let mut status = link.status();
        timeout(
            WAIT,
            status.wait_for(|s| s.state == ConnectionState::Open && s.generation == generation),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[test]
    fn test_control_message_json() {
        assert_eq!(ControlMessage::get_info().to_json().unwrap(), r#"{"cmd":"getinfo"}"#);

        let msg = ControlMessage::new("play").with("id", 3);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"cmd": "play", "id": 3}));
    }

    #[test]
    fn test_inbound_parsing() {
        let msg = InboundMessage::parse(r#"{"cmd":"ack","id":1}"#).unwrap();
        assert_eq!(msg.cmd(), Some("ack"));
        assert_eq!(msg.get("id"), Some(&json!(1)));

        let err = InboundMessage::parse("{oops").unwrap_err();
        assert!(matches!(err, AppError::MalformedInboundMessage(_)));
    }

    #[test]
    fn test_pcm_frame_is_raw_samples() {
        let frame = OutboundMessage::Pcm(PcmBuffer::new(vec![0.5; 10], 8000))
            .into_frame()
            .unwrap();
        match frame {
            Message::Binary(bytes) => {
                assert_eq!(bytes.len(), 40);
                assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_sends_getinfo() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"cmd": "getinfo"}));

        wait_open(&link, 1).await;
        assert_eq!(link.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_reconnects_after_clean_close() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register_listener(move |msg| {
            let _ = tx.send(msg);
        });

        let mut first = accept(&listener).await;
        assert_eq!(next_json(&mut first).await, json!({"cmd": "getinfo"}));
        wait_open(&link, 1).await;

        let closed_at = Instant::now();
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_millis(2000), "reconnected after {waited:?}");
        assert!(waited < Duration::from_millis(4000), "reconnected after {waited:?}");

        assert_eq!(next_json(&mut second).await, json!({"cmd": "getinfo"}));
        wait_open(&link, 2).await;

        // Sends after the reconnect land on the new instance.
        link.send_control(ControlMessage::new("ping"));
        assert_eq!(next_json(&mut second).await, json!({"cmd": "ping"}));

        // The listener registered before the reconnect still hears the new instance.
        second.send(Message::Text(r#"{"cmd":"ack","id":1}"#.to_string())).await.unwrap();
        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.payload(), &json!({"cmd": "ack", "id": 1}));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_invoked_once_per_message() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register_listener(move |msg| {
            let _ = tx.send(msg);
        });

        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        ws.send(Message::Text(r#"{"cmd":"ack","id":1}"#.to_string())).await.unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.payload(), &json!({"cmd": "ack", "id": 1}));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_newest_listener_wins() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);

        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        link.register_listener(move |msg| {
            let _ = old_tx.send(msg);
        });

        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;

        ws.send(Message::Text(r#"{"cmd":"status","n":1}"#.to_string())).await.unwrap();
        let first = timeout(WAIT, old_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.get("n"), Some(&json!(1)));

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        link.register_listener(move |msg| {
            let _ = new_tx.send(msg);
        });

        ws.send(Message::Text(r#"{"cmd":"status","n":2}"#.to_string())).await.unwrap();
        let second = timeout(WAIT, new_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.get("n"), Some(&json!(2)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_pcm_one_binary_frame() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);

        let decoder = AudioDecoder::symphonia(AudioConfig::default());
        let blob = SourceBlob::new("signal.wav", mono_wav_of_size(4_000_000));
        let pcm = decoder.decode(&blob).await.unwrap();
        let sample_count = pcm.len();
        let second_sample = pcm.samples()[1];

        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        wait_open(&link, 1).await;

        link.send_pcm(pcm);

        match next_frame(&mut ws).await {
            Message::Binary(bytes) => {
                assert_eq!(bytes.len(), sample_count * 4);
                assert_eq!(&bytes[4..8], &second_sample.to_le_bytes());
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_inbound_drops_connection() {
        let (listener, config) = bind(100).await;
        let link = DeviceLink::connect(config);
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        link.register_listener(move |msg| {
            let _ = tx.send(msg);
        });

        let mut first = accept(&listener).await;
        next_json(&mut first).await;
        first.send(Message::Text("not json at all".to_string())).await.unwrap();

        let mut second = accept(&listener).await;
        assert_eq!(next_json(&mut second).await, json!({"cmd": "getinfo"}));
        wait_open(&link, 2).await;

        let status = link.status().borrow().clone();
        let fault = status.last_fault.expect("fault recorded");
        assert!(fault.contains("Malformed"), "unexpected fault: {fault}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_connection_is_dropped() {
        let (listener, config) = bind(300).await;
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let link = DeviceLink::connect(config);

        // While the first instance is still connecting.
        link.send_control(ControlMessage::new("early"));

        let mut status = link.status();
        let closed = timeout(WAIT, status.wait_for(|s| s.state == ConnectionState::Closed))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert!(closed.last_fault.is_some());

        // Between instances.
        link.send_control(ControlMessage::new("late"));
        link.send_pcm(PcmBuffer::new(vec![0.0; 8], 8000));

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"cmd": "getinfo"}));

        // Nothing sent while disconnected shows up on the new instance.
        assert!(timeout(Duration::from_millis(500), ws.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_getinfo_precedes_sends_racing_the_open() {
        let (listener, config) = bind(2000).await;
        let link = DeviceLink::connect(config);

        let sender = link.clone();
        let mut status = link.status();
        let racer = tokio::spawn(async move {
            let _ = status.wait_for(|s| s.state == ConnectionState::Open).await;
            sender.send_control(ControlMessage::new("stop"));
        });

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"cmd": "getinfo"}));
        racer.await.unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"cmd": "stop"}));
    }
}
