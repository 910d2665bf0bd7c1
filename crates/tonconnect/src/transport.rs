use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one server-push stream opened through a [`BridgeTransport`].
///
/// Handles are allocated by the caller and never reused, so a lifecycle
/// signal can always be correlated with the request that produced it.
pub type StreamHandle = u64;

/// Receives `(handle, signal)` pairs for a stream.
pub type SignalSink = mpsc::UnboundedSender<(StreamHandle, StreamSignal)>;

/// Parameters for opening `GET {bridge}/events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub handle: StreamHandle,
    /// Routing address on the relay: the wallet's own session public key (hex).
    pub client_id: String,
    /// Id of the last server event seen on a previous stream, if any.
    pub last_event_id: Option<String>,
}

/// One server-sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Lifecycle callbacks of a server-push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Opened,
    Event(ServerEvent),
    Closed,
    Failed(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay responded with status {0}")]
    Status(u16),

    #[error("event stream error: {0}")]
    Stream(String),

    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

/// HTTP access to the bridge relay.
///
/// `open_stream` must not block: the outcome is reported later through the
/// sink (`Opened` or `Failed`, then `Event`s, then `Closed` or `Failed`).
/// After `close_stream` no further signals are required for that handle.
pub trait BridgeTransport: Send + Sync + 'static {
    fn open_stream(&self, request: StreamRequest, sink: SignalSink);

    fn close_stream(&self, handle: StreamHandle);

    /// `POST {bridge}/message?client_id=..&to=..&ttl=..` with `body` as payload.
    fn post_message(
        &self,
        client_id: &str,
        to: &str,
        ttl_secs: u32,
        body: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
