use crate::transport::{
    BridgeTransport, ServerEvent, SignalSink, StreamHandle, StreamRequest, StreamSignal,
    TransportError,
};
use dashmap::DashMap;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// [`BridgeTransport`] over HTTP with server-sent events.
pub struct HttpBridgeTransport {
    client: reqwest::Client,
    bridge_url: String,
    streams: Arc<DashMap<StreamHandle, AbortHandle>>,
}

impl HttpBridgeTransport {
    pub fn new(bridge_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), bridge_url)
    }

    pub fn with_client(client: reqwest::Client, bridge_url: &str) -> Self {
        Self {
            client,
            bridge_url: bridge_url.trim_end_matches('/').to_string(),
            streams: Arc::new(DashMap::new()),
        }
    }

    /// The underlying HTTP client, shared with manifest fetches.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn endpoint(&self, segment: &str) -> String {
        format!("{}/{segment}", self.bridge_url)
    }

    /// Streams whose task is still registered.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

impl BridgeTransport for HttpBridgeTransport {
    fn open_stream(&self, request: StreamRequest, sink: SignalSink) {
        let handle = request.handle;
        let client = self.client.clone();
        let url = self.endpoint("events");
        let streams = self.streams.clone();
        // The task waits until its abort handle is registered, so its own
        // cleanup can never run before the insert.
        let (registered, gate) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if gate.await.is_err() {
                return;
            }
            let signal = match run_stream(&client, &url, &request, &sink).await {
                Ok(()) => StreamSignal::Closed,
                Err(e) => StreamSignal::Failed(e.to_string()),
            };
            streams.remove(&request.handle);
            let _ = sink.send((request.handle, signal));
        });
        if let Some(previous) = self.streams.insert(handle, task.abort_handle()) {
            previous.abort();
        }
        let _ = registered.send(());
    }

    fn close_stream(&self, handle: StreamHandle) {
        if let Some((_, task)) = self.streams.remove(&handle) {
            task.abort();
            tracing::debug!(handle, "closed bridge stream");
        }
    }

    async fn post_message(
        &self,
        client_id: &str,
        to: &str,
        ttl_secs: u32,
        body: String,
    ) -> Result<(), TransportError> {
        let ttl = ttl_secs.to_string();
        let response = self
            .client
            .post(self.endpoint("message"))
            .query(&[("client_id", client_id), ("to", to), ("ttl", ttl.as_str())])
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

async fn run_stream(
    client: &reqwest::Client,
    url: &str,
    request: &StreamRequest,
    sink: &SignalSink,
) -> Result<(), TransportError> {
    let mut query = vec![("client_id", request.client_id.as_str())];
    if let Some(last_event_id) = request.last_event_id.as_deref() {
        query.push(("last_event_id", last_event_id));
    }

    let response = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .query(&query)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    if sink.send((request.handle, StreamSignal::Opened)).is_err() {
        return Ok(());
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| TransportError::Stream(e.to_string()))?;
        let signal = StreamSignal::Event(ServerEvent {
            id: non_empty(event.id),
            event: non_empty(event.event),
            data: event.data,
        });
        if sink.send((request.handle, signal)).is_err() {
            break;
        }
    }
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}
