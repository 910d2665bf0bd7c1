use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonconnect::BridgeTransport;
use tonconnect::protocol::{BridgeMessage, HEARTBEAT_EVENT};
use tonconnect::transport::{
    ServerEvent, SignalSink, StreamHandle, StreamRequest, StreamSignal, TransportError,
};

/// How the relay answers new streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Accept immediately.
    Auto,
    /// Park the stream until [`MemoryRelay::accept_held`] or [`MemoryRelay::fail_held`].
    Hold,
}

/// A message posted by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub client_id: String,
    pub to: String,
    pub ttl_secs: u32,
    pub body: String,
}

/// Store-and-forward relay living in the test process.
///
/// Cloning shares the same relay, so a test can keep a handle after moving
/// one into a `ConnectionManager`.
#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

struct RelayState {
    mode: OpenMode,
    refused: HashSet<String>,
    fail_posts: bool,
    streams: HashMap<StreamHandle, Stream>,
    held: Vec<Stream>,
    /// client_id -> queued `(event id, data)`.
    mailboxes: HashMap<String, Vec<(u64, String)>>,
    /// client_id -> highest event id handed to a stream.
    delivered: HashMap<String, u64>,
    next_event_id: u64,
    opens: Vec<StreamRequest>,
    posts: Vec<Post>,
}

struct Stream {
    request: StreamRequest,
    sink: SignalSink,
}

impl Stream {
    fn signal(&self, signal: StreamSignal) {
        let _ = self.sink.send((self.request.handle, signal));
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                mode: OpenMode::Auto,
                refused: HashSet::new(),
                fail_posts: false,
                streams: HashMap::new(),
                held: Vec::new(),
                mailboxes: HashMap::new(),
                delivered: HashMap::new(),
                next_event_id: 1,
                opens: Vec::new(),
                posts: Vec::new(),
            })),
        }
    }

    pub fn set_mode(&self, mode: OpenMode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Fail every stream opened for `client_id` from now on.
    pub fn refuse_client(&self, client_id: &str) {
        self.state.lock().unwrap().refused.insert(client_id.to_string());
    }

    pub fn fail_posts(&self, fail: bool) {
        self.state.lock().unwrap().fail_posts = fail;
    }

    /// Queue an encrypted message for `to` and push it if a stream is open.
    pub fn deliver(&self, to: &str, from: &str, message_b64: &str) -> u64 {
        let data = serde_json::to_string(&BridgeMessage {
            from: from.to_string(),
            message: message_b64.to_string(),
        })
        .unwrap();
        self.deliver_raw(to, &data)
    }

    /// Queue an arbitrary SSE `data` payload for `to`.
    pub fn deliver_raw(&self, to: &str, data: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_event_id;
        state.next_event_id += 1;
        state
            .mailboxes
            .entry(to.to_string())
            .or_default()
            .push((id, data.to_string()));
        state.flush(to, None);
        id
    }

    /// Send a keep-alive to every open stream of `client_id`.
    pub fn heartbeat(&self, client_id: &str) {
        let state = self.state.lock().unwrap();
        for stream in state.streams.values().filter(|s| s.request.client_id == client_id) {
            stream.signal(StreamSignal::Event(ServerEvent {
                id: None,
                event: Some(HEARTBEAT_EVENT.to_string()),
                data: HEARTBEAT_EVENT.to_string(),
            }));
        }
    }

    /// Kill every open stream of `client_id` with a failure.
    pub fn drop_client(&self, client_id: &str, cause: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let handles: Vec<StreamHandle> = state
            .streams
            .iter()
            .filter(|(_, s)| s.request.client_id == client_id)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            if let Some(stream) = state.streams.remove(handle) {
                stream.signal(StreamSignal::Failed(cause.to_string()));
            }
        }
        handles.len()
    }

    /// Open every parked stream of `client_id`.
    pub fn accept_held(&self, client_id: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let held = state.take_held(client_id);
        let count = held.len();
        for stream in held {
            state.accept(stream);
        }
        count
    }

    /// Fail every parked stream of `client_id`.
    pub fn fail_held(&self, client_id: &str, cause: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let held = state.take_held(client_id);
        for stream in &held {
            stream.signal(StreamSignal::Failed(cause.to_string()));
        }
        held.len()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    pub fn open_stream_count(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .values()
            .filter(|s| s.request.client_id == client_id)
            .count()
    }

    /// Every stream request received, in order.
    pub fn opens(&self) -> Vec<StreamRequest> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state.lock().unwrap().posts.clone()
    }

    /// Poll until `check` holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&MemoryRelay) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl RelayState {
    fn take_held(&mut self, client_id: &str) -> Vec<Stream> {
        let (matching, rest): (Vec<Stream>, Vec<Stream>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|s| s.request.client_id == client_id);
        self.held = rest;
        matching
    }

    fn accept(&mut self, stream: Stream) {
        stream.signal(StreamSignal::Opened);
        let client_id = stream.request.client_id.clone();
        let resume_after = stream
            .request
            .last_event_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok());
        self.streams.insert(stream.request.handle, stream);
        self.flush(&client_id, resume_after);
    }

    /// Push queued messages newer than `resume_after` (or than anything
    /// already delivered) to the open streams of `client_id`.
    fn flush(&mut self, client_id: &str, resume_after: Option<u64>) {
        let from = resume_after.unwrap_or_else(|| self.delivered.get(client_id).copied().unwrap_or(0));
        let Some(mailbox) = self.mailboxes.get(client_id) else {
            return;
        };
        let targets: Vec<&Stream> = self
            .streams
            .values()
            .filter(|s| s.request.client_id == client_id)
            .collect();
        if targets.is_empty() {
            return;
        }
        let mut highest = from;
        for (id, data) in mailbox.iter().filter(|(id, _)| *id > from) {
            for stream in &targets {
                stream.signal(StreamSignal::Event(ServerEvent {
                    id: Some(id.to_string()),
                    event: Some("message".to_string()),
                    data: data.clone(),
                }));
            }
            highest = highest.max(*id);
        }
        let delivered = self.delivered.entry(client_id.to_string()).or_insert(0);
        *delivered = (*delivered).max(highest);
    }
}

impl BridgeTransport for MemoryRelay {
    fn open_stream(&self, request: StreamRequest, sink: SignalSink) {
        let mut state = self.state.lock().unwrap();
        state.opens.push(request.clone());
        let stream = Stream { request, sink };
        if state.refused.contains(&stream.request.client_id) {
            stream.signal(StreamSignal::Failed("relay refused stream".to_string()));
            return;
        }
        match state.mode {
            OpenMode::Auto => state.accept(stream),
            OpenMode::Hold => state.held.push(stream),
        }
    }

    fn close_stream(&self, handle: StreamHandle) {
        let mut state = self.state.lock().unwrap();
        state.streams.remove(&handle);
        state.held.retain(|s| s.request.handle != handle);
    }

    async fn post_message(
        &self,
        client_id: &str,
        to: &str,
        ttl_secs: u32,
        body: String,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_posts {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        state.posts.push(Post {
            client_id: client_id.to_string(),
            to: to.to_string(),
            ttl_secs,
            body,
        });
        Ok(())
    }
}
