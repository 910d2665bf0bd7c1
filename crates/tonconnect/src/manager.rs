use crate::AccountId;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ConnectFailure};
use crate::event::DomainEvent;
use crate::protocol::{ConnectAck, HEARTBEAT_EVENT};
use crate::router::{EventRouter, EventSubscription};
use crate::session::{ConnectionSession, decode_key_hex};
use crate::store::SessionStore;
use crate::transport::{
    BridgeTransport, ServerEvent, SignalSink, StreamHandle, StreamRequest, StreamSignal,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonconnect_crypto::CryptoError;

type SessionKey = (AccountId, String);
type ConnectWaiter = oneshot::Sender<Result<(), ConnectFailure>>;

/// Lifecycle of one session's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Persisted but no stream requested.
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// Snapshot of a session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub account_id: AccountId,
    pub peer_client_id: String,
    pub state: LinkState,
    /// Wallet session public key (hex), the relay `client_id`.
    pub wallet_public_key: String,
    pub last_request_id: i64,
}

/// Owns every live bridge session: connects, reconnects, decrypts and
/// deduplicates inbound requests, and seals outbound messages.
pub struct ConnectionManager<T: BridgeTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: BridgeTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    config: BridgeConfig,
    store: SessionStore,
    transport: Arc<T>,
    router: Arc<EventRouter>,
    links: DashMap<SessionKey, Arc<Link>>,
    /// Stream handle -> session it was opened for.
    bindings: DashMap<StreamHandle, SessionKey>,
    /// Stream handle -> `connect()` calls waiting for it to open.
    pending: DashMap<StreamHandle, Vec<ConnectWaiter>>,
    next_handle: AtomicU64,
}

/// A session that is wanted by the application.
struct Link {
    session: ConnectionSession,
    persisted: AtomicBool,
    last_request_id: AtomicI64,
    state: StdMutex<LinkState>,
    /// Handle of the current stream.
    handle: AtomicU64,
    last_event_id: StdMutex<Option<String>>,
    cancel: CancellationToken,
}

impl Link {
    fn new(session: ConnectionSession, persisted: bool, handle: StreamHandle) -> Self {
        Self {
            last_request_id: AtomicI64::new(session.last_request_id),
            session,
            persisted: AtomicBool::new(persisted),
            state: StdMutex::new(LinkState::Connecting),
            handle: AtomicU64::new(handle),
            last_event_id: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn key(&self) -> SessionKey {
        (self.session.account_id, self.session.peer_client_id.clone())
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn last_event_id(&self) -> MutexGuard<'_, Option<String>> {
        self.last_event_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_handle(&self) -> StreamHandle {
        self.handle.load(Ordering::SeqCst)
    }

    /// Accept `request_id` only if it is strictly newer than anything seen.
    fn advance(&self, request_id: i64) -> bool {
        self.last_request_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (request_id > current).then_some(request_id)
            })
            .is_ok()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            account_id: self.session.account_id,
            peer_client_id: self.session.peer_client_id.clone(),
            state: *self.state(),
            wallet_public_key: self.session.wallet_client_id(),
            last_request_id: self.last_request_id.load(Ordering::SeqCst),
        }
    }
}

enum Join {
    Ready,
    Waiting(oneshot::Receiver<Result<(), ConnectFailure>>),
    Stale,
}

impl<T: BridgeTransport> ConnectionManager<T> {
    pub fn new(config: BridgeConfig, store: SessionStore, transport: T) -> Self {
        let router = Arc::new(EventRouter::with_capacity(config.event_buffer));
        Self::with_router(config, store, Arc::new(transport), router)
    }

    pub fn with_router(
        config: BridgeConfig,
        store: SessionStore,
        transport: Arc<T>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                transport,
                router,
                links: DashMap::new(),
                bindings: DashMap::new(),
                pending: DashMap::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    pub fn subscribe(&self, account_id: AccountId) -> EventSubscription {
        self.inner.router.subscribe(account_id)
    }

    /// Open (or join) the stream for a session and wait until the relay
    /// accepts it.
    ///
    /// The first open of a session publishes [`DomainEvent::ConnectionOpened`]
    /// ahead of any request the relay delivers on that stream. Joining a live
    /// session publishes nothing.
    ///
    /// Reuses the persisted keypair when the session exists, otherwise
    /// generates one; a new session is persisted once the stream opens.
    /// Returns immediately when the session is already streaming or
    /// recovering from a dropped stream.
    pub async fn connect(&self, account_id: AccountId, peer_client_id: &str) -> Result<(), BridgeError> {
        if decode_key_hex(peer_client_id).is_none() {
            return Err(BridgeError::Crypto(CryptoError::InvalidKey {
                what: "peer client id",
                len: peer_client_id.len() / 2,
            }));
        }
        let key: SessionKey = (account_id, peer_client_id.to_string());

        let waiter = loop {
            if let Some(link) = self.inner.link(&key) {
                match self.inner.join(&link) {
                    Join::Ready => break None,
                    Join::Waiting(rx) => break Some(rx),
                    Join::Stale => {
                        self.inner
                            .links
                            .remove_if(&key, |_, current| Arc::ptr_eq(current, &link));
                    }
                }
            }

            let (session, persisted) = self.inner.load_or_create(account_id, peer_client_id).await?;
            match self.inner.links.entry(key.clone()) {
                // Lost a race with another connect(); join it instead.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let handle = self.inner.allocate_handle();
                    let (tx, rx) = oneshot::channel();
                    self.inner.pending.insert(handle, vec![tx]);
                    self.inner.bindings.insert(handle, key.clone());
                    let link = Arc::new(Link::new(session, persisted, handle));
                    slot.insert(link.clone());
                    self.start(link, handle);
                    break Some(rx);
                }
            }
        };

        if let Some(rx) = waiter {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => return Err(BridgeError::ConnectionFailed(failure)),
                Err(_) => return Err(BridgeError::ConnectionFailed(ConnectFailure::Cancelled)),
            }
        }

        tracing::info!(account_id, peer = %peer_client_id, "bridge session connected");
        Ok(())
    }

    fn start(&self, link: Arc<Link>, handle: StreamHandle) {
        let (sink, signals) = mpsc::unbounded_channel();
        let request = StreamRequest {
            handle,
            client_id: link.session.wallet_client_id(),
            last_event_id: None,
        };
        tracing::debug!(
            account_id = link.session.account_id,
            peer = %link.session.peer_client_id,
            handle,
            "opening bridge stream"
        );
        tokio::spawn(drive_link(self.inner.clone(), link, signals, sink.clone()));
        self.inner.transport.open_stream(request, sink);
    }

    /// Encrypt `payload` for the peer and post it through the relay.
    ///
    /// Fails with [`BridgeError::NoSuchSession`] before any network call when
    /// the session is unknown. Transport failures are returned, not retried.
    pub async fn send(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
        payload: &[u8],
    ) -> Result<(), BridgeError> {
        let key: SessionKey = (account_id, peer_client_id.to_string());
        let session = match self.inner.link(&key) {
            Some(link) => link.session.clone(),
            None => self
                .inner
                .store
                .get(account_id, peer_client_id)
                .await?
                .ok_or_else(|| BridgeError::NoSuchSession {
                    account_id,
                    peer_client_id: peer_client_id.to_string(),
                })?,
        };

        let body = session.seal(payload)?;
        self.inner
            .transport
            .post_message(
                &session.wallet_client_id(),
                &session.peer_client_id,
                self.inner.config.message_ttl_secs,
                body,
            )
            .await?;
        tracing::debug!(account_id, peer = %peer_client_id, "bridge message sent");
        Ok(())
    }

    pub async fn send_json<P: Serialize>(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
        payload: &P,
    ) -> Result<(), BridgeError> {
        let bytes = serde_json::to_vec(payload)?;
        self.send(account_id, peer_client_id, &bytes).await
    }

    /// Connect to a new dApp and acknowledge the connection.
    pub async fn approve(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
        ack: &ConnectAck,
    ) -> Result<(), BridgeError> {
        self.connect(account_id, peer_client_id).await?;
        self.send_json(account_id, peer_client_id, ack).await
    }

    /// Reconnect every persisted session in the background.
    ///
    /// Returns how many sessions were scheduled. Individual failures are
    /// logged and never abort startup.
    pub async fn restore_all(&self) -> Result<usize, BridgeError> {
        let sessions = self.inner.store.list_all().await?;
        Ok(self.spawn_connects(sessions))
    }

    pub async fn restore_account(&self, account_id: AccountId) -> Result<usize, BridgeError> {
        let sessions = self.inner.store.list_by_account(account_id).await?;
        Ok(self.spawn_connects(sessions))
    }

    fn spawn_connects(&self, sessions: Vec<ConnectionSession>) -> usize {
        let count = sessions.len();
        for session in sessions {
            let manager = self.clone();
            let account_id = session.account_id;
            let peer = session.peer_client_id.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect(account_id, &peer).await {
                    tracing::warn!(account_id, peer = %peer, err = %e, "failed to restore bridge session");
                }
            });
        }
        if count > 0 {
            tracing::info!(count, "restoring bridge sessions");
        }
        count
    }

    /// Close the session's stream. The persisted session is kept.
    ///
    /// A `connect()` still waiting on this session fails with
    /// [`ConnectFailure::Cancelled`].
    pub fn disconnect(&self, account_id: AccountId, peer_client_id: &str) -> bool {
        let key: SessionKey = (account_id, peer_client_id.to_string());
        let Some((_, link)) = self.inner.links.remove(&key) else {
            return false;
        };
        self.inner.teardown(&link);
        link.cancel.cancel();
        tracing::info!(account_id, peer = %peer_client_id, "bridge session disconnected");
        true
    }

    /// Disconnect and delete the persisted session.
    pub async fn forget(&self, account_id: AccountId, peer_client_id: &str) -> Result<bool, BridgeError> {
        let was_live = self.disconnect(account_id, peer_client_id);
        let removed = self.inner.store.remove(account_id, peer_client_id).await?;
        Ok(was_live || removed)
    }

    /// Tear down everything belonging to an account: streams, rows and its
    /// event channel. Returns the number of rows deleted.
    pub async fn remove_account(&self, account_id: AccountId) -> Result<usize, BridgeError> {
        let peers: Vec<String> = self
            .inner
            .links
            .iter()
            .filter(|entry| entry.key().0 == account_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        for peer in &peers {
            self.disconnect(account_id, peer);
        }
        let removed = self.inner.store.remove_account(account_id).await?;
        self.inner.router.remove_account(account_id);
        tracing::info!(account_id, removed, "bridge account removed");
        Ok(removed)
    }

    /// Disconnect every live session. Persisted sessions are kept.
    pub fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.inner.links.iter().map(|entry| entry.key().clone()).collect();
        for (account_id, peer) in keys {
            self.disconnect(account_id, &peer);
        }
    }

    pub fn link_state(&self, account_id: AccountId, peer_client_id: &str) -> LinkState {
        self.inner
            .link(&(account_id, peer_client_id.to_string()))
            .map(|link| *link.state())
            .unwrap_or(LinkState::Idle)
    }

    /// State of a live or persisted session, `None` when neither exists.
    pub async fn session_info(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
    ) -> Result<Option<SessionInfo>, BridgeError> {
        if let Some(link) = self.inner.link(&(account_id, peer_client_id.to_string())) {
            return Ok(Some(link.info()));
        }
        let stored = self.inner.store.get(account_id, peer_client_id).await?;
        Ok(stored.map(|session| SessionInfo {
            account_id,
            peer_client_id: session.peer_client_id.clone(),
            state: LinkState::Idle,
            wallet_public_key: session.wallet_client_id(),
            last_request_id: session.last_request_id,
        }))
    }

    /// Live and persisted sessions of an account.
    pub async fn list_sessions(&self, account_id: AccountId) -> Result<Vec<SessionInfo>, BridgeError> {
        let stored = self.inner.store.list_by_account(account_id).await?;
        Ok(stored
            .into_iter()
            .map(|session| match self.inner.link(&(account_id, session.peer_client_id.clone())) {
                Some(link) => link.info(),
                None => SessionInfo {
                    account_id,
                    peer_client_id: session.peer_client_id.clone(),
                    state: LinkState::Idle,
                    wallet_public_key: session.wallet_client_id(),
                    last_request_id: session.last_request_id,
                },
            })
            .collect())
    }
}

impl<T: BridgeTransport> Inner<T> {
    fn link(&self, key: &SessionKey) -> Option<Arc<Link>> {
        self.links.get(key).map(|entry| entry.value().clone())
    }

    fn bound_link(&self, handle: StreamHandle) -> Option<Arc<Link>> {
        let key = self.bindings.get(&handle)?.value().clone();
        self.link(&key)
    }

    fn allocate_handle(&self) -> StreamHandle {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn join(&self, link: &Link) -> Join {
        let state = link.state();
        match *state {
            LinkState::Streaming | LinkState::Reconnecting => Join::Ready,
            LinkState::Connecting => match self.pending.get_mut(&link.current_handle()) {
                Some(mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Join::Waiting(rx)
                }
                // Re-opening after a dropped stream.
                None => Join::Ready,
            },
            LinkState::Idle | LinkState::Closed => Join::Stale,
        }
    }

    async fn load_or_create(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
    ) -> Result<(ConnectionSession, bool), BridgeError> {
        if let Some(session) = self.store.get(account_id, peer_client_id).await? {
            return Ok((session, true));
        }
        let keypair = tonconnect_crypto::generate_keypair()?;
        Ok((ConnectionSession::new(account_id, peer_client_id, keypair), false))
    }

    fn resolve(&self, handle: StreamHandle, outcome: Result<(), ConnectFailure>) {
        if let Some((_, waiters)) = self.pending.remove(&handle) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Returns `false` when the link must stop.
    async fn on_stream_opened(&self, link: &Arc<Link>, handle: StreamHandle) -> bool {
        let session = &link.session;
        if !link.persisted.load(Ordering::SeqCst) {
            match self.store.upsert(session).await {
                Ok(_) => link.persisted.store(true, Ordering::SeqCst),
                Err(e) => {
                    tracing::warn!(
                        account_id = session.account_id,
                        peer = %session.peer_client_id,
                        err = %e,
                        "failed to persist bridge session"
                    );
                    self.retire(link);
                    self.resolve(handle, Err(ConnectFailure::Storage(e.to_string())));
                    return false;
                }
            }
        }

        let waiters = {
            let mut state = link.state();
            if *state == LinkState::Closed {
                return false;
            }
            *state = LinkState::Streaming;
            self.pending.remove(&handle)
        };
        // Only the first open of a link has waiters. The notice goes out
        // before any event of this stream is handled.
        if let Some((_, waiters)) = waiters {
            self.router.publish(
                session.account_id,
                DomainEvent::ConnectionOpened {
                    account_id: session.account_id,
                    peer_client_id: session.peer_client_id.clone(),
                },
            );
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }
        tracing::debug!(
            account_id = session.account_id,
            peer = %session.peer_client_id,
            handle,
            "bridge stream opened"
        );
        true
    }

    /// Decrypt, deduplicate and publish one server event.
    ///
    /// Undecryptable envelopes and stale request ids are dropped silently.
    async fn on_stream_event(&self, handle: StreamHandle, event: ServerEvent) {
        let Some(link) = self.bound_link(handle) else {
            tracing::debug!(handle, "event for unbound stream");
            return;
        };
        if let Some(id) = event.id {
            *link.last_event_id() = Some(id);
        }
        if event.event.as_deref() == Some(HEARTBEAT_EVENT) {
            return;
        }

        let session = &link.session;
        let Some(request) = session.open_envelope(&event.data) else {
            tracing::debug!(
                account_id = session.account_id,
                peer = %session.peer_client_id,
                handle,
                "dropped unreadable envelope"
            );
            return;
        };
        if !link.advance(request.id) {
            tracing::debug!(
                account_id = session.account_id,
                peer = %session.peer_client_id,
                request_id = request.id,
                "dropped stale request"
            );
            return;
        }

        if let Err(e) = self
            .store
            .update_last_request_id(session.account_id, &session.peer_client_id, request.id)
            .await
        {
            tracing::warn!(
                account_id = session.account_id,
                request_id = request.id,
                err = %e,
                "failed to persist request id"
            );
        }

        match DomainEvent::from_request(session.account_id, &session.peer_client_id, &request) {
            Some(event) => {
                tracing::info!(
                    account_id = session.account_id,
                    peer = %session.peer_client_id,
                    request_id = request.id,
                    method = %request.method,
                    "bridge request accepted"
                );
                self.router.publish(session.account_id, event);
            }
            None => tracing::debug!(
                account_id = session.account_id,
                request_id = request.id,
                method = %request.method,
                "request has no domain event"
            ),
        }
    }

    /// Handle the end of stream `handle`. Returns `false` when the link must
    /// stop because the stream never opened.
    fn on_stream_ended(&self, link: &Arc<Link>, handle: StreamHandle, cause: String) -> bool {
        self.bindings.remove(&handle);
        self.transport.close_stream(handle);

        let initial = {
            let mut state = link.state();
            let initial = self.pending.remove(&handle);
            if initial.is_none() && *state != LinkState::Closed {
                *state = LinkState::Reconnecting;
            }
            initial
        };
        match initial {
            Some((_, waiters)) => {
                self.retire(link);
                tracing::warn!(
                    account_id = link.session.account_id,
                    peer = %link.session.peer_client_id,
                    handle,
                    cause = %cause,
                    "bridge stream failed to open"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(ConnectFailure::Transport(cause.clone())));
                }
                false
            }
            None => {
                tracing::warn!(
                    account_id = link.session.account_id,
                    peer = %link.session.peer_client_id,
                    handle,
                    cause = %cause,
                    "bridge stream dropped, reconnecting"
                );
                true
            }
        }
    }

    /// Open a replacement stream, resuming after the last seen event.
    fn reopen(&self, link: &Link, sink: &SignalSink) {
        let handle = self.allocate_handle();
        let last_event_id = link.last_event_id().clone();
        {
            let mut state = link.state();
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Connecting;
            link.handle.store(handle, Ordering::SeqCst);
            self.bindings.insert(handle, link.key());
        }
        tracing::debug!(
            account_id = link.session.account_id,
            peer = %link.session.peer_client_id,
            handle,
            "reopening bridge stream"
        );
        self.transport.open_stream(
            StreamRequest {
                handle,
                client_id: link.session.wallet_client_id(),
                last_event_id,
            },
            sink.clone(),
        );
    }

    /// Mark `link` closed and drop it from the live set.
    fn retire(&self, link: &Arc<Link>) -> StreamHandle {
        let handle = {
            let mut state = link.state();
            *state = LinkState::Closed;
            link.current_handle()
        };
        self.links
            .remove_if(&link.key(), |_, current| Arc::ptr_eq(current, link));
        handle
    }

    /// Release everything held for `link`. Safe to call more than once.
    fn teardown(&self, link: &Arc<Link>) {
        let handle = self.retire(link);
        self.transport.close_stream(handle);
        self.bindings.remove(&handle);
        self.resolve(handle, Err(ConnectFailure::Cancelled));
    }
}

/// Per-session task: applies stream signals in order until the link is
/// cancelled or its first stream fails to open.
async fn drive_link<T: BridgeTransport>(
    inner: Arc<Inner<T>>,
    link: Arc<Link>,
    mut signals: mpsc::UnboundedReceiver<(StreamHandle, StreamSignal)>,
    sink: SignalSink,
) {
    let mut attempts: u32 = 0;
    loop {
        let (handle, signal) = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => break,
            next = signals.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        if handle != link.current_handle() {
            continue;
        }

        let cause = match signal {
            StreamSignal::Opened => {
                if !inner.on_stream_opened(&link, handle).await {
                    break;
                }
                attempts = 0;
                continue;
            }
            StreamSignal::Event(event) => {
                inner.on_stream_event(handle, event).await;
                continue;
            }
            StreamSignal::Closed => "stream closed".to_string(),
            StreamSignal::Failed(cause) => cause,
        };

        if !inner.on_stream_ended(&link, handle, cause) {
            break;
        }
        let delay = inner.config.reconnect_backoff(attempts);
        attempts = attempts.saturating_add(1);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = link.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        inner.reopen(&link, &sink);
    }
    inner.teardown(&link);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::Mutex;
    use tonconnect_crypto::{KeyPair, StoreKey, generate_keypair};

    /// Answers every open with a fixed outcome and records posts.
    #[derive(Default)]
    struct ScriptedTransport {
        refuse: bool,
        /// dApp key and raw requests it has queued for the wallet.
        backlog: Option<(KeyPair, Vec<serde_json::Value>)>,
        opened: Mutex<Vec<StreamRequest>>,
        posts: Mutex<Vec<(String, String, u32)>>,
    }

    impl ScriptedTransport {
        fn envelope(&self, wallet_client_id: &str, request: &serde_json::Value) -> Option<String> {
            let (dapp, _) = self.backlog.as_ref()?;
            let sender = ConnectionSession::new(0, wallet_client_id, dapp.clone());
            let message = sender.seal(&serde_json::to_vec(request).unwrap()).unwrap();
            Some(
                serde_json::to_string(&crate::protocol::BridgeMessage {
                    from: hex::encode(dapp.public_key),
                    message,
                })
                .unwrap(),
            )
        }
    }

    impl BridgeTransport for ScriptedTransport {
        fn open_stream(&self, request: StreamRequest, sink: SignalSink) {
            if self.refuse {
                let _ = sink.send((request.handle, StreamSignal::Failed("refused".into())));
            } else {
                let _ = sink.send((request.handle, StreamSignal::Opened));
                let queued = self.backlog.as_ref().map(|(_, queued)| queued.as_slice()).unwrap_or(&[]);
                for (id, pending) in queued.iter().enumerate() {
                    if let Some(data) = self.envelope(&request.client_id, pending) {
                        let event = ServerEvent {
                            id: Some(id.to_string()),
                            event: Some("message".into()),
                            data,
                        };
                        let _ = sink.send((request.handle, StreamSignal::Event(event)));
                    }
                }
            }
            self.opened.lock().unwrap().push(request);
        }

        fn close_stream(&self, _handle: StreamHandle) {}

        async fn post_message(
            &self,
            client_id: &str,
            to: &str,
            ttl_secs: u32,
            _body: String,
        ) -> Result<(), TransportError> {
            self.posts
                .lock()
                .unwrap()
                .push((client_id.to_string(), to.to_string(), ttl_secs));
            Ok(())
        }
    }

    fn manager(transport: ScriptedTransport) -> ConnectionManager<ScriptedTransport> {
        let store = SessionStore::open(None, StoreKey::derive(b"k")).unwrap();
        ConnectionManager::new(BridgeConfig::default(), store, transport)
    }

    fn peer() -> String {
        hex::encode(generate_keypair().unwrap().public_key)
    }

    #[tokio::test]
    async fn connect_persists_and_publishes() {
        let manager = manager(ScriptedTransport::default());
        let peer = peer();
        let mut events = manager.subscribe(1);

        manager.connect(1, &peer).await.unwrap();

        assert_eq!(manager.link_state(1, &peer), LinkState::Streaming);
        let stored = manager.store().get(1, &peer).await.unwrap().unwrap();
        let opened = manager.transport().opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].client_id, stored.wallet_client_id());
        assert_eq!(
            events.recv().await,
            Some(DomainEvent::ConnectionOpened {
                account_id: 1,
                peer_client_id: peer.clone()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connection_notice_precedes_requests_from_same_open() {
        for _ in 0..50 {
            let dapp = generate_keypair().unwrap();
            let peer = hex::encode(dapp.public_key);
            let transfer = serde_json::json!({
                "id": "42",
                "method": "sendTransaction",
                "params": [r#"{"messages":[{"address":"0:aa","amount":"1"}]}"#],
            });
            let store = SessionStore::open(None, StoreKey::derive(b"k")).unwrap();
            let manager = ConnectionManager::new(
                BridgeConfig {
                    event_buffer: 8,
                    ..BridgeConfig::default()
                },
                store,
                ScriptedTransport {
                    backlog: Some((dapp, vec![transfer])),
                    ..Default::default()
                },
            );
            let mut events = manager.subscribe(1);

            manager.connect(1, &peer).await.unwrap();

            let first = tokio::time::timeout(std::time::Duration::from_secs(3), events.recv())
                .await
                .unwrap();
            assert_eq!(
                first,
                Some(DomainEvent::ConnectionOpened {
                    account_id: 1,
                    peer_client_id: peer.clone()
                })
            );
            let second = tokio::time::timeout(std::time::Duration::from_secs(3), events.recv())
                .await
                .unwrap();
            assert!(matches!(
                second,
                Some(DomainEvent::TransferRequested { request_id: 42, .. })
            ));
        }
    }

    #[tokio::test]
    async fn joining_a_live_session_publishes_nothing() {
        let manager = manager(ScriptedTransport::default());
        let peer = peer();
        let mut events = manager.subscribe(1);
        manager.connect(1, &peer).await.unwrap();
        manager.connect(1, &peer).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(DomainEvent::ConnectionOpened { .. })
        ));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn second_connect_reuses_stream() {
        let manager = manager(ScriptedTransport::default());
        let peer = peer();
        manager.connect(1, &peer).await.unwrap();
        manager.connect(1, &peer).await.unwrap();
        assert_eq!(manager.transport().opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_open_fails_connect_and_persists_nothing() {
        let manager = manager(ScriptedTransport {
            refuse: true,
            ..Default::default()
        });
        let peer = peer();

        let err = manager.connect(1, &peer).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConnectionFailed(ConnectFailure::Transport(_))
        ));
        assert!(manager.store().get(1, &peer).await.unwrap().is_none());
        assert_eq!(manager.link_state(1, &peer), LinkState::Idle);
    }

    #[tokio::test]
    async fn invalid_peer_id_is_rejected_before_network() {
        let manager = manager(ScriptedTransport::default());
        let err = manager.connect(1, "zz").await.unwrap_err();
        assert!(matches!(err, BridgeError::Crypto(_)));
        assert!(manager.transport().opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_session_makes_no_call() {
        let manager = manager(ScriptedTransport::default());
        let err = manager.send(1, &peer(), b"{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::NoSuchSession { account_id: 1, .. }));
        assert!(manager.transport().posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_posts_with_ttl() {
        let manager = manager(ScriptedTransport::default());
        let peer = peer();
        manager.connect(1, &peer).await.unwrap();
        manager.send(1, &peer, b"{}").await.unwrap();

        let info = manager.session_info(1, &peer).await.unwrap().unwrap();
        let posts = manager.transport().posts.lock().unwrap().clone();
        assert_eq!(posts, vec![(info.wallet_public_key, peer, 300)]);
    }

    #[tokio::test]
    async fn disconnect_keeps_row_and_forget_removes_it() {
        let manager = manager(ScriptedTransport::default());
        let peer = peer();
        manager.connect(1, &peer).await.unwrap();

        assert!(manager.disconnect(1, &peer));
        assert!(!manager.disconnect(1, &peer));
        let info = manager.session_info(1, &peer).await.unwrap().unwrap();
        assert_eq!(info.state, LinkState::Idle);

        assert!(manager.forget(1, &peer).await.unwrap());
        assert!(manager.session_info(1, &peer).await.unwrap().is_none());
    }

    #[test]
    fn advance_is_strictly_increasing() {
        let link = Link::new(
            ConnectionSession::new(1, "aa", generate_keypair().unwrap()),
            true,
            1,
        );
        let accepted: Vec<i64> = [5, 3, 7, 7, 6]
            .into_iter()
            .filter(|id| link.advance(*id))
            .collect();
        assert_eq!(accepted, vec![5, 7]);
    }
}
