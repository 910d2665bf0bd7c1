use crate::AccountId;
use crate::event::DomainEvent;
use dashmap::DashMap;
use futures_util::Stream;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Per-account fan-out of domain events.
///
/// Channels are created on first use and live until [`EventRouter::remove_account`].
/// Delivery is best-effort and favors the latest event: while nobody listens,
/// only the most recent event is kept for the next subscriber, and a
/// subscriber that falls more than `capacity` events behind skips the oldest.
pub struct EventRouter {
    channels: DashMap<AccountId, Arc<Channel>>,
    capacity: usize,
}

struct Channel {
    tx: broadcast::Sender<DomainEvent>,
    /// Event published while the channel had no receivers.
    latest: StdMutex<Option<DomainEvent>>,
}

impl Channel {
    fn latest(&self) -> MutexGuard<'_, Option<DomainEvent>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::with_capacity(1)
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, account_id: AccountId) -> Arc<Channel> {
        self.channels
            .entry(account_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                Arc::new(Channel {
                    tx,
                    latest: StdMutex::new(None),
                })
            })
            .clone()
    }

    /// Deliver `event` to the account's subscribers. Never blocks.
    pub fn publish(&self, account_id: AccountId, event: DomainEvent) {
        let channel = self.channel(account_id);
        let mut latest = channel.latest();
        if channel.tx.receiver_count() == 0 {
            *latest = Some(event);
        } else if let Err(broadcast::error::SendError(event)) = channel.tx.send(event) {
            // Last receiver went away after the count check.
            *latest = Some(event);
        }
    }

    pub fn subscribe(&self, account_id: AccountId) -> EventSubscription {
        let channel = self.channel(account_id);
        let mut latest = channel.latest();
        let rx = channel.tx.subscribe();
        EventSubscription {
            account_id,
            pending: latest.take(),
            rx,
        }
    }

    /// Drop the account's channel; open subscriptions end after draining.
    pub fn remove_account(&self, account_id: AccountId) -> bool {
        self.channels.remove(&account_id).is_some()
    }

    pub fn subscriber_count(&self, account_id: AccountId) -> usize {
        self.channels
            .get(&account_id)
            .map(|channel| channel.tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Receiving half of [`EventRouter::subscribe`].
pub struct EventSubscription {
    account_id: AccountId,
    pending: Option<DomainEvent>,
    rx: broadcast::Receiver<DomainEvent>,
}

impl EventSubscription {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Next event, or `None` once the account's channel is torn down.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(account_id = self.account_id, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = DomainEvent> + Send + 'static {
        let mut subscription = self;
        async_stream::stream! {
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }
    }
}
