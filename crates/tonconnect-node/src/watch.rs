use anyhow::Result;
use std::pin::Pin;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tonconnect::{AccountId, BridgeTransport, ConnectionManager, DomainEvent};

type EventStream = Pin<Box<dyn Stream<Item = DomainEvent> + Send>>;

/// Drains bridge events of a set of accounts into a handler.
///
/// Subscriptions are taken and drained from [`Watcher::start`] on, so events
/// published by a later restore or approve are never missed.
pub struct Watcher {
    accounts: usize,
    printer: JoinHandle<Result<()>>,
}

impl Watcher {
    pub fn start<T, F>(manager: &ConnectionManager<T>, accounts: &[AccountId], mut emit: F) -> Self
    where
        T: BridgeTransport,
        F: FnMut(AccountId, &DomainEvent) -> Result<()> + Send + 'static,
    {
        let mut streams: StreamMap<AccountId, EventStream> = StreamMap::new();
        for &account_id in accounts {
            streams.insert(account_id, Box::pin(manager.subscribe(account_id).into_stream()));
        }
        let printer = tokio::spawn(async move {
            while let Some((account_id, event)) = streams.next().await {
                tracing::debug!(account_id, "bridge event");
                emit(account_id, &event)?;
            }
            Ok::<(), anyhow::Error>(())
        });
        Self {
            accounts: accounts.len(),
            printer,
        }
    }

    /// Keep draining until SIGINT, then disconnect every session.
    pub async fn run<T: BridgeTransport>(self, manager: &ConnectionManager<T>) -> Result<()> {
        tracing::info!(accounts = self.accounts, "watching bridge events");
        tokio::signal::ctrl_c().await?;
        tracing::info!("received SIGINT, shutting down");

        manager.shutdown();
        self.printer.abort();
        tracing::info!("tonconnect-node shut down");
        Ok(())
    }
}

/// Print one event to stdout as a JSON line.
pub fn print_event(_account_id: AccountId, event: &DomainEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}
