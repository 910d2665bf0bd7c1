mod watch;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tonconnect::protocol::{ConnectAck, DeviceInfo, NETWORK_MAINNET, SendResult, TonAddressItem};
use tonconnect::state_dir::{
    SESSIONS_DB_FILE, default_state_dir, ensure_state_dir, load_or_create_store_key,
};
use tonconnect::{
    AccountId, BridgeConfig, ConnectLink, ConnectionManager, HttpBridgeTransport, SessionStore,
    fetch_manifest,
};
use watch::{Watcher, print_event};

type Manager = ConnectionManager<HttpBridgeTransport>;

#[derive(Parser, Debug)]
#[command(author, version, about = "TON Connect bridge daemon")]
struct Args {
    /// State directory for session data.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Bridge relay base URL.
    #[arg(long, global = true, default_value = tonconnect::DEFAULT_BRIDGE_URL)]
    bridge_url: String,

    /// Delay before re-opening a dropped stream.
    #[arg(long, global = true, default_value_t = 0)]
    reconnect_delay_ms: u64,

    /// Random extra delay added to every reconnect.
    #[arg(long, global = true, default_value_t = 0)]
    reconnect_jitter_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore persisted sessions and print bridge events as JSON lines.
    Run {
        /// Only restore and watch these accounts (repeatable).
        #[arg(long)]
        account: Vec<AccountId>,
    },
    /// Approve a dApp connection from a `tc://` link, then keep running.
    Connect {
        link: String,
        #[arg(long)]
        account: AccountId,
        /// Raw wallet address (`workchain:hex`).
        #[arg(long)]
        address: String,
        /// Wallet public key (hex).
        #[arg(long)]
        public_key: String,
        /// Base64 state init of the wallet contract.
        #[arg(long)]
        state_init: String,
        #[arg(long, default_value = NETWORK_MAINNET)]
        network: String,
    },
    /// List persisted sessions.
    List {
        #[arg(long)]
        account: Option<AccountId>,
    },
    /// Delete a persisted session.
    Forget {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        peer: String,
    },
    /// Answer a transfer request.
    Respond {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        peer: String,
        #[arg(long)]
        request_id: i64,
        /// Report that the user declined instead of confirming.
        #[arg(long)]
        decline: bool,
    },
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            reconnect_delay_ms: self.reconnect_delay_ms,
            reconnect_jitter_ms: self.reconnect_jitter_ms,
            ..BridgeConfig::default().with_bridge_url(self.bridge_url.clone())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tonconnect=info,tonconnect_node=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state_dir = match &args.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir().context("failed to determine state directory")?,
    };
    ensure_state_dir(&state_dir)?;
    let store_key = load_or_create_store_key(&state_dir).context("failed to load store key")?;
    let store = SessionStore::open(Some(&state_dir.join(SESSIONS_DB_FILE)), store_key)
        .context("failed to open session store")?;

    let config = args.bridge_config();
    let transport = HttpBridgeTransport::new(&config.bridge_url);
    let manager = ConnectionManager::new(config, store, transport);

    match args.command {
        Command::Run { account } => {
            let accounts = if account.is_empty() {
                stored_accounts(&manager).await?
            } else {
                account
            };
            let watcher = Watcher::start(&manager, &accounts, print_event);
            for account_id in &accounts {
                manager.restore_account(*account_id).await?;
            }
            watcher.run(&manager).await
        }
        Command::Connect {
            link,
            account,
            address,
            public_key,
            state_init,
            network,
        } => {
            let Some(link) = ConnectLink::parse(&link) else {
                bail!("not a TON Connect link");
            };
            if !link.wants_address() {
                bail!("link does not request a wallet address");
            }
            let manifest = fetch_manifest(manager.transport().client(), &link.request.manifest_url)
                .await
                .context("failed to fetch dApp manifest")?
                .context("dApp manifest URL is invalid")?;
            tracing::info!(app = %manifest.name, host = %manifest.display_host(), "connecting to dApp");

            let ack = ConnectAck::new(
                TonAddressItem {
                    address,
                    public_key,
                    network,
                    wallet_state_init: state_init,
                },
                DeviceInfo::current(env!("CARGO_PKG_VERSION")),
            );
            let watcher = Watcher::start(&manager, &[account], print_event);
            manager.restore_account(account).await?;
            manager
                .approve(account, &link.client_id, &ack)
                .await
                .context("failed to approve connection")?;
            watcher.run(&manager).await
        }
        Command::List { account } => {
            let accounts = match account {
                Some(account) => vec![account],
                None => stored_accounts(&manager).await?,
            };
            for account_id in accounts {
                for info in manager.list_sessions(account_id).await? {
                    println!("{}", serde_json::to_string(&info)?);
                }
            }
            Ok(())
        }
        Command::Forget { account, peer } => {
            if !manager.forget(account, &peer).await? {
                bail!("no session for account {account} and peer {peer}");
            }
            eprintln!("Session forgotten.");
            Ok(())
        }
        Command::Respond {
            account,
            peer,
            request_id,
            decline,
        } => {
            let result = if decline {
                SendResult::user_declined(request_id)
            } else {
                SendResult::success(request_id)
            };
            manager
                .send_json(account, &peer, &result)
                .await
                .context("failed to send response")?;
            Ok(())
        }
    }
}

async fn stored_accounts(manager: &Manager) -> Result<Vec<AccountId>> {
    let mut accounts: Vec<AccountId> = manager
        .store()
        .list_all()
        .await?
        .into_iter()
        .map(|session| session.account_id)
        .collect();
    accounts.sort_unstable();
    accounts.dedup();
    Ok(accounts)
}
