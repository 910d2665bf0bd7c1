pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod link;
pub mod manager;
pub mod manifest;
pub mod protocol;
pub mod router;
pub mod session;
pub mod state_dir;
pub mod store;
pub mod transport;

/// Local wallet account identifier.
pub type AccountId = i64;

/// Public TON Connect bridge used when nothing else is configured.
pub const DEFAULT_BRIDGE_URL: &str = "https://bridge.tonapi.io/bridge";

pub use config::BridgeConfig;
pub use error::{BridgeError, ConnectFailure};
pub use event::DomainEvent;
pub use http::HttpBridgeTransport;
pub use link::ConnectLink;
pub use manager::{ConnectionManager, LinkState, SessionInfo};
pub use manifest::{Manifest, fetch_manifest};
pub use router::{EventRouter, EventSubscription};
pub use session::ConnectionSession;
pub use store::SessionStore;
pub use transport::BridgeTransport;
