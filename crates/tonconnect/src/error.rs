use crate::AccountId;
use crate::transport::TransportError;
use std::fmt;
use thiserror::Error;
use tonconnect_crypto::CryptoError;

/// Why a `connect()` call did not reach the streaming state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The session was torn down while the stream was still opening.
    Cancelled,
    /// The relay refused or dropped the stream before it opened.
    Transport(String),
    /// The stream opened but the session could not be persisted.
    Storage(String),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Cancelled => write!(f, "cancelled"),
            ConnectFailure::Transport(cause) => write!(f, "transport: {cause}"),
            ConnectFailure::Storage(cause) => write!(f, "storage: {cause}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("crypto unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("connection failed: {0}")]
    ConnectionFailed(ConnectFailure),

    #[error("no session for account {account_id} and peer {peer_client_id}")]
    NoSuchSession {
        account_id: AccountId,
        peer_client_id: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<CryptoError> for BridgeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Unavailable(cause) => BridgeError::CryptoUnavailable(cause),
            other => BridgeError::Crypto(other),
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}
