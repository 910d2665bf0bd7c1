use crate::AccountId;
use crate::protocol::{AppRequest, METHOD_SEND_TRANSACTION};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Serialize, Serializer};

/// What the rest of the wallet sees of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ConnectionOpened {
        account_id: AccountId,
        peer_client_id: String,
    },
    TransferRequested {
        account_id: AccountId,
        peer_client_id: String,
        request_id: i64,
        destination_address: String,
        /// Nanotons.
        amount: u64,
        #[serde(serialize_with = "base64_opt")]
        state_init: Option<Vec<u8>>,
    },
}

impl DomainEvent {
    pub fn account_id(&self) -> AccountId {
        match self {
            DomainEvent::ConnectionOpened { account_id, .. }
            | DomainEvent::TransferRequested { account_id, .. } => *account_id,
        }
    }

    /// Map an accepted request to an event.
    ///
    /// Only `sendTransaction` produces one, built from the first message of
    /// the first parameter; the wallet sends a single message per request.
    pub fn from_request(
        account_id: AccountId,
        peer_client_id: &str,
        request: &AppRequest,
    ) -> Option<Self> {
        if request.method != METHOD_SEND_TRANSACTION {
            return None;
        }
        let payload = request.transfer_payload()?;
        let message = payload.messages.into_iter().next()?;
        let state_init = match message.state_init {
            Some(encoded) => Some(BASE64.decode(encoded.trim()).ok()?),
            None => None,
        };
        Some(DomainEvent::TransferRequested {
            account_id,
            peer_client_id: peer_client_id.to_string(),
            request_id: request.id,
            destination_address: message.address,
            amount: message.amount,
            state_init,
        })
    }
}

fn base64_opt<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}
