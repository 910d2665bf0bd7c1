use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default time-to-live for outbound envelopes, in seconds.
pub const DEFAULT_MESSAGE_TTL_SECS: u32 = 300;

/// The only inbound method that produces a domain event.
pub const METHOD_SEND_TRANSACTION: &str = "sendTransaction";

/// SSE event type the relay uses for keep-alives.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Network id of TON mainnet.
pub const NETWORK_MAINNET: &str = "-239";
pub const PLATFORM_ANDROID: &str = "android";

/// Error code reported to the dApp when the user rejects a transfer.
pub const USER_DECLINED_CODE: i32 = 300;
pub const USER_DECLINED_MESSAGE: &str = "User declined the transaction";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// SSE `data` payload delivered by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeMessage {
    pub from: String,
    /// Base64 of `nonce || ciphertext`.
    pub message: String,
}

/// Decrypted request from a dApp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRequest {
    #[serde(deserialize_with = "int_or_string")]
    pub id: i64,
    pub method: String,
    /// Each entry is itself a JSON-encoded [`TransferPayload`].
    #[serde(default)]
    pub params: Vec<String>,
}

impl AppRequest {
    /// Decode the first parameter as a transfer payload.
    pub fn transfer_payload(&self) -> Option<TransferPayload> {
        let first = self.params.first()?;
        serde_json::from_str(first).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferPayload {
    #[serde(default)]
    pub messages: Vec<TransferMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferMessage {
    pub address: String,
    /// Nanotons. Sent as a decimal string by dApps; plain integers are accepted too.
    #[serde(deserialize_with = "int_or_string")]
    pub amount: u64,
    /// Base64 bag-of-cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Connect acknowledgment sent once a new session is approved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAck {
    pub id: i64,
    pub payload: ConnectAckPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAckPayload {
    pub items: Vec<TonAddressItem>,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TonAddressItem {
    /// Raw `workchain:hex` address of the wallet.
    pub address: String,
    /// Wallet public key (hex).
    pub public_key: String,
    pub network: String,
    /// Base64 state init of the wallet contract.
    pub wallet_state_init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: String,
    pub app_version: String,
}

impl DeviceInfo {
    /// Device description for the host this process runs on.
    pub fn current(app_version: impl Into<String>) -> Self {
        Self {
            platform: platform_name(std::env::consts::OS).to_string(),
            app_version: app_version.into(),
        }
    }
}

/// Map a Rust target OS to the platform names dApps understand.
fn platform_name(os: &str) -> &'static str {
    match os {
        "android" => PLATFORM_ANDROID,
        "ios" => "iphone",
        "macos" => "mac",
        "windows" => "windows",
        _ => "linux",
    }
}

impl ConnectAck {
    pub fn new(item: TonAddressItem, device: DeviceInfo) -> Self {
        Self {
            id: 0,
            payload: ConnectAckPayload {
                items: vec![item],
                device,
            },
        }
    }
}

/// Response to a `sendTransaction` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SendResult {
    Error { id: String, error: ErrorBody },
    Success { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl SendResult {
    pub fn success(request_id: i64) -> Self {
        SendResult::Success {
            id: request_id.to_string(),
        }
    }

    pub fn error(request_id: i64, code: i32, message: impl Into<String>) -> Self {
        SendResult::Error {
            id: request_id.to_string(),
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn user_declined(request_id: i64) -> Self {
        Self::error(request_id, USER_DECLINED_CODE, USER_DECLINED_MESSAGE)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Accept an integer given either as a JSON number or as a decimal string.
fn int_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + TryFrom<u64> + std::str::FromStr,
    <T as std::str::FromStr>::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unsigned(u64),
        Signed(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Unsigned(n) => <T as TryFrom<u64>>::try_from(n)
            .map_err(|_| de::Error::custom("integer out of range")),
        Raw::Signed(n) => <T as TryFrom<i64>>::try_from(n)
            .map_err(|_| de::Error::custom("integer out of range")),
        Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}
