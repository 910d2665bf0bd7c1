//! `tc://` connect links handed to the wallet by a dApp.

use reqwest::Url;
use serde::Deserialize;

const TC_SCHEME: &str = "tc";
const UNIVERSAL_HOST: &str = "app.tonkeeper.com";
const UNIVERSAL_PATH: &str = "/ton-connect";

/// Name of the connect item that asks for the wallet address.
pub const TON_ADDR_ITEM: &str = "ton_addr";

/// A parsed connect request link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectLink {
    pub url: String,
    pub version: u32,
    /// The dApp's public key (hex), used as `peer_client_id`.
    pub client_id: String,
    pub request: ConnectRequest,
    pub ret: Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub manifest_url: String,
    pub items: Vec<ConnectItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectItem {
    TonAddress,
}

/// Where the user goes after approving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Return {
    Back,
    None,
    Url(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    manifest_url: String,
    items: Vec<serde_json::Value>,
}

impl ConnectLink {
    /// Parse `tc://?v=..&id=..&r=..[&ret=..]` or the equivalent
    /// `https://app.tonkeeper.com/ton-connect?..` universal link.
    pub fn parse(link: &str) -> Option<Self> {
        let url = Url::parse(link.trim()).ok()?;
        let universal = url.scheme() == "https"
            && url.host_str() == Some(UNIVERSAL_HOST)
            && url.path() == UNIVERSAL_PATH;
        if url.scheme() != TC_SCHEME && !universal {
            return None;
        }

        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };

        let version = param("v")?.parse().ok()?;
        let client_id = param("id")?;
        let raw: RawRequest = serde_json::from_str(&param("r")?).ok()?;
        let items = raw
            .items
            .iter()
            .filter_map(|item| item.get("name")?.as_str())
            .filter(|name| *name == TON_ADDR_ITEM)
            .map(|_| ConnectItem::TonAddress)
            .collect();

        let ret = match param("ret") {
            Some(ret) if ret == "none" => Return::None,
            Some(ret) if Url::parse(&ret).is_ok() => Return::Url(ret),
            _ => Return::Back,
        };

        Some(Self {
            url: url.to_string(),
            version,
            client_id,
            request: ConnectRequest {
                manifest_url: raw.manifest_url,
                items,
            },
            ret,
        })
    }

    pub fn wants_address(&self) -> bool {
        self.request.items.contains(&ConnectItem::TonAddress)
    }
}
