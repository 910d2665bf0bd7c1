use crate::transport::TransportError;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// `tonconnect-manifest.json` published by a dApp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub url: String,
    pub name: String,
    pub icon_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_use_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy_url: Option<String>,
}

impl Manifest {
    /// Host shown to the user, falling back to the app name.
    pub fn display_host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Fetch a dApp manifest. Returns `Ok(None)` when `manifest_url` is not an
/// http(s) URL.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    manifest_url: &str,
) -> Result<Option<Manifest>, TransportError> {
    let Ok(url) = Url::parse(manifest_url) else {
        return Ok(None);
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Ok(None);
    }

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    Ok(Some(response.json().await?))
}
