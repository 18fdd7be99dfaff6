//! Credential-archive decoding and OAuth2 token acquisition.
//!
//! A credential archive is a ZIP containing `treehub.json`, which names
//! the OAuth2 token server, client credentials, and the ostree server
//! URL whose fourth path component is the factory name.

use crate::PushError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use url::{Position, Url};

const TREEHUB_FILE: &str = "treehub.json";

#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2 {
    pub server: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct OstreeServer {
    pub server: String,
}

/// Contents of `treehub.json`.
#[derive(Debug, Deserialize)]
pub struct TreehubInfo {
    #[serde(default)]
    pub oauth2: Option<OAuth2>,
    #[serde(default)]
    pub no_auth: bool,
    pub ostree: OstreeServer,
}

/// Hub coordinates extracted from a credential archive.
#[derive(Debug)]
pub struct HubCredentials {
    pub url: String,
    pub factory: String,
    pub auth: Option<OAuth2>,
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: u64,
}

/// Read `treehub.json` out of the ZIP credential archive at `path`.
pub fn parse_cred_archive(path: &Path) -> Result<TreehubInfo, PushError> {
    let file = File::open(path)
        .map_err(|e| PushError::Creds(format!("failed to open {}: {e}", path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PushError::Creds(format!("not a zip archive: {e}")))?;
    let mut entry = archive
        .by_name(TREEHUB_FILE)
        .map_err(|_| PushError::Creds(format!("no {TREEHUB_FILE} in {}", path.display())))?;
    let mut data = String::new();
    entry
        .read_to_string(&mut data)
        .map_err(|e| PushError::Creds(format!("failed to read {TREEHUB_FILE}: {e}")))?;
    serde_json::from_str(&data)
        .map_err(|e| PushError::Creds(format!("invalid {TREEHUB_FILE}: {e}")))
}

/// Derive the hub base URL and factory from the ostree server URL, e.g.
/// `https://api.example.com/ota/treehub/acme-dev/api/v3/` yields factory
/// `acme-dev`.
pub fn extract_hub(info: &TreehubInfo) -> Result<HubCredentials, PushError> {
    let server = Url::parse(&info.ostree.server).map_err(|e| PushError::Url(e.to_string()))?;
    let factory = server
        .path()
        .split('/')
        .nth(3)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            PushError::Creds(format!(
                "no factory in ostree server URL path '{}'",
                server.path()
            ))
        })?
        .to_owned();

    let auth = if info.no_auth {
        None
    } else {
        Some(info.oauth2.clone().ok_or_else(|| {
            PushError::Creds("credential archive has no oauth2 section".to_owned())
        })?)
    };

    Ok(HubCredentials {
        url: server[..Position::BeforePath].to_owned(),
        factory,
        auth,
    })
}

/// Fetch a client-credentials token from the OAuth2 server.
pub fn fetch_oauth_token(agent: &ureq::Agent, auth: &OAuth2) -> Result<String, PushError> {
    let url = format!("{}/token?grant_type=client_credentials", auth.server);
    let basic = BASE64.encode(format!("{}:{}", auth.client_id, auth.client_secret));
    let resp = agent
        .post(url.as_str())
        .header("Authorization", &format!("Basic {basic}"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .send("grant_type=client_credentials")
        .map_err(|e| PushError::Auth(format!("token request failed: {e}")))?;

    let token: OAuthToken = serde_json::from_reader(resp.into_body().into_reader())
        .map_err(|e| PushError::Auth(format!("invalid token response: {e}")))?;
    Ok(token.access_token)
}
