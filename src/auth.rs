//! Identity provider: device-code sign-in, token cache and silent refresh.
//!
//! The access token is persisted in a JSON cache file in the operator's home
//! directory together with its refresh token and expiry. A crawl first tries
//! the cached token, then a silent refresh, and only falls back to the
//! interactive device-code flow when both fail.
//!
//! During a run every remote call reads the token through a shared
//! [`TokenHolder`]; when the drive reports an authorization failure the
//! orchestrator calls [`TokenHolder::refresh`] once and retries.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Delegated scopes: read-only file access plus basic profile.
pub const SCOPES: &str = "Files.Read.All User.Read offline_access";

/// Tokens expiring within this many seconds are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// On-disk token cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCache {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) at which the access token expires.
    pub expires_at: i64,
}

impl TokenCache {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token cache: {}", path.display()))?;
        match serde_json::from_str(&raw) {
            Ok(cache) => Ok(Some(cache)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable token cache");
                Ok(None)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write token cache: {}", path.display()))?;
        Ok(())
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_MARGIN_SECS > now
    }
}

/// Something that can produce a new access token without operator interaction.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh_silent(&self) -> Result<String>;
}

/// The current access token for one run, replaceable in place after a refresh.
pub struct TokenHolder {
    current: RwLock<String>,
    source: Arc<dyn TokenSource>,
}

impl TokenHolder {
    pub fn new(initial: String, source: Arc<dyn TokenSource>) -> Self {
        Self {
            current: RwLock::new(initial),
            source,
        }
    }

    pub fn current(&self) -> String {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Ask the source for a fresh token and make it current.
    pub async fn refresh(&self) -> Result<()> {
        let token = self.source.refresh_silent().await?;
        match self.current.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
        debug!("Access token replaced after silent refresh");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    #[serde(default)]
    message: Option<String>,
    user_code: String,
    verification_uri: String,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default = "default_device_expiry")]
    expires_in: u64,
}

fn default_interval() -> u64 {
    5
}
fn default_device_expiry() -> u64 {
    900
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Device-code flow against the Microsoft identity platform.
pub struct DeviceCodeAuth {
    client: reqwest::Client,
    authority: String,
    tenant: String,
    client_id: String,
    cache_path: PathBuf,
}

impl DeviceCodeAuth {
    pub fn new(authority: &str, tenant: &str, client_id: &str, cache_path: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            authority: authority.trim_end_matches('/').to_string(),
            tenant: tenant.to_string(),
            client_id: client_id.to_string(),
            cache_path,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            &config.drive.authority_url,
            &config.drive.tenant_id()?,
            &config.drive.client_id()?,
            config.state.token_cache_path(),
        ))
    }

    fn endpoint(&self, leaf: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{}", self.authority, self.tenant, leaf)
    }

    /// Cached token if still fresh, otherwise a silent refresh, otherwise
    /// (when allowed) the interactive device-code flow.
    pub async fn acquire(&self, allow_interactive: bool) -> Result<String> {
        if let Some(cache) = TokenCache::load(&self.cache_path)? {
            if cache.is_fresh(chrono::Utc::now().timestamp()) {
                debug!("Using cached access token");
                return Ok(cache.access_token);
            }
            if let Some(refresh_token) = cache.refresh_token.as_deref() {
                match self.redeem_refresh_token(refresh_token).await {
                    Ok(fresh) => return Ok(fresh.access_token),
                    Err(e) => warn!(error = %e, "Silent token refresh failed"),
                }
            }
        }

        if !allow_interactive {
            bail!("No valid cached token. Run `smartdrive login` first.");
        }
        Ok(self.interactive().await?.access_token)
    }

    /// Run the device-code flow: print the sign-in instructions, then poll
    /// the token endpoint until the operator completes sign-in.
    pub async fn interactive(&self) -> Result<TokenCache> {
        let resp = self
            .client
            .post(self.endpoint("devicecode"))
            .form(&[("client_id", self.client_id.as_str()), ("scope", SCOPES)])
            .send()
            .await
            .context("Device code request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Failed to create device flow ({}): {}", status, body);
        }
        let flow: DeviceCodeResponse = resp.json().await?;

        match &flow.message {
            Some(message) => println!("{}", message),
            None => println!(
                "To sign in, open {} and enter the code {}",
                flow.verification_uri, flow.user_code
            ),
        }

        let mut interval = flow.interval.max(1);
        let deadline = std::time::Instant::now() + Duration::from_secs(flow.expires_in);

        loop {
            if std::time::Instant::now() >= deadline {
                bail!("Device code expired before sign-in completed");
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let resp = self
                .client
                .post(self.endpoint("token"))
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", flow.device_code.as_str()),
                ])
                .send()
                .await
                .context("Token polling request failed")?;

            if resp.status().is_success() {
                let token: TokenResponse = resp.json().await?;
                let cache = self.store(token, None)?;
                info!("Signed in; token cached");
                return Ok(cache);
            }

            let err: TokenErrorResponse = resp
                .json()
                .await
                .context("Unexpected token endpoint response")?;
            match err.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => interval += 5,
                other => bail!(
                    "Authentication failed: {} {}",
                    other,
                    err.error_description.unwrap_or_default()
                ),
            }
        }
    }

    async fn redeem_refresh_token(&self, refresh_token: &str) -> Result<TokenCache> {
        let resp = self
            .client
            .post(self.endpoint("token"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", SCOPES),
            ])
            .send()
            .await
            .context("Token refresh request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Token endpoint returned {}: {}", status, body);
        }
        let token: TokenResponse = resp.json().await?;
        debug!(expires_in = token.expires_in, "Refreshed access token");
        self.store(token, Some(refresh_token))
    }

    fn store(&self, token: TokenResponse, previous_refresh: Option<&str>) -> Result<TokenCache> {
        let cache = TokenCache {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: chrono::Utc::now().timestamp() + token.expires_in,
        };
        cache.save(&self.cache_path)?;
        Ok(cache)
    }
}

#[async_trait]
impl TokenSource for DeviceCodeAuth {
    async fn refresh_silent(&self) -> Result<String> {
        let cache = TokenCache::load(&self.cache_path)?.context("No token cache to refresh")?;
        let refresh_token = cache
            .refresh_token
            .context("Token cache has no refresh token")?;
        Ok(self.redeem_refresh_token(&refresh_token).await?.access_token)
    }
}

/// `smartdrive login`: always run the interactive flow and cache the result.
pub async fn run_login(config: &Config) -> Result<()> {
    let auth = DeviceCodeAuth::from_config(config)?;
    auth.interactive().await?;
    println!(
        "Signed in. Token cached at {}",
        config.state.token_cache_path().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn refresh_silent(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{}", n))
        }
    }

    #[tokio::test]
    async fn holder_swaps_token_on_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let holder = TokenHolder::new("initial".into(), source.clone());
        assert_eq!(holder.current(), "initial");
        holder.refresh().await.unwrap();
        assert_eq!(holder.current(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_freshness_respects_margin() {
        let cache = TokenCache {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: 10_000,
        };
        assert!(cache.is_fresh(10_000 - EXPIRY_MARGIN_SECS - 1));
        assert!(!cache.is_fresh(10_000 - EXPIRY_MARGIN_SECS));
    }

    #[test]
    fn unreadable_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(TokenCache::load(&path).unwrap().is_none());
        assert!(TokenCache::load(&dir.path().join("missing.json"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn silent_refresh_redeems_refresh_token_and_rewrites_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-x/oauth2/v2.0/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        TokenCache {
            access_token: "old".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: 0,
        }
        .save(&path)
        .unwrap();

        let auth = DeviceCodeAuth::new(&server.url(), "tenant-x", "client-1", path.clone());
        let token = auth.refresh_silent().await.unwrap();
        assert_eq!(token, "new-access");
        mock.assert_async().await;

        let saved = TokenCache::load(&path).unwrap().unwrap();
        assert_eq!(saved.access_token, "new-access");
        // Provider did not rotate the refresh token; the old one is kept.
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn acquire_without_interactive_fails_when_refresh_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/t/oauth2/v2.0/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        TokenCache {
            access_token: "old".into(),
            refresh_token: Some("r".into()),
            expires_at: 0,
        }
        .save(&path)
        .unwrap();

        let auth = DeviceCodeAuth::new(&server.url(), "t", "c", path);
        let err = auth.acquire(false).await.unwrap_err();
        assert!(err.to_string().contains("smartdrive login"));
    }
}
