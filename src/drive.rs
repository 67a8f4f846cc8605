//! Remote drive access: folder listing, path lookup and file download.
//!
//! [`DriveApi`] is the seam between the crawler and Microsoft Graph. The
//! discovery walker and the orchestrator only see [`RemoteItem`]s and typed
//! [`DriveError`]s; everything HTTP-specific stays in [`GraphDrive`].

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{DriveError, DriveResult};
use crate::models::{ItemKind, RemoteItem};

#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Look up a folder by its full path (e.g. `/Documents`).
    async fn resolve_path(&self, path: &str, token: &str) -> DriveResult<RemoteItem>;

    /// List the direct children of a folder. Items that are neither files nor
    /// folders (notebooks, packages) are dropped.
    async fn list_children(
        &self,
        folder_id: &str,
        folder_path: &str,
        timeout_secs: u64,
        token: &str,
    ) -> DriveResult<Vec<RemoteItem>>;

    /// Fetch the full content of one file.
    async fn download(
        &self,
        item: &RemoteItem,
        timeout_secs: u64,
        token: &str,
    ) -> DriveResult<Vec<u8>>;
}

/// `true` for responses that mean the bearer token is no longer accepted:
/// any 401, or a 400 whose `error` object names the token.
pub fn is_auth_failure(status: u16, body: &str) -> bool {
    if status == 401 {
        return true;
    }
    if status != 400 {
        return false;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let Some(error) = value.get("error") else {
        return false;
    };
    let rendered = error.to_string().to_lowercase();
    rendered.contains("invalidauthenticationtoken")
        || rendered.contains("jwt")
        || rendered.contains("token")
}

#[derive(Debug, Deserialize)]
struct GraphItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "lastModifiedDateTime")]
    last_modified: String,
    #[serde(default)]
    file: Option<serde_json::Value>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

impl GraphItem {
    fn into_remote(self, parent_path: &str) -> Option<RemoteItem> {
        let kind = if self.folder.is_some() {
            ItemKind::Folder
        } else if self.file.is_some() {
            ItemKind::File
        } else {
            return None;
        };
        Some(RemoteItem {
            id: self.id,
            name: self.name,
            parent_path: parent_path.to_string(),
            kind,
            size: self.size,
            modified: self.last_modified,
            download_url: self.download_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<GraphItem>,
    #[serde(default, rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Microsoft Graph `me/drive` client.
pub struct GraphDrive {
    client: reqwest::Client,
    base_url: String,
}

impl GraphDrive {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, url: &str, token: Option<&str>, timeout_secs: u64) -> DriveResult<reqwest::Response> {
        let mut req = self
            .client
            .get(url)
            .timeout(Duration::from_secs(timeout_secs));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DriveError::from_reqwest(e, timeout_secs))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if is_auth_failure(status.as_u16(), &body) {
            return Err(DriveError::Unauthorized {
                status: status.as_u16(),
            });
        }
        Err(DriveError::Status {
            status: status.as_u16(),
            message: truncate(&body, 200),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[async_trait]
impl DriveApi for GraphDrive {
    async fn resolve_path(&self, path: &str, token: &str) -> DriveResult<RemoteItem> {
        let url = format!("{}/root:{}", self.base_url, path);
        let resp = self.get(&url, Some(token), 30).await?;
        let item: GraphItem = resp
            .json()
            .await
            .map_err(|e| DriveError::Decode(e.to_string()))?;

        let parent = match path.trim_end_matches('/').rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        item.into_remote(&parent)
            .ok_or_else(|| DriveError::Decode(format!("{} is neither a file nor a folder", path)))
    }

    async fn list_children(
        &self,
        folder_id: &str,
        folder_path: &str,
        timeout_secs: u64,
        token: &str,
    ) -> DriveResult<Vec<RemoteItem>> {
        let mut url = format!("{}/items/{}/children", self.base_url, folder_id);
        let mut items = Vec::new();

        loop {
            let resp = self.get(&url, Some(token), timeout_secs).await?;
            let page: ChildrenPage = resp
                .json()
                .await
                .map_err(|e| DriveError::Decode(e.to_string()))?;
            items.extend(
                page.value
                    .into_iter()
                    .filter_map(|item| item.into_remote(folder_path)),
            );
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(folder = folder_path, count = items.len(), "Listed folder");
        Ok(items)
    }

    async fn download(
        &self,
        item: &RemoteItem,
        timeout_secs: u64,
        token: &str,
    ) -> DriveResult<Vec<u8>> {
        // Download URLs are pre-authenticated; the content endpoint needs the bearer token.
        let resp = match &item.download_url {
            Some(url) => self.get(url, None, timeout_secs).await?,
            None if !item.id.is_empty() => {
                let url = format!("{}/items/{}/content", self.base_url, item.id);
                self.get(&url, Some(token), timeout_secs).await?
            }
            None => return Err(DriveError::NoDownloadUrl(item.name.clone())),
        };
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| DriveError::from_reqwest(e, timeout_secs))?;
        Ok(bytes.to_vec())
    }
}
