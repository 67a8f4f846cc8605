//! Full-text document store.
//!
//! The vector index only keeps a preview of each document; the complete
//! extracted text goes to a blob container, keyed by an id derived from the
//! file path, and the id is recorded in the vector's metadata.
//!
//! # Environment Variables
//!
//! - `AZURE_STORAGE_CONNECTION_STRING`: `AccountName`, `AccountKey` and either
//!   `BlobEndpoint` or `DefaultEndpointsProtocol` + `EndpointSuffix`.
//!
//! # Authentication
//!
//! Requests are signed with the Blob service Shared Key scheme
//! (HMAC-SHA256 over a canonical request, `hmac` + `sha2` crates).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{required_env, StorageConfig};

const API_VERSION: &str = "2021-08-06";

type HmacSha256 = Hmac<Sha256>;

/// Store id for a remote path: `doc_` + first 16 hex chars of its SHA-256.
pub fn document_id(path: &str) -> String {
    let digest = hex::encode(Sha256::digest(path.as_bytes()));
    format!("doc_{}", &digest[..16])
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store `text` under `doc_id`, replacing any previous version.
    async fn store(&self, doc_id: &str, text: &str) -> Result<String>;
    async fn retrieve(&self, doc_id: &str) -> Result<Option<String>>;
    /// `false` when there was nothing to delete.
    async fn delete(&self, doc_id: &str) -> Result<bool>;
}

// ============ Connection string ============

#[derive(Debug, Clone, PartialEq)]
struct StorageAccount {
    name: String,
    key: Vec<u8>,
    blob_endpoint: String,
}

impl StorageAccount {
    fn parse(connection_string: &str) -> Result<Self> {
        let mut name = None;
        let mut key = None;
        let mut endpoint = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();

        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            let (k, v) = part
                .split_once('=')
                .with_context(|| format!("Malformed connection string segment: {}", k_only(part)))?;
            match k.trim() {
                "AccountName" => name = Some(v.trim().to_string()),
                "AccountKey" => key = Some(v.trim().to_string()),
                "BlobEndpoint" => endpoint = Some(v.trim().trim_end_matches('/').to_string()),
                "DefaultEndpointsProtocol" => protocol = v.trim().to_string(),
                "EndpointSuffix" => suffix = v.trim().to_string(),
                _ => {}
            }
        }

        let name = name.context("Connection string has no AccountName")?;
        let key = STANDARD
            .decode(key.context("Connection string has no AccountKey")?)
            .context("AccountKey is not valid base64")?;
        let blob_endpoint =
            endpoint.unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, name, suffix));
        Ok(Self {
            name,
            key,
            blob_endpoint,
        })
    }
}

/// Segment name only, so keys never end up in error messages.
fn k_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or_default()
}

// ============ Shared Key signing ============

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Canonical string for the Blob service Shared Key scheme.
///
/// `ms_headers` must already be lowercase; they are sorted here.
fn string_to_sign(
    verb: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(&str, String)],
    resource: &str,
    query: &[(&str, &str)],
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut headers: Vec<&(&str, String)> = ms_headers.iter().collect();
    headers.sort_by(|a, b| a.0.cmp(b.0));
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let mut params: Vec<&(&str, &str)> = query.iter().collect();
    params.sort_by(|a, b| a.0.cmp(b.0));
    let canonical_query: String = params
        .iter()
        .map(|(k, v)| format!("\n{}:{}", k, v))
        .collect();

    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}{}",
        verb, length, content_type, canonical_headers, resource, canonical_query
    )
}

// ============ Azure Blob ============

pub struct AzureBlobStore {
    client: reqwest::Client,
    account: StorageAccount,
    container: String,
}

impl AzureBlobStore {
    pub fn new(connection_string: &str, container: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            account: StorageAccount::parse(connection_string)?,
            container: container.to_string(),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let conn = required_env("AZURE_STORAGE_CONNECTION_STRING")?;
        Self::new(&conn, &config.container)
    }

    fn blob_url(&self, doc_id: &str) -> String {
        format!(
            "{}/{}/{}.txt",
            self.account.blob_endpoint, self.container, doc_id
        )
    }

    /// Send a signed request. `query` is appended to the URL and signed.
    async fn send(
        &self,
        verb: reqwest::Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<(&str, Vec<u8>)>,
        blob_type: bool,
    ) -> Result<reqwest::Response> {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid blob URL {}", url))?;
        let resource = format!("/{}{}", self.account.name, parsed.path());
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut ms_headers = vec![
            ("x-ms-date", date),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        if blob_type {
            ms_headers.push(("x-ms-blob-type", "BlockBlob".to_string()));
        }
        let (content_type, payload) = body.unwrap_or(("", Vec::new()));

        let to_sign = string_to_sign(
            verb.as_str(),
            payload.len(),
            content_type,
            &ms_headers,
            &resource,
            query,
        );
        let signature = STANDARD.encode(hmac_sha256(&self.account.key, to_sign.as_bytes())?);

        let mut req = self
            .client
            .request(verb, parsed)
            .query(query)
            .header("Authorization", format!("SharedKey {}:{}", self.account.name, signature));
        for (name, value) in &ms_headers {
            req = req.header(*name, value);
        }
        if !content_type.is_empty() {
            req = req.header("Content-Type", content_type);
        }
        req.body(payload)
            .send()
            .await
            .context("Blob request failed")
    }

    async fn create_container(&self) -> Result<()> {
        let url = format!("{}/{}", self.account.blob_endpoint, self.container);
        let resp = self
            .send(reqwest::Method::PUT, &url, &[("restype", "container")], None, false)
            .await?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 409 {
            info!(container = %self.container, "Blob container ready");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            bail!("Create container failed ({}): {}", status, body)
        }
    }

    async fn put_blob(&self, doc_id: &str, text: &str) -> Result<reqwest::Response> {
        self.send(
            reqwest::Method::PUT,
            &self.blob_url(doc_id),
            &[],
            Some(("text/plain; charset=utf-8", text.as_bytes().to_vec())),
            true,
        )
        .await
    }
}

#[async_trait]
impl DocumentStore for AzureBlobStore {
    async fn store(&self, doc_id: &str, text: &str) -> Result<String> {
        let mut resp = self.put_blob(doc_id, text).await?;
        if resp.status().as_u16() == 404 {
            debug!(container = %self.container, "Container missing, creating");
            self.create_container().await?;
            resp = self.put_blob(doc_id, text).await?;
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Put blob {} failed ({}): {}", doc_id, status, body);
        }
        Ok(doc_id.to_string())
    }

    async fn retrieve(&self, doc_id: &str) -> Result<Option<String>> {
        let resp = self
            .send(reqwest::Method::GET, &self.blob_url(doc_id), &[], None, false)
            .await?;
        match resp.status().as_u16() {
            404 => Ok(None),
            s if (200..300).contains(&s) => Ok(Some(resp.text().await?)),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("Get blob {} failed ({}): {}", doc_id, status, body)
            }
        }
    }

    async fn delete(&self, doc_id: &str) -> Result<bool> {
        let resp = self
            .send(reqwest::Method::DELETE, &self.blob_url(doc_id), &[], None, false)
            .await?;
        match resp.status().as_u16() {
            404 => Ok(false),
            s if (200..300).contains(&s) => Ok(true),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("Delete blob {} failed ({}): {}", doc_id, status, body)
            }
        }
    }
}
