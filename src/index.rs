//! Remote vector index.
//!
//! [`VectorIndex`] is the narrow contract the crawler needs: batched fetch
//! by id, upsert, delete (by id or everything in the namespace) and a
//! hybrid query. [`PineconeIndex`] implements it over the Pinecone data
//! plane REST API; the namespace is fixed per client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{required_env, IndexConfig};
use crate::sparse::SparseVector;

/// Metadata stored next to every vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub file_name: String,
    pub file_path: String,
    pub size: u64,
    pub modified: String,
    pub text_preview: String,
    /// Key of the full text in the document store, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub sparse: Option<SparseVector>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Metadata for each requested id that exists. Missing ids are absent
    /// from the map. Callers keep batches within the service limit.
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, serde_json::Value>>;

    async fn upsert(&self, vectors: &[VectorRecord]) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Delete every vector in the namespace. A namespace that does not exist
    /// yet is not an error.
    async fn delete_all(&self) -> Result<()>;

    async fn query(
        &self,
        vector: &[f32],
        sparse: Option<&SparseVector>,
        top_k: usize,
    ) -> Result<Vec<QueryMatch>>;
}

// ============ Pinecone ============

#[derive(Serialize)]
struct PineconeSparse<'a> {
    indices: &'a [u32],
    values: &'a [f32],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PineconeVector<'a> {
    id: &'a str,
    values: &'a [f32],
    #[serde(skip_serializing_if = "Option::is_none")]
    sparse_values: Option<PineconeSparse<'a>>,
    metadata: &'a VectorMetadata,
}

#[derive(Deserialize)]
struct FetchResponse {
    #[serde(default)]
    vectors: HashMap<String, FetchedVector>,
}

#[derive(Deserialize)]
struct FetchedVector {
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

#[derive(Deserialize)]
struct RawMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

const MAX_ATTEMPTS: u32 = 3;

pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    namespace: String,
}

impl PineconeIndex {
    pub fn new(host: &str, api_key: &str, namespace: &str, timeout_secs: u64) -> Result<Self> {
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?,
            host,
            api_key: api_key.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Build from config; `PINECONE_API_KEY` must be set.
    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        let api_key = required_env("PINECONE_API_KEY")?;
        Self::new(&config.host, &api_key, &config.namespace, config.timeout_secs)
    }

    /// Send a request, retrying 429/5xx and network errors with linear backoff.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            match build()
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", "2024-07")
                .send()
                .await
            {
                Ok(resp) if resp.status().as_u16() == 429 || resp.status().is_server_error() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(%status, attempt = attempt + 1, "Vector index request failed, retrying");
                    last_err = Some(anyhow::anyhow!("Vector index error {}: {}", status, body));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Vector index request failed")))
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("{} failed ({}): {}", what, status, body)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, serde_json::Value>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = format!("{}/vectors/fetch", self.host);
        let mut query: Vec<(&str, &str)> = ids.iter().map(|id| ("ids", id.as_str())).collect();
        query.push(("namespace", self.namespace.as_str()));

        let resp = self.send(|| self.client.get(&url).query(&query)).await?;
        let resp = Self::expect_success(resp, "Vector fetch").await?;
        let parsed: FetchResponse = resp.json().await.context("Invalid fetch response")?;
        debug!(requested = ids.len(), found = parsed.vectors.len(), "Fetched vectors");
        Ok(parsed
            .vectors
            .into_iter()
            .map(|(id, v)| (id, v.metadata))
            .collect())
    }

    async fn upsert(&self, vectors: &[VectorRecord]) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        let payload: Vec<PineconeVector<'_>> = vectors
            .iter()
            .map(|v| PineconeVector {
                id: &v.id,
                values: &v.values,
                sparse_values: v
                    .sparse
                    .as_ref()
                    .filter(|s| !s.is_empty())
                    .map(|s| PineconeSparse {
                        indices: &s.indices,
                        values: &s.values,
                    }),
                metadata: &v.metadata,
            })
            .collect();
        let body = serde_json::json!({
            "vectors": payload,
            "namespace": self.namespace,
        });
        let url = format!("{}/vectors/upsert", self.host);
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        Self::expect_success(resp, "Vector upsert").await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "ids": ids, "namespace": self.namespace });
        let url = format!("{}/vectors/delete", self.host);
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        Self::expect_success(resp, "Vector delete").await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let body = serde_json::json!({ "deleteAll": true, "namespace": self.namespace });
        let url = format!("{}/vectors/delete", self.host);
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        if resp.status().as_u16() == 404 {
            debug!(namespace = %self.namespace, "Namespace does not exist yet; nothing to clear");
            return Ok(());
        }
        Self::expect_success(resp, "Namespace clear").await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        sparse: Option<&SparseVector>,
        top_k: usize,
    ) -> Result<Vec<QueryMatch>> {
        let mut body = serde_json::json!({
            "namespace": self.namespace,
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(sparse) = sparse.filter(|s| !s.is_empty()) {
            body["sparseVector"] = serde_json::json!({
                "indices": sparse.indices,
                "values": sparse.values,
            });
        }
        let url = format!("{}/query", self.host);
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        let resp = Self::expect_success(resp, "Vector query").await?;
        let parsed: QueryResponse = resp.json().await.context("Invalid query response")?;
        Ok(parsed
            .matches
            .into_iter()
            .map(|m| QueryMatch {
                id: m.id,
                score: m.score,
                metadata: m.metadata,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn index(server: &mockito::ServerGuard) -> PineconeIndex {
        PineconeIndex::new(&server.url(), "pc-key", "smartdrive", 5).unwrap()
    }

    #[tokio::test]
    async fn fetch_sends_ids_and_namespace() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/vectors/fetch")
            .match_header("api-key", "pc-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ids".into(), "abc".into()),
                Matcher::UrlEncoded("namespace".into(), "smartdrive".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"vectors":{"abc":{"id":"abc","metadata":{"modified":"2024-01-01T00:00:00Z","size":600.0}}},"namespace":"smartdrive"}"#,
            )
            .create_async()
            .await;

        let found = index(&server)
            .fetch(&["abc".to_string(), "missing".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found["abc"]["modified"], "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn delete_all_tolerates_missing_namespace() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/vectors/delete")
            .match_body(Matcher::PartialJson(serde_json::json!({"deleteAll": true})))
            .with_status(404)
            .with_body(r#"{"code":5,"message":"Namespace not found"}"#)
            .create_async()
            .await;
        index(&server).delete_all().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_sends_sparse_values_and_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/vectors/upsert")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "namespace": "smartdrive",
                "vectors": [{
                    "id": "id1",
                    "sparseValues": {"indices": [7], "values": [0.5]},
                    "metadata": {"file_name": "a.txt", "file_path": "/D/a.txt", "size": 3}
                }]
            })))
            .with_status(200)
            .with_body(r#"{"upsertedCount":1}"#)
            .create_async()
            .await;

        let record = VectorRecord {
            id: "id1".into(),
            values: vec![0.1, 0.2],
            sparse: Some(SparseVector {
                indices: vec![7],
                values: vec![0.5],
            }),
            metadata: VectorMetadata {
                file_name: "a.txt".into(),
                file_path: "/D/a.txt".into(),
                size: 3,
                modified: "m".into(),
                text_preview: "abc".into(),
                doc_id: None,
            },
        };
        index(&server).upsert(&[record]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_upsert_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/vectors/upsert")
            .expect(0)
            .create_async()
            .await;
        index(&server).upsert(&[]).await.unwrap();
        mock.assert_async().await;
    }
}
