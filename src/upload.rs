//! Upload stage: extracted documents into the vector index.
//!
//! Each document is checked against the content floor, embedded (text cut
//! to the provider's input limit), given a sparse term vector, optionally
//! stored in full in the document store, and upserted in batches under its
//! stable identity. Upsert is idempotent, so re-uploading an updated file
//! replaces its previous vector.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{Config, EmbeddingConfig, IndexConfig};
use crate::embedding::Embedder;
use crate::extract::truncate_chars;
use crate::index::{VectorIndex, VectorMetadata, VectorRecord};
use crate::models::{ExtractedDocument, SyncDecision};
use crate::planner::{passes_content_floor, stable_id};
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter};
use crate::sparse::encode_document;
use crate::storage::{document_id, DocumentStore};

/// Tallies of one upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub new: usize,
    pub updated: usize,
    pub too_small: usize,
    pub embed_failed: usize,
    pub store_failed: usize,
    pub upserted: usize,
    pub upsert_failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub batch_size: usize,
    pub preview_chars: usize,
    pub max_input_chars: usize,
}

impl UploadSettings {
    pub fn new(index: &IndexConfig, embedding: &EmbeddingConfig) -> Self {
        Self {
            batch_size: index.upsert_batch_size.max(1),
            preview_chars: index.preview_chars,
            max_input_chars: embedding.max_input_chars,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.index, &config.embedding)
    }
}

pub struct Uploader<'a> {
    index: &'a dyn VectorIndex,
    embedder: &'a dyn Embedder,
    store: Option<&'a dyn DocumentStore>,
    progress: &'a dyn CrawlProgressReporter,
    settings: UploadSettings,
}

impl<'a> Uploader<'a> {
    pub fn new(
        index: &'a dyn VectorIndex,
        embedder: &'a dyn Embedder,
        store: Option<&'a dyn DocumentStore>,
        progress: &'a dyn CrawlProgressReporter,
        settings: UploadSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            store,
            progress,
            settings,
        }
    }

    /// Upload every document. A failed embedding or upsert only loses the
    /// documents concerned; batches already upserted stay in the index.
    pub async fn upload(&self, documents: &[ExtractedDocument]) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut pending: Vec<VectorRecord> = Vec::new();
        let total = documents.len() as u64;

        for (i, doc) in documents.iter().enumerate() {
            self.progress.report(CrawlProgressEvent::Uploading {
                n: i as u64 + 1,
                total,
            });

            match doc.decision {
                SyncDecision::Updated => report.updated += 1,
                _ => report.new += 1,
            }

            if !passes_content_floor(&doc.text) {
                debug!(
                    file = %doc.path,
                    chars = doc.text.trim().chars().count(),
                    "Skipped: insufficient content"
                );
                report.too_small += 1;
                continue;
            }

            let input = truncate_chars(&doc.text, self.settings.max_input_chars);
            let values = match self.embedder.embed_document(input).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(file = %doc.path, error = %e, "Embedding failed");
                    report.embed_failed += 1;
                    continue;
                }
            };

            let sparse = Some(encode_document(input)).filter(|s| !s.is_empty());
            let doc_id = match self.store {
                Some(store) => match store.store(&document_id(&doc.path), &doc.text).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(file = %doc.path, error = %e, "Full-text store failed");
                        report.store_failed += 1;
                        None
                    }
                },
                None => None,
            };

            pending.push(VectorRecord {
                id: stable_id(&doc.path),
                values,
                sparse,
                metadata: VectorMetadata {
                    file_name: doc.name.clone(),
                    file_path: doc.path.clone(),
                    size: doc.size,
                    modified: doc.modified.clone(),
                    text_preview: truncate_chars(&doc.text, self.settings.preview_chars)
                        .to_string(),
                    doc_id,
                },
            });

            if pending.len() >= self.settings.batch_size {
                self.flush(&mut pending, &mut report).await;
            }
        }
        self.flush(&mut pending, &mut report).await;

        info!(
            new = report.new,
            updated = report.updated,
            too_small = report.too_small,
            upserted = report.upserted,
            "Upload finished"
        );
        Ok(report)
    }

    async fn flush(&self, pending: &mut Vec<VectorRecord>, report: &mut UploadReport) {
        if pending.is_empty() {
            return;
        }
        match self.index.upsert(pending).await {
            Ok(()) => report.upserted += pending.len(),
            Err(e) => {
                warn!(count = pending.len(), error = %e, "Upsert batch failed");
                report.upsert_failed += pending.len();
            }
        }
        pending.clear();
    }
}
