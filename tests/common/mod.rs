//! In-memory stand-ins for the remote collaborators, shared by the
//! integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use smartdrive::auth::{TokenHolder, TokenSource};
use smartdrive::drive::DriveApi;
use smartdrive::embedding::Embedder;
use smartdrive::error::{DriveError, DriveResult};
use smartdrive::index::{QueryMatch, VectorIndex, VectorRecord};
use smartdrive::models::{FailedFolder, ItemKind, RemoteItem};
use smartdrive::ocr::{OcrEngine, PageRasterizer};
use smartdrive::planner::stable_id;
use smartdrive::policy::{AdHocChoice, DecisionSource, FolderDecision, PreflightChoice};
use smartdrive::sparse::SparseVector;

pub const MODIFIED: &str = "2024-05-01T12:00:00Z";

// ============ Drive ============

/// Folder tree keyed by path; item ids are their paths.
#[derive(Default)]
pub struct FakeDrive {
    children: HashMap<String, Vec<RemoteItem>>,
    content: HashMap<String, Vec<u8>>,
    /// Timeouts to return per folder path before listing succeeds.
    listing_timeouts: Mutex<HashMap<String, usize>>,
    /// Listings to reject with 401 per folder path before succeeding.
    listing_unauthorized: Mutex<HashMap<String, usize>>,
    /// Path lookups to reject with 401 before succeeding.
    resolve_unauthorized: AtomicUsize,
    /// Download attempts to reject with 401 before accepting.
    download_unauthorized: AtomicUsize,
    /// Download failures (503) to return per file path before succeeding.
    download_failures: Mutex<HashMap<String, usize>>,
    pub listed: Mutex<Vec<String>>,
    pub downloaded: Mutex<Vec<String>>,
    pub tokens_seen: Mutex<Vec<String>>,
}

fn split(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

impl FakeDrive {
    pub fn new(root: &str) -> Self {
        let mut drive = Self::default();
        drive.children.insert(root.to_string(), Vec::new());
        drive
    }

    pub fn folder(&mut self, path: &str) -> &mut Self {
        let (parent, name) = split(path);
        self.children.entry(parent.clone()).or_default().push(RemoteItem {
            id: path.to_string(),
            name,
            parent_path: parent,
            kind: ItemKind::Folder,
            size: 0,
            modified: MODIFIED.to_string(),
            download_url: None,
        });
        self.children.entry(path.to_string()).or_default();
        self
    }

    pub fn file(&mut self, path: &str, body: &[u8]) -> &mut Self {
        self.file_modified(path, body, MODIFIED)
    }

    pub fn file_modified(&mut self, path: &str, body: &[u8], modified: &str) -> &mut Self {
        let (parent, name) = split(path);
        self.children.entry(parent.clone()).or_default().push(RemoteItem {
            id: path.to_string(),
            name,
            parent_path: parent,
            kind: ItemKind::File,
            size: body.len() as u64,
            modified: modified.to_string(),
            download_url: Some(format!("https://download.example{}", path)),
        });
        self.content.insert(path.to_string(), body.to_vec());
        self
    }

    pub fn time_out_listing(&self, path: &str, times: usize) {
        self.listing_timeouts
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
    }

    pub fn reject_listing(&self, path: &str, times: usize) {
        self.listing_unauthorized
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
    }

    pub fn reject_resolve(&self, times: usize) {
        self.resolve_unauthorized.store(times, Ordering::SeqCst);
    }

    pub fn reject_downloads(&self, times: usize) {
        self.download_unauthorized.store(times, Ordering::SeqCst);
    }

    pub fn fail_download(&self, path: &str, times: usize) {
        self.download_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn listings(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriveApi for FakeDrive {
    async fn resolve_path(&self, path: &str, _token: &str) -> DriveResult<RemoteItem> {
        if take_one(&self.resolve_unauthorized) {
            return Err(DriveError::Unauthorized { status: 401 });
        }
        if !self.children.contains_key(path) {
            return Err(DriveError::Status {
                status: 404,
                message: "itemNotFound".into(),
            });
        }
        let (parent, name) = split(path);
        Ok(RemoteItem {
            id: path.to_string(),
            name,
            parent_path: parent,
            kind: ItemKind::Folder,
            size: 0,
            modified: MODIFIED.to_string(),
            download_url: None,
        })
    }

    async fn list_children(
        &self,
        folder_id: &str,
        _folder_path: &str,
        timeout_secs: u64,
        _token: &str,
    ) -> DriveResult<Vec<RemoteItem>> {
        self.listed.lock().unwrap().push(folder_id.to_string());
        if let Some(left) = self.listing_timeouts.lock().unwrap().get_mut(folder_id) {
            if *left > 0 {
                *left -= 1;
                return Err(DriveError::Timeout(timeout_secs));
            }
        }
        if let Some(left) = self.listing_unauthorized.lock().unwrap().get_mut(folder_id) {
            if *left > 0 {
                *left -= 1;
                return Err(DriveError::Unauthorized { status: 401 });
            }
        }
        self.children
            .get(folder_id)
            .cloned()
            .ok_or_else(|| DriveError::Status {
                status: 404,
                message: folder_id.to_string(),
            })
    }

    async fn download(
        &self,
        item: &RemoteItem,
        _timeout_secs: u64,
        token: &str,
    ) -> DriveResult<Vec<u8>> {
        let path = item.path();
        self.tokens_seen.lock().unwrap().push(token.to_string());
        if take_one(&self.download_unauthorized) {
            return Err(DriveError::Unauthorized { status: 401 });
        }
        if let Some(left) = self.download_failures.lock().unwrap().get_mut(&path) {
            if *left > 0 {
                *left -= 1;
                return Err(DriveError::Status {
                    status: 503,
                    message: "serviceNotAvailable".into(),
                });
            }
        }
        self.downloaded.lock().unwrap().push(path.clone());
        self.content
            .get(&path)
            .cloned()
            .ok_or(DriveError::NoDownloadUrl(path))
    }
}

/// Decrement a countdown; `true` while it had budget left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============ Tokens ============

/// Hands out `token-1`, `token-2`, ... on each silent refresh, or refuses
/// every refresh when `refuse` is set.
#[derive(Default)]
pub struct CountingTokens {
    pub refreshes: AtomicUsize,
    pub refuse: bool,
}

#[async_trait]
impl TokenSource for CountingTokens {
    async fn refresh_silent(&self) -> Result<String> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refuse {
            bail!("refresh token expired");
        }
        Ok(format!("token-{}", n))
    }
}

pub fn tokens() -> (TokenHolder, Arc<CountingTokens>) {
    let source = Arc::new(CountingTokens::default());
    (TokenHolder::new("token-0".into(), source.clone()), source)
}

/// Tokens whose silent refresh always fails.
pub fn refusing_tokens() -> (TokenHolder, Arc<CountingTokens>) {
    let source = Arc::new(CountingTokens {
        refuse: true,
        ..Default::default()
    });
    (TokenHolder::new("token-0".into(), source.clone()), source)
}

// ============ Index ============

/// Keeps the metadata of every upserted vector.
#[derive(Default)]
pub struct FakeIndex {
    pub stored: Mutex<HashMap<String, serde_json::Value>>,
    pub fetch_calls: AtomicUsize,
    pub upsert_calls: AtomicUsize,
}

impl FakeIndex {
    /// Pretend `path` was indexed earlier with this `(modified, size)`.
    pub fn seed(&self, path: &str, modified: &str, size: u64) {
        self.stored.lock().unwrap().insert(
            stable_id(path),
            serde_json::json!({
                "file_name": path.rsplit('/').next().unwrap_or(path),
                "file_path": path,
                "modified": modified,
                "size": size,
                "text_preview": "",
            }),
        );
    }

    pub fn len(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    pub fn upserts(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, serde_json::Value>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let stored = self.stored.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }

    async fn upsert(&self, vectors: &[VectorRecord]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.stored.lock().unwrap();
        for v in vectors {
            stored.insert(v.id.clone(), serde_json::to_value(&v.metadata)?);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut stored = self.stored.lock().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.stored.lock().unwrap().clear();
        Ok(())
    }

    async fn query(&self, _: &[f32], _: Option<&SparseVector>, _: usize) -> Result<Vec<QueryMatch>> {
        Ok(vec![])
    }
}

// ============ Embedder ============

#[derive(Default)]
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![text.len() as f32, 0.0, 0.0, 1.0])
    }
}

// ============ Decisions ============

/// Scripted operator; unscripted prompts fail the test.
#[derive(Default)]
pub struct ScriptedOperator {
    pub ad_hoc: VecDeque<AdHocChoice>,
    pub preflight: VecDeque<PreflightChoice>,
    pub new_folders: VecDeque<Option<FolderDecision>>,
    pub retries: VecDeque<bool>,
    pub asked: Vec<String>,
}

impl DecisionSource for ScriptedOperator {
    fn ad_hoc(&mut self, path: &str, _name: &str) -> Result<AdHocChoice> {
        self.asked.push(path.to_string());
        match self.ad_hoc.pop_front() {
            Some(choice) => Ok(choice),
            None => bail!("unexpected ad-hoc prompt for {}", path),
        }
    }

    fn preflight(&mut self, _: usize, _: usize, path: &str, _name: &str) -> Result<PreflightChoice> {
        self.asked.push(path.to_string());
        match self.preflight.pop_front() {
            Some(choice) => Ok(choice),
            None => bail!("unexpected preflight prompt for {}", path),
        }
    }

    fn new_folder(&mut self, path: &str, _name: &str) -> Result<Option<FolderDecision>> {
        self.asked.push(path.to_string());
        match self.new_folders.pop_front() {
            Some(choice) => Ok(choice),
            None => bail!("unexpected new-folder prompt for {}", path),
        }
    }

    fn confirm_retry(&mut self, _failed: &[FailedFolder]) -> Result<bool> {
        Ok(self.retries.pop_front().unwrap_or(false))
    }
}

// ============ OCR ============

/// Engine answering from a fixed text, or failing when `text` is `None`.
/// An empty text answers with nothing at all.
pub struct FakeOcr {
    pub label: &'static str,
    pub text: Option<String>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeOcr {
    pub fn answering(label: &'static str, text: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                label,
                text: Some(text.to_string()),
                calls: calls.clone(),
            },
            calls,
        )
    }

    pub fn blank(label: &'static str) -> (Self, Arc<AtomicUsize>) {
        Self::answering(label, "")
    }

    pub fn failing(label: &'static str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                label,
                text: None,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    fn name(&self) -> &'static str {
        self.label
    }

    /// Echoes the image bytes after the configured text, so page order shows.
    async fn recognize(&self, image: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.text {
            Some(text) if text.is_empty() => Ok(String::new()),
            Some(text) => Ok(format!("{} {}", text, String::from_utf8_lossy(image))),
            None => bail!("{} engine unavailable", self.label),
        }
    }
}

/// Renders page `n` as the bytes `page-n`.
#[derive(Default)]
pub struct FakeRasterizer {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PageRasterizer for FakeRasterizer {
    async fn render_page(&self, _pdf: &[u8], page: usize, _dpi: u32) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("page-{}", page).into_bytes())
    }
}

// ============ Fixtures ============

/// A PDF with `pages` empty pages: no text layer at all.
pub fn scanned_pdf(pages: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", 3 + i * 2)).collect();
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            pages
        )
        .as_bytes(),
    );

    for i in 0..pages {
        let page_id = 3 + i * 2;
        let content_id = page_id + 1;
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << >> >> endobj\n",
                page_id, content_id
            )
            .as_bytes(),
        );
        offsets.push(out.len());
        out.extend_from_slice(
            format!("{} 0 obj << /Length 3 >> stream\nq Q\nendstream endobj\n", content_id).as_bytes(),
        );
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            offsets.len() + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}

/// A zip archive holding `members` as `(name, body)` pairs.
pub fn zip_of(members: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in members {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}
