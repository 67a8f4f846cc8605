//! OCR fallback chain and page rasterization.
//!
//! Images (and PDF pages without a text layer) are recognised by a fixed
//! priority chain: the cloud engine first when one is configured, then the
//! local engine. A cloud error falls back to the local engine for that page
//! only; the cloud engine is never retried on the same page.
//!
//! Form-like PDFs can instead go through document intelligence, which keeps
//! table and key/value structure that plain OCR loses.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{required_env, DocIntelMode, OcrConfig};

/// Recognises text in one image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Short engine label used in progress output.
    fn name(&self) -> &'static str;

    async fn recognize(&self, image: &[u8]) -> Result<String>;
}

/// Renders single PDF pages to PNG images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// `page` is 1-based.
    async fn render_page(&self, pdf: &[u8], page: usize, dpi: u32) -> Result<Vec<u8>>;
}

/// Text recognised for one image, with the engine that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    pub engine: &'static str,
}

// ============ Chain ============

pub struct OcrChain {
    cloud: Option<Box<dyn OcrEngine>>,
    local: Box<dyn OcrEngine>,
}

impl OcrChain {
    pub fn new(cloud: Option<Box<dyn OcrEngine>>, local: Box<dyn OcrEngine>) -> Self {
        Self { cloud, local }
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Recognise one image. `None` when no engine produced any text.
    ///
    /// A cloud error or a cloud answer without text moves on to the local
    /// engine; the cloud engine is asked once per image.
    pub async fn recognize(&self, image: &[u8]) -> Option<OcrOutput> {
        if let Some(cloud) = &self.cloud {
            match cloud.recognize(image).await {
                Ok(text) => match non_empty(text, cloud.name()) {
                    Some(output) => return Some(output),
                    None => debug!(engine = cloud.name(), "Cloud OCR found no text; using local engine"),
                },
                Err(e) => {
                    warn!(engine = cloud.name(), error = %e, "Cloud OCR failed; using local engine");
                }
            }
        }
        match self.local.recognize(image).await {
            Ok(text) => non_empty(text, self.local.name()),
            Err(e) => {
                warn!(engine = self.local.name(), error = %e, "Local OCR failed");
                None
            }
        }
    }
}

fn non_empty(text: String, engine: &'static str) -> Option<OcrOutput> {
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(OcrOutput { text, engine })
    }
}

// ============ Azure Computer Vision ============

#[derive(Deserialize, Default)]
struct AnalyzeResponse {
    #[serde(default, rename = "readResult")]
    read_result: Option<ReadResult>,
}

#[derive(Deserialize, Default)]
struct ReadResult {
    #[serde(default)]
    blocks: Vec<ReadBlock>,
}

#[derive(Deserialize)]
struct ReadBlock {
    #[serde(default)]
    lines: Vec<ReadLine>,
}

#[derive(Deserialize)]
struct ReadLine {
    text: String,
}

/// Azure Computer Vision image analysis, `read` feature.
pub struct AzureVisionOcr {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl AzureVisionOcr {
    pub fn new(endpoint: &str, key: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build OCR HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl OcrEngine for AzureVisionOcr {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn recognize(&self, image: &[u8]) -> Result<String> {
        let url = format!(
            "{}/computervision/imageanalysis:analyze?api-version=2023-10-01&features=read",
            self.endpoint
        );
        let resp = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .context("Vision request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Vision API error ({}): {}", status, body);
        }
        let parsed: AnalyzeResponse = resp.json().await.context("Invalid Vision response")?;
        let lines: Vec<String> = parsed
            .read_result
            .unwrap_or_default()
            .blocks
            .into_iter()
            .flat_map(|b| b.lines.into_iter().map(|l| l.text))
            .collect();
        Ok(lines.join("\n"))
    }
}

// ============ Local engine ============

/// Tesseract CLI, image on stdin and text on stdout.
pub struct TesseractOcr {
    cmd: String,
    lang: String,
    timeout_secs: u64,
}

impl TesseractOcr {
    pub fn new(cmd: &str, lang: &str, timeout_secs: u64) -> Self {
        Self {
            cmd: cmd.to_string(),
            lang: lang.to_string(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn recognize(&self, image: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.cmd)
            .args(["stdin", "stdout", "-l", &self.lang])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image)
                .await
                .context("Failed to send image to tesseract")?;
        }

        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .with_context(|| format!("tesseract timed out after {}s", self.timeout_secs))?
        .context("tesseract did not finish")?;

        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ============ Rasterizer ============

/// Poppler's `pdftoppm`, one page per call.
pub struct PdftoppmRasterizer {
    cmd: String,
    timeout_secs: u64,
}

impl PdftoppmRasterizer {
    pub fn new(cmd: &str, timeout_secs: u64) -> Self {
        Self {
            cmd: cmd.to_string(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn render_page(&self, pdf: &[u8], page: usize, dpi: u32) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("Failed to create scratch directory")?;
        let input = dir.path().join("input.pdf");
        let prefix = dir.path().join("page");
        tokio::fs::write(&input, pdf)
            .await
            .context("Failed to write scratch PDF")?;

        let page_arg = page.to_string();
        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.cmd)
                .arg("-r")
                .arg(dpi.to_string())
                .args(["-f", &page_arg, "-l", &page_arg, "-png", "-singlefile"])
                .arg(&input)
                .arg(&prefix)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("pdftoppm timed out on page {}", page))?
        .with_context(|| format!("Failed to run {}", self.cmd))?;

        if !output.status.success() {
            bail!(
                "pdftoppm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        tokio::fs::read(prefix.with_extension("png"))
            .await
            .with_context(|| format!("pdftoppm produced no image for page {}", page))
    }
}

// ============ Document intelligence ============

const FORM_KEYWORDS: &[&str] = &[
    "tax", "1040", "w2", "w-2", "1099", "invoice", "receipt", "form", "return",
];
const ANALYZE_POLL_LIMIT: u32 = 120;

#[derive(Deserialize)]
struct AnalyzeOperation {
    status: String,
    #[serde(default, rename = "analyzeResult")]
    analyze_result: Option<LayoutResult>,
}

#[derive(Deserialize, Default)]
struct LayoutResult {
    #[serde(default)]
    pages: Vec<LayoutPage>,
    #[serde(default)]
    tables: Vec<LayoutTable>,
    #[serde(default, rename = "keyValuePairs")]
    key_value_pairs: Vec<KeyValuePair>,
}

#[derive(Deserialize)]
struct LayoutPage {
    #[serde(rename = "pageNumber")]
    page_number: u32,
    #[serde(default)]
    lines: Vec<ContentSpan>,
}

#[derive(Deserialize)]
struct ContentSpan {
    content: String,
}

#[derive(Deserialize)]
struct LayoutTable {
    #[serde(rename = "rowCount")]
    row_count: u32,
    #[serde(rename = "columnCount")]
    column_count: u32,
    #[serde(default)]
    cells: Vec<LayoutCell>,
}

#[derive(Deserialize)]
struct LayoutCell {
    #[serde(rename = "rowIndex")]
    row_index: u32,
    #[serde(rename = "columnIndex")]
    column_index: u32,
    content: String,
}

#[derive(Deserialize)]
struct KeyValuePair {
    key: Option<ContentSpan>,
    value: Option<ContentSpan>,
}

/// Azure Document Intelligence, `prebuilt-document` model.
pub struct DocumentIntelligence {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    mode: DocIntelMode,
    poll_interval: Duration,
}

impl DocumentIntelligence {
    pub fn new(endpoint: &str, key: &str, mode: DocIntelMode, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build document intelligence HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
            mode,
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Whether a PDF with this file name goes through document intelligence.
    pub fn should_use(&self, file_name: &str) -> bool {
        match self.mode {
            DocIntelMode::Never => false,
            DocIntelMode::Always => true,
            DocIntelMode::Selective => {
                let lower = file_name.to_lowercase();
                FORM_KEYWORDS.iter().any(|k| lower.contains(k))
            }
        }
    }

    /// Analyse a PDF and render pages, tables and form fields as text.
    pub async fn analyze(&self, pdf: &[u8]) -> Result<String> {
        let url = format!(
            "{}/formrecognizer/documentModels/prebuilt-document:analyze?api-version=2023-07-31",
            self.endpoint
        );
        let resp = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/pdf")
            .body(pdf.to_vec())
            .send()
            .await
            .context("Document intelligence request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Document intelligence error ({}): {}", status, body);
        }
        let operation = resp
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .context("Document intelligence response has no Operation-Location")?;

        for _ in 0..ANALYZE_POLL_LIMIT {
            let poll: AnalyzeOperation = self
                .client
                .get(&operation)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .await
                .context("Document intelligence poll failed")?
                .error_for_status()
                .context("Document intelligence poll rejected")?
                .json()
                .await
                .context("Invalid document intelligence poll response")?;
            match poll.status.as_str() {
                "succeeded" => return Ok(render_layout(poll.analyze_result.unwrap_or_default())),
                "failed" => bail!("Document intelligence analysis failed"),
                other => debug!(status = other, "Document intelligence still running"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        bail!("Document intelligence did not finish after {} polls", ANALYZE_POLL_LIMIT)
    }
}

fn render_layout(result: LayoutResult) -> String {
    let mut parts = Vec::new();
    for page in result.pages {
        parts.push(format!("=== Page {} ===", page.page_number));
        parts.extend(page.lines.into_iter().map(|l| l.content));
    }
    if !result.tables.is_empty() {
        parts.push("\n=== Tables ===".to_string());
        for (i, table) in result.tables.into_iter().enumerate() {
            parts.push(format!(
                "\nTable {} ({}x{}):",
                i + 1,
                table.row_count,
                table.column_count
            ));
            for cell in table.cells {
                parts.push(format!(
                    "Row {}, Col {}: {}",
                    cell.row_index, cell.column_index, cell.content
                ));
            }
        }
    }
    if !result.key_value_pairs.is_empty() {
        parts.push("\n=== Form Fields ===".to_string());
        for kv in result.key_value_pairs {
            let key = kv.key.map(|k| k.content).unwrap_or_else(|| "Unknown".into());
            let value = kv.value.map(|v| v.content).unwrap_or_else(|| "N/A".into());
            parts.push(format!("{}: {}", key, value));
        }
    }
    parts.join("\n")
}

// ============ Wiring ============

/// Everything the extractor needs for image-only content.
pub struct OcrServices {
    pub chain: OcrChain,
    pub rasterizer: Box<dyn PageRasterizer>,
    pub dpi: u32,
    pub document_intelligence: Option<DocumentIntelligence>,
}

impl OcrServices {
    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        let cloud: Option<Box<dyn OcrEngine>> = match &config.vision_endpoint {
            Some(endpoint) => {
                let key = required_env("AZURE_VISION_KEY")?;
                Some(Box::new(AzureVisionOcr::new(endpoint, &key, config.timeout_secs)?))
            }
            None => None,
        };
        let local = Box::new(TesseractOcr::new(
            &config.tesseract_cmd,
            &config.tesseract_lang,
            config.timeout_secs,
        ));
        let document_intelligence = match &config.form_recognizer_endpoint {
            Some(endpoint) if config.document_intelligence != DocIntelMode::Never => {
                let key = required_env("AZURE_FORM_RECOGNIZER_KEY")?;
                Some(DocumentIntelligence::new(
                    endpoint,
                    &key,
                    config.document_intelligence,
                    config.timeout_secs,
                )?)
            }
            _ => None,
        };
        Ok(Self {
            chain: OcrChain::new(cloud, local),
            rasterizer: Box::new(PdftoppmRasterizer::new(
                &config.pdftoppm_cmd,
                config.timeout_secs,
            )),
            dpi: config.dpi,
            document_intelligence,
        })
    }
}
