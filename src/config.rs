//! TOML configuration parsing and validation.
//!
//! Non-secret settings live in the config file (default
//! `./config/smartdrive.toml`); API keys and connection strings are read from
//! the environment when the collaborator that needs them is built. Any
//! validation failure here is fatal: the crawl never starts with a
//! half-usable configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    #[serde(default = "default_authority_url")]
    pub authority_url: String,
    #[serde(default = "default_root_path")]
    pub root_path: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            tenant_id: None,
            graph_url: default_graph_url(),
            authority_url: default_authority_url(),
            root_path: default_root_path(),
        }
    }
}

fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0/me/drive".to_string()
}
fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}
fn default_root_path() -> String {
    "/Documents".to_string()
}

impl DriveConfig {
    /// Client id from the config file, falling back to `MICROSOFT_CLIENT_ID`.
    pub fn client_id(&self) -> Result<String> {
        self.client_id
            .clone()
            .or_else(|| std::env::var("MICROSOFT_CLIENT_ID").ok())
            .context("drive.client_id not set and MICROSOFT_CLIENT_ID environment variable not set")
    }

    /// Tenant id from the config file, falling back to `MICROSOFT_TENANT_ID`.
    pub fn tenant_id(&self) -> Result<String> {
        self.tenant_id
            .clone()
            .or_else(|| std::env::var("MICROSOFT_TENANT_ID").ok())
            .context("drive.tenant_id not set and MICROSOFT_TENANT_ID environment variable not set")
    }
}

/// How `.zip` files are turned into text.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ZipMode {
    /// Index the archive's file names only.
    #[default]
    List,
    /// Extract supported entries and index their text.
    Extract,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Stop processing files once this many have been processed.
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub zip_mode: ZipMode,
    #[serde(default = "default_listing_timeout")]
    pub listing_timeout_secs: u64,
    #[serde(default = "default_listing_retry_timeout")]
    pub listing_retry_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    /// Linear backoff step: attempt `n` waits `n * retry_backoff_secs`.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_discovery_retry_rounds")]
    pub discovery_retry_rounds: u32,
    /// Globs matched against file names; matching files are never fetched.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_files: None,
            zip_mode: ZipMode::List,
            listing_timeout_secs: default_listing_timeout(),
            listing_retry_timeout_secs: default_listing_retry_timeout(),
            download_timeout_secs: default_download_timeout(),
            download_retries: default_download_retries(),
            retry_backoff_secs: default_retry_backoff(),
            discovery_retry_rounds: default_discovery_retry_rounds(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_listing_timeout() -> u64 {
    10
}
fn default_listing_retry_timeout() -> u64 {
    30
}
fn default_download_timeout() -> u64 {
    60
}
fn default_download_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    2
}
fn default_discovery_retry_rounds() -> u32 {
    3
}

/// Per-format resource ceilings for top-level files.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_pdf_max_pages")]
    pub pdf_max_pages: usize,
    #[serde(default = "default_sheet_max")]
    pub xlsx_max_sheets: usize,
    #[serde(default = "default_row_max")]
    pub xlsx_max_rows: usize,
    #[serde(default = "default_row_max")]
    pub csv_max_rows: usize,
    #[serde(default = "default_json_max_bytes")]
    pub json_max_bytes: usize,
    #[serde(default = "default_zip_max_entries")]
    pub zip_max_entries: usize,
    #[serde(default = "default_zip_entry_max_chars")]
    pub zip_entry_max_chars: usize,
    #[serde(default = "default_zip_list_max")]
    pub zip_list_max: usize,
    #[serde(default = "default_zip_entry_max_bytes")]
    pub zip_entry_max_bytes: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            pdf_max_pages: default_pdf_max_pages(),
            xlsx_max_sheets: default_sheet_max(),
            xlsx_max_rows: default_row_max(),
            csv_max_rows: default_row_max(),
            json_max_bytes: default_json_max_bytes(),
            zip_max_entries: default_zip_max_entries(),
            zip_entry_max_chars: default_zip_entry_max_chars(),
            zip_list_max: default_zip_list_max(),
            zip_entry_max_bytes: default_zip_entry_max_bytes(),
        }
    }
}

fn default_pdf_max_pages() -> usize {
    500
}
fn default_sheet_max() -> usize {
    100
}
fn default_row_max() -> usize {
    100_000
}
fn default_json_max_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_zip_max_entries() -> usize {
    50
}
fn default_zip_entry_max_chars() -> usize {
    2000
}
fn default_zip_list_max() -> usize {
    100
}
fn default_zip_entry_max_bytes() -> u64 {
    50 * 1024 * 1024
}

/// When to send PDFs through document intelligence instead of plain OCR.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocIntelMode {
    Never,
    /// Only for files whose names look like forms, invoices or tax documents.
    #[default]
    Selective,
    Always,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// Azure Computer Vision endpoint. Unset means local OCR only.
    #[serde(default)]
    pub vision_endpoint: Option<String>,
    #[serde(default = "default_tesseract_cmd")]
    pub tesseract_cmd: String,
    #[serde(default = "default_tesseract_lang")]
    pub tesseract_lang: String,
    #[serde(default = "default_pdftoppm_cmd")]
    pub pdftoppm_cmd: String,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_ocr_timeout")]
    pub timeout_secs: u64,
    /// Azure Document Intelligence endpoint for form-like PDFs.
    #[serde(default)]
    pub form_recognizer_endpoint: Option<String>,
    #[serde(default)]
    pub document_intelligence: DocIntelMode,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            vision_endpoint: None,
            tesseract_cmd: default_tesseract_cmd(),
            tesseract_lang: default_tesseract_lang(),
            pdftoppm_cmd: default_pdftoppm_cmd(),
            dpi: default_dpi(),
            timeout_secs: default_ocr_timeout(),
            form_recognizer_endpoint: None,
            document_intelligence: DocIntelMode::default(),
        }
    }
}

fn default_tesseract_cmd() -> String {
    "tesseract".to_string()
}
fn default_tesseract_lang() -> String {
    "eng".to_string()
}
fn default_pdftoppm_cmd() -> String {
    "pdftoppm".to_string()
}
fn default_dpi() -> u32 {
    300
}
fn default_ocr_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint for the `api` provider (OpenAI-compatible `/embeddings`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest text sent to the provider; longer documents are truncated.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    128_000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Pinecone index host, e.g. `https://smartdrive-abc123.svc.pinecone.io`.
    pub host: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_batch")]
    pub fetch_batch_size: usize,
    #[serde(default = "default_batch")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_namespace() -> String {
    "smartdrive".to_string()
}
fn default_batch() -> usize {
    100
}
fn default_preview_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_container")]
    pub container: String,
}

fn default_container() -> String {
    "documents".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub token_cache: Option<PathBuf>,
    #[serde(default)]
    pub folder_cache: Option<PathBuf>,
}

impl StateConfig {
    pub fn token_cache_path(&self) -> PathBuf {
        self.token_cache
            .clone()
            .unwrap_or_else(|| home_file(".smartdrive_token_cache.json"))
    }

    pub fn folder_cache_path(&self) -> PathBuf {
        self.folder_cache
            .clone()
            .unwrap_or_else(|| home_file(".smartdrive_folder_policy.json"))
    }
}

fn home_file(name: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}

/// Read an environment variable that must be present for a selected feature.
pub fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} environment variable not set", name),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !config.drive.root_path.starts_with('/') {
        bail!("drive.root_path must start with '/'");
    }

    // Crawl
    if config.crawl.max_files == Some(0) {
        bail!("crawl.max_files must be > 0 when set");
    }
    if config.crawl.listing_timeout_secs == 0 || config.crawl.listing_retry_timeout_secs == 0 {
        bail!("crawl listing timeouts must be > 0");
    }
    if config.crawl.download_retries == 0 {
        bail!("crawl.download_retries must be >= 1");
    }
    for pattern in &config.crawl.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid crawl.exclude_globs pattern: {}", pattern))?;
    }

    // Index
    if config.index.host.trim().is_empty() {
        bail!("index.host must be set");
    }
    if config.index.fetch_batch_size == 0 || config.index.upsert_batch_size == 0 {
        bail!("index batch sizes must be > 0");
    }

    // Extract
    if config.extract.pdf_max_pages == 0 {
        bail!("extract.pdf_max_pages must be > 0");
    }
    if config.extract.xlsx_max_sheets == 0 {
        bail!("extract.xlsx_max_sheets must be > 0");
    }
    if config.extract.zip_entry_max_bytes == 0 {
        bail!("extract.zip_entry_max_bytes must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "api" | "voyage" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, api, voyage, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be > 0");
        }
    }
    if config.embedding.provider == "api" {
        if config.embedding.url.is_none() {
            bail!("embedding.url must be specified when provider is 'api'");
        }
        if std::env::var("EMBEDDING_API_KEY").is_err() && std::env::var("OPENAI_API_KEY").is_err()
        {
            bail!("EMBEDDING_API_KEY or OPENAI_API_KEY must be set when provider is 'api'");
        }
    }
    if config.embedding.provider == "voyage" {
        required_env("VOYAGE_API_KEY")?;
    }

    // OCR
    if config.ocr.dpi == 0 {
        bail!("ocr.dpi must be > 0");
    }
    if config.ocr.vision_endpoint.is_some() {
        required_env("AZURE_VISION_KEY").context("ocr.vision_endpoint is configured")?;
    }
    if config.ocr.form_recognizer_endpoint.is_some()
        && config.ocr.document_intelligence != DocIntelMode::Never
    {
        required_env("AZURE_FORM_RECOGNIZER_KEY")
            .context("ocr.form_recognizer_endpoint is configured")?;
    }

    // Storage
    if config.storage.is_some() {
        required_env("AZURE_STORAGE_CONNECTION_STRING").context("[storage] is configured")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse("[index]\nhost = \"https://idx.example\"\n").unwrap();
        assert_eq!(cfg.drive.root_path, "/Documents");
        assert_eq!(cfg.crawl.listing_timeout_secs, 10);
        assert_eq!(cfg.crawl.listing_retry_timeout_secs, 30);
        assert_eq!(cfg.crawl.discovery_retry_rounds, 3);
        assert_eq!(cfg.crawl.zip_mode, ZipMode::List);
        assert_eq!(cfg.index.namespace, "smartdrive");
        assert_eq!(cfg.index.fetch_batch_size, 100);
        assert!(!cfg.embedding.is_enabled());
        assert!(cfg.storage.is_none());
    }

    #[test]
    fn enabled_provider_requires_model_and_dims() {
        let err = parse(
            "[index]\nhost = \"h\"\n[embedding]\nprovider = \"voyage\"\nmodel = \"voyage-3-large\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn api_provider_requires_url() {
        let err = parse(
            "[index]\nhost = \"h\"\n[embedding]\nprovider = \"api\"\nmodel = \"m\"\ndims = 8\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.url"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse("[index]\nhost = \"h\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn zero_max_files_rejected() {
        let err = parse("[index]\nhost = \"h\"\n[crawl]\nmax_files = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_files"));
    }

    #[test]
    fn zero_extract_ceilings_rejected() {
        for (key, field) in [
            ("pdf_max_pages = 0", "pdf_max_pages"),
            ("xlsx_max_sheets = 0", "xlsx_max_sheets"),
            ("zip_entry_max_bytes = 0", "zip_entry_max_bytes"),
        ] {
            let err = parse(&format!("[index]\nhost = \"h\"\n[extract]\n{}\n", key)).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
    }

    #[test]
    fn example_config_parses() {
        let cfg: Config = toml::from_str(include_str!("../config/smartdrive.example.toml")).unwrap();
        assert_eq!(cfg.embedding.provider, "voyage");
        assert_eq!(cfg.ocr.document_intelligence, DocIntelMode::Selective);
        assert_eq!(cfg.crawl.exclude_globs.len(), 4);
        assert!(cfg.storage.is_none());
    }

    #[test]
    fn zip_mode_parses_extract() {
        let cfg = parse("[index]\nhost = \"h\"\n[crawl]\nzip_mode = \"extract\"\n").unwrap();
        assert_eq!(cfg.crawl.zip_mode, ZipMode::Extract);
    }
}
